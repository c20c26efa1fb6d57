use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::committer::DrainReport;
use crate::connector::Connector;
use crate::errors::{EngineError, Result};
use crate::events::IngestMessage;
use crate::source::{CheckpointHandle, Source};

/// Outcome of one poll cycle.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleStats {
    pub received: usize,
    pub inserted: usize,
    pub skipped: usize,
    pub committed: bool,
}

/// The ingestor orchestrates the data flow from source -> connector.
///
/// Source offsets are acknowledged right after the batch set holding their
/// rows has been handed to the committer, never before.
pub struct Ingestor<S: Source> {
    source: S,
    connector: Arc<Connector>,
    commit_interval: Duration,
    last_commit: Instant,
    pending: Vec<CheckpointHandle>,
}

impl<S: Source> Ingestor<S> {
    pub fn new(source: S, connector: Arc<Connector>, commit_interval: Duration) -> Self {
        Self {
            source,
            connector,
            commit_interval,
            last_commit: Instant::now(),
            pending: Vec::new(),
        }
    }

    pub fn connector(&self) -> &Arc<Connector> {
        &self.connector
    }

    /// Runs a single poll-insert-commit cycle.
    ///
    /// 1. Fetch a batch of messages from the source.
    /// 2. Decode each payload and route it to the connector. Events the
    ///    connector rejects are logged and dropped.
    /// 3. Once the commit interval has elapsed, commit the connector and then
    ///    acknowledge every handle received since the last commit.
    pub async fn run_once(&mut self) -> Result<CycleStats> {
        let batch = self.source.next_batch().await?;
        let mut stats = CycleStats {
            received: batch.len(),
            ..CycleStats::default()
        };

        for message in &batch.messages {
            let outcome = serde_json::from_slice::<IngestMessage>(&message.payload)
                .map_err(EngineError::from)
                .and_then(|msg| self.connector.insert_message(&msg));
            match outcome {
                Ok(()) => stats.inserted += 1,
                Err(e) if e.should_skip_message() => {
                    stats.skipped += 1;
                    warn!(topic = %message.topic, partition = message.partition, error = %e, "skipping message");
                }
                Err(e) => return Err(e),
            }
        }
        self.pending.extend(batch.handles);

        if self.last_commit.elapsed() >= self.commit_interval {
            self.commit().await?;
            stats.committed = true;
        }
        Ok(stats)
    }

    async fn commit(&mut self) -> Result<()> {
        self.connector.commit().await?;
        self.last_commit = Instant::now();
        if !self.pending.is_empty() {
            self.source.commit(&self.pending).await?;
            debug!(handles = self.pending.len(), "source offsets committed");
            self.pending.clear();
        }
        Ok(())
    }

    /// Loops over [`Self::run_once`] until `shutdown` resolves, then shuts down.
    pub async fn run(&mut self, shutdown: impl Future<Output = ()>) -> Result<DrainReport> {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
                cycle = self.run_once() => match cycle {
                    Ok(stats) => {
                        if stats.received > 0 {
                            debug!(received = stats.received, skipped = stats.skipped, "cycle done");
                        }
                    }
                    Err(e) if e.is_retryable() => {
                        let delay = e.get_retry_delay_ms();
                        warn!(error = %e, delay_ms = delay, "retrying after error");
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                    }
                    Err(e) => {
                        error!(error = %e, "ingestion failed");
                        return Err(e);
                    }
                },
            }
        }
        self.shutdown().await
    }

    /// Commits what is buffered, drains the connector and acknowledges the
    /// remaining offsets before closing the source.
    pub async fn shutdown(&mut self) -> Result<DrainReport> {
        self.connector.commit().await?;
        let report = self.connector.stop().await?;
        if !self.pending.is_empty() {
            self.source.commit(&self.pending).await?;
            self.pending.clear();
        }
        self.source.shutdown().await?;
        info!(tasks = report.tasks_sent, rows = report.rows_sent, "ingestor stopped");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SourceError;
    use crate::schema::{SchemaRegistry, destination};
    use crate::sink::MemorySink;
    use crate::source::{MessageBatch, SourceMessage};
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    #[derive(Default)]
    struct ScriptedSource {
        batches: Mutex<VecDeque<MessageBatch>>,
        committed: Mutex<Vec<CheckpointHandle>>,
        closed: Mutex<bool>,
    }

    impl ScriptedSource {
        fn push(&self, payloads: &[&str]) {
            let mut batch = MessageBatch::default();
            for payload in payloads {
                let offset = self.batches.lock().unwrap().len() * 100 + batch.len();
                batch.messages.push(SourceMessage {
                    payload: payload.as_bytes().to_vec(),
                    topic: "events".to_string(),
                    partition: 0,
                    headers: HashMap::new(),
                });
                batch.handles.push(offset.to_le_bytes().to_vec());
            }
            self.batches.lock().unwrap().push_back(batch);
        }
    }

    impl Source for &ScriptedSource {
        async fn next_batch(&self) -> std::result::Result<MessageBatch, SourceError> {
            Ok(self.batches.lock().unwrap().pop_front().unwrap_or_default())
        }

        async fn commit(&self, handles: &[CheckpointHandle]) -> std::result::Result<(), SourceError> {
            self.committed.lock().unwrap().extend_from_slice(handles);
            Ok(())
        }

        async fn shutdown(&self) -> std::result::Result<(), SourceError> {
            *self.closed.lock().unwrap() = true;
            Ok(())
        }
    }

    const CLICK: &str = r#"{"session": {"session_id": 1, "project_id": 2}, "event": {"kind": "click", "payload": {"message_id": 1, "timestamp": 1700000000000, "label": "Buy"}}}"#;
    const EMPTY_CLICK: &str = r#"{"session": {"session_id": 1}, "event": {"kind": "click", "payload": {"label": ""}}}"#;
    const BAD_ISSUE: &str = r#"{"session": {"session_id": 1}, "event": {"kind": "issue", "payload": {"type": "nope"}}}"#;

    async fn connector(sink: Arc<MemorySink>) -> Arc<Connector> {
        let connector = Connector::builder(Arc::new(SchemaRegistry::standard("test")), sink).build();
        connector.prepare().await.unwrap();
        Arc::new(connector)
    }

    #[tokio::test]
    async fn test_offsets_wait_for_commit() {
        let sink = Arc::new(MemorySink::new());
        let source = ScriptedSource::default();
        source.push(&[CLICK, "not json", EMPTY_CLICK, BAD_ISSUE]);
        source.push(&[CLICK]);

        let mut ingestor = Ingestor::new(&source, connector(sink.clone()).await, Duration::from_secs(3600));
        let stats = ingestor.run_once().await.unwrap();
        assert_eq!(stats.received, 4);
        assert_eq!(stats.inserted, 2);
        assert_eq!(stats.skipped, 2);
        assert!(!stats.committed);
        assert!(source.committed.lock().unwrap().is_empty());
        assert_eq!(ingestor.connector().pending_rows(destination::CLICKS), 1);

        ingestor.commit_interval = Duration::ZERO;
        let stats = ingestor.run_once().await.unwrap();
        assert!(stats.committed);
        assert_eq!(source.committed.lock().unwrap().len(), 5);
        assert_eq!(ingestor.connector().pending_rows(destination::CLICKS), 0);

        let report = ingestor.shutdown().await.unwrap();
        assert_eq!(report.rows_sent, 2);
        assert_eq!(sink.rows_for(destination::CLICKS).len(), 2);
        assert!(*source.closed.lock().unwrap());
        assert!(sink.is_closed());
    }

    #[tokio::test]
    async fn test_run_stops_on_signal() {
        let sink = Arc::new(MemorySink::new());
        let source = ScriptedSource::default();
        source.push(&[CLICK, CLICK]);

        let mut ingestor = Ingestor::new(&source, connector(sink.clone()).await, Duration::from_secs(3600));
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        ingestor.run_once().await.unwrap();
        tx.send(()).unwrap();
        let report = ingestor.run(async { rx.await.unwrap_or(()) }).await.unwrap();

        assert_eq!(report.rows_sent, 2);
        assert_eq!(source.committed.lock().unwrap().len(), 2);
        assert!(matches!(
            ingestor.connector().commit().await,
            Err(EngineError::Stopped)
        ));
    }
}
