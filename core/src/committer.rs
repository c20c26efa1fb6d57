//! The background worker that transmits flush tasks.
//!
//! One task is in flight at a time and at most one more waits in the queue,
//! which is what makes `Connector::commit` block under a slow store.
//!
//! States: `Running` accepts tasks. A shutdown signal moves the worker to
//! `Draining`, where the queue is closed and whatever is still in it is sent in
//! arrival order. Once the queue is empty the worker reports `Stopped` and
//! resolves its join handle with a [`DrainReport`].

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::batch::FlushTask;
use crate::errors::{EngineError, Result};
use crate::sink::Sink;
use crate::telemetry::CommitMetrics;
use crate::value::Row;

/// Queue slots beyond the task being transmitted.
pub const TASK_QUEUE_DEPTH: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CommitterState {
    Running,
    Draining,
    Stopped,
}

/// A batch the store refused. Its rows are not retried by the engine.
#[derive(Debug)]
pub struct FailedBatch {
    pub task_id: u64,
    pub destination: String,
    pub rows: Vec<Row>,
    pub error: EngineError,
}

/// Receives batches that failed to transmit, e.g. to dead-letter or re-queue them.
pub trait FailureHook: Send + Sync {
    fn on_failed_batch(&self, failed: FailedBatch);
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub tasks_sent: u64,
    pub batches_sent: u64,
    pub batches_failed: u64,
    pub rows_sent: u64,
    /// Tasks transmitted after the shutdown signal.
    pub drained_tasks: u64,
}

struct Committer {
    sink: Arc<dyn Sink>,
    tasks: mpsc::Receiver<FlushTask>,
    shutdown: oneshot::Receiver<()>,
    state: watch::Sender<CommitterState>,
    metrics: Arc<CommitMetrics>,
    hook: Option<Arc<dyn FailureHook>>,
    report: DrainReport,
}

/// Owner side of the committer: enqueues tasks and drives shutdown.
pub struct CommitterHandle {
    tasks: mpsc::Sender<FlushTask>,
    shutdown: Option<oneshot::Sender<()>>,
    state: watch::Receiver<CommitterState>,
    worker: Option<JoinHandle<DrainReport>>,
}

impl CommitterHandle {
    /// Starts the worker on the current tokio runtime.
    pub fn spawn(
        sink: Arc<dyn Sink>,
        metrics: Arc<CommitMetrics>,
        hook: Option<Arc<dyn FailureHook>>,
    ) -> Self {
        let (task_tx, task_rx) = mpsc::channel(TASK_QUEUE_DEPTH);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (state_tx, state_rx) = watch::channel(CommitterState::Running);

        let committer = Committer {
            sink,
            tasks: task_rx,
            shutdown: shutdown_rx,
            state: state_tx,
            metrics,
            hook,
            report: DrainReport::default(),
        };
        let worker = tokio::spawn(committer.run());

        Self {
            tasks: task_tx,
            shutdown: Some(shutdown_tx),
            state: state_rx,
            worker: Some(worker),
        }
    }

    pub fn state(&self) -> CommitterState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<CommitterState> {
        self.state.clone()
    }

    /// Waits for a free queue slot. The permit accepts exactly one task.
    pub async fn reserve(&self) -> Result<mpsc::Permit<'_, FlushTask>> {
        if self.shutdown.is_none() || self.state() != CommitterState::Running {
            return Err(EngineError::Stopped);
        }
        self.tasks.reserve().await.map_err(|_| EngineError::Stopped)
    }

    /// Queues a task, waiting for a free slot if the worker is behind.
    pub async fn enqueue(&self, task: FlushTask) -> Result<()> {
        self.reserve().await?.send(task);
        Ok(())
    }

    /// Signals shutdown and waits for the queue to drain. Only the first call
    /// does anything; later calls return `Stopped`.
    pub async fn shutdown(&mut self) -> Result<DrainReport> {
        let signal = self.shutdown.take().ok_or(EngineError::Stopped)?;
        // The worker may already be gone if it panicked; the join below reports that.
        let _ = signal.send(());
        let worker = self.worker.take().ok_or(EngineError::Stopped)?;
        worker
            .await
            .map_err(|e| EngineError::Generic(anyhow::anyhow!("committer task failed: {e}")))
    }
}

impl Committer {
    async fn run(mut self) -> DrainReport {
        info!("committer started");
        loop {
            tokio::select! {
                biased;
                _ = &mut self.shutdown => break,
                task = self.tasks.recv() => match task {
                    Some(task) => self.send_task(task, false).await,
                    None => break,
                },
            }
        }

        self.state.send_replace(CommitterState::Draining);
        self.tasks.close();
        let mut drained = 0;
        while let Some(task) = self.tasks.recv().await {
            self.send_task(task, true).await;
            drained += 1;
        }
        info!(drained_tasks = drained, "committer drained");

        self.state.send_replace(CommitterState::Stopped);
        self.report
    }

    async fn send_task(&mut self, task: FlushTask, draining: bool) {
        let start = Instant::now();
        let task_id = task.id();
        let mut rows_sent = 0u64;
        let mut failed = 0u64;

        for mut batch in task.into_batches() {
            match batch.send(self.sink.as_ref()).await {
                Ok(rows) => {
                    if rows > 0 {
                        rows_sent += rows as u64;
                        self.report.batches_sent += 1;
                        CommitMetrics::incr(&self.metrics.batches_sent);
                    }
                }
                Err(error) => {
                    failed += 1;
                    self.report.batches_failed += 1;
                    CommitMetrics::incr(&self.metrics.batches_failed);
                    CommitMetrics::add(&self.metrics.rows_lost, batch.len() as u64);
                    error!(
                        task_id,
                        destination = %batch.destination(),
                        rows = batch.len(),
                        error = %error,
                        "can't send batch"
                    );
                    if let Some(hook) = &self.hook {
                        hook.on_failed_batch(FailedBatch {
                            task_id,
                            destination: batch.destination().to_string(),
                            rows: batch.into_rows(),
                            error,
                        });
                    }
                }
            }
        }

        let duration_ms = start.elapsed().as_millis() as u64;
        self.report.tasks_sent += 1;
        self.report.rows_sent += rows_sent;
        if draining {
            self.report.drained_tasks += 1;
        }
        CommitMetrics::incr(&self.metrics.tasks_sent);
        CommitMetrics::add(&self.metrics.rows_sent, rows_sent);
        self.metrics
            .last_task_duration_ms
            .store(duration_ms, std::sync::atomic::Ordering::Relaxed);

        if failed > 0 {
            warn!(
                task_id,
                duration_ms,
                rows = rows_sent,
                failed_batches = failed,
                "task sent with failures"
            );
        } else {
            info!(task_id, duration_ms, rows = rows_sent, "task sent");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BatchSet;
    use crate::schema::{SchemaRegistry, destination};
    use crate::sink::MemorySink;
    use crate::value::{Value, datetime};
    use std::sync::Mutex;

    fn click(label: &str) -> Row {
        vec![
            Value::UInt64(1),
            Value::UInt16(1),
            Value::UInt64(1),
            datetime(1_700_000_000_000),
            Value::from(label),
            Value::Null,
            Value::from("CLICK"),
        ]
    }

    async fn task_with_click(id: u64, registry: &SchemaRegistry, sink: &MemorySink) -> FlushTask {
        let mut set = BatchSet::prepare(registry, sink).await.set;
        set.append(destination::CLICKS, click("go")).unwrap();
        set.into_task(id, registry)
    }

    #[derive(Default)]
    struct Collect(Mutex<Vec<String>>);

    impl FailureHook for Collect {
        fn on_failed_batch(&self, failed: FailedBatch) {
            self.0.lock().unwrap().push(failed.destination);
        }
    }

    #[tokio::test]
    async fn test_shutdown_drains_queue_in_order() {
        let registry = SchemaRegistry::standard("test");
        let sink = Arc::new(MemorySink::gated());
        let mut handle =
            CommitterHandle::spawn(sink.clone(), Arc::new(CommitMetrics::new()), None);

        handle.enqueue(task_with_click(1, &registry, &sink).await).await.unwrap();
        sink.wait_for_writes_started(1).await;
        handle.enqueue(task_with_click(2, &registry, &sink).await).await.unwrap();

        let shutdown = tokio::spawn(async move {
            let report = handle.shutdown().await;
            (handle, report)
        });
        // Let the shutdown signal land while task 1 is still stuck at the gate.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        sink.open_gate();

        let (handle, report) = shutdown.await.unwrap();
        let report = report.unwrap();
        assert_eq!(report.tasks_sent, 2);
        assert_eq!(report.drained_tasks, 1);
        assert_eq!(handle.state(), CommitterState::Stopped);
        assert_eq!(sink.rows_for(destination::CLICKS).len(), 2);
        assert!(matches!(
            handle.enqueue(task_with_click(3, &registry, &sink).await).await,
            Err(EngineError::Stopped)
        ));
    }

    #[tokio::test]
    async fn test_failed_batches_reach_hook() {
        let registry = SchemaRegistry::standard("test");
        let sink = Arc::new(MemorySink::new());
        sink.fail_writes_for(destination::CLICKS);
        let hook = Arc::new(Collect::default());
        let metrics = Arc::new(CommitMetrics::new());
        let mut handle = CommitterHandle::spawn(
            sink.clone(),
            metrics.clone(),
            Some(hook.clone() as Arc<dyn FailureHook>),
        );

        handle.enqueue(task_with_click(1, &registry, &sink).await).await.unwrap();
        let report = handle.shutdown().await.unwrap();

        assert_eq!(report.batches_failed, 1);
        assert_eq!(*hook.0.lock().unwrap(), vec![destination::CLICKS.to_string()]);
        assert_eq!(metrics.snapshot().rows_lost, 1);
        assert!(handle.shutdown().await.is_err());
    }
}
