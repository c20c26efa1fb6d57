use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::{Notify, watch};
use tracing::debug;

use crate::errors::SinkError;
use crate::schema::TableSchema;
use crate::sink::Sink;
use crate::value::Row;

/// A bulk write as observed by [`MemorySink`].
#[derive(Debug, Clone, PartialEq)]
pub struct WrittenBulk {
    pub destination: String,
    pub rows: Vec<Row>,
}

/// Keeps every bulk write in memory.
///
/// Used for dry runs and tests: failures can be injected per destination and
/// writes can be held at a gate to simulate a slow store.
pub struct MemorySink {
    written: Mutex<Vec<WrittenBulk>>,
    failing_writes: Mutex<HashSet<String>>,
    failing_prepares: Mutex<HashSet<String>>,
    gate: watch::Sender<bool>,
    started: AtomicUsize,
    started_notify: Notify,
    closed: AtomicBool,
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySink {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            written: Mutex::new(Vec::new()),
            failing_writes: Mutex::new(HashSet::new()),
            failing_prepares: Mutex::new(HashSet::new()),
            gate,
            started: AtomicUsize::new(0),
            started_notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// A sink whose writes block until [`MemorySink::open_gate`] is called.
    pub fn gated() -> Self {
        let sink = Self::new();
        sink.close_gate();
        sink
    }

    pub fn open_gate(&self) {
        self.gate.send_replace(true);
    }

    pub fn close_gate(&self) {
        self.gate.send_replace(false);
    }

    pub fn fail_writes_for(&self, destination: &str) {
        self.failing_writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(destination.to_string());
    }

    pub fn fail_prepares_for(&self, destination: &str) {
        self.failing_prepares
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(destination.to_string());
    }

    pub fn clear_failures(&self) {
        self.failing_writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.failing_prepares
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Successful bulk writes, in completion order.
    pub fn written(&self) -> Vec<WrittenBulk> {
        self.written
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn rows_for(&self, destination: &str) -> Vec<Row> {
        self.written()
            .into_iter()
            .filter(|bulk| bulk.destination == destination)
            .flat_map(|bulk| bulk.rows)
            .collect()
    }

    /// Number of write attempts that have begun, including failed and gated ones.
    pub fn writes_started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    /// Waits until at least `count` writes have begun.
    pub async fn wait_for_writes_started(&self, count: usize) {
        loop {
            let notified = self.started_notify.notified();
            if self.writes_started() >= count {
                return;
            }
            notified.await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Sink for MemorySink {
    async fn prepare(&self, table: &TableSchema) -> Result<(), SinkError> {
        if self.is_closed() {
            return Err(SinkError::Closed);
        }
        let failing = self
            .failing_prepares
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&table.destination);
        if failing {
            return Err(SinkError::Prepare {
                table: table.table.clone(),
                reason: "injected prepare failure".to_string(),
            });
        }
        Ok(())
    }

    async fn write_bulk(&self, table: &TableSchema, rows: &[Row]) -> Result<(), SinkError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        self.started_notify.notify_waiters();

        let mut gate = self.gate.subscribe();
        if gate.wait_for(|open| *open).await.is_err() {
            return Err(SinkError::Closed);
        }

        if self.is_closed() {
            return Err(SinkError::Closed);
        }
        let failing = self
            .failing_writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&table.destination);
        if failing {
            return Err(SinkError::Write {
                table: table.table.clone(),
                reason: "injected write failure".to_string(),
            });
        }

        debug!(destination = %table.destination, rows = rows.len(), "memory sink write");
        self.written
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(WrittenBulk {
                destination: table.destination.clone(),
                rows: rows.to_vec(),
            });
        Ok(())
    }

    async fn close(&self) -> Result<(), SinkError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
