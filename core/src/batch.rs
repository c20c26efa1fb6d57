//! Per-destination row buffers and the generation swap between them.
//!
//! A [`BatchSet`] holds one open [`Batch`] per destination. At commit time the
//! whole set is retired into a [`FlushTask`] and a fresh set takes its place,
//! so a batch handed to the committer is never reachable by producers again.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::warn;

use crate::errors::{EngineError, Result};
use crate::schema::{SchemaRegistry, TableSchema};
use crate::sink::Sink;
use crate::value::{Row, Value, truncate_to_bytes};

/// Row buffer for one destination during one accumulation window.
#[derive(Debug)]
pub struct Batch {
    schema: Arc<TableSchema>,
    rows: Vec<Row>,
    truncated: usize,
    sent: bool,
}

impl Batch {
    pub fn new(schema: Arc<TableSchema>) -> Self {
        Self {
            schema,
            rows: Vec::new(),
            truncated: 0,
            sent: false,
        }
    }

    pub fn destination(&self) -> &str {
        &self.schema.destination
    }

    pub fn schema(&self) -> &Arc<TableSchema> {
        &self.schema
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    /// Number of string cells cut down to their column budget so far.
    pub fn truncated_cells(&self) -> usize {
        self.truncated
    }

    pub fn is_sent(&self) -> bool {
        self.sent
    }

    /// Buffers one row and returns how many of its strings were truncated.
    /// No I/O happens here.
    pub fn append(&mut self, mut row: Row) -> Result<usize> {
        if self.sent {
            return Err(EngineError::AlreadySent {
                destination: self.schema.destination.clone(),
            });
        }
        if row.len() != self.schema.arity() {
            return Err(EngineError::Encoding {
                destination: self.schema.destination.clone(),
                reason: format!(
                    "schema mismatch: expected {} values, got {}",
                    self.schema.arity(),
                    row.len()
                ),
            });
        }

        let mut truncated = 0;
        for (column, value) in self.schema.columns.iter().zip(row.iter_mut()) {
            match value.data_type() {
                None if column.nullable => {}
                None => {
                    return Err(EngineError::Encoding {
                        destination: self.schema.destination.clone(),
                        reason: format!("column {} is not nullable", column.name),
                    });
                }
                Some(actual) if actual != column.data_type => {
                    return Err(EngineError::Encoding {
                        destination: self.schema.destination.clone(),
                        reason: format!(
                            "column {} expects {:?}, got {:?}",
                            column.name, column.data_type, actual
                        ),
                    });
                }
                Some(_) => {}
            }
            if let (Some(budget), Value::String(s)) = (column.max_bytes, value) {
                if truncate_to_bytes(s, budget) {
                    truncated += 1;
                }
            }
        }

        self.truncated += truncated;
        self.rows.push(row);
        Ok(truncated)
    }

    /// Transmits the buffered rows as one bulk write.
    ///
    /// The batch is marked sent before the write is attempted, so a second call
    /// returns `AlreadySent` whatever the outcome of the first. Empty batches
    /// are marked sent without touching the sink. Returns the number of rows sent.
    pub async fn send(&mut self, sink: &dyn Sink) -> Result<usize> {
        if self.sent {
            return Err(EngineError::AlreadySent {
                destination: self.schema.destination.clone(),
            });
        }
        self.sent = true;
        if self.rows.is_empty() {
            return Ok(0);
        }
        sink.write_bulk(&self.schema, &self.rows)
            .await
            .map_err(|source| EngineError::Transmission {
                destination: self.schema.destination.clone(),
                source,
            })?;
        Ok(self.rows.len())
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }
}

/// The open batches of every destination that prepared successfully.
#[derive(Debug, Default)]
pub struct BatchSet {
    batches: HashMap<String, Batch>,
}

/// Outcome of rebuilding a batch set. `failures` holds one `Prepare` error per
/// destination left without a batch.
pub struct PreparedSet {
    pub set: BatchSet,
    pub failures: Vec<EngineError>,
}

impl BatchSet {
    /// An empty set with no destinations; every append fails until `prepare` runs.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Allocates one fresh batch per registered destination.
    pub async fn prepare(registry: &SchemaRegistry, sink: &dyn Sink) -> PreparedSet {
        let mut batches = HashMap::with_capacity(registry.len());
        let mut failures = Vec::new();
        for table in registry.tables() {
            match sink.prepare(table).await {
                Ok(()) => {
                    batches.insert(table.destination.clone(), Batch::new(Arc::clone(table)));
                }
                Err(source) => {
                    warn!(destination = %table.destination, error = %source, "can't prepare batch");
                    failures.push(EngineError::Prepare {
                        destination: table.destination.clone(),
                        source,
                    });
                }
            }
        }
        PreparedSet {
            set: Self { batches },
            failures,
        }
    }

    pub fn append(&mut self, destination: &str, row: Row) -> Result<usize> {
        match self.batches.get_mut(destination) {
            Some(batch) => batch.append(row),
            None => Err(EngineError::UnknownDestination {
                destination: destination.to_string(),
            }),
        }
    }

    pub fn get(&self, destination: &str) -> Option<&Batch> {
        self.batches.get(destination)
    }

    pub fn contains(&self, destination: &str) -> bool {
        self.batches.contains_key(destination)
    }

    pub fn rows(&self, destination: &str) -> usize {
        self.batches.get(destination).map_or(0, Batch::len)
    }

    pub fn total_rows(&self) -> usize {
        self.batches.values().map(Batch::len).sum()
    }

    pub fn destinations(&self) -> usize {
        self.batches.len()
    }

    /// Retires the set into a flush task, ordered as in `registry`.
    pub fn into_task(mut self, id: u64, registry: &SchemaRegistry) -> FlushTask {
        let mut batches = Vec::with_capacity(self.batches.len());
        for destination in registry.destinations() {
            if let Some(batch) = self.batches.remove(destination) {
                batches.push(batch);
            }
        }
        // Anything the registry doesn't list still gets sent.
        batches.extend(self.batches.into_values());
        FlushTask {
            id,
            batches,
            created_at: Instant::now(),
        }
    }
}

/// Batches detached from one batch set at commit time.
#[derive(Debug)]
pub struct FlushTask {
    id: u64,
    batches: Vec<Batch>,
    created_at: Instant,
}

impl FlushTask {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn batches(&self) -> &[Batch] {
        &self.batches
    }

    pub fn total_rows(&self) -> usize {
        self.batches.iter().map(Batch::len).sum()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn into_batches(self) -> Vec<Batch> {
        self.batches
    }
}
