pub mod delta;
pub mod memory;

use async_trait::async_trait;

use crate::errors::SinkError;
use crate::schema::TableSchema;
use crate::value::Row;

pub use delta::DeltaSink;
pub use memory::MemorySink;

/// The `Sink` trait defines the contract for the columnar store.
/// It takes one destination's rows at a time and persists them as a single bulk write.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Allocates whatever a fresh bulk insert for `table` needs.
    ///
    /// Called for every destination each time a batch set is rebuilt.
    async fn prepare(&self, table: &TableSchema) -> Result<(), SinkError>;

    /// Writes `rows` to `table` as one bulk operation. Never retried by the caller.
    async fn write_bulk(&self, table: &TableSchema, rows: &[Row]) -> Result<(), SinkError>;

    /// Releases the underlying connection. Called once, after the last write.
    async fn close(&self) -> Result<(), SinkError>;
}
