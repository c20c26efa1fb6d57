pub mod batch;
pub mod committer;
pub mod config;
pub mod connector;
pub mod encode;
pub mod errors;
pub mod events;
pub mod ingestor;
pub mod schema;
pub mod sink;
pub mod source;
pub mod telemetry;
pub mod value;

pub use config::IngestConfig;
pub use committer::{CommitterState, DrainReport, FailedBatch, FailureHook};
pub use connector::{Connector, ConnectorBuilder};
pub use errors::{EngineError, Result};
pub use ingestor::Ingestor;
pub use schema::SchemaRegistry;
pub use sink::{DeltaSink, MemorySink, Sink};
