use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Encoding error for {destination}: {reason}")]
    Encoding { destination: String, reason: String },

    #[error("Batch for {destination} was already sent")]
    AlreadySent { destination: String },

    #[error("No open batch for destination {destination}")]
    UnknownDestination { destination: String },

    #[error("Failed to send batch for {destination}")]
    Transmission {
        destination: String,
        #[source]
        source: SinkError,
    },

    #[error("Failed to prepare batch for {destination}")]
    Prepare {
        destination: String,
        #[source]
        source: SinkError,
    },

    #[error("Connector is stopped")]
    Stopped,

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Data source error")]
    Source(#[from] SourceError),

    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    #[error("Generic error: {0}")]
    Generic(#[from] anyhow::Error),
}

/// Caller-supplied data rejected before it reaches a batch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("unknown issue type: {0}")]
    UnknownIssueType(String),

    #[error("unknown error source: {0}")]
    UnknownErrorSource(String),

    #[error("unknown resource type {kind} in session {session_id}")]
    UnknownResourceType { session_id: u64, kind: String },

    #[error("unknown http method {method} in session {session_id}")]
    UnknownMethod { session_id: u64, method: String },

    #[error("missing required field {field}")]
    MissingField { field: &'static str },
}

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Failed to connect or communicate with the source")]
    Connection {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("A transient error occurred, the operation can be retried")]
    Transient {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Unrecoverable error from the source")]
    Unrecoverable(#[source] Box<dyn std::error::Error + Send + Sync>),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Configuration validation failed: {reason}")]
    ValidationFailed { reason: String },

    #[error("Failed to load configuration from {origin}: {error}")]
    LoadFailed {
        origin: String,
        #[source]
        error: Box<dyn std::error::Error + Send + Sync>,
    },
}

#[derive(Error, Debug)]
pub enum KafkaError {
    #[error("Failed to create consumer: {reason}")]
    ConsumerCreation { reason: String },

    #[error("Failed to subscribe to topics {topics}: {reason}")]
    Subscription { topics: String, reason: String },

    #[error("Failed to consume messages: {reason}")]
    Consumption { reason: String },

    #[error("Failed to commit offsets: {reason}")]
    OffsetCommit { reason: String },

    #[error("Message parsing failed: {reason}")]
    MessageParsing { reason: String },
}

/// Failures reported by a store sink.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    #[error("Failed to open bulk insert for {table}: {reason}")]
    Prepare { table: String, reason: String },

    #[error("Failed to write bulk to {table}: {reason}")]
    Write { table: String, reason: String },

    #[error("Row conversion failed for {table}: {reason}")]
    Conversion { table: String, reason: String },

    #[error("Sink is closed")]
    Closed,
}

#[derive(Error, Debug)]
pub enum SerializationError {
    #[error("JSON serialization failed: {reason}")]
    Json { reason: String },

    #[error("YAML serialization failed: {reason}")]
    Yaml { reason: String },
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization(SerializationError::Json {
            reason: err.to_string(),
        })
    }
}

impl From<serde_yaml::Error> for EngineError {
    fn from(err: serde_yaml::Error) -> Self {
        EngineError::Serialization(SerializationError::Yaml {
            reason: err.to_string(),
        })
    }
}

impl EngineError {
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Source(SourceError::Transient { .. }) => true,
            EngineError::Source(SourceError::Connection { .. }) => true,
            _ => false,
        }
    }

    /// Errors that concern a single event; the producer drops the event and moves on.
    pub fn should_skip_message(&self) -> bool {
        matches!(
            self,
            EngineError::Validation(_)
                | EngineError::Encoding { .. }
                | EngineError::AlreadySent { .. }
                | EngineError::UnknownDestination { .. }
                | EngineError::Serialization(_)
        )
    }

    pub fn get_retry_delay_ms(&self) -> u64 {
        match self {
            EngineError::Source(_) => 1000,
            _ => 5000,
        }
    }
}
