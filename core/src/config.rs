use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::schema::{MAX_STRING_BYTES, SchemaRegistry};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IngestConfig {
    pub version: u32,
    pub source: SourceConfig,
    pub sink: SinkConfig,
    #[serde(default)]
    pub processing: ProcessingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceConfig {
    #[serde(rename = "type")]
    pub source_type: String,
    pub options: KafkaOptions,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KafkaOptions {
    pub bootstrap_servers: String,
    pub topics: Vec<String>,
    pub consumer_group: String,
    pub security_protocol: Option<String>,
    pub sasl_mechanisms: Option<String>,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
    pub ssl_ca_location: Option<String>,
    pub auto_offset_reset: Option<String>,
    pub session_timeout_ms: Option<u32>,
    pub heartbeat_interval_ms: Option<u32>,
    pub max_poll_records: Option<u32>,
    pub poll_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SinkConfig {
    #[serde(rename = "type")]
    pub target_type: SinkType,
    pub options: Option<DeltaOptions>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkType {
    Delta,
    Memory,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeltaOptions {
    /// Each destination is written to `<table_root>/<destination>`.
    pub table_root: String,
    pub storage_options: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProcessingConfig {
    pub commit_interval_ms: u64,
    pub max_string_bytes: usize,
    pub save_request_payloads: bool,
    /// Namespace prefixed to every target table.
    pub database: String,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            commit_interval_ms: 20_000,
            max_string_bytes: MAX_STRING_BYTES,
            save_request_payloads: false,
            database: "experimental".to_string(),
        }
    }
}

pub async fn load_config(config_path: Option<&str>) -> anyhow::Result<IngestConfig> {
    match config_path {
        Some(path) => IngestConfig::from_file(path),
        None => IngestConfig::from_env(),
    }
}

impl IngestConfig {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: IngestConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn from_env() -> anyhow::Result<Self> {
        let config_str = std::env::var("INGEST_CONFIG")
            .map_err(|_| anyhow::anyhow!("INGEST_CONFIG environment variable not set"))?;
        let config: IngestConfig = serde_yaml::from_str(&config_str)?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.source.source_type != "kafka" {
            return Err(anyhow::anyhow!(
                "Unsupported source type: {}",
                self.source.source_type
            ));
        }
        if self.source.options.bootstrap_servers.is_empty() {
            return Err(anyhow::anyhow!("Kafka bootstrap servers cannot be empty"));
        }
        if self.source.options.topics.is_empty() {
            return Err(anyhow::anyhow!("At least one Kafka topic must be configured"));
        }
        if self.sink.target_type == SinkType::Delta {
            match &self.sink.options {
                Some(options) if !options.table_root.is_empty() => {}
                _ => return Err(anyhow::anyhow!("Delta sink requires a table_root")),
            }
        }
        if self.processing.commit_interval_ms == 0 {
            return Err(anyhow::anyhow!("Commit interval must be positive"));
        }
        if self.processing.max_string_bytes == 0 {
            return Err(anyhow::anyhow!("max_string_bytes must be positive"));
        }
        Ok(())
    }

    /// Builds the destination registry, applying the configured string budget.
    pub fn registry(&self) -> SchemaRegistry {
        SchemaRegistry::standard(&self.processing.database)
            .with_string_budget(self.processing.max_string_bytes)
    }
}
