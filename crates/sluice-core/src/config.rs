//! Configuration for runs, workers, the indexer, and the broker substrate.
//!
//! Loaded from a YAML file:
//!
//! ```yaml
//! runner:
//!   connector_timeout_ms: 600000
//! worker:
//!   threads: 4
//!   queue_capacity: 10000
//! indexer:
//!   index: articles
//!   batch_size: 250
//!   batch_timeout_ms: 200
//! pipelines:
//!   - name: enrich
//!     stages:
//!       - type: set_static_values
//!         fields:
//!           origin: catalog
//! connectors:
//!   - name: feed
//!     connector: csv
//!     pipeline: enrich
//!     config:
//!       path: /data/feed.csv
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::document::UpdateMode;
use crate::error::ConfigError;
use crate::stage::StageCondition;

/// Root configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SluiceConfig {
    /// Run orchestration settings.
    #[serde(default)]
    pub runner: RunnerConfig,

    /// Worker pool settings.
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Indexer settings.
    #[serde(default)]
    pub indexer: IndexerConfig,

    /// Broker settings for distributed runs.
    #[serde(default)]
    pub kafka: Option<KafkaConfig>,

    /// Pipeline definitions.
    #[serde(default)]
    pub pipelines: Vec<PipelineConfig>,

    /// Connector definitions, executed in declared order.
    #[serde(default)]
    pub connectors: Vec<ConnectorConfig>,
}

impl SluiceConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml(&raw)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Check cross-references and bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker.threads == 0 {
            return Err(ConfigError::invalid("worker.threads must be at least 1"));
        }
        if self.indexer.batch_size == 0 {
            return Err(ConfigError::invalid("indexer.batch_size must be at least 1"));
        }
        for connector in &self.connectors {
            let Some(pipeline) = &connector.pipeline else {
                return Err(ConfigError::invalid(format!(
                    "connector '{}' names no pipeline",
                    connector.name
                )));
            };
            if !self.pipelines.iter().any(|p| &p.name == pipeline) {
                return Err(ConfigError::invalid(format!(
                    "connector '{}' references unknown pipeline '{}'",
                    connector.name, pipeline
                )));
            }
        }
        Ok(())
    }

    /// The pipeline definition with the given name.
    pub fn pipeline(&self, name: &str) -> Option<&PipelineConfig> {
        self.pipelines.iter().find(|p| p.name == name)
    }
}

/// Run orchestration settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunnerConfig {
    /// Wall-clock budget per connector, in milliseconds.
    #[serde(default = "default_connector_timeout_ms")]
    pub connector_timeout_ms: u64,
}

fn default_connector_timeout_ms() -> u64 {
    86_400_000 // one day
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            connector_timeout_ms: default_connector_timeout_ms(),
        }
    }
}

/// Worker pool settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkerConfig {
    /// Workers per pipeline.
    #[serde(default = "default_worker_threads")]
    pub threads: usize,

    /// Source queue bound; publishers block once it is reached. Unbounded
    /// when absent.
    #[serde(default)]
    pub queue_capacity: Option<usize>,
}

fn default_worker_threads() -> usize {
    1
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            threads: default_worker_threads(),
            queue_capacity: None,
        }
    }
}

/// External versioning mode for the index backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionType {
    /// Backend-managed versions.
    #[default]
    Internal,
    /// Version drawn from the source offset; strictly greater wins.
    External,
    /// Version drawn from the source offset; greater-or-equal wins.
    ExternalGte,
}

/// Indexer settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IndexerConfig {
    /// Target index name.
    #[serde(default = "default_index")]
    pub index: String,

    /// Flush when this many documents are batched.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Flush when the oldest batched document is this old, in
    /// milliseconds.
    #[serde(default = "default_batch_timeout_ms")]
    pub batch_timeout_ms: u64,

    /// Field whose value substitutes the document id in the indexing call.
    #[serde(default)]
    pub id_override_field: Option<String>,

    /// Field holding the routed shard key.
    #[serde(default)]
    pub routing_field: Option<String>,

    /// Versioning mode.
    #[serde(default)]
    pub version_type: VersionType,

    /// Field marking a document for deletion.
    #[serde(default)]
    pub deletion_marker_field: Option<String>,

    /// Marker value meaning "delete".
    #[serde(default)]
    pub deletion_marker_field_value: Option<String>,

    /// Field naming the delete-by-query field.
    #[serde(default)]
    pub delete_by_field_field: Option<String>,

    /// Field naming the delete-by-query value.
    #[serde(default)]
    pub delete_by_field_value: Option<String>,

    /// Field names stripped from the indexed payload.
    #[serde(default)]
    pub ignore_fields: Vec<String>,

    /// Leave the id out of the indexed payload entirely.
    #[serde(default)]
    pub omit_id_from_payload: bool,
}

fn default_index() -> String {
    "sluice".to_string()
}

fn default_batch_size() -> usize {
    100
}

fn default_batch_timeout_ms() -> u64 {
    100
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            index: default_index(),
            batch_size: default_batch_size(),
            batch_timeout_ms: default_batch_timeout_ms(),
            id_override_field: None,
            routing_field: None,
            version_type: VersionType::default(),
            deletion_marker_field: None,
            deletion_marker_field_value: None,
            delete_by_field_field: None,
            delete_by_field_value: None,
            ignore_fields: Vec::new(),
            omit_id_from_payload: false,
        }
    }
}

/// Broker settings for distributed runs.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KafkaConfig {
    /// Bootstrap servers (host:port).
    pub bootstrap_servers: Vec<String>,

    /// Prefix of the source, destination, and event topics.
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,

    /// Prefix of the consumer groups.
    #[serde(default = "default_consumer_group_prefix")]
    pub consumer_group_prefix: String,

    /// Delay a freshly polled record waits in the deduplication holding
    /// area, in milliseconds. Gives a rebalance redelivery time to settle.
    #[serde(default = "default_dedup_delay_ms")]
    pub dedup_delay_ms: u64,

    /// Broker poll timeout, in milliseconds.
    #[serde(default = "default_kafka_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
}

fn default_topic_prefix() -> String {
    "sluice".to_string()
}

fn default_consumer_group_prefix() -> String {
    "sluice".to_string()
}

fn default_dedup_delay_ms() -> u64 {
    1_000
}

fn default_kafka_poll_timeout_ms() -> u64 {
    250
}

/// One pipeline definition.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    /// Pipeline name, referenced by connectors.
    pub name: String,

    /// Stages in execution order.
    #[serde(default)]
    pub stages: Vec<StageConfig>,
}

/// One stage definition.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StageConfig {
    /// Conditions gating the stage; all must match.
    #[serde(default)]
    pub conditions: Vec<StageCondition>,

    /// The stage itself.
    #[serde(flatten)]
    pub kind: StageKind,
}

/// Built-in stage types. Stages beyond these are composed in code through
/// [`Pipeline::builder`](crate::pipeline::Pipeline::builder).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StageKind {
    /// Write fixed values onto each document.
    SetStaticValues {
        /// Field name → value.
        #[serde(default)]
        fields: BTreeMap<String, serde_json::Value>,
        /// How existing fields are treated.
        #[serde(default)]
        update_mode: UpdateMode,
    },
    /// Count the values of fields into other fields.
    FieldLength {
        /// Source field → destination field.
        #[serde(default)]
        field_mapping: BTreeMap<String, String>,
    },
}

/// One connector definition.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectorConfig {
    /// Connector name, used in logs and run summaries.
    pub name: String,

    /// Connector type (e.g. "csv", "datagen").
    pub connector: String,

    /// Pipeline this connector feeds.
    #[serde(default)]
    pub pipeline: Option<String>,

    /// Connector-specific configuration.
    #[serde(default)]
    pub config: serde_yaml::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"
runner:
  connector_timeout_ms: 5000
worker:
  threads: 2
  queue_capacity: 100
indexer:
  index: articles
  batch_size: 10
  deletion_marker_field: is_deleted
  deletion_marker_field_value: "true"
  ignore_fields: [internal_notes]
pipelines:
  - name: enrich
    stages:
      - type: set_static_values
        fields:
          origin: catalog
        update_mode: skip
      - type: field_length
        field_mapping:
          tags: tag_count
        conditions:
          - field: kind
            values: [article]
connectors:
  - name: feed
    connector: csv
    pipeline: enrich
    config:
      path: /data/feed.csv
"#;

    #[test]
    fn parses_a_full_config() {
        let config = SluiceConfig::from_yaml(EXAMPLE).unwrap();
        assert_eq!(config.runner.connector_timeout_ms, 5000);
        assert_eq!(config.worker.threads, 2);
        assert_eq!(config.worker.queue_capacity, Some(100));
        assert_eq!(config.indexer.index, "articles");
        assert_eq!(
            config.indexer.deletion_marker_field.as_deref(),
            Some("is_deleted")
        );
        assert_eq!(config.pipelines.len(), 1);
        assert_eq!(config.pipelines[0].stages.len(), 2);
        assert_eq!(config.connectors[0].connector, "csv");
        config.validate().unwrap();
    }

    #[test]
    fn stage_kinds_are_tagged() {
        let config = SluiceConfig::from_yaml(EXAMPLE).unwrap();
        match &config.pipelines[0].stages[0].kind {
            StageKind::SetStaticValues { fields, update_mode } => {
                assert_eq!(fields["origin"], serde_json::json!("catalog"));
                assert_eq!(*update_mode, UpdateMode::Skip);
            }
            other => panic!("unexpected stage kind: {other:?}"),
        }
        assert_eq!(config.pipelines[0].stages[1].conditions.len(), 1);
    }

    #[test]
    fn defaults_apply_when_sections_are_absent() {
        let config = SluiceConfig::from_yaml("{}").unwrap();
        assert_eq!(config.runner.connector_timeout_ms, 86_400_000);
        assert_eq!(config.worker.threads, 1);
        assert_eq!(config.worker.queue_capacity, None);
        assert_eq!(config.indexer.batch_size, 100);
        assert!(config.kafka.is_none());
    }

    #[test]
    fn validate_rejects_unknown_pipeline_reference() {
        let config = SluiceConfig::from_yaml(
            r#"
pipelines: []
connectors:
  - name: feed
    connector: csv
    pipeline: nowhere
"#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_workers() {
        let config = SluiceConfig::from_yaml("worker:\n  threads: 0\n").unwrap();
        assert!(config.validate().is_err());
    }
}
