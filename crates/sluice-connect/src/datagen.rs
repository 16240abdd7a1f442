//! Synthetic document generator for demos and tests.

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;
use validator::Validate;

use sluice_core::{
    ConfigError, Connector, ConnectorConfig, ConnectorError, Document, FieldValue, Publisher,
};

fn default_count() -> u64 {
    100
}

fn default_id_prefix() -> String {
    "doc".to_string()
}

/// Datagen connector configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Validate, JsonSchema)]
pub struct DatagenConnectorConfig {
    /// Number of documents to generate.
    #[serde(default = "default_count")]
    #[validate(range(min = 1, max = 10_000_000))]
    pub count: u64,

    /// Document ids are `<prefix>-<sequence>`.
    #[serde(default = "default_id_prefix")]
    pub id_prefix: String,

    /// Fields written onto every generated document.
    #[serde(default)]
    pub fields: BTreeMap<String, serde_json::Value>,
}

impl Default for DatagenConnectorConfig {
    fn default() -> Self {
        Self {
            count: default_count(),
            id_prefix: default_id_prefix(),
            fields: BTreeMap::new(),
        }
    }
}

/// Connector generating synthetic documents without any external system.
pub struct DatagenConnector {
    name: String,
    pipeline: Option<String>,
    config: DatagenConnectorConfig,
}

impl DatagenConnector {
    /// A datagen connector with an explicit configuration.
    pub fn new(
        name: impl Into<String>,
        pipeline: Option<String>,
        config: DatagenConnectorConfig,
    ) -> Self {
        Self {
            name: name.into(),
            pipeline,
            config,
        }
    }

    /// Build from a connector configuration block.
    pub fn from_config(config: &ConnectorConfig) -> Result<Self, ConfigError> {
        let parsed = crate::parse_connector_config(config)?;
        Ok(Self::new(&config.name, config.pipeline.clone(), parsed))
    }
}

#[async_trait]
impl Connector for DatagenConnector {
    fn name(&self) -> &str {
        &self.name
    }

    fn pipeline(&self) -> Option<&str> {
        self.pipeline.as_deref()
    }

    async fn execute(&self, publisher: Publisher) -> Result<(), ConnectorError> {
        for sequence in 0..self.config.count {
            let mut doc = Document::new(format!("{}-{}", self.config.id_prefix, sequence))
                .map_err(|e| ConnectorError::source(e.to_string()))?;
            doc.set_field("sequence", sequence as i64);
            for (name, value) in &self.config.fields {
                doc.set_field(name, FieldValue::from_json(value.clone()));
            }
            publisher.publish(doc).await?;
        }
        info!(
            connector = self.name.as_str(),
            count = self.config.count,
            "datagen connector finished"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_core::RecordingMessenger;
    use std::sync::Arc;

    #[tokio::test]
    async fn generates_the_configured_number_of_documents() {
        let messenger = Arc::new(RecordingMessenger::new());
        let publisher = Publisher::new(messenger.clone(), "run-1", "enrich");

        let mut fields = BTreeMap::new();
        fields.insert("kind".to_string(), serde_json::json!("synthetic"));
        let connector = DatagenConnector::new(
            "generator",
            Some("enrich".to_string()),
            DatagenConnectorConfig {
                count: 3,
                id_prefix: "gen".to_string(),
                fields,
            },
        );
        connector.execute(publisher).await.unwrap();

        let docs = messenger.documents_sent_for_processing();
        assert_eq!(docs.len(), 3);
        assert_eq!(docs[0].id(), "gen-0");
        assert_eq!(docs[2].id(), "gen-2");
        assert_eq!(docs[1].get_long("sequence"), Some(1));
        assert_eq!(docs[1].get_string("kind").unwrap(), "synthetic");
    }
}
