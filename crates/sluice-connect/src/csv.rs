//! Connector producing documents from the rows of a CSV file.

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use validator::Validate;

use sluice_core::{
    ConfigError, Connector, ConnectorConfig, ConnectorError, Document, Publisher, RESERVED_FIELDS,
};

fn default_line_num_field() -> String {
    "csv_line_number".to_string()
}

fn default_true() -> bool {
    true
}

/// CSV connector configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Validate, JsonSchema)]
pub struct CsvConnectorConfig {
    /// Path of the CSV file. The first row is the header.
    #[validate(length(min = 1))]
    pub path: String,

    /// Header column holding the document id; the first column when
    /// absent.
    #[serde(default)]
    pub id_field: Option<String>,

    /// Field receiving the 1-based row number.
    #[serde(default = "default_line_num_field")]
    pub line_num_field: String,

    /// Read tab-separated values instead of commas.
    #[serde(default)]
    pub use_tabs: bool,

    /// Honor RFC 4180 quoting. Disable to read quote characters verbatim.
    #[serde(default = "default_true")]
    pub interpret_quotes: bool,

    /// Lowercase the header names.
    #[serde(default)]
    pub lowercase_fields: bool,

    /// Cell values to leave off the document entirely.
    #[serde(default)]
    pub ignored_terms: Vec<String>,

    /// Prefix prepended to every document id.
    #[serde(default)]
    pub doc_id_prefix: String,
}

/// Connector producing one document per CSV row.
pub struct CsvConnector {
    name: String,
    pipeline: Option<String>,
    config: CsvConnectorConfig,
}

impl CsvConnector {
    /// A CSV connector with an explicit configuration.
    pub fn new(
        name: impl Into<String>,
        pipeline: Option<String>,
        config: CsvConnectorConfig,
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
impl Connector for CsvConnector {
    fn name(&self) -> &str {
        &self.name
    }

    fn pipeline(&self) -> Option<&str> {
        self.pipeline.as_deref()
    }

    async fn execute(&self, publisher: Publisher) -> Result<(), ConnectorError> {
        let raw = tokio::fs::read_to_string(&self.config.path).await?;

        let delimiter = if self.config.use_tabs { b'\t' } else { b',' };
        let mut reader = ::csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .quoting(self.config.interpret_quotes)
            .flexible(true)
            .from_reader(raw.as_bytes());

        let headers: Vec<String> = reader
            .headers()
            .map_err(|e| ConnectorError::source(format!("bad header row: {e}")))?
            .iter()
            .map(|h| {
                if self.config.lowercase_fields {
                    h.to_lowercase()
                } else {
                    h.to_string()
                }
            })
            .collect();
        if headers.is_empty() {
            return Ok(());
        }

        let id_column = self
            .config
            .id_field
            .as_deref()
            .and_then(|field| headers.iter().position(|h| h == field))
            .unwrap_or(0);

        let mut line_num: i64 = 0;
        let mut published = 0u64;
        for record in reader.records() {
            let record = record.map_err(|e| ConnectorError::source(e.to_string()))?;
            line_num += 1;

            // Skip blank rows and rows with nothing in the first column.
            if record.is_empty()
                || (record.len() == 1 && record.get(0).is_some_and(|v| v.trim().is_empty()))
            {
                continue;
            }
            if record.len() != headers.len() {
                warn!(
                    line = line_num,
                    "row has {} columns, header has {}",
                    record.len(),
                    headers.len()
                );
                continue;
            }

            let raw_id = record.get(id_column).unwrap_or("");
            let id = format!("{}{}", self.config.doc_id_prefix, raw_id);
            let mut doc = match Document::new(id) {
                Ok(doc) => doc,
                Err(_) => {
                    warn!(line = line_num, "skipping row with an empty id");
                    continue;
                }
            };

            doc.set_field("source", self.config.path.as_str());
            for (column, header) in headers.iter().enumerate() {
                let Some(value) = record.get(column) else {
                    continue;
                };
                if self.config.ignored_terms.iter().any(|term| term == value) {
                    continue;
                }
                if RESERVED_FIELDS.contains(&header.as_str()) {
                    continue;
                }
                doc.set_field(header, value);
            }
            doc.set_field(&self.config.line_num_field, line_num);

            publisher.publish(doc).await?;
            published += 1;
        }

        info!(
            connector = self.name.as_str(),
            path = self.config.path.as_str(),
            published,
            "csv connector finished"
        );
        Ok(())
    }
}
