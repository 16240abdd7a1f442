//! sluice-connect - connector framework for Sluice
//!
//! Connectors read an external source, turn each record into a
//! [`Document`](sluice_core::Document), and hand it to the run's
//! [`Publisher`](sluice_core::Publisher). The trait itself lives in
//! `sluice-core`; this crate carries the built-in connectors and the
//! registry that instantiates them from configuration:
//!
//! - `csv`: documents from the rows of a CSV file
//! - `datagen`: synthetic documents for demos and tests
//!
//! Connector configurations are plain serde structs validated with
//! `validator` and described by `schemars`, so a configuration error
//! surfaces before the run starts.

pub mod csv;
pub mod datagen;

pub use crate::csv::{CsvConnector, CsvConnectorConfig};
pub use crate::datagen::{DatagenConnector, DatagenConnectorConfig};

use std::sync::Arc;

use sluice_core::{ConfigError, Connector, ConnectorConfig, SluiceConfig};

/// Parse and validate a connector-specific configuration block.
fn parse_connector_config<T>(config: &ConnectorConfig) -> Result<T, ConfigError>
where
    T: serde::de::DeserializeOwned + validator::Validate,
{
    let value = if config.config.is_null() {
        serde_yaml::Value::Mapping(Default::default())
    } else {
        config.config.clone()
    };
    let parsed: T = serde_yaml::from_value(value)
        .map_err(|e| ConfigError::invalid(format!("connector '{}': {e}", config.name)))?;
    parsed
        .validate()
        .map_err(|e| ConfigError::invalid(format!("connector '{}': {e}", config.name)))?;
    Ok(parsed)
}

/// Instantiate one connector from its configuration.
pub fn build_connector(config: &ConnectorConfig) -> Result<Arc<dyn Connector>, ConfigError> {
    match config.connector.as_str() {
        "csv" => Ok(Arc::new(CsvConnector::from_config(config)?)),
        "datagen" => Ok(Arc::new(DatagenConnector::from_config(config)?)),
        other => Err(ConfigError::invalid(format!(
            "unknown connector type '{other}'"
        ))),
    }
}

/// Instantiate every configured connector, in declared order.
pub fn build_connectors(config: &SluiceConfig) -> Result<Vec<Arc<dyn Connector>>, ConfigError> {
    config.connectors.iter().map(build_connector).collect()
}
