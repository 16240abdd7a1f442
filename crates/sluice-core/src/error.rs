//! Error types for the Sluice core.
//!
//! Each concern carries its own error enum so that callers can react to the
//! failure class rather than parsing messages. Reserved-field misuse on a
//! [`Document`](crate::document::Document) is a programming bug and panics
//! instead of returning one of these.

use thiserror::Error;

/// Errors raised when constructing or deserializing a document.
#[derive(Debug, Error)]
pub enum DocumentError {
    /// The document id was missing, empty, or not a string.
    #[error("document id must be a non-empty string")]
    InvalidId,

    /// The document did not match the expected wire shape.
    #[error("malformed document: {0}")]
    Malformed(String),

    /// JSON (de)serialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised by the messenger substrate.
#[derive(Debug, Error)]
pub enum MessengerError {
    /// The underlying transport (queue or broker) failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// A document or event could not be (de)serialized for the wire.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The messenger was closed while an operation was in flight.
    #[error("messenger closed")]
    Closed,
}

impl MessengerError {
    /// Create a transport error.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a serialization error.
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Check whether this error is worth retrying at the call site.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

impl From<serde_json::Error> for MessengerError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Errors raised by an individual pipeline stage.
#[derive(Debug, Error)]
pub enum StageError {
    /// The stage could not start with its configuration; the run aborts.
    #[error("configuration error: {0}")]
    Config(String),

    /// The stage failed while processing a document; the document fails,
    /// the run continues.
    #[error("{0}")]
    Processing(String),
}

impl StageError {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a processing error.
    pub fn processing(msg: impl Into<String>) -> Self {
        Self::Processing(msg.into())
    }
}

/// A stage failure attributed to the stage and document it occurred on.
#[derive(Debug, Error)]
#[error("stage '{stage}' failed on document '{document_id}': {source}")]
pub struct PipelineError {
    /// Name of the failing stage.
    pub stage: String,
    /// Id of the document being processed.
    pub document_id: String,
    /// The underlying stage error.
    #[source]
    pub source: StageError,
}

impl PipelineError {
    /// The first line of the failure, suitable for an event message.
    /// Deeper detail stays in the logs.
    pub fn reason(&self) -> String {
        let msg = self.to_string();
        msg.lines().next().unwrap_or_default().to_string()
    }
}

/// Errors raised by an index backend.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The backend could not be reached; the whole batch fails.
    #[error("backend transport error: {0}")]
    Transport(String),

    /// The backend rejected the request as a whole.
    #[error("backend rejected request: {0}")]
    Rejected(String),
}

impl BackendError {
    /// Create a transport error.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a rejection error.
    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::Rejected(msg.into())
    }
}

/// Errors raised by connectors.
#[derive(Debug, Error)]
pub enum ConnectorError {
    /// The connector configuration was invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// Reading from the external source failed.
    #[error("source error: {0}")]
    Source(String),

    /// IO error while reading the source.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Handing a document to the publisher failed.
    #[error("publish failed: {0}")]
    Publish(#[from] MessengerError),

    /// Generic error from a connector implementation.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ConnectorError {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a source error.
    pub fn source(msg: impl Into<String>) -> Self {
        Self::Source(msg.into())
    }
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file could not be parsed.
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// The configuration parsed but is not usable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    /// Create an invalid-configuration error.
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }
}

/// Outcome of waiting for a run's completion.
#[derive(Debug, Error)]
pub enum CompletionError {
    /// The wall-clock timeout elapsed before all work was accounted for.
    #[error("completion wait timed out after {timeout_ms} ms")]
    TimedOut {
        /// The configured timeout in milliseconds.
        timeout_ms: u64,
    },

    /// The connector task returned an error.
    #[error("connector failed: {0}")]
    ConnectorFailed(String),

    /// The connector task panicked or was cancelled.
    #[error("connector task aborted: {0}")]
    ConnectorAborted(String),

    /// The messenger failed while draining events.
    #[error(transparent)]
    Messenger(#[from] MessengerError),
}

/// Run-level errors; these abort the current run.
#[derive(Debug, Error)]
pub enum RunError {
    /// Configuration problem discovered while setting up the run.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A stage refused to start; the run aborts.
    #[error("pipeline startup failed: {0}")]
    StageStartup(String),

    /// A connector failed; subsequent connectors are skipped.
    #[error("connector '{name}' failed: {message}")]
    ConnectorFailed {
        /// Connector name.
        name: String,
        /// Failure description.
        message: String,
    },

    /// The per-connector timeout elapsed.
    #[error("connector '{name}' timed out after {timeout_ms} ms")]
    Timeout {
        /// Connector name.
        name: String,
        /// The configured timeout in milliseconds.
        timeout_ms: u64,
    },

    /// The messenger substrate failed.
    #[error(transparent)]
    Messenger(#[from] MessengerError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_error_reason_is_first_line() {
        let err = PipelineError {
            stage: "parse_date".to_string(),
            document_id: "d1".to_string(),
            source: StageError::processing("bad date\ncaused by: empty field"),
        };
        assert_eq!(
            err.reason(),
            "stage 'parse_date' failed on document 'd1': bad date"
        );
    }

    #[test]
    fn messenger_transport_is_retryable() {
        assert!(MessengerError::transport("broker unreachable").is_retryable());
        assert!(!MessengerError::serialization("bad utf8").is_retryable());
        assert!(!MessengerError::Closed.is_retryable());
    }
}
