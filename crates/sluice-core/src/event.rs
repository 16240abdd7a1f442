//! Lifecycle events flowing from workers and indexers back to the
//! publisher of a run.
//!
//! Events are value objects; they carry ids, never documents. CREATE opens
//! accounting for a child document, FINISH and FAIL close accounting for
//! any document.

use serde::{Deserialize, Serialize};
use std::fmt;

/// What happened to the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    /// A child document was created by a stage; one more terminal event is
    /// expected for this run.
    Create,
    /// The document was delivered to the index backend.
    Finish,
    /// The document reached a terminal failure.
    Fail,
}

/// Whether the reported step succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    /// The step succeeded.
    Success,
    /// The step failed.
    Failure,
}

/// A single lifecycle event for one document within one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Id of the document the event refers to.
    pub document_id: String,
    /// The run the document belongs to.
    pub run_id: String,
    /// Event type.
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Success or failure of the reported step.
    pub status: EventStatus,
    /// Optional first-line reason, set on failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Event {
    /// A CREATE event announcing a child document.
    pub fn create(document_id: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            run_id: run_id.into(),
            event_type: EventType::Create,
            status: EventStatus::Success,
            message: None,
        }
    }

    /// A FINISH event: the document was indexed.
    pub fn finish(document_id: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            run_id: run_id.into(),
            event_type: EventType::Finish,
            status: EventStatus::Success,
            message: None,
        }
    }

    /// A FAIL event: the document reached a terminal failure.
    pub fn fail(
        document_id: impl Into<String>,
        run_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            document_id: document_id.into(),
            run_id: run_id.into(),
            event_type: EventType::Fail,
            status: EventStatus::Failure,
            message: Some(message.into()),
        }
    }

    /// FINISH and FAIL are terminal; CREATE is not.
    pub fn is_terminal(&self) -> bool {
        matches!(self.event_type, EventType::Finish | EventType::Fail)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}({}, {}, {:?})",
            self.event_type, self.document_id, self.run_id, self.status
        )?;
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        Ok(())
    }
}
