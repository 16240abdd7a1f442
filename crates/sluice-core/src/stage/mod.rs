//! Pipeline stages: single transformations applied to each document.
//!
//! A stage is stateless with respect to documents. Configuration and pooled
//! resources (compiled patterns, clients, dictionaries) belong to the stage
//! instance: created in `start`, released in `stop`.

mod field_length;
mod set_static_values;

pub use field_length::FieldLength;
pub use set_static_values::SetStaticValues;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::document::Document;
use crate::error::StageError;

/// A single transformation in a pipeline.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Name used in logs and failure events.
    fn name(&self) -> &str;

    /// Invoked once before any document flows. A configuration problem
    /// surfaces here and aborts the run.
    async fn start(&mut self) -> Result<(), StageError> {
        Ok(())
    }

    /// Release resources acquired in `start`.
    async fn stop(&mut self) -> Result<(), StageError> {
        Ok(())
    }

    /// Transform one document in place. The returned documents are
    /// *additional* output (children or replacements) and flow through the
    /// remaining stages only; `None` keeps the input document as the sole
    /// output.
    async fn process(&self, doc: &mut Document) -> Result<Option<Vec<Document>>, StageError>;
}

/// How a condition combines the matched values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    /// The stage runs only when the condition matches.
    #[default]
    Must,
    /// The stage runs only when the condition does not match.
    MustNot,
}

/// A predicate over a document's fields, attached to a stage.
///
/// With `values`, the condition matches when any value of `field` equals
/// one of them; without, it matches on mere presence of `field`. A false
/// predicate skips the stage; the document still flows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageCondition {
    /// Field the condition inspects.
    pub field: String,
    /// Values to match against; empty means "field is present".
    #[serde(default)]
    pub values: Vec<String>,
    /// Whether a match enables or disables the stage.
    #[serde(default)]
    pub operator: ConditionOperator,
}

impl StageCondition {
    /// A condition requiring `field` to hold one of `values`.
    pub fn must(field: impl Into<String>, values: Vec<String>) -> Self {
        Self {
            field: field.into(),
            values,
            operator: ConditionOperator::Must,
        }
    }

    /// A condition requiring `field` to hold none of `values`.
    pub fn must_not(field: impl Into<String>, values: Vec<String>) -> Self {
        Self {
            field: field.into(),
            values,
            operator: ConditionOperator::MustNot,
        }
    }

    /// Evaluate the predicate against a document.
    pub fn matches(&self, doc: &Document) -> bool {
        let hit = if self.values.is_empty() {
            doc.has(&self.field)
        } else {
            doc.get_string_list(&self.field)
                .map(|values| values.iter().any(|v| self.values.contains(v)))
                .unwrap_or(false)
        };
        match self.operator {
            ConditionOperator::Must => hit,
            ConditionOperator::MustNot => !hit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc_with(field: &str, value: &str) -> Document {
        let mut doc = Document::new("d1").unwrap();
        doc.set_field(field, value);
        doc
    }

    #[test]
    fn must_matches_on_value() {
        let condition = StageCondition::must("kind", vec!["a".to_string(), "b".to_string()]);
        assert!(condition.matches(&doc_with("kind", "a")));
        assert!(!condition.matches(&doc_with("kind", "c")));
        assert!(!condition.matches(&Document::new("d1").unwrap()));
    }

    #[test]
    fn must_not_inverts() {
        let condition = StageCondition::must_not("kind", vec!["a".to_string()]);
        assert!(!condition.matches(&doc_with("kind", "a")));
        assert!(condition.matches(&doc_with("kind", "b")));
        assert!(condition.matches(&Document::new("d1").unwrap()));
    }

    #[test]
    fn empty_values_test_presence() {
        let condition = StageCondition::must("kind", Vec::new());
        assert!(condition.matches(&doc_with("kind", "anything")));
        assert!(!condition.matches(&Document::new("d1").unwrap()));
    }

    #[test]
    fn matches_any_value_of_multivalued_field() {
        let condition = StageCondition::must("tags", vec!["hit".to_string()]);
        let mut doc = Document::new("d1").unwrap();
        doc.add_to_field("tags", "miss");
        doc.add_to_field("tags", "hit");
        assert!(condition.matches(&doc));
    }
}
