//! Stage that writes configured values onto every document.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;

use super::Stage;
use crate::document::{Document, FieldValue, UpdateMode, RESERVED_FIELDS};
use crate::error::StageError;

/// Writes a fixed set of field values onto each document, honoring an
/// update mode for fields that already exist.
pub struct SetStaticValues {
    values: BTreeMap<String, Value>,
    mode: UpdateMode,
}

impl SetStaticValues {
    /// A stage writing `values` with the given update mode.
    pub fn new(values: BTreeMap<String, Value>, mode: UpdateMode) -> Self {
        Self { values, mode }
    }
}

#[async_trait]
impl Stage for SetStaticValues {
    fn name(&self) -> &str {
        "set_static_values"
    }

    async fn start(&mut self) -> Result<(), StageError> {
        for name in self.values.keys() {
            if RESERVED_FIELDS.contains(&name.as_str()) {
                return Err(StageError::config(format!(
                    "set_static_values cannot write reserved field '{name}'"
                )));
            }
        }
        Ok(())
    }

    async fn process(&self, doc: &mut Document) -> Result<Option<Vec<Document>>, StageError> {
        for (name, value) in &self.values {
            doc.update(name, self.mode, [FieldValue::from_json(value.clone())]);
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn stage(mode: UpdateMode) -> SetStaticValues {
        let mut values = BTreeMap::new();
        values.insert("origin".to_string(), json!("catalog"));
        values.insert("revision".to_string(), json!(3));
        SetStaticValues::new(values, mode)
    }

    #[tokio::test]
    async fn writes_configured_values() {
        let mut doc = Document::new("d1").unwrap();
        stage(UpdateMode::Overwrite)
            .process(&mut doc)
            .await
            .unwrap();
        assert_eq!(doc.get_string("origin").unwrap(), "catalog");
        assert_eq!(doc.get_long("revision"), Some(3));
    }

    #[tokio::test]
    async fn skip_mode_keeps_existing_values() {
        let mut doc = Document::new("d1").unwrap();
        doc.set_field("origin", "feed");
        stage(UpdateMode::Skip).process(&mut doc).await.unwrap();
        assert_eq!(doc.get_string("origin").unwrap(), "feed");
        assert_eq!(doc.get_long("revision"), Some(3));
    }

    #[tokio::test]
    async fn reserved_target_fails_at_start() {
        let mut values = BTreeMap::new();
        values.insert("id".to_string(), json!("x"));
        let mut stage = SetStaticValues::new(values, UpdateMode::Overwrite);
        assert!(matches!(stage.start().await, Err(StageError::Config(_))));
    }
}
