//! Stage that counts the values of a field into another field.

use async_trait::async_trait;
use std::collections::BTreeMap;

use super::Stage;
use crate::document::{Document, RESERVED_FIELDS};
use crate::error::StageError;

/// Writes the number of values held by each source field into a
/// destination field. An absent source counts as zero.
pub struct FieldLength {
    /// Source field → destination field.
    mapping: BTreeMap<String, String>,
}

impl FieldLength {
    /// A stage applying the given source → destination mapping.
    pub fn new(mapping: BTreeMap<String, String>) -> Self {
        Self { mapping }
    }
}

#[async_trait]
impl Stage for FieldLength {
    fn name(&self) -> &str {
        "field_length"
    }

    async fn start(&mut self) -> Result<(), StageError> {
        for destination in self.mapping.values() {
            if RESERVED_FIELDS.contains(&destination.as_str()) {
                return Err(StageError::config(format!(
                    "field_length cannot write reserved field '{destination}'"
                )));
            }
        }
        Ok(())
    }

    async fn process(&self, doc: &mut Document) -> Result<Option<Vec<Document>>, StageError> {
        for (source, destination) in &self.mapping {
            let length = doc.length(source);
            doc.set_field(destination, length as i64);
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn counts_values() {
        let mut mapping = BTreeMap::new();
        mapping.insert("tags".to_string(), "tag_count".to_string());
        mapping.insert("missing".to_string(), "missing_count".to_string());
        let stage = FieldLength::new(mapping);

        let mut doc = Document::new("d1").unwrap();
        doc.add_to_field("tags", "a");
        doc.add_to_field("tags", "b");

        stage.process(&mut doc).await.unwrap();
        assert_eq!(doc.get_long("tag_count"), Some(2));
        assert_eq!(doc.get_long("missing_count"), Some(0));
    }
}
