//! The record that flows through a pipeline.
//!
//! A [`Document`] is a bag of named, possibly multi-valued fields plus a
//! handful of reserved fields controlled by the framework: `id`, `run_id`,
//! `children`, and `errors`. User-facing setters panic when pointed at a
//! reserved name; that is a bug in the calling stage, not a runtime
//! condition.
//!
//! Documents serialize to plain JSON objects: reserved fields and user
//! fields side by side, arrays for multi-valued fields, instants as ISO-8601
//! strings.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::error::DocumentError;

/// Reserved field: the document id.
pub const ID_FIELD: &str = "id";
/// Reserved field: the run id.
pub const RUN_ID_FIELD: &str = "run_id";
/// Reserved field: child documents.
pub const CHILDREN_FIELD: &str = "children";
/// Reserved field: accumulated error descriptions.
pub const ERRORS_FIELD: &str = "errors";

/// Field names that only the framework may write.
pub const RESERVED_FIELDS: [&str; 4] = [ID_FIELD, RUN_ID_FIELD, CHILDREN_FIELD, ERRORS_FIELD];

/// How `update` treats an existing field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateMode {
    /// Replace the field with the first value, then append the rest.
    #[default]
    Overwrite,
    /// Append all values to the existing field.
    Append,
    /// Leave an existing field untouched.
    Skip,
}

/// A single typed field value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// UTF-8 string.
    String(String),
    /// 64-bit signed integer.
    Long(i64),
    /// Double-precision float.
    Double(f64),
    /// Boolean.
    Bool(bool),
    /// UTC timestamp, serialized as an ISO-8601 string.
    Instant(DateTime<Utc>),
    /// Arbitrary structured JSON.
    Node(Value),
}

impl FieldValue {
    /// Build a value from arbitrary JSON, mapping scalars to their typed
    /// variants and keeping structure as [`FieldValue::Node`].
    pub fn from_json(value: Value) -> Self {
        match value {
            Value::String(s) => Self::String(s),
            Value::Bool(b) => Self::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Long(i),
                None => Self::Double(n.as_f64().unwrap_or_default()),
            },
            other => Self::Node(other),
        }
    }

    /// Render as JSON.
    pub fn to_json(&self) -> Value {
        match self {
            Self::String(s) => Value::String(s.clone()),
            Self::Long(i) => Value::from(*i),
            Self::Double(d) => Value::from(*d),
            Self::Bool(b) => Value::Bool(*b),
            Self::Instant(t) => Value::String(format_instant(t)),
            Self::Node(v) => v.clone(),
        }
    }

    /// Lenient string view: scalars render, nulls do not.
    pub fn as_string(&self) -> Option<String> {
        match self {
            Self::String(s) => Some(s.clone()),
            Self::Long(i) => Some(i.to_string()),
            Self::Double(d) => Some(d.to_string()),
            Self::Bool(b) => Some(b.to_string()),
            Self::Instant(t) => Some(format_instant(t)),
            Self::Node(Value::Null) => None,
            Self::Node(Value::String(s)) => Some(s.clone()),
            Self::Node(v) => Some(v.to_string()),
        }
    }

    /// Lenient integer view; parseable strings count.
    pub fn as_long(&self) -> Option<i64> {
        match self {
            Self::Long(i) => Some(*i),
            Self::Double(d) => Some(*d as i64),
            Self::Bool(b) => Some(i64::from(*b)),
            Self::String(s) => s.trim().parse().ok(),
            Self::Instant(t) => Some(t.timestamp_millis()),
            Self::Node(v) => v.as_i64(),
        }
    }

    /// Lenient float view; parseable strings count.
    pub fn as_double(&self) -> Option<f64> {
        match self {
            Self::Double(d) => Some(*d),
            Self::Long(i) => Some(*i as f64),
            Self::Bool(b) => Some(f64::from(u8::from(*b))),
            Self::String(s) => s.trim().parse().ok(),
            Self::Instant(_) => None,
            Self::Node(v) => v.as_f64(),
        }
    }

    /// Lenient boolean view.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::String(s) => s.trim().parse().ok(),
            Self::Long(i) => Some(*i != 0),
            Self::Node(v) => v.as_bool(),
            _ => None,
        }
    }

    /// Timestamp view; ISO-8601 strings parse.
    pub fn as_instant(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Instant(t) => Some(*t),
            Self::String(s) => parse_instant(s),
            Self::Node(Value::String(s)) => parse_instant(s),
            _ => None,
        }
    }
}

fn format_instant(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn parse_instant(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        Self::Long(v)
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        Self::Long(i64::from(v))
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<DateTime<Utc>> for FieldValue {
    fn from(v: DateTime<Utc>) -> Self {
        Self::Instant(v)
    }
}

impl From<Value> for FieldValue {
    fn from(v: Value) -> Self {
        Self::from_json(v)
    }
}

/// A named field: one value or an ordered list of values.
#[derive(Debug, Clone, PartialEq)]
enum Field {
    Single(FieldValue),
    Multi(Vec<FieldValue>),
}

impl Field {
    /// Append a value, upgrading a scalar to a list on the first add.
    fn push(&mut self, value: FieldValue) {
        match self {
            Field::Multi(values) => values.push(value),
            Field::Single(_) => {
                let old = std::mem::replace(self, Field::Multi(Vec::with_capacity(2)));
                if let (Field::Single(existing), Field::Multi(values)) = (old, &mut *self) {
                    values.push(existing);
                    values.push(value);
                }
            }
        }
    }

    fn first(&self) -> Option<&FieldValue> {
        match self {
            Field::Single(v) => Some(v),
            Field::Multi(values) => values.first(),
        }
    }

    fn values(&self) -> Vec<&FieldValue> {
        match self {
            Field::Single(v) => vec![v],
            Field::Multi(values) => values.iter().collect(),
        }
    }

    fn len(&self) -> usize {
        match self {
            Field::Single(_) => 1,
            Field::Multi(values) => values.len(),
        }
    }

    fn to_json(&self) -> Value {
        match self {
            Field::Single(v) => v.to_json(),
            Field::Multi(values) => Value::Array(values.iter().map(FieldValue::to_json).collect()),
        }
    }
}

/// Broker provenance of a document: the source record it was read from.
/// Framework-controlled; never serialized with the document.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceOffset {
    /// Source topic.
    pub topic: String,
    /// Source partition.
    pub partition: i32,
    /// Source offset within the partition.
    pub offset: i64,
}

/// A record from a source system, enriched by a pipeline and delivered to
/// an index backend.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    id: String,
    run_id: Option<String>,
    fields: BTreeMap<String, Field>,
    children: Vec<Document>,
    errors: Vec<String>,
    source_offset: Option<SourceOffset>,
}

impl Document {
    /// Create a document with the given id.
    pub fn new(id: impl Into<String>) -> Result<Self, DocumentError> {
        let id = id.into();
        if id.is_empty() {
            return Err(DocumentError::InvalidId);
        }
        Ok(Self {
            id,
            run_id: None,
            fields: BTreeMap::new(),
            children: Vec::new(),
            errors: Vec::new(),
            source_offset: None,
        })
    }

    /// Create a document that already belongs to a run.
    pub fn with_run_id(
        id: impl Into<String>,
        run_id: impl Into<String>,
    ) -> Result<Self, DocumentError> {
        let mut doc = Self::new(id)?;
        doc.run_id = Some(run_id.into());
        Ok(doc)
    }

    /// Parse a document from its JSON wire form.
    pub fn from_json(json: &str) -> Result<Self, DocumentError> {
        let value: Value = serde_json::from_str(json)?;
        Self::from_value(value)
    }

    /// Parse a document from a JSON value.
    pub fn from_value(value: Value) -> Result<Self, DocumentError> {
        let Value::Object(map) = value else {
            return Err(DocumentError::Malformed(
                "document must be a JSON object".to_string(),
            ));
        };

        let mut doc = match map.get(ID_FIELD) {
            Some(Value::String(id)) if !id.is_empty() => Self::new(id.clone())?,
            _ => return Err(DocumentError::InvalidId),
        };

        for (name, value) in map {
            match name.as_str() {
                ID_FIELD => {}
                RUN_ID_FIELD => match value {
                    Value::String(run_id) => doc.run_id = Some(run_id),
                    Value::Null => {}
                    _ => {
                        return Err(DocumentError::Malformed(
                            "run_id must be a string".to_string(),
                        ))
                    }
                },
                CHILDREN_FIELD => {
                    let Value::Array(items) = value else {
                        return Err(DocumentError::Malformed(
                            "children must be an array".to_string(),
                        ));
                    };
                    for item in items {
                        doc.children.push(Self::from_value(item)?);
                    }
                }
                ERRORS_FIELD => {
                    let Value::Array(items) = value else {
                        return Err(DocumentError::Malformed(
                            "errors must be an array".to_string(),
                        ));
                    };
                    for item in items {
                        match item {
                            Value::String(s) => doc.errors.push(s),
                            other => doc.errors.push(other.to_string()),
                        }
                    }
                }
                _ => {
                    let field = match value {
                        Value::Array(items) => {
                            Field::Multi(items.into_iter().map(FieldValue::from_json).collect())
                        }
                        other => Field::Single(FieldValue::from_json(other)),
                    };
                    doc.fields.insert(name, field);
                }
            }
        }

        Ok(doc)
    }

    /// Render the document as a JSON value in its wire form.
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert(ID_FIELD.to_string(), Value::String(self.id.clone()));
        if let Some(run_id) = &self.run_id {
            map.insert(RUN_ID_FIELD.to_string(), Value::String(run_id.clone()));
        }
        for (name, field) in &self.fields {
            map.insert(name.clone(), field.to_json());
        }
        if !self.errors.is_empty() {
            map.insert(
                ERRORS_FIELD.to_string(),
                Value::Array(self.errors.iter().cloned().map(Value::String).collect()),
            );
        }
        if !self.children.is_empty() {
            map.insert(
                CHILDREN_FIELD.to_string(),
                Value::Array(self.children.iter().map(Document::to_value).collect()),
            );
        }
        Value::Object(map)
    }

    /// Render the document as a JSON string.
    pub fn to_json(&self) -> String {
        self.to_value().to_string()
    }

    /// The document id. Immutable once set.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The run this document belongs to, if it has entered one.
    pub fn run_id(&self) -> Option<&str> {
        self.run_id.as_deref()
    }

    /// Attach the document to a run. May be called at most once; a second
    /// call is a framework bug and panics.
    pub fn initialize_run_id(&mut self, run_id: impl Into<String>) {
        assert!(
            self.run_id.is_none(),
            "run_id may only be initialized once (document '{}')",
            self.id
        );
        self.run_id = Some(run_id.into());
    }

    fn assert_writable(name: &str) {
        assert!(
            !RESERVED_FIELDS.contains(&name),
            "field '{name}' is reserved and cannot be written directly"
        );
    }

    /// Whether the named field is present. Reserved names are visible here:
    /// `id` is always present, `run_id`/`children`/`errors` when non-empty.
    pub fn has(&self, name: &str) -> bool {
        match name {
            ID_FIELD => true,
            RUN_ID_FIELD => self.run_id.is_some(),
            CHILDREN_FIELD => !self.children.is_empty(),
            ERRORS_FIELD => !self.errors.is_empty(),
            _ => self.fields.contains_key(name),
        }
    }

    /// Whether the named field is present with a non-null value.
    pub fn has_non_null(&self, name: &str) -> bool {
        if RESERVED_FIELDS.contains(&name) {
            return self.has(name);
        }
        match self.fields.get(name) {
            Some(Field::Single(FieldValue::Node(Value::Null))) => false,
            Some(_) => true,
            None => false,
        }
    }

    /// Whether the named field holds a list of values.
    pub fn is_multi_valued(&self, name: &str) -> bool {
        matches!(self.fields.get(name), Some(Field::Multi(_)))
    }

    /// Number of values in the named field: 0 when absent, 1 for a scalar.
    pub fn length(&self, name: &str) -> usize {
        match name {
            ID_FIELD => 1,
            RUN_ID_FIELD => usize::from(self.run_id.is_some()),
            CHILDREN_FIELD => self.children.len(),
            ERRORS_FIELD => self.errors.len(),
            _ => self.fields.get(name).map_or(0, Field::len),
        }
    }

    /// Names of the user fields on this document.
    pub fn field_names(&self) -> Vec<&str> {
        self.fields.keys().map(String::as_str).collect()
    }

    fn first_value(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name).and_then(Field::first)
    }

    /// First value of the field, rendered as a string.
    pub fn get_string(&self, name: &str) -> Option<String> {
        match name {
            ID_FIELD => Some(self.id.clone()),
            RUN_ID_FIELD => self.run_id.clone(),
            _ => self.first_value(name).and_then(FieldValue::as_string),
        }
    }

    /// All values of the field rendered as strings; values with no string
    /// form are skipped.
    pub fn get_string_list(&self, name: &str) -> Option<Vec<String>> {
        match name {
            ID_FIELD => Some(vec![self.id.clone()]),
            RUN_ID_FIELD => self.run_id.clone().map(|r| vec![r]),
            ERRORS_FIELD => {
                if self.errors.is_empty() {
                    None
                } else {
                    Some(self.errors.clone())
                }
            }
            _ => self.fields.get(name).map(|f| {
                f.values()
                    .into_iter()
                    .filter_map(FieldValue::as_string)
                    .collect()
            }),
        }
    }

    /// First value of the field as an integer.
    pub fn get_long(&self, name: &str) -> Option<i64> {
        self.first_value(name).and_then(FieldValue::as_long)
    }

    /// All values of the field as integers; non-numeric values are skipped.
    pub fn get_long_list(&self, name: &str) -> Option<Vec<i64>> {
        self.fields.get(name).map(|f| {
            f.values()
                .into_iter()
                .filter_map(FieldValue::as_long)
                .collect()
        })
    }

    /// First value of the field as a float.
    pub fn get_double(&self, name: &str) -> Option<f64> {
        self.first_value(name).and_then(FieldValue::as_double)
    }

    /// All values of the field as floats; non-numeric values are skipped.
    pub fn get_double_list(&self, name: &str) -> Option<Vec<f64>> {
        self.fields.get(name).map(|f| {
            f.values()
                .into_iter()
                .filter_map(FieldValue::as_double)
                .collect()
        })
    }

    /// First value of the field as a boolean.
    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.first_value(name).and_then(FieldValue::as_bool)
    }

    /// First value of the field as a UTC timestamp.
    pub fn get_instant(&self, name: &str) -> Option<DateTime<Utc>> {
        self.first_value(name).and_then(FieldValue::as_instant)
    }

    /// First value of the field as arbitrary JSON.
    pub fn get_node(&self, name: &str) -> Option<Value> {
        self.first_value(name).map(FieldValue::to_json)
    }

    /// Set a field to a single value, replacing any existing values.
    ///
    /// # Panics
    ///
    /// Panics when `name` is reserved.
    pub fn set_field(&mut self, name: &str, value: impl Into<FieldValue>) {
        Self::assert_writable(name);
        self.fields
            .insert(name.to_string(), Field::Single(value.into()));
    }

    /// Append a value to a field, upgrading a scalar to a list.
    ///
    /// # Panics
    ///
    /// Panics when `name` is reserved.
    pub fn add_to_field(&mut self, name: &str, value: impl Into<FieldValue>) {
        Self::assert_writable(name);
        match self.fields.get_mut(name) {
            Some(field) => field.push(value.into()),
            None => {
                self.fields
                    .insert(name.to_string(), Field::Multi(vec![value.into()]));
            }
        }
    }

    /// Set the field when absent, append otherwise.
    ///
    /// # Panics
    ///
    /// Panics when `name` is reserved.
    pub fn set_or_add(&mut self, name: &str, value: impl Into<FieldValue>) {
        if self.fields.contains_key(name) {
            self.add_to_field(name, value);
        } else {
            self.set_field(name, value);
        }
    }

    /// Write a sequence of values according to `mode`: `Overwrite` replaces
    /// the field with the first value then appends the rest, `Append`
    /// appends all, `Skip` returns immediately when the field exists.
    ///
    /// # Panics
    ///
    /// Panics when `name` is reserved.
    pub fn update<V>(&mut self, name: &str, mode: UpdateMode, values: impl IntoIterator<Item = V>)
    where
        V: Into<FieldValue>,
    {
        Self::assert_writable(name);
        if mode == UpdateMode::Skip && self.has(name) {
            return;
        }
        let mut values = values.into_iter();
        let Some(first) = values.next() else {
            return;
        };
        match mode {
            UpdateMode::Overwrite => self.set_field(name, first),
            _ => self.set_or_add(name, first),
        }
        for value in values {
            self.set_or_add(name, value);
        }
    }

    /// Move a field to a new name. When the new name exists, `mode` decides:
    /// `Skip` keeps the existing field (the old one is dropped), `Append`
    /// appends the old values, `Overwrite` replaces.
    ///
    /// # Panics
    ///
    /// Panics when either name is reserved.
    pub fn rename_field(&mut self, old: &str, new: &str, mode: UpdateMode) {
        Self::assert_writable(old);
        Self::assert_writable(new);
        let Some(field) = self.fields.remove(old) else {
            return;
        };
        if self.fields.contains_key(new) {
            match mode {
                UpdateMode::Skip => return,
                UpdateMode::Append => {
                    match field {
                        Field::Single(v) => self.add_to_field(new, v),
                        Field::Multi(values) => {
                            for v in values {
                                self.add_to_field(new, v);
                            }
                        }
                    }
                    return;
                }
                UpdateMode::Overwrite => {}
            }
        }
        self.fields.insert(new.to_string(), field);
    }

    /// Remove a field.
    ///
    /// # Panics
    ///
    /// Panics when `name` is reserved.
    pub fn remove_field(&mut self, name: &str) {
        Self::assert_writable(name);
        self.fields.remove(name);
    }

    /// Drop repeated values from a multi-valued field, keeping the first
    /// occurrence of each and preserving order. When `target` names another
    /// field, the deduplicated values are written there and the source is
    /// left untouched. Idempotent.
    ///
    /// # Panics
    ///
    /// Panics when `target` is reserved.
    pub fn remove_duplicate_values(&mut self, name: &str, target: Option<&str>) {
        if let Some(t) = target {
            if t != name {
                Self::assert_writable(t);
            }
        }
        let Some(Field::Multi(values)) = self.fields.get(name) else {
            return;
        };
        let mut deduped: Vec<FieldValue> = Vec::with_capacity(values.len());
        for value in values {
            if !deduped.contains(value) {
                deduped.push(value.clone());
            }
        }
        let destination = match target {
            Some(t) if t != name => t,
            _ => name,
        };
        self.fields
            .insert(destination.to_string(), Field::Multi(deduped));
    }

    /// Attach a child document. Children are one level deep; grandchildren
    /// are not part of the model.
    pub fn add_child(&mut self, child: Document) {
        self.children.push(child);
    }

    /// The document's children.
    pub fn children(&self) -> &[Document] {
        &self.children
    }

    /// Whether the document carries children.
    pub fn has_children(&self) -> bool {
        !self.children.is_empty()
    }

    /// Append an error description. The list is append-only.
    pub fn log_error(&mut self, description: impl Into<String>) {
        self.errors.push(description.into());
    }

    /// Accumulated error descriptions.
    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    /// The source record this document was read from, in broker mode.
    pub fn source_offset(&self) -> Option<&SourceOffset> {
        self.source_offset.as_ref()
    }

    pub(crate) fn set_source_offset(&mut self, offset: SourceOffset) {
        self.source_offset = Some(offset);
    }
}

impl Serialize for Document {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Document {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(value).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn doc(id: &str) -> Document {
        Document::new(id).unwrap()
    }

    #[test]
    fn empty_id_is_rejected() {
        assert!(matches!(Document::new(""), Err(DocumentError::InvalidId)));
    }

    #[test]
    #[should_panic(expected = "reserved")]
    fn setting_reserved_field_panics() {
        doc("d1").set_field("id", "other");
    }

    #[test]
    #[should_panic(expected = "reserved")]
    fn adding_to_reserved_field_panics() {
        doc("d1").add_to_field("children", "nope");
    }

    #[test]
    #[should_panic(expected = "run_id may only be initialized once")]
    fn double_run_id_initialization_panics() {
        let mut d = doc("d1");
        d.initialize_run_id("r1");
        d.initialize_run_id("r2");
    }

    #[test]
    fn scalar_upgrades_to_list_on_first_add() {
        let mut d = doc("d1");
        d.set_field("tag", "a");
        assert!(!d.is_multi_valued("tag"));
        d.add_to_field("tag", "b");
        assert!(d.is_multi_valued("tag"));
        assert_eq!(d.get_string_list("tag").unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn set_or_add_appends_in_insertion_order() {
        let mut d = doc("d1");
        d.set_or_add("tag", "a");
        d.set_or_add("tag", "b");
        d.set_or_add("tag", "c");
        assert_eq!(d.get_string_list("tag").unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn update_overwrite_yields_all_values() {
        let mut d = doc("d1");
        d.set_field("f", "old");
        d.update("f", UpdateMode::Overwrite, ["a", "b", "c"]);
        assert_eq!(d.get_string_list("f").unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn update_append_extends_existing_field() {
        let mut d = doc("d1");
        d.set_field("f", "x");
        d.update("f", UpdateMode::Append, ["a"]);
        assert_eq!(d.get_string_list("f").unwrap(), vec!["x", "a"]);
    }

    #[test]
    fn update_skip_leaves_existing_field_unchanged() {
        let mut d = doc("d1");
        d.set_field("f", "x");
        d.update("f", UpdateMode::Skip, ["a"]);
        assert_eq!(d.get_string("f").unwrap(), "x");
        assert_eq!(d.length("f"), 1);
    }

    #[test]
    fn update_skip_writes_missing_field() {
        let mut d = doc("d1");
        d.update("f", UpdateMode::Skip, ["a"]);
        assert_eq!(d.get_string("f").unwrap(), "a");
    }

    #[test]
    fn remove_duplicate_values_preserves_first_occurrence_order() {
        let mut d = doc("d1");
        for v in ["b", "a", "b", "c", "a"] {
            d.add_to_field("f", v);
        }
        d.remove_duplicate_values("f", None);
        assert_eq!(d.get_string_list("f").unwrap(), vec!["b", "a", "c"]);
        // Idempotent.
        d.remove_duplicate_values("f", None);
        assert_eq!(d.get_string_list("f").unwrap(), vec!["b", "a", "c"]);
    }

    #[test]
    fn remove_duplicate_values_into_target_keeps_source() {
        let mut d = doc("d1");
        for v in ["a", "a", "b"] {
            d.add_to_field("f", v);
        }
        d.remove_duplicate_values("f", Some("deduped"));
        assert_eq!(d.get_string_list("f").unwrap(), vec!["a", "a", "b"]);
        assert_eq!(d.get_string_list("deduped").unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn rename_field_modes() {
        let mut d = doc("d1");
        d.set_field("old", "v");
        d.rename_field("old", "new", UpdateMode::Overwrite);
        assert!(!d.has("old"));
        assert_eq!(d.get_string("new").unwrap(), "v");

        d.set_field("other", "x");
        d.rename_field("other", "new", UpdateMode::Append);
        assert_eq!(d.get_string_list("new").unwrap(), vec!["v", "x"]);

        d.set_field("third", "y");
        d.rename_field("third", "new", UpdateMode::Skip);
        assert_eq!(d.get_string_list("new").unwrap(), vec!["v", "x"]);
        assert!(!d.has("third"));
    }

    #[test]
    fn children_are_one_level() {
        let mut parent = doc("p");
        parent.add_child(doc("c1"));
        parent.add_child(doc("c2"));
        assert!(parent.has_children());
        assert_eq!(parent.children().len(), 2);
        assert_eq!(parent.children()[0].id(), "c1");
    }

    #[test]
    fn typed_getters_coerce() {
        let mut d = doc("d1");
        d.set_field("n", "42");
        d.set_field("f", 1.5);
        d.set_field("b", true);
        assert_eq!(d.get_long("n"), Some(42));
        assert_eq!(d.get_double("f"), Some(1.5));
        assert_eq!(d.get_bool("b"), Some(true));
        assert_eq!(d.get_string("f").unwrap(), "1.5");
    }

    #[test]
    fn instants_round_trip_through_json() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 9, 12, 30, 0).unwrap();
        let mut d = doc("d1");
        d.set_field("seen_at", ts);
        let parsed = Document::from_json(&d.to_json()).unwrap();
        assert_eq!(parsed.get_instant("seen_at"), Some(ts));
        assert_eq!(parsed.get_string("seen_at").unwrap(), "2024-03-09T12:30:00Z");
    }

    #[test]
    fn wire_format_round_trips() {
        let mut d = Document::with_run_id("d1", "run-7").unwrap();
        d.set_field("title", "a title");
        d.add_to_field("tags", "x");
        d.add_to_field("tags", "y");
        d.log_error("stage blew up");
        let mut child = doc("d1-c1");
        child.set_field("part", 1);
        d.add_child(child);

        let parsed = Document::from_json(&d.to_json()).unwrap();
        assert_eq!(parsed, d);
        assert_eq!(parsed.run_id(), Some("run-7"));
        assert_eq!(parsed.children()[0].get_long("part"), Some(1));
        assert_eq!(parsed.errors(), ["stage blew up"]);
    }

    #[test]
    fn from_json_rejects_missing_or_empty_id() {
        assert!(Document::from_json(r#"{"title":"x"}"#).is_err());
        assert!(Document::from_json(r#"{"id":""}"#).is_err());
        assert!(Document::from_json(r#"{"id":7}"#).is_err());
    }

    #[test]
    fn length_counts_values() {
        let mut d = doc("d1");
        assert_eq!(d.length("missing"), 0);
        d.set_field("one", "v");
        assert_eq!(d.length("one"), 1);
        d.add_to_field("one", "w");
        assert_eq!(d.length("one"), 2);
        assert_eq!(d.length("id"), 1);
    }

    #[test]
    fn has_non_null_distinguishes_null_nodes() {
        let mut d = doc("d1");
        d.set_field("n", Value::Null);
        assert!(d.has("n"));
        assert!(!d.has_non_null("n"));
        d.set_field("s", "v");
        assert!(d.has_non_null("s"));
    }
}
