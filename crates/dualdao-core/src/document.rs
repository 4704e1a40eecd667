use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Reserved keys shared by both backends' record shapes.
pub mod fields {
    pub const ID: &str = "_id";
    pub const REV: &str = "_rev";
    pub const DELETED: &str = "_deleted";
    pub const ENTITY_TYPE: &str = "entityType";
    pub const APP_VERSION: &str = "appVersion";
    pub const CREATED_DATE: &str = "createdDate";
    pub const UPDATED_DATE: &str = "updatedDate";
    pub const VERSION: &str = "version";
}

/// A backend record: a schemaless JSON object.
///
/// Both backends speak `Document` at the DAO boundary; what differs is which
/// reserved keys they populate (`_rev` for the document store, `version` for
/// the relational store).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document(Map<String, Value>);

impl Document {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// The `_id`, ignoring empty strings.
    pub fn id(&self) -> Option<&str> {
        self.get_str(fields::ID).filter(|s| !s.is_empty())
    }

    /// The `_rev` token, ignoring empty strings.
    pub fn rev(&self) -> Option<&str> {
        self.get_str(fields::REV).filter(|s| !s.is_empty())
    }

    pub fn entity_type(&self) -> Option<&str> {
        self.get_str(fields::ENTITY_TYPE).filter(|s| !s.is_empty())
    }

    /// The relational `version` column.
    pub fn version(&self) -> Option<i64> {
        self.0.get(fields::VERSION).and_then(Value::as_i64)
    }

    /// Sets `key` when it is missing, null or an empty string.
    pub fn set_if_empty(&mut self, key: &str, value: impl FnOnce() -> String) {
        let empty = match self.0.get(key) {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => s.is_empty(),
            Some(_) => false,
        };
        if empty {
            self.0.insert(key.to_string(), Value::String(value()));
        }
    }

    /// Overlays every field of `other` onto `self`.
    pub fn merge_from(&mut self, other: Document) {
        for (key, value) in other.0 {
            self.0.insert(key, value);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_inner(self) -> Map<String, Value> {
        self.0
    }
}

impl From<Map<String, Value>> for Document {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl From<Document> for Value {
    fn from(doc: Document) -> Self {
        Value::Object(doc.0)
    }
}

impl TryFrom<Value> for Document {
    type Error = Value;

    /// Only JSON objects are documents; anything else is handed back.
    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(other),
        }
    }
}

impl FromIterator<(String, Value)> for Document {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_strings_do_not_count_as_ids() {
        let doc = Document::new().with(fields::ID, "").with(fields::REV, "");
        assert_eq!(doc.id(), None);
        assert_eq!(doc.rev(), None);
    }

    #[test]
    fn set_if_empty_keeps_existing_values() {
        let mut doc = Document::new()
            .with(fields::ENTITY_TYPE, "")
            .with(fields::APP_VERSION, "1.2.3");
        doc.set_if_empty(fields::ENTITY_TYPE, || "Widget|".into());
        doc.set_if_empty(fields::APP_VERSION, || "9.9.9".into());
        doc.set_if_empty(fields::ID, || "Widget|abc".into());
        assert_eq!(doc.entity_type(), Some("Widget|"));
        assert_eq!(doc.get_str(fields::APP_VERSION), Some("1.2.3"));
        assert_eq!(doc.id(), Some("Widget|abc"));
    }

    #[test]
    fn merge_overlays_caller_fields() {
        let mut stored = Document::try_from(json!({"_id": "a", "name": "old", "keep": 1})).unwrap();
        let patch = Document::try_from(json!({"_id": "a", "name": "new"})).unwrap();
        stored.merge_from(patch);
        assert_eq!(Value::from(stored), json!({"_id": "a", "name": "new", "keep": 1}));
    }

    #[test]
    fn non_objects_are_not_documents() {
        assert!(Document::try_from(json!([1, 2])).is_err());
    }
}
