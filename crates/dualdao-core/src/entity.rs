use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;

/// Concurrency token of a stored record.
///
/// The document store hands out opaque revision strings; the relational
/// store uses a monotonically increasing integer column.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Revision {
    Version(i64),
    Token(String),
}

impl Revision {
    pub fn as_token(&self) -> Option<&str> {
        match self {
            Revision::Token(token) => Some(token),
            Revision::Version(_) => None,
        }
    }

    pub fn as_version(&self) -> Option<i64> {
        match self {
            Revision::Version(v) => Some(*v),
            Revision::Token(_) => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Revision::Version(v) => Value::from(*v),
            Revision::Token(token) => Value::from(token.as_str()),
        }
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Revision::Version(v) => write!(f, "{}", v),
            Revision::Token(token) => f.write_str(token),
        }
    }
}

/// Canonical, backend-neutral view of a record.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub id: String,
    pub revision: Option<Revision>,
    pub entity_type: String,
    pub created_at: OffsetDateTime,
    pub updated_at: Option<OffsetDateTime>,
    /// Domain fields; empty for mappers that only carry the envelope.
    pub fields: Map<String, Value>,
}

impl Entity {
    pub fn new(id: impl Into<String>, entity_type: impl Into<String>, created_at: OffsetDateTime) -> Self {
        Self {
            id: id.into(),
            revision: None,
            entity_type: entity_type.into(),
            created_at,
            updated_at: None,
            fields: Map::new(),
        }
    }

    pub fn with_revision(mut self, revision: Revision) -> Self {
        self.revision = Some(revision);
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn revision_deserializes_either_shape() {
        let token: Revision = serde_json::from_value(json!("3-abc")).unwrap();
        let version: Revision = serde_json::from_value(json!(7)).unwrap();
        assert_eq!(token.as_token(), Some("3-abc"));
        assert_eq!(version.as_version(), Some(7));
        assert_eq!(version.to_string(), "7");
    }
}
