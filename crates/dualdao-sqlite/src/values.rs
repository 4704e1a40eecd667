//! JSON <-> SQLite value conversion for domain columns.

use rusqlite::types::{Value as SqlValue, ValueRef};
use serde_json::{Number, Value};

/// Scalars bind natively; arrays and objects are stored as JSON in a BLOB
/// so they can never be confused with text that merely looks like JSON.
pub(crate) fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        nested @ (Value::Array(_) | Value::Object(_)) => SqlValue::Blob(nested.to_string().into_bytes()),
    }
}

/// Inverse of [`to_sql`]. Text is always a string; booleans come back as
/// integers.
pub(crate) fn from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => serde_json::from_slice(bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn nested_values_survive_as_json_blobs() {
        let nested = json!({"w": 2, "tags": ["a"]});
        let stored = to_sql(&nested);
        let bytes = match &stored {
            SqlValue::Blob(b) => b.clone(),
            other => panic!("expected blob, got {:?}", other),
        };
        assert_eq!(from_sql(ValueRef::Blob(&bytes)), nested);
    }

    #[test]
    fn text_that_looks_like_json_stays_text() {
        let stored = to_sql(&json!("[1]"));
        assert_eq!(stored, SqlValue::Text("[1]".into()));
        assert_eq!(from_sql(ValueRef::Text(b"[1]")), json!("[1]"));
        assert_eq!(from_sql(ValueRef::Text(b"{\"a\":1}")), json!("{\"a\":1}"));
    }

    #[test]
    fn scalars_bind_natively() {
        assert_eq!(to_sql(&json!(42)), SqlValue::Integer(42));
        assert_eq!(to_sql(&json!(true)), SqlValue::Integer(1));
        assert_eq!(to_sql(&json!(1.5)), SqlValue::Real(1.5));
        assert_eq!(from_sql(ValueRef::Text(b"plain")), json!("plain"));
    }
}
