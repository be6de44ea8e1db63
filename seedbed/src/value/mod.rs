use crate::error::{FixtureError, Result};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A single row-like mapping of field names to values, addressed by a
/// user-supplied key.
pub type Record = BTreeMap<String, Value>;

/// A mapping from record key to record. Keys are user-chosen identifiers,
/// not persisted IDs.
pub type Table = BTreeMap<String, Record>;

/// A mapping from table name to table.
pub type Database = BTreeMap<String, Table>;

/// A late-bound field value: invoked with the enclosing record's key during
/// evaluation and replaced by its result.
pub type ComputedFn = Arc<dyn Fn(&str) -> Result<Value> + Send + Sync>;

/// A dynamically typed field value.
///
/// Documents decode into this union, commands emit it, and writers consume
/// it. `Computed` carries a deferred producer (usable in per-table default
/// values); it never survives evaluation.
#[derive(Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    Timestamp(DateTime<Utc>),
    Array(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Computed(ComputedFn),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Timestamp(ts) => Some(*ts),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(entries) => Some(entries),
            _ => None,
        }
    }

    /// Lossy projection into JSON for the final-database dump. Bytes become
    /// base64 text, timestamps RFC 3339 text, and computed values null.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Integer(i) => serde_json::Value::Number((*i).into()),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Bytes(b) => serde_json::Value::String(BASE64_STANDARD.encode(b)),
            Value::Timestamp(ts) => serde_json::Value::String(ts.to_rfc3339()),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Map(entries) => serde_json::Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
            Value::Computed(_) => serde_json::Value::Null,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "Null"),
            Value::Bool(b) => write!(f, "Bool({b})"),
            Value::Integer(i) => write!(f, "Integer({i})"),
            Value::Float(v) => write!(f, "Float({v})"),
            Value::String(s) => write!(f, "String({s:?})"),
            Value::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            Value::Timestamp(ts) => write!(f, "Timestamp({ts})"),
            Value::Array(items) => f.debug_tuple("Array").field(items).finish(),
            Value::Map(entries) => f.debug_tuple("Map").field(entries).finish(),
            Value::Computed(_) => write!(f, "Computed(..)"),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Timestamp(a), Value::Timestamp(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Computed(a), Value::Computed(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// Plain-text rendering used by the template engine. Scalars render bare,
/// bytes as base64, containers as JSON.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::String(s) => write!(f, "{s}"),
            Value::Bytes(b) => write!(f, "{}", BASE64_STANDARD.encode(b)),
            Value::Timestamp(ts) => write!(f, "{}", ts.to_rfc3339()),
            Value::Array(_) | Value::Map(_) => write!(f, "{}", self.to_json()),
            Value::Computed(_) => Ok(()),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Value {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Value {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Value {
        Value::Integer(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Value {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Value {
        Value::Bool(b)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Value {
        Value::Bytes(b)
    }
}

impl From<toml::Value> for Value {
    fn from(value: toml::Value) -> Value {
        match value {
            toml::Value::String(s) => Value::String(s),
            toml::Value::Integer(i) => Value::Integer(i),
            toml::Value::Float(f) => Value::Float(f),
            toml::Value::Boolean(b) => Value::Bool(b),
            toml::Value::Datetime(dt) => {
                let text = dt.to_string();
                match DateTime::parse_from_rfc3339(&text) {
                    Ok(ts) => Value::Timestamp(ts.with_timezone(&Utc)),
                    // Local dates and times carry no offset; keep the text.
                    Err(_) => Value::String(text),
                }
            }
            toml::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            toml::Value::Table(entries) => Value::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, Value::from(v)))
                    .collect(),
            ),
        }
    }
}

/// Convert a YAML node into a field value. Mapping keys must be strings.
pub fn from_yaml(value: serde_yaml::Value) -> Result<Value> {
    Ok(match value {
        serde_yaml::Value::Null => Value::Null,
        serde_yaml::Value::Bool(b) => Value::Bool(b),
        serde_yaml::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Integer(i)
            } else if let Some(f) = n.as_f64() {
                Value::Float(f)
            } else {
                return Err(FixtureError::Document(format!(
                    "unrepresentable number: {n}"
                )));
            }
        }
        serde_yaml::Value::String(s) => Value::String(s),
        serde_yaml::Value::Sequence(items) => {
            let mut converted = Vec::with_capacity(items.len());
            for item in items {
                converted.push(from_yaml(item)?);
            }
            Value::Array(converted)
        }
        serde_yaml::Value::Mapping(entries) => {
            let mut converted = BTreeMap::new();
            for (k, v) in entries {
                let key = match k {
                    serde_yaml::Value::String(s) => s,
                    other => {
                        return Err(FixtureError::Document(format!(
                            "non-string mapping key: {other:?}"
                        )))
                    }
                };
                converted.insert(key, from_yaml(v)?);
            }
            Value::Map(converted)
        }
        serde_yaml::Value::Tagged(tagged) => from_yaml(tagged.value)?,
    })
}

/// Project a whole database into JSON for inspection.
pub fn database_to_json(database: &Database) -> serde_json::Value {
    serde_json::Value::Object(
        database
            .iter()
            .map(|(table, records)| {
                (
                    table.clone(),
                    serde_json::Value::Object(
                        records
                            .iter()
                            .map(|(key, record)| {
                                (
                                    key.clone(),
                                    serde_json::Value::Object(
                                        record
                                            .iter()
                                            .map(|(field, value)| (field.clone(), value.to_json()))
                                            .collect(),
                                    ),
                                )
                            })
                            .collect(),
                    ),
                )
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_toml_scalars() {
        let parsed: toml::Value = "a = 1\nb = 1.5\nc = true\nd = \"x\"".parse().unwrap();
        let value = Value::from(parsed);
        let map = value.as_map().unwrap();
        assert_eq!(map["a"], Value::Integer(1));
        assert_eq!(map["b"], Value::Float(1.5));
        assert_eq!(map["c"], Value::Bool(true));
        assert_eq!(map["d"], Value::String("x".into()));

        assert_eq!(map["a"].as_i64(), Some(1));
        assert_eq!(map["a"].as_f64(), Some(1.0));
        assert_eq!(map["b"].as_f64(), Some(1.5));
        assert_eq!(map["c"].as_bool(), Some(true));
        assert!(!map["d"].is_null());
        assert!(Value::Null.is_null());
    }

    #[test]
    fn test_from_toml_datetime() {
        let parsed: toml::Value = "at = 1979-05-27T07:32:00Z".parse().unwrap();
        let value = Value::from(parsed);
        let map = value.as_map().unwrap();
        let ts = map["at"].as_timestamp().unwrap();
        assert_eq!(ts.to_rfc3339(), "1979-05-27T07:32:00+00:00");
    }

    #[test]
    fn test_from_yaml_nested() {
        let parsed: serde_yaml::Value =
            serde_yaml::from_str("items:\n  - 1\n  - name: x\n").unwrap();
        let value = from_yaml(parsed).unwrap();
        let items = value.as_map().unwrap()["items"].as_array().unwrap();
        assert_eq!(items[0], Value::Integer(1));
        assert_eq!(items[1].as_map().unwrap()["name"], Value::String("x".into()));
    }

    #[test]
    fn test_from_yaml_rejects_non_string_keys() {
        let parsed: serde_yaml::Value = serde_yaml::from_str("1: x\n").unwrap();
        assert!(from_yaml(parsed).is_err());
    }

    #[test]
    fn test_to_json_bytes_and_timestamp() {
        let bytes = Value::Bytes(b"hello".to_vec());
        assert_eq!(bytes.to_json(), serde_json::json!("aGVsbG8="));

        let ts = Value::Timestamp("2020-01-02T03:04:05Z".parse().unwrap());
        assert_eq!(ts.to_json(), serde_json::json!("2020-01-02T03:04:05+00:00"));
    }

    #[test]
    fn test_database_to_json() {
        let record = Record::from([("n".to_string(), Value::Integer(1))]);
        let database = Database::from([(
            "t".to_string(),
            Table::from([("1".to_string(), record)]),
        )]);

        assert_eq!(
            database_to_json(&database),
            serde_json::json!({"t": {"1": {"n": 1}}})
        );
    }

    #[test]
    fn test_computed_compares_by_identity() {
        let f: ComputedFn = Arc::new(|_| Ok(Value::Null));
        assert_eq!(Value::Computed(f.clone()), Value::Computed(f.clone()));
        let g: ComputedFn = Arc::new(|_| Ok(Value::Null));
        assert_ne!(Value::Computed(f), Value::Computed(g));
    }

    #[test]
    fn test_display() {
        assert_eq!(Value::Integer(7).to_string(), "7");
        assert_eq!(Value::String("x".into()).to_string(), "x");
        assert_eq!(Value::Bool(false).to_string(), "false");
        assert_eq!(Value::Null.to_string(), "");
    }
}
