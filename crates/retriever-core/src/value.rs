//! Output value model.
//!
//! Entity outputs are reshaped freely by callbacks, so they are stored as an
//! ordered map of [`OutputValue`] rather than a fixed record per
//! configuration.

use std::fmt;

use indexmap::IndexMap;
use serde_json::Value;

/// Ordered, string-keyed record of output values.
pub type Record = IndexMap<String, OutputValue>;

/// A single output field value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum OutputValue {
    /// Not extracted: the field was never filled, or its filter path did not
    /// match the response.
    #[default]
    Missing,
    /// The response contained the key with an explicit JSON `null`.
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    List(Vec<OutputValue>),
    Record(Record),
    /// Raw response body of a download target.
    Bytes(Vec<u8>),
}

impl OutputValue {
    pub fn is_missing(&self) -> bool {
        matches!(self, OutputValue::Missing)
    }

    /// `Missing`, `Null`, empty strings and empty collections count as empty.
    pub fn is_empty(&self) -> bool {
        match self {
            OutputValue::Missing | OutputValue::Null => true,
            OutputValue::String(s) => s.is_empty(),
            OutputValue::List(items) => items.is_empty(),
            OutputValue::Record(fields) => fields.is_empty(),
            OutputValue::Bytes(bytes) => bytes.is_empty(),
            OutputValue::Bool(_) | OutputValue::Number(_) => false,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            OutputValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[OutputValue]> {
        match self {
            OutputValue::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&Record> {
        match self {
            OutputValue::Record(fields) => Some(fields),
            _ => None,
        }
    }

    /// True for a non-empty list whose elements are all records.
    pub fn is_record_list(&self) -> bool {
        match self {
            OutputValue::List(items) => {
                !items.is_empty() && items.iter().all(|item| item.as_record().is_some())
            }
            _ => false,
        }
    }

    /// Convert back to JSON. `Missing` becomes `null`, bytes become a lossy
    /// UTF-8 string.
    pub fn to_json(&self) -> Value {
        match self {
            OutputValue::Missing | OutputValue::Null => Value::Null,
            OutputValue::Bool(b) => Value::Bool(*b),
            OutputValue::Number(n) => Value::Number(n.clone()),
            OutputValue::String(s) => Value::String(s.clone()),
            OutputValue::List(items) => Value::Array(items.iter().map(Self::to_json).collect()),
            OutputValue::Record(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
            OutputValue::Bytes(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        }
    }

    /// Render the value as a single CSV cell or URI/input string.
    pub fn to_cell(&self) -> String {
        match self {
            OutputValue::Missing | OutputValue::Null => String::new(),
            OutputValue::String(s) => s.clone(),
            OutputValue::Bool(b) => b.to_string(),
            OutputValue::Number(n) => n.to_string(),
            OutputValue::List(_) | OutputValue::Record(_) => self.to_json().to_string(),
            OutputValue::Bytes(bytes) => format!("<{} bytes>", bytes.len()),
        }
    }
}

impl From<Value> for OutputValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => OutputValue::Null,
            Value::Bool(b) => OutputValue::Bool(b),
            Value::Number(n) => OutputValue::Number(n),
            Value::String(s) => OutputValue::String(s),
            Value::Array(items) => OutputValue::List(items.into_iter().map(Self::from).collect()),
            Value::Object(fields) => OutputValue::Record(
                fields
                    .into_iter()
                    .map(|(k, v)| (k, OutputValue::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<&Value> for OutputValue {
    fn from(value: &Value) -> Self {
        OutputValue::from(value.clone())
    }
}

impl From<&str> for OutputValue {
    fn from(s: &str) -> Self {
        OutputValue::String(s.to_string())
    }
}

impl From<String> for OutputValue {
    fn from(s: String) -> Self {
        OutputValue::String(s)
    }
}

impl From<bool> for OutputValue {
    fn from(b: bool) -> Self {
        OutputValue::Bool(b)
    }
}

impl fmt::Display for OutputValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_cell())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn null_and_missing_are_distinct() {
        assert_ne!(OutputValue::Null, OutputValue::Missing);
        assert_eq!(OutputValue::from(json!(null)), OutputValue::Null);
        assert_eq!(OutputValue::Null.to_cell(), "");
        assert_eq!(OutputValue::Missing.to_cell(), "");
    }

    #[test]
    fn nested_json_keeps_key_order() {
        let value = OutputValue::from(json!({"b": 1, "a": {"z": true, "y": "s"}}));
        let record = value.as_record().unwrap();
        assert_eq!(record.keys().collect::<Vec<_>>(), vec!["b", "a"]);
        let inner = record["a"].as_record().unwrap();
        assert_eq!(inner.keys().collect::<Vec<_>>(), vec!["z", "y"]);
    }

    #[test]
    fn cells_render_scalars_and_json() {
        assert_eq!(OutputValue::from(json!(42)).to_cell(), "42");
        assert_eq!(OutputValue::from(json!(false)).to_cell(), "false");
        assert_eq!(OutputValue::from("plain").to_cell(), "plain");
        assert_eq!(OutputValue::from(json!([1, 2])).to_cell(), "[1,2]");
        assert_eq!(OutputValue::Bytes(vec![0, 1, 2]).to_cell(), "<3 bytes>");
    }

    #[test]
    fn record_list_detection() {
        assert!(OutputValue::from(json!([{"a": 1}, {"a": 2}])).is_record_list());
        assert!(!OutputValue::from(json!([{"a": 1}, 2])).is_record_list());
        assert!(!OutputValue::from(json!([])).is_record_list());
        assert!(!OutputValue::from(json!({"a": 1})).is_record_list());
    }

    #[test]
    fn emptiness() {
        assert!(OutputValue::Missing.is_empty());
        assert!(OutputValue::from("").is_empty());
        assert!(!OutputValue::from(json!(0)).is_empty());
        assert!(!OutputValue::from(json!(false)).is_empty());
    }
}
