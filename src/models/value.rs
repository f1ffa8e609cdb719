//! Backend-neutral values.
//!
//! [`Value`] is used both for statement arguments and for result cells, so
//! the same type flows in and out of every driver. [`Record`] is one result
//! row with its column names.

use crate::error::{DatabaseError, DbResult};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;

/// A statement argument or a decoded result cell.
///
/// Serialized untagged; on deserialization JSON strings always become
/// `Text` and arrays/objects become `Json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// NULL value
    Null,
    Bool(bool),
    /// Integer value (stored as i64 for maximum range)
    Int(i64),
    Float(f64),
    Text(String),
    /// Binary data (base64 encoded in JSON)
    #[serde(with = "base64_bytes")]
    Bytes(Vec<u8>),
    Json(JsonValue),
    Timestamp(DateTime<Utc>),
    Uuid(Uuid),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get the type name of this value for debugging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Text(_) => "text",
            Self::Bytes(_) => "bytes",
            Self::Json(_) => "json",
            Self::Timestamp(_) => "timestamp",
            Self::Uuid(_) => "uuid",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// JSON rendering used for serde-based decoding and for output.
    pub fn to_json(&self) -> JsonValue {
        use base64::{Engine as _, engine::general_purpose::STANDARD};

        match self {
            Self::Null => JsonValue::Null,
            Self::Bool(b) => JsonValue::Bool(*b),
            Self::Int(i) => JsonValue::from(*i),
            Self::Float(f) => serde_json::Number::from_f64(*f)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            Self::Text(s) => JsonValue::String(s.clone()),
            Self::Bytes(b) => JsonValue::String(STANDARD.encode(b)),
            Self::Json(v) => v.clone(),
            Self::Timestamp(ts) => JsonValue::String(ts.to_rfc3339()),
            Self::Uuid(u) => JsonValue::String(u.to_string()),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(v.into())
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl From<JsonValue> for Value {
    fn from(v: JsonValue) -> Self {
        Self::Json(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Self::Timestamp(v)
    }
}

impl From<Uuid> for Value {
    fn from(v: Uuid) -> Self {
        Self::Uuid(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

/// Build an argument list: `args![1, "a", None::<i64>]`.
#[macro_export]
macro_rules! args {
    () => { Vec::<$crate::models::Value>::new() };
    ($($v:expr),+ $(,)?) => { vec![$($crate::models::Value::from($v)),+] };
}

/// Custom serialization for binary data as base64.
mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        STANDARD.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

/// One result row.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Record {
    columns: Vec<String>,
    values: Vec<Value>,
}

impl Record {
    /// Pair column names with values. Extra entries on either side are dropped.
    pub fn new(columns: Vec<String>, mut values: Vec<Value>) -> Self {
        let mut columns = columns;
        let len = columns.len().min(values.len());
        columns.truncate(len);
        values.truncate(len);
        Self { columns, values }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Value of the first column called `name`.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c == name)
            .map(|i| &self.values[i])
    }

    pub fn get_index(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Row as a JSON object keyed by column name.
    pub fn into_json(self) -> JsonValue {
        let map: Map<String, JsonValue> = self
            .columns
            .into_iter()
            .zip(self.values.iter().map(Value::to_json))
            .collect();
        JsonValue::Object(map)
    }

    /// Decode the row into any deserializable type through its JSON form.
    /// Structs match columns by name; tuples and sequences take values in
    /// column order.
    pub fn decode<T: DeserializeOwned>(&self) -> DbResult<T> {
        let by_name = serde_json::from_value(self.clone().into_json());
        match by_name {
            Ok(v) => Ok(v),
            Err(named_err) => {
                let positional =
                    JsonValue::Array(self.values.iter().map(Value::to_json).collect());
                serde_json::from_value(positional).map_err(|_| {
                    DatabaseError::with_source(
                        crate::error::ErrorKind::InvalidData,
                        format!("cannot decode row: {named_err}"),
                        named_err,
                    )
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn test_value_serde_untagged() {
        let values = vec![
            Value::Null,
            Value::Bool(true),
            Value::Int(42),
            Value::Text("hi".to_string()),
            Value::Bytes(vec![1, 2, 3]),
        ];
        let json = serde_json::to_string(&values).unwrap();
        assert_eq!(json, r#"[null,true,42,"hi","AQID"]"#);
    }

    #[test]
    fn test_value_deserialize_strings_as_text() {
        let v: Value = serde_json::from_str(r#""AQID""#).unwrap();
        assert_eq!(v, Value::Text("AQID".to_string()));
        let v: Value = serde_json::from_str(r#"{"a":1}"#).unwrap();
        assert!(matches!(v, Value::Json(_)));
        let v: Value = serde_json::from_str("1.5").unwrap();
        assert_eq!(v, Value::Float(1.5));
    }

    #[test]
    fn test_value_from_option() {
        assert_eq!(Value::from(None::<i64>), Value::Null);
        assert_eq!(Value::from(Some("x")), Value::Text("x".to_string()));
    }

    #[test]
    fn test_args_macro() {
        let args = crate::args![1, "two", None::<bool>];
        assert_eq!(
            args,
            vec![Value::Int(1), Value::Text("two".to_string()), Value::Null]
        );
        assert!(crate::args![].is_empty());
    }

    #[test]
    fn test_non_finite_float_is_null() {
        assert_eq!(Value::Float(f64::NAN).to_json(), JsonValue::Null);
    }

    fn sample() -> Record {
        Record::new(
            vec!["id".to_string(), "name".to_string(), "active".to_string()],
            vec![
                Value::Int(7),
                Value::Text("alice".to_string()),
                Value::Bool(true),
            ],
        )
    }

    #[test]
    fn test_record_get() {
        let record = sample();
        assert_eq!(record.get("name"), Some(&Value::Text("alice".to_string())));
        assert_eq!(record.get("missing"), None);
        assert_eq!(record.get_index(0), Some(&Value::Int(7)));
        assert_eq!(record.len(), 3);
    }

    #[test]
    fn test_record_into_json_keeps_column_order() {
        let json = sample().into_json();
        assert_eq!(json.to_string(), r#"{"id":7,"name":"alice","active":true}"#);
    }

    #[test]
    fn test_record_decode_struct() {
        #[derive(Deserialize)]
        struct User {
            id: i64,
            name: String,
        }
        let user: User = sample().decode().unwrap();
        assert_eq!(user.id, 7);
        assert_eq!(user.name, "alice");
    }

    #[test]
    fn test_record_decode_tuple() {
        let (id, name, active): (i64, String, bool) = sample().decode().unwrap();
        assert_eq!((id, name.as_str(), active), (7, "alice", true));
    }

    #[test]
    fn test_record_decode_mismatch() {
        let err = sample().decode::<(String, String)>().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidData);
    }

    #[test]
    fn test_record_new_truncates() {
        let record = Record::new(vec!["a".to_string()], vec![Value::Int(1), Value::Int(2)]);
        assert_eq!(record.len(), 1);
    }
}
