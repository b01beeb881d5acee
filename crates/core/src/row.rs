//! Row codec: source rows to JSON message bodies.
//!
//! A [`Row`] carries the column names of its result set and one
//! [`SourceValue`] per column. [`encode`] turns it into a [`Message`] whose
//! keys are the lower-cased column names in result-set order. Values without a
//! JSON counterpart (dates, decimals, binary, UUIDs) are written as strings.

use std::fmt::Write as _;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde_json::{Map, Number, Value};
use uuid::Uuid;

use crate::error::CodecError;

/// A single column value as read from the source database.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Json(Value),
    /// Exact decimal in its canonical text form.
    Decimal(String),
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Uuid(Uuid),
    Bytes(Vec<u8>),
}

impl SourceValue {
    pub fn into_json(self) -> Value {
        match self {
            SourceValue::Null => Value::Null,
            SourceValue::Bool(b) => Value::Bool(b),
            SourceValue::Int(i) => Value::Number(i.into()),
            SourceValue::Float(f) => match Number::from_f64(f) {
                Some(n) => Value::Number(n),
                None => Value::String(f.to_string()),
            },
            SourceValue::Text(s) | SourceValue::Decimal(s) => Value::String(s),
            SourceValue::Json(v) => v,
            SourceValue::Date(d) => Value::String(d.to_string()),
            SourceValue::Time(t) => Value::String(t.to_string()),
            SourceValue::Timestamp(ts) => Value::String(ts.to_string()),
            SourceValue::TimestampTz(ts) => Value::String(ts.to_rfc3339()),
            SourceValue::Uuid(u) => Value::String(u.hyphenated().to_string()),
            SourceValue::Bytes(bytes) => Value::String(hex_literal(&bytes)),
        }
    }
}

/// PostgreSQL `bytea` text form: `\x` followed by lower-case hex.
fn hex_literal(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(2 + bytes.len() * 2);
    out.push_str("\\x");
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

/// One result-set row. Column names are shared by every row of a query.
#[derive(Debug, Clone)]
pub struct Row {
    pub columns: Arc<[String]>,
    pub values: Vec<SourceValue>,
}

impl Row {
    pub fn new(columns: Arc<[String]>, values: Vec<SourceValue>) -> Self {
        Self { columns, values }
    }

    pub fn encode(self) -> Result<Message, CodecError> {
        encode(&self.columns, self.values)
    }
}

/// Encode one row into a message body.
///
/// When two columns lower-case to the same name the later value wins and
/// keeps the position of the first.
pub fn encode(columns: &[String], values: Vec<SourceValue>) -> Result<Message, CodecError> {
    if columns.len() != values.len() {
        return Err(CodecError::LengthMismatch {
            columns: columns.len(),
            values: values.len(),
        });
    }

    let body = columns
        .iter()
        .zip(values)
        .map(|(name, value)| (name.to_lowercase(), value.into_json()))
        .collect::<Map<String, Value>>();

    Ok(Message { body })
}

/// A JSON object message body, keys in column order.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    body: Map<String, Value>,
}

impl Message {
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.body.keys().map(String::as_str)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.body.get(key)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.body
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(&self.body)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        match serde_json::from_slice::<Value>(bytes)? {
            Value::Object(body) => Ok(Self { body }),
            _ => Err(CodecError::NotAnObject),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn columns(names: &[&str]) -> Arc<[String]> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn lowercases_keys_and_keeps_column_order() {
        let cols = columns(&["ID", "Name", "qty"]);
        let msg = encode(
            &cols,
            vec![
                SourceValue::Int(1),
                SourceValue::Text("A".into()),
                SourceValue::Int(7),
            ],
        )
        .unwrap();

        assert_eq!(msg.keys().collect::<Vec<_>>(), vec!["id", "name", "qty"]);
        assert_eq!(
            String::from_utf8(msg.to_bytes().unwrap()).unwrap(),
            r#"{"id":1,"name":"A","qty":7}"#
        );
    }

    #[test]
    fn rejects_length_mismatch() {
        let cols = columns(&["id", "name"]);
        let err = encode(&cols, vec![SourceValue::Int(1)]).unwrap_err();
        assert!(matches!(err, CodecError::LengthMismatch { columns: 2, values: 1 }));
    }

    #[test]
    fn non_native_values_become_strings() {
        let cols = columns(&["price", "day", "at", "at_tz", "blob", "ref", "ratio", "note"]);
        let day = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let at = day.and_hms_opt(10, 30, 0).unwrap();
        let msg = encode(
            &cols,
            vec![
                SourceValue::Decimal("12.50".into()),
                SourceValue::Date(day),
                SourceValue::Timestamp(at),
                SourceValue::TimestampTz(at.and_utc()),
                SourceValue::Bytes(vec![0xde, 0xad, 0x01]),
                SourceValue::Uuid(Uuid::nil()),
                SourceValue::Float(f64::NAN),
                SourceValue::Null,
            ],
        )
        .unwrap();

        assert_eq!(msg.get("price"), Some(&Value::String("12.50".into())));
        assert_eq!(msg.get("day"), Some(&Value::String("2024-03-01".into())));
        assert_eq!(msg.get("at"), Some(&Value::String("2024-03-01 10:30:00".into())));
        assert_eq!(
            msg.get("at_tz"),
            Some(&Value::String("2024-03-01T10:30:00+00:00".into()))
        );
        assert_eq!(msg.get("blob"), Some(&Value::String("\\xdead01".into())));
        assert_eq!(
            msg.get("ref"),
            Some(&Value::String("00000000-0000-0000-0000-000000000000".into()))
        );
        assert_eq!(msg.get("ratio"), Some(&Value::String("NaN".into())));
        assert_eq!(msg.get("note"), Some(&Value::Null));
    }

    #[test]
    fn duplicate_lowercased_columns_keep_last_value() {
        let cols = columns(&["code", "CODE"]);
        let msg = encode(&cols, vec![SourceValue::Int(1), SourceValue::Int(2)]).unwrap();
        assert_eq!(msg.as_map().len(), 1);
        assert_eq!(msg.get("code"), Some(&Value::from(2)));
    }

    #[test]
    fn rows_of_one_query_share_key_set() {
        let cols = columns(&["id", "name"]);
        let a = Row::new(cols.clone(), vec![SourceValue::Int(1), SourceValue::Null])
            .encode()
            .unwrap();
        let b = Row::new(cols, vec![SourceValue::Int(2), SourceValue::Text("B".into())])
            .encode()
            .unwrap();
        assert!(a.keys().eq(b.keys()));
    }

    #[test]
    fn from_bytes_requires_object() {
        assert!(Message::from_bytes(br#"{"id":1}"#).is_ok());
        assert!(matches!(
            Message::from_bytes(b"[1,2]"),
            Err(CodecError::NotAnObject)
        ));
        assert!(matches!(
            Message::from_bytes(b"not json"),
            Err(CodecError::Serialize(_))
        ));
    }
}
