use chrono::{DateTime, SecondsFormat, Utc};
use serde::ser::{Error as _, SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use thiserror::Error;

/// Field holding the event time. Required on every event.
pub const TIMESTAMP_FIELD: &str = "@timestamp";
/// Field holding the logical document type / stream. Required on every event.
pub const TYPE_FIELD: &str = "type";
/// Wire-level object carrying metadata that never reaches the stored document.
pub const METADATA_FIELD: &str = "@metadata";
/// Metadata key for a caller-chosen document id.
pub const META_ID: &str = "_id";
/// Metadata key for an ingest pipeline override.
pub const META_PIPELINE: &str = "pipeline";

pub type Fields = BTreeMap<String, Value>;

/// A dynamically shaped event value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Timestamp(DateTime<Utc>),
    Array(Vec<Value>),
    Map(Fields),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Fields> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Integer(i) => serializer.serialize_i64(*i),
            Value::Float(f) if f.is_finite() => serializer.serialize_f64(*f),
            Value::Float(f) => Err(S::Error::custom(format!("cannot encode non-finite float {f}"))),
            Value::String(s) => serializer.serialize_str(s),
            Value::Timestamp(ts) => {
                serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Millis, true))
            }
            Value::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Map(fields) => {
                let mut map = serializer.serialize_map(Some(fields.len()))?;
                for (k, v) in fields {
                    map.serialize_entry(k, v)?;
                }
                map.end()
            }
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Integer(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(obj) => {
                Value::Map(obj.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(ts: DateTime<Utc>) -> Self {
        Value::Timestamp(ts)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FieldError {
    #[error("missing required field '{0}'")]
    Missing(&'static str),
    #[error("malformed timestamp '{value}': {reason}")]
    MalformedTimestamp { value: String, reason: String },
    #[error("field '{0}' must be a non-empty string")]
    NotAString(&'static str),
}

/// A single shippable event: document fields plus out-of-band metadata.
///
/// Events are treated as immutable once handed to a publisher; the builder
/// methods consume and return `self`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Event {
    fields: Fields,
    meta: Fields,
}

impl Event {
    pub fn new(timestamp: DateTime<Utc>, doc_type: impl Into<String>) -> Self {
        let mut fields = Fields::new();
        fields.insert(TIMESTAMP_FIELD.to_string(), Value::Timestamp(timestamp));
        fields.insert(TYPE_FIELD.to_string(), Value::String(doc_type.into()));
        Self {
            fields,
            meta: Fields::new(),
        }
    }

    /// Builds an event from raw fields, splitting off any `@metadata` object.
    pub fn from_fields(mut fields: Fields) -> Self {
        let meta = match fields.remove(METADATA_FIELD) {
            Some(Value::Map(meta)) => meta,
            Some(other) => {
                fields.insert(METADATA_FIELD.to_string(), other);
                Fields::new()
            }
            None => Fields::new(),
        };
        Self { fields, meta }
    }

    /// Decode one JSON object into an event.
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        match serde_json::from_slice::<serde_json::Value>(bytes)? {
            serde_json::Value::Object(obj) => Ok(Self::from_fields(
                obj.into_iter().map(|(k, v)| (k, Value::from(v))).collect(),
            )),
            _ => Err(serde::de::Error::custom("event must be a JSON object")),
        }
    }

    /// Insert a field unless it is already present.
    pub fn insert_missing(&mut self, key: &str, value: impl Into<Value>) {
        if !self.fields.contains_key(key) {
            self.fields.insert(key.to_string(), value.into());
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(key.into(), value.into());
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.meta.insert(META_ID.to_string(), Value::String(id.into()));
        self
    }

    pub fn with_pipeline(mut self, pipeline: impl Into<String>) -> Self {
        self.meta
            .insert(META_PIPELINE.to_string(), Value::String(pipeline.into()));
        self
    }

    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn meta(&self) -> &Fields {
        &self.meta
    }

    /// Document id from metadata; non-string ids are ignored.
    pub fn id(&self) -> Option<&str> {
        self.meta.get(META_ID).and_then(Value::as_str)
    }

    pub fn pipeline(&self) -> Option<&str> {
        self.meta.get(META_PIPELINE).and_then(Value::as_str)
    }

    /// Event time. Accepts a typed timestamp or an RFC 3339 string
    /// (events decoded off the wire carry strings).
    pub fn timestamp(&self) -> Result<DateTime<Utc>, FieldError> {
        match self.fields.get(TIMESTAMP_FIELD) {
            Some(Value::Timestamp(ts)) => Ok(*ts),
            Some(Value::String(raw)) => DateTime::parse_from_rfc3339(raw)
                .map(|ts| ts.with_timezone(&Utc))
                .map_err(|e| FieldError::MalformedTimestamp {
                    value: raw.clone(),
                    reason: e.to_string(),
                }),
            Some(other) => Err(FieldError::MalformedTimestamp {
                value: format!("{other:?}"),
                reason: "expected a timestamp or RFC 3339 string".to_string(),
            }),
            None => Err(FieldError::Missing(TIMESTAMP_FIELD)),
        }
    }

    pub fn doc_type(&self) -> Result<&str, FieldError> {
        match self.fields.get(TYPE_FIELD) {
            Some(Value::String(s)) if !s.is_empty() => Ok(s),
            Some(_) => Err(FieldError::NotAString(TYPE_FIELD)),
            None => Err(FieldError::Missing(TYPE_FIELD)),
        }
    }
}

impl Serialize for Event {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        Value::serialize_fields(&self.fields, serializer)
    }
}

impl Value {
    fn serialize_fields<S: Serializer>(fields: &Fields, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(fields.len()))?;
        for (k, v) in fields {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap()
    }

    #[test]
    fn new_event_carries_required_fields() {
        let event = Event::new(ts(), "nginx");
        assert_eq!(event.timestamp().unwrap(), ts());
        assert_eq!(event.doc_type().unwrap(), "nginx");
    }

    #[test]
    fn timestamp_serializes_as_rfc3339_millis() {
        let event = Event::new(ts(), "nginx").with_field("bytes", 512i64);
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(
            json,
            r#"{"@timestamp":"2024-01-15T10:30:00.000Z","bytes":512,"type":"nginx"}"#
        );
    }

    #[test]
    fn non_finite_float_fails_to_encode() {
        let event = Event::new(ts(), "metrics").with_field("load", f64::NAN);
        assert!(serde_json::to_vec(&event).is_err());
    }

    #[test]
    fn string_timestamp_is_parsed() {
        let event = Event::from_fields(Fields::from([
            (TIMESTAMP_FIELD.to_string(), Value::from("2024-01-15T10:30:00Z")),
            (TYPE_FIELD.to_string(), Value::from("syslog")),
        ]));
        assert_eq!(event.timestamp().unwrap(), ts());
    }

    #[test]
    fn malformed_timestamp_is_reported() {
        let event = Event::from_fields(Fields::from([
            (TIMESTAMP_FIELD.to_string(), Value::from("yesterday")),
            (TYPE_FIELD.to_string(), Value::from("syslog")),
        ]));
        assert!(matches!(
            event.timestamp(),
            Err(FieldError::MalformedTimestamp { .. })
        ));
    }

    #[test]
    fn metadata_is_split_from_document() {
        let json = serde_json::json!({
            "@timestamp": "2024-01-15T10:30:00Z",
            "type": "app",
            "@metadata": {"_id": "abc", "pipeline": "geoip"}
        });
        let Value::Map(fields) = Value::from(json) else {
            panic!("expected map");
        };
        let event = Event::from_fields(fields);
        assert_eq!(event.id(), Some("abc"));
        assert_eq!(event.pipeline(), Some("geoip"));
        assert!(event.get(METADATA_FIELD).is_none());
    }

    #[test]
    fn from_json_requires_an_object() {
        let event = Event::from_json(br#"{"type":"app","@metadata":{"_id":"x"},"n":1.5}"#).unwrap();
        assert_eq!(event.doc_type().unwrap(), "app");
        assert_eq!(event.id(), Some("x"));
        assert_eq!(event.get("n"), Some(&Value::Float(1.5)));
        assert!(Event::from_json(b"[1,2]").is_err());
        assert!(Event::from_json(b"{oops").is_err());
    }

    #[test]
    fn insert_missing_keeps_existing_value() {
        let mut event = Event::new(ts(), "app");
        event.insert_missing(TYPE_FIELD, "other");
        event.insert_missing("shipper", "edge-1");
        assert_eq!(event.doc_type().unwrap(), "app");
        assert_eq!(event.get("shipper"), Some(&Value::from("edge-1")));
    }

    #[test]
    fn empty_type_is_rejected() {
        let event = Event::new(ts(), "");
        assert_eq!(event.doc_type(), Err(FieldError::NotAString(TYPE_FIELD)));
    }
}
