use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value};

/// Read-only view over one raw backend record that tolerates casing drift.
///
/// Every accessor takes the list of accepted spellings for a field and
/// returns the first one that is present and not `null`.
#[derive(Clone, Copy)]
pub(super) struct Record<'a>(&'a Map<String, Value>);

impl<'a> Record<'a> {
    pub fn new(value: &'a Value) -> Option<Self> {
        value.as_object().map(Record)
    }

    pub fn get(&self, keys: &[&str]) -> Option<&'a Value> {
        keys.iter()
            .filter_map(|key| self.0.get(*key))
            .find(|value| !value.is_null())
    }

    /// Identifiers arrive as integers from the relational backend and as
    /// strings from newer payloads.
    pub fn id(&self, keys: &[&str]) -> Option<String> {
        match self.get(keys)? {
            Value::Number(n) => Some(n.to_string()),
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            _ => None,
        }
    }

    pub fn string(&self, keys: &[&str]) -> Option<String> {
        match self.get(keys)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn non_empty_string(&self, keys: &[&str]) -> Option<String> {
        self.string(keys).filter(|s| !s.trim().is_empty())
    }

    pub fn timestamp(&self, keys: &[&str]) -> Option<DateTime<Utc>> {
        parse_timestamp(self.get(keys)?)
    }

    pub fn array(&self, keys: &[&str]) -> &'a [Value] {
        self.get(keys)
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

/// RFC 3339 strings or integer epoch milliseconds.
pub(super) fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => n
            .as_i64()
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single()),
        _ => None,
    }
}

/// List endpoints sometimes answer with a bare object instead of an array.
pub(super) fn records(value: &Value) -> &[Value] {
    match value {
        Value::Array(items) => items.as_slice(),
        Value::Object(_) => std::slice::from_ref(value),
        _ => &[],
    }
}
