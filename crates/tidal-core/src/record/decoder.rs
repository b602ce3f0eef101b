//! JSON record decoding against a fixed schema.
//!
//! Event times are accepted as RFC 3339 strings, `YYYY-MM-DD HH:MM:SS[.fff]`
//! strings (read as UTC), or integer epoch milliseconds.

use super::Record;
use crate::config::SchemaConfig;
use crate::error::{DecodeError, DecodeReason};
use crate::source::{SourceMessage, SourcePosition};
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};

const SNIPPET_CHARS: usize = 64;

const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

/// Decoder counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeStats {
    /// Records decoded successfully
    pub decoded: u64,
    /// Records rejected
    pub dropped: u64,
}

/// Parses raw payloads into [`Record`]s.
pub struct RecordDecoder {
    schema: SchemaConfig,
    decoded: AtomicU64,
    dropped: AtomicU64,
}

impl RecordDecoder {
    /// Create a decoder for the given field names.
    pub fn new(schema: SchemaConfig) -> Self {
        Self {
            schema,
            decoded: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Field names this decoder reads.
    pub fn schema(&self) -> &SchemaConfig {
        &self.schema
    }

    /// Decode a source message.
    pub fn decode_message(&self, msg: &SourceMessage) -> Result<Record, DecodeError> {
        self.decode(
            msg.payload.as_deref().unwrap_or_default(),
            msg.position.clone(),
            msg.key_str(),
            msg.timestamp(),
        )
    }

    /// Decode a raw payload read at `position`.
    pub fn decode(
        &self,
        raw: &[u8],
        position: SourcePosition,
        key: Option<&str>,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<Record, DecodeError> {
        match self.parse(raw, position, key, timestamp) {
            Ok(record) => {
                self.decoded.fetch_add(1, Ordering::Relaxed);
                Ok(record)
            }
            Err(reason) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Err(DecodeError {
                    reason,
                    raw_snippet: snippet(raw),
                })
            }
        }
    }

    /// Encode a record into the JSON form `decode` accepts.
    pub fn encode(&self, record: &Record) -> Vec<u8> {
        let mut object = Map::new();
        object.insert(self.schema.id_field.clone(), Value::from(record.id.clone()));
        object.insert(
            self.schema.event_time_field.clone(),
            Value::from(record.event_time.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
        );
        object.insert(self.schema.value_field.clone(), Value::from(record.value));
        for (name, part) in self
            .schema
            .partition_key_fields
            .iter()
            .zip(&record.partition_key_parts)
        {
            if let Some(part) = part {
                object.insert(name.clone(), Value::from(part.clone()));
            }
        }
        Value::Object(object).to_string().into_bytes()
    }

    /// Current counters.
    pub fn stats(&self) -> DecodeStats {
        DecodeStats {
            decoded: self.decoded.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    fn parse(
        &self,
        raw: &[u8],
        position: SourcePosition,
        key: Option<&str>,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<Record, DecodeReason> {
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Err(DecodeReason::EmptyPayload);
        }
        let text = std::str::from_utf8(raw).map_err(|_| DecodeReason::InvalidUtf8)?;
        let value: Value =
            serde_json::from_str(text).map_err(|e| DecodeReason::InvalidJson(e.to_string()))?;
        let Value::Object(object) = value else {
            return Err(DecodeReason::NotAnObject);
        };

        let id = match required(&object, &self.schema.id_field)? {
            Value::String(s) if !s.is_empty() => s.clone(),
            other => return Err(mismatch(&self.schema.id_field, "non-empty string", other)),
        };

        let event_time = parse_event_time(
            &self.schema.event_time_field,
            required(&object, &self.schema.event_time_field)?,
        )?;

        let raw_value = required(&object, &self.schema.value_field)?;
        let value = raw_value
            .as_f64()
            .ok_or_else(|| mismatch(&self.schema.value_field, "number", raw_value))?;

        let partition_key_parts = self
            .schema
            .partition_key_fields
            .iter()
            .map(|field| match object.get(field) {
                None | Some(Value::Null) => Ok(None),
                Some(Value::String(s)) => Ok(Some(s.clone())),
                Some(other) => Err(mismatch(field, "string", other)),
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Record {
            id,
            event_time,
            value,
            partition_key_parts,
            source_offset: position,
            source_key: key.map(str::to_string),
            source_timestamp: timestamp,
        })
    }
}

fn required<'a>(object: &'a Map<String, Value>, field: &str) -> Result<&'a Value, DecodeReason> {
    match object.get(field) {
        None | Some(Value::Null) => Err(DecodeReason::MissingField(field.to_string())),
        Some(value) => Ok(value),
    }
}

fn parse_event_time(field: &str, value: &Value) -> Result<DateTime<Utc>, DecodeReason> {
    match value {
        Value::String(s) => {
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Ok(dt.with_timezone(&Utc));
            }
            NAIVE_FORMATS
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
                .map(|naive| naive.and_utc())
                .ok_or_else(|| mismatch(field, "timestamp", value))
        }
        Value::Number(n) => n
            .as_i64()
            .and_then(DateTime::from_timestamp_millis)
            .ok_or_else(|| mismatch(field, "epoch milliseconds", value)),
        other => Err(mismatch(field, "timestamp", other)),
    }
}

fn mismatch(field: &str, expected: &'static str, found: &Value) -> DecodeReason {
    let found = match found {
        Value::Null => "null".to_string(),
        Value::Bool(_) => "boolean".to_string(),
        Value::Number(n) => format!("number {}", n),
        Value::String(s) if s.is_empty() => "empty string".to_string(),
        Value::String(s) => format!("string {:?}", truncate(s, SNIPPET_CHARS)),
        Value::Array(_) => "array".to_string(),
        Value::Object(_) => "object".to_string(),
    };
    DecodeReason::TypeMismatch {
        field: field.to_string(),
        expected,
        found,
    }
}

fn snippet(raw: &[u8]) -> String {
    truncate(&String::from_utf8_lossy(raw), SNIPPET_CHARS).to_string()
}

/// Longest prefix of at most `max` chars.
fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
