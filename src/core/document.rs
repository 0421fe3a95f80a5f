//! Document model shared by every tier.
//!
//! The whole [`Document`] is the unit of replication. On the wire and on disk
//! it travels inside an [`Envelope`]; older payloads may be a bare document,
//! which [`Envelope::decode_data`] accepts as well.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// String key to arbitrary JSON value. Keys are opaque to the engine.
pub type Document = serde_json::Map<String, Value>;

pub const ENVELOPE_VERSION: u32 = 1;

/// Key under which the engine keeps its metadata record.
pub const DEFAULT_META_KEY: &str = "appMeta";

/// Keys starting with this prefix are engine bookkeeping and never replicated.
pub const DEFAULT_RESERVED_PREFIX: &str = "__";

/// Formats a timestamp the way every persisted record carries it
/// (RFC 3339, millisecond precision, `Z` suffix).
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn now_timestamp() -> String {
    format_timestamp(Utc::now())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub version: u32,
    pub updated_at: String,
    pub data: Document,
}

impl Envelope {
    pub fn new(data: Document) -> Self {
        Self::stamped(data, Utc::now())
    }

    pub fn stamped(data: Document, at: DateTime<Utc>) -> Self {
        Self {
            version: ENVELOPE_VERSION,
            updated_at: format_timestamp(at),
            data,
        }
    }

    /// Extracts the document from either payload shape.
    ///
    /// `{data: {...}}` yields the inner object; an object without `data` is
    /// taken as a legacy bare document. Non-objects and a non-object `data`
    /// yield `None`.
    pub fn decode_data(payload: &Value) -> Option<Document> {
        let object = payload.as_object()?;
        match object.get("data") {
            Some(Value::Object(data)) => Some(data.clone()),
            Some(_) => None,
            None => Some(object.clone()),
        }
    }

    /// Decodes and re-stamps a payload with the current time.
    pub fn restamp(payload: &Value) -> Option<Self> {
        Self::decode_data(payload).map(Self::new)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn to_pretty_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
    }
}

/// `{version, lastSavedAt}` rewritten on every local mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaRecord {
    pub version: String,
    pub last_saved_at: String,
}

impl MetaRecord {
    pub fn now(app_version: impl Into<String>) -> Self {
        Self {
            version: app_version.into(),
            last_saved_at: now_timestamp(),
        }
    }
}

/// Snapshot handed to external collaborators (file export, cloud export).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportEnvelope {
    pub version: u32,
    pub app_version: String,
    pub last_saved_at: Option<String>,
    pub exported_at: String,
    pub data: Document,
}

impl ExportEnvelope {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Length of the compact JSON serialization, used by delta classification.
pub fn serialized_len(doc: &Document) -> usize {
    serde_json::to_string(doc).map(|s| s.len()).unwrap_or(0)
}

pub fn is_reserved_key(key: &str, reserved_prefix: &str) -> bool {
    !reserved_prefix.is_empty() && key.starts_with(reserved_prefix)
}

/// Returns a copy of `doc` without `key`.
pub fn without_key(doc: &Document, key: &str) -> Document {
    let mut copy = doc.clone();
    copy.remove(key);
    copy
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_accepts_wrapped_and_bare_payloads() {
        let wrapped = json!({"version": 1, "data": {"a": 1}});
        let bare = json!({"todoTasks": [1, 2]});

        assert_eq!(
            Envelope::decode_data(&wrapped).unwrap().get("a"),
            Some(&json!(1))
        );
        assert_eq!(
            Envelope::decode_data(&bare).unwrap().get("todoTasks"),
            Some(&json!([1, 2]))
        );
    }

    #[test]
    fn test_decode_rejects_non_objects() {
        assert!(Envelope::decode_data(&json!([1, 2, 3])).is_none());
        assert!(Envelope::decode_data(&json!("text")).is_none());
        assert!(Envelope::decode_data(&Value::Null).is_none());
    }

    #[test]
    fn test_decode_rejects_non_object_data_field() {
        assert!(Envelope::decode_data(&json!({"data": 5})).is_none());
        assert!(Envelope::decode_data(&json!({"version": 1, "data": [1, 2]})).is_none());
        assert!(Envelope::restamp(&json!({"data": null})).is_none());
    }

    #[test]
    fn test_envelope_serializes_camel_case() {
        let mut data = Document::new();
        data.insert("k".to_string(), json!(true));
        let value = Envelope::new(data).to_value();

        assert_eq!(value["version"], 1);
        assert!(value["updatedAt"].as_str().unwrap().ends_with('Z'));
        assert_eq!(value["data"]["k"], true);
    }

    #[test]
    fn test_reserved_prefix_matching() {
        assert!(is_reserved_key("__internal", DEFAULT_RESERVED_PREFIX));
        assert!(!is_reserved_key("todoTasks", DEFAULT_RESERVED_PREFIX));
        assert!(!is_reserved_key("__internal", ""));
    }
}
