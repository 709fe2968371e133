//! The record model: the unit flowing through the pipeline and the batch
//! envelope that carries records through fan-out, retry, and dead-lettering.

use std::{
    collections::{
        BTreeMap,
        BTreeSet,
    },
    fmt,
    hash::Hasher,
    sync::Arc,
};

use serde::{
    Deserialize,
    Serialize,
};
use serde_json::Value as JsonValue;

use crate::runtime::UnixTimestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    File,
    Container,
}

impl SourceKind {
    /// Stable string form, used for metric labels and the wire encoding.
    pub fn label(&self) -> &'static str {
        match self {
            SourceKind::File => "file",
            SourceKind::Container => "container",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Scalar values carried through to sinks that understand structured
/// payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

/// One normalized log line.
///
/// Records are immutable once admitted: the dispatcher shares them between
/// sinks as `Arc<LogRecord>`, so a sink is free to retain a batch across
/// await points and cannot affect any other sink's view of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// The raw line, trailing newline stripped.
    pub message: String,
    /// Always present; defaults to the ingest instant when the source did
    /// not provide one.
    pub timestamp: UnixTimestamp,
    pub source_kind: SourceKind,
    /// Stable source identifier: absolute file path or container identity.
    pub source_id: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, FieldValue>,
}

impl LogRecord {
    pub fn new(
        message: impl Into<String>,
        timestamp: UnixTimestamp,
        source_kind: SourceKind,
        source_id: impl Into<String>,
    ) -> Self {
        Self {
            message: message.into(),
            timestamp,
            source_kind,
            source_id: source_id.into(),
            labels: BTreeMap::new(),
            fields: BTreeMap::new(),
        }
    }

    /// Content hash of `(source_id, message)` used only for deduplication.
    ///
    /// SeaHash: not cryptographic, but documented to produce identical
    /// output across platforms and versions, so the suppression window
    /// survives restarts.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = seahash::SeaHasher::new();
        hasher.write(self.source_id.as_bytes());
        hasher.write_u8(0xff);
        hasher.write(self.message.as_bytes());
        hasher.finish()
    }

    /// JSON object form used by sinks that emit one object per record.
    pub fn to_json_map(&self) -> anyhow::Result<serde_json::Map<String, JsonValue>> {
        match serde_json::to_value(self)? {
            JsonValue::Object(map) => Ok(map),
            v => anyhow::bail!("LogRecord serialized to a non-object value: {v:?}"),
        }
    }
}

/// A batch of records owned by one worker between flush triggers, and the
/// unit of retry and dead-letter accounting.
#[derive(Debug, Clone)]
pub struct BatchEnvelope {
    /// Insertion order is dispatcher arrival order.
    pub records: Vec<Arc<LogRecord>>,
    /// 0 on first dispatch.
    pub attempt: u32,
    pub first_failure_reason: Option<String>,
    /// When a retry targets only the sinks that failed, the names of that
    /// subset. `None` means every registered sink.
    pub sink_filter: Option<BTreeSet<String>>,
}

impl BatchEnvelope {
    pub fn new(records: Vec<Arc<LogRecord>>) -> Self {
        Self {
            records,
            attempt: 0,
            first_failure_reason: None,
            sink_filter: None,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Whether a retry of this envelope should target the named sink.
    pub fn targets_sink(&self, name: &str) -> bool {
        match &self.sink_filter {
            None => true,
            Some(filter) => filter.contains(name),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Arc;

    use super::{
        BatchEnvelope,
        FieldValue,
        LogRecord,
        SourceKind,
    };
    use crate::runtime::UnixTimestamp;

    fn record(source_id: &str, message: &str) -> LogRecord {
        LogRecord::new(
            message,
            UnixTimestamp::from_millis(1_700_000_000_000),
            SourceKind::File,
            source_id,
        )
    }

    #[test]
    fn test_fingerprint_depends_on_source_and_message() {
        let a = record("/var/log/app.log", "hello");
        let b = record("/var/log/app.log", "hello");
        let c = record("/var/log/other.log", "hello");
        let d = record("/var/log/app.log", "world");
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
        assert_ne!(a.fingerprint(), d.fingerprint());
    }

    #[test]
    fn test_fingerprint_separator_prevents_concat_collisions() {
        let a = record("ab", "c");
        let b = record("a", "bc");
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_record_json_round_trip() {
        let mut r = record("/var/log/app.log", "payload");
        r.labels.insert("service".to_string(), "api".to_string());
        r.fields
            .insert("latency_ms".to_string(), FieldValue::Int(12));
        let encoded = serde_json::to_string(&r).unwrap();
        let decoded: LogRecord = serde_json::from_str(&encoded).unwrap();
        assert_eq!(r, decoded);

        let map = r.to_json_map().unwrap();
        assert_eq!(map["message"], "payload");
        assert_eq!(map["source_kind"], "file");
        assert_eq!(map["timestamp"], 1_700_000_000_000u64);
    }

    #[test]
    fn test_envelope_sink_filter() {
        let envelope = BatchEnvelope::new(vec![Arc::new(record("/a", "x"))]);
        assert!(envelope.targets_sink("anything"));

        let mut filtered = envelope.clone();
        filtered.sink_filter = Some(BTreeSet::from(["loki".to_string()]));
        assert!(filtered.targets_sink("loki"));
        assert!(!filtered.targets_sink("kafka"));
    }
}
