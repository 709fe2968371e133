//! Admission preprocessors: content-hash deduplication and timestamp
//! discipline. Both run inline on the admission path and perform no I/O.

use std::{
    num::NonZeroUsize,
    time::Duration,
};

use common::{
    config::TimestampConfig,
    record::{
        FieldValue,
        LogRecord,
    },
    runtime::UnixTimestamp,
};
use lru::LruCache;
use parking_lot::Mutex;

use crate::metrics::log_dedup_entries;

const DEDUP_SHARDS: usize = 16;

/// Striped LRU+TTL map of `fingerprint -> last_seen`. Striping keeps the
/// admission path off a single lock.
pub struct DedupCache {
    shards: Vec<Mutex<LruCache<u64, UnixTimestamp>>>,
}

impl DedupCache {
    pub fn new(cap: usize) -> Self {
        let per_shard = NonZeroUsize::new((cap / DEDUP_SHARDS).max(1))
            .expect("per-shard capacity is at least 1");
        Self {
            shards: (0..DEDUP_SHARDS)
                .map(|_| Mutex::new(LruCache::new(per_shard)))
                .collect(),
        }
    }

    fn shard(&self, fingerprint: u64) -> &Mutex<LruCache<u64, UnixTimestamp>> {
        &self.shards[(fingerprint as usize) % DEDUP_SHARDS]
    }

    /// True when the fingerprint was seen within `ttl` of `now`. An expired
    /// entry does not count and will be overwritten by the next `note`.
    pub fn is_recent_duplicate(&self, fingerprint: u64, now: UnixTimestamp, ttl: Duration) -> bool {
        let mut shard = self.shard(fingerprint).lock();
        match shard.get(&fingerprint) {
            Some(last_seen) => now
                .checked_sub(*last_seen)
                .map_or(true, |age| age < ttl),
            None => false,
        }
    }

    /// Record that the fingerprint's record was admitted.
    pub fn note(&self, fingerprint: u64, now: UnixTimestamp) {
        self.shard(fingerprint).lock().put(fingerprint, now);
        log_dedup_entries(self.len());
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampOutcome {
    Admitted,
    AdmittedClamped,
    Dropped,
}

/// Field carrying the pre-clamp timestamp for audit.
pub const ORIGINAL_TIMESTAMP_FIELD: &str = "timestamp_original_ms";

/// Force the record's timestamp into `[now - max_past_age, now +
/// max_future_age]`. With clamping enabled the original value is preserved
/// as a field; with it disabled, out-of-window records are dropped.
pub fn normalize_timestamp(
    record: &mut LogRecord,
    now: UnixTimestamp,
    config: &TimestampConfig,
) -> TimestampOutcome {
    let floor = now.saturating_sub(config.max_past_age());
    let ceiling = now + config.max_future_age();

    let clamped_to = if record.timestamp < floor {
        floor
    } else if record.timestamp > ceiling {
        ceiling
    } else {
        return TimestampOutcome::Admitted;
    };

    if !config.clamp {
        return TimestampOutcome::Dropped;
    }
    record.fields.insert(
        ORIGINAL_TIMESTAMP_FIELD.to_owned(),
        FieldValue::Int(record.timestamp.as_ms_since_epoch() as i64),
    );
    record.timestamp = clamped_to;
    TimestampOutcome::AdmittedClamped
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use common::{
        config::TimestampConfig,
        record::{
            FieldValue,
            LogRecord,
            SourceKind,
        },
        runtime::UnixTimestamp,
    };

    use super::{
        normalize_timestamp,
        DedupCache,
        TimestampOutcome,
        ORIGINAL_TIMESTAMP_FIELD,
    };

    fn record_at(ts: UnixTimestamp) -> LogRecord {
        LogRecord::new("message", ts, SourceKind::File, "/var/log/app.log")
    }

    fn config(clamp: bool) -> TimestampConfig {
        TimestampConfig {
            max_past_age_secs: 3_600,
            max_future_age_secs: 300,
            clamp,
        }
    }

    #[test]
    fn test_dedup_suppresses_within_ttl() {
        let cache = DedupCache::new(1_024);
        let now = UnixTimestamp::from_millis(1_700_000_000_000);
        let ttl = Duration::from_secs(60);

        assert!(!cache.is_recent_duplicate(42, now, ttl));
        cache.note(42, now);
        assert!(cache.is_recent_duplicate(42, now + Duration::from_secs(30), ttl));
        // Expired entries stop counting as duplicates.
        assert!(!cache.is_recent_duplicate(42, now + Duration::from_secs(61), ttl));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_dedup_evicts_at_capacity() {
        // 16 shards, 1 entry each.
        let cache = DedupCache::new(16);
        let now = UnixTimestamp::from_millis(1_700_000_000_000);
        for fingerprint in 0..1_000u64 {
            cache.note(fingerprint, now);
        }
        assert!(cache.len() <= 16);
    }

    #[test]
    fn test_in_window_timestamp_untouched() {
        let now = UnixTimestamp::from_millis(1_700_000_000_000);
        let mut record = record_at(now - Duration::from_secs(10));
        assert_eq!(
            normalize_timestamp(&mut record, now, &config(true)),
            TimestampOutcome::Admitted
        );
        assert_eq!(record.timestamp, now - Duration::from_secs(10));
        assert!(record.fields.is_empty());
    }

    #[test]
    fn test_old_timestamp_clamped_with_audit_field() {
        let now = UnixTimestamp::from_millis(1_700_000_000_000);
        let original = now - Duration::from_secs(48 * 3_600);
        let mut record = record_at(original);
        assert_eq!(
            normalize_timestamp(&mut record, now, &config(true)),
            TimestampOutcome::AdmittedClamped
        );
        assert_eq!(record.timestamp, now - Duration::from_secs(3_600));
        assert_eq!(
            record.fields.get(ORIGINAL_TIMESTAMP_FIELD),
            Some(&FieldValue::Int(original.as_ms_since_epoch() as i64))
        );
    }

    #[test]
    fn test_future_timestamp_clamped() {
        let now = UnixTimestamp::from_millis(1_700_000_000_000);
        let mut record = record_at(now + Duration::from_secs(900));
        assert_eq!(
            normalize_timestamp(&mut record, now, &config(true)),
            TimestampOutcome::AdmittedClamped
        );
        assert_eq!(record.timestamp, now + Duration::from_secs(300));
    }

    #[test]
    fn test_out_of_window_dropped_when_clamp_disabled() {
        let now = UnixTimestamp::from_millis(1_700_000_000_000);
        let mut record = record_at(now - Duration::from_secs(48 * 3_600));
        assert_eq!(
            normalize_timestamp(&mut record, now, &config(false)),
            TimestampOutcome::Dropped
        );
    }
}
