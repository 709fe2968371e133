//! Pipeline counters exposed to the admin surface. Counters are atomics,
//! never touched under batch-processing locks.

use std::{
    collections::BTreeMap,
    sync::atomic::{
        AtomicU64,
        Ordering,
    },
};

use serde::Serialize;

use crate::{
    dlq::DlqStats,
    metrics::{
        log_duplicate_suppressed,
        log_queue_full_drop,
        log_record_shed,
        log_records_processed,
        log_timestamp_clamped,
        log_timestamp_dropped,
    },
};

pub struct PipelineStats {
    processed_records: AtomicU64,
    /// Keyed by sink name; the sink set is fixed at startup.
    failed_per_sink: BTreeMap<String, AtomicU64>,
    duplicates_suppressed: AtomicU64,
    timestamp_clamped: AtomicU64,
    timestamp_dropped: AtomicU64,
    queue_full_drops: AtomicU64,
    shed_records: AtomicU64,
}

impl PipelineStats {
    pub(crate) fn new(sink_names: impl IntoIterator<Item = String>) -> Self {
        Self {
            processed_records: AtomicU64::new(0),
            failed_per_sink: sink_names
                .into_iter()
                .map(|name| (name, AtomicU64::new(0)))
                .collect(),
            duplicates_suppressed: AtomicU64::new(0),
            timestamp_clamped: AtomicU64::new(0),
            timestamp_dropped: AtomicU64::new(0),
            queue_full_drops: AtomicU64::new(0),
            shed_records: AtomicU64::new(0),
        }
    }

    pub(crate) fn record_processed(&self, count: usize) {
        self.processed_records
            .fetch_add(count as u64, Ordering::Relaxed);
        log_records_processed(count);
    }

    pub(crate) fn record_sink_failure(&self, sink: &str, count: usize) {
        if let Some(counter) = self.failed_per_sink.get(sink) {
            counter.fetch_add(count as u64, Ordering::Relaxed);
        }
    }

    pub(crate) fn note_duplicate(&self) {
        self.duplicates_suppressed.fetch_add(1, Ordering::Relaxed);
        log_duplicate_suppressed();
    }

    pub(crate) fn note_timestamp_clamped(&self) {
        self.timestamp_clamped.fetch_add(1, Ordering::Relaxed);
        log_timestamp_clamped();
    }

    pub(crate) fn note_timestamp_dropped(&self) {
        self.timestamp_dropped.fetch_add(1, Ordering::Relaxed);
        log_timestamp_dropped();
    }

    pub(crate) fn note_queue_full_drop(&self, source_kind: &'static str) {
        self.queue_full_drops.fetch_add(1, Ordering::Relaxed);
        log_queue_full_drop(source_kind);
    }

    pub(crate) fn note_shed(&self, source_kind: &'static str) {
        self.shed_records.fetch_add(1, Ordering::Relaxed);
        log_record_shed(source_kind);
    }

    pub fn processed(&self) -> u64 {
        self.processed_records.load(Ordering::Relaxed)
    }

    pub fn failed_per_sink(&self) -> BTreeMap<String, u64> {
        self.failed_per_sink
            .iter()
            .map(|(name, counter)| (name.clone(), counter.load(Ordering::Relaxed)))
            .collect()
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates_suppressed.load(Ordering::Relaxed)
    }

    pub fn timestamp_drops(&self) -> u64 {
        self.timestamp_dropped.load(Ordering::Relaxed)
    }

    pub fn queue_full_drops(&self) -> u64 {
        self.queue_full_drops.load(Ordering::Relaxed)
    }
}

/// Point-in-time view returned by `Pipeline::stats` for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub queue_len: usize,
    pub queue_cap: usize,
    pub queue_utilization: f64,
    pub processed_records: u64,
    pub failed_per_sink: BTreeMap<String, u64>,
    pub retry_queue_depth: usize,
    pub dedup_entries: usize,
    pub duplicates_suppressed: u64,
    pub timestamp_clamped: u64,
    pub timestamp_dropped: u64,
    pub queue_full_drops: u64,
    pub shed_records: u64,
    pub dlq: DlqStats,
    pub live_tasks: usize,
    pub failed_tasks: u64,
}

impl PipelineStats {
    pub(crate) fn clamped(&self) -> u64 {
        self.timestamp_clamped.load(Ordering::Relaxed)
    }

    pub(crate) fn shed(&self) -> u64 {
        self.shed_records.load(Ordering::Relaxed)
    }
}
