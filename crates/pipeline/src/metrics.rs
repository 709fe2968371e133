use metrics::{
    log_counter,
    log_counter_with_labels,
    log_distribution_with_labels,
    log_gauge,
    register_logship_counter,
    register_logship_gauge,
    register_logship_histogram,
    StaticMetricLabel,
};

register_logship_counter!(
    PIPELINE_PROCESSED_RECORDS,
    "Records delivered to every targeted healthy sink"
);
pub fn log_records_processed(count: usize) {
    log_counter(&PIPELINE_PROCESSED_RECORDS, count as u64);
}

register_logship_counter!(
    PIPELINE_DUPLICATES_SUPPRESSED_RECORDS,
    "Records dropped at admission as recent duplicates"
);
pub fn log_duplicate_suppressed() {
    log_counter(&PIPELINE_DUPLICATES_SUPPRESSED_RECORDS, 1);
}

register_logship_counter!(
    PIPELINE_TIMESTAMP_CLAMPED_RECORDS,
    "Records whose timestamp was clamped into the acceptance window"
);
pub fn log_timestamp_clamped() {
    log_counter(&PIPELINE_TIMESTAMP_CLAMPED_RECORDS, 1);
}

register_logship_counter!(
    PIPELINE_TIMESTAMP_DROPPED_RECORDS,
    "Records dropped at admission for a timestamp outside the window"
);
pub fn log_timestamp_dropped() {
    log_counter(&PIPELINE_TIMESTAMP_DROPPED_RECORDS, 1);
}

register_logship_counter!(
    PIPELINE_QUEUE_FULL_DROPS_RECORDS,
    "Records dropped because the dispatch queue was full",
    &["source_kind"],
);
pub fn log_queue_full_drop(source_kind: &'static str) {
    log_counter_with_labels(
        &PIPELINE_QUEUE_FULL_DROPS_RECORDS,
        1,
        vec![StaticMetricLabel::new("source_kind", source_kind)],
    );
}

register_logship_counter!(
    PIPELINE_SHED_RECORDS,
    "Records shed under queue pressure",
    &["source_kind"],
);
pub fn log_record_shed(source_kind: &'static str) {
    log_counter_with_labels(
        &PIPELINE_SHED_RECORDS,
        1,
        vec![StaticMetricLabel::new("source_kind", source_kind)],
    );
}

register_logship_gauge!(
    PIPELINE_QUEUE_UTILIZATION_INFO,
    "Dispatch queue fill fraction in [0, 1]"
);
pub fn log_queue_utilization(utilization: f64) {
    log_gauge(&PIPELINE_QUEUE_UTILIZATION_INFO, utilization);
}

register_logship_histogram!(
    SINK_SEND_SECONDS,
    "Per-sink batch delivery latency",
    &["sink", "status"],
);
pub fn log_sink_send_seconds(sink: &str, status: &'static str, seconds: f64) {
    log_distribution_with_labels(
        &SINK_SEND_SECONDS,
        seconds,
        vec![
            StaticMetricLabel::new("sink", sink.to_owned()),
            StaticMetricLabel::new("status", status),
        ],
    );
}

register_logship_counter!(
    SINK_SEND_FAILURES_ERRORS,
    "Failed per-sink batch deliveries",
    &["sink"],
);
pub fn log_sink_send_failure(sink: &str) {
    log_counter_with_labels(
        &SINK_SEND_FAILURES_ERRORS,
        1,
        vec![StaticMetricLabel::new("sink", sink.to_owned())],
    );
}

register_logship_counter!(
    SINK_SKIPPED_UNHEALTHY_TOTAL,
    "Batch deliveries skipped because the sink reported unhealthy",
    &["sink"],
);
pub fn log_sink_skipped_unhealthy(sink: &str) {
    log_counter_with_labels(
        &SINK_SKIPPED_UNHEALTHY_TOTAL,
        1,
        vec![StaticMetricLabel::new("sink", sink.to_owned())],
    );
}

register_logship_gauge!(
    RETRY_QUEUE_DEPTH_BATCHES,
    "Batches waiting in the retry queue"
);
pub fn log_retry_queue_depth(depth: usize) {
    log_gauge(&RETRY_QUEUE_DEPTH_BATCHES, depth as f64);
}

register_logship_counter!(
    RETRY_SCHEDULED_BATCHES,
    "Batches scheduled for retry"
);
pub fn log_retry_scheduled() {
    log_counter(&RETRY_SCHEDULED_BATCHES, 1);
}

register_logship_counter!(
    RETRY_CIRCUIT_WIDENED_TOTAL,
    "Times the retry circuit breaker widened scheduled delays"
);
pub fn log_retry_circuit_widened() {
    log_counter(&RETRY_CIRCUIT_WIDENED_TOTAL, 1);
}

register_logship_counter!(
    DLQ_APPENDED_BATCHES,
    "Batches appended to the dead-letter store",
    &["reason"],
);
pub fn log_dlq_appended(reason: &'static str) {
    log_counter_with_labels(
        &DLQ_APPENDED_BATCHES,
        1,
        vec![StaticMetricLabel::new("reason", reason)],
    );
}

register_logship_counter!(
    DLQ_WRITE_FAILURES_ERRORS,
    "Failed writes to the dead-letter store (alarm condition)"
);
pub fn log_dlq_write_failure() {
    log_counter(&DLQ_WRITE_FAILURES_ERRORS, 1);
}

register_logship_counter!(
    DLQ_REPROCESSED_ENTRIES,
    "Dead-letter entries successfully reinjected"
);
pub fn log_dlq_reprocessed(count: usize) {
    log_counter(&DLQ_REPROCESSED_ENTRIES, count as u64);
}

register_logship_gauge!(
    DLQ_LIVE_ENTRIES,
    "Dead-letter entries on disk that have not been reprocessed"
);
pub fn log_dlq_entries(count: usize) {
    log_gauge(&DLQ_LIVE_ENTRIES, count as f64);
}

register_logship_gauge!(
    DEDUP_CACHE_ENTRIES,
    "Entries currently held by the dedup cache"
);
pub fn log_dedup_entries(count: usize) {
    log_gauge(&DEDUP_CACHE_ENTRIES, count as f64);
}
