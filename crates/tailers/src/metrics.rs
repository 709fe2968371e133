use metrics::{
    log_counter,
    log_counter_with_labels,
    register_logship_counter,
    register_logship_histogram,
    StaticMetricLabel,
    Timer,
};

register_logship_counter!(
    FILE_RECORDS_EMITTED_RECORDS,
    "Number of records emitted by file tailers"
);
pub fn log_file_record_emitted() {
    log_counter(&FILE_RECORDS_EMITTED_RECORDS, 1);
}

register_logship_counter!(
    FILE_TAILER_TRUNCATIONS_TOTAL,
    "Number of times a tailed file was detected as truncated"
);
pub fn log_file_truncation() {
    log_counter(&FILE_TAILER_TRUNCATIONS_TOTAL, 1);
}

register_logship_counter!(
    FILE_TAILER_ROTATIONS_ROTATIONS,
    "Number of times a tailed path was replaced by a new file identity"
);
pub fn log_file_rotation() {
    log_counter(&FILE_TAILER_ROTATIONS_ROTATIONS, 1);
}

register_logship_counter!(
    FILE_TAILER_GONE_TOTAL,
    "Number of tailed files demoted after disappearing or failing to open"
);
pub fn log_file_gone() {
    log_counter(&FILE_TAILER_GONE_TOTAL, 1);
}

register_logship_counter!(
    FILE_TAILER_READ_ERRORS,
    "Transient read errors observed by file tailers"
);
pub fn log_file_read_error() {
    log_counter(&FILE_TAILER_READ_ERRORS, 1);
}

register_logship_counter!(
    RECORDS_NOT_ADMITTED_RECORDS,
    "Records a source offered that the pipeline did not admit",
    &["source_kind"],
);
pub fn log_record_not_admitted(source_kind: &'static str) {
    log_counter_with_labels(
        &RECORDS_NOT_ADMITTED_RECORDS,
        1,
        vec![StaticMetricLabel::new("source_kind", source_kind)],
    );
}

register_logship_counter!(
    CONTAINER_RECORDS_EMITTED_RECORDS,
    "Number of records emitted by container tailers"
);
pub fn log_container_record_emitted() {
    log_counter(&CONTAINER_RECORDS_EMITTED_RECORDS, 1);
}

register_logship_counter!(
    CONTAINER_STREAM_ROTATIONS_ROTATIONS,
    "Number of container log stream rotations"
);
pub fn log_container_rotation() {
    log_counter(&CONTAINER_STREAM_ROTATIONS_ROTATIONS, 1);
}

register_logship_counter!(
    CONTAINER_STREAM_ERRORS,
    "Errors reading or opening container log streams"
);
pub fn log_container_stream_error() {
    log_counter(&CONTAINER_STREAM_ERRORS, 1);
}

register_logship_histogram!(
    OFFSET_FLUSH_SECONDS,
    "Time spent flushing the offset store to disk"
);
pub fn offset_flush_timer() -> Timer {
    Timer::new(&OFFSET_FLUSH_SECONDS)
}

register_logship_counter!(
    OFFSET_TOMBSTONES_PURGED_TOTAL,
    "Offset entries purged after their tombstone retention elapsed"
);
pub fn log_offset_tombstones_purged(count: usize) {
    log_counter(&OFFSET_TOMBSTONES_PURGED_TOTAL, count as u64);
}
