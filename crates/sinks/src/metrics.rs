use metrics::{
    log_counter_with_labels,
    register_logship_counter,
    register_logship_histogram,
    StaticMetricLabel,
    StatusTimer,
    STATUS_LABEL,
};

register_logship_counter!(
    SINK_RECORDS_WRITTEN_RECORDS,
    "Records written out by a sink",
    &["sink"],
);
pub fn log_sink_records_written(sink: &str, count: usize) {
    log_counter_with_labels(
        &SINK_RECORDS_WRITTEN_RECORDS,
        count as u64,
        vec![StaticMetricLabel::new("sink", sink.to_owned())],
    );
}

register_logship_counter!(
    LOCAL_SINK_FILE_ROTATIONS_ROTATIONS,
    "Rotations of a local sink's output file",
    &["sink"],
);
pub fn log_local_sink_rotation(sink: &str) {
    log_counter_with_labels(
        &LOCAL_SINK_FILE_ROTATIONS_ROTATIONS,
        1,
        vec![StaticMetricLabel::new("sink", sink.to_owned())],
    );
}

register_logship_counter!(
    HTTP_PUSH_REQUESTS_TOTAL,
    "Push requests issued by HTTP sinks",
    &["sink", "status"],
);
pub fn log_http_push_request(sink: &str, status: &'static str) {
    log_counter_with_labels(
        &HTTP_PUSH_REQUESTS_TOTAL,
        1,
        vec![
            StaticMetricLabel::new("sink", sink.to_owned()),
            StaticMetricLabel::new("status", status),
        ],
    );
}

register_logship_histogram!(
    HTTP_PUSH_SECONDS,
    "End-to-end latency of one push payload, across its request attempts",
    &STATUS_LABEL,
);
pub fn http_push_timer() -> StatusTimer {
    StatusTimer::new(&HTTP_PUSH_SECONDS)
}
