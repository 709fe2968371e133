use metrics::{
    log_counter_with_labels,
    log_gauge,
    register_logship_counter,
    register_logship_gauge,
    StaticMetricLabel,
};

register_logship_gauge!(
    DISPATCH_QUEUE_SIZE_RECORDS,
    "Number of records buffered in the dispatch queue"
);
pub fn log_queue_size(len: usize) {
    log_gauge(&DISPATCH_QUEUE_SIZE_RECORDS, len as f64);
}

register_logship_counter!(
    ERRORS_REPORTED_TOTAL,
    "Number of errors reported by background tasks",
    &["severity"],
);
pub fn log_error_reported(severity: &'static str) {
    log_counter_with_labels(
        &ERRORS_REPORTED_TOTAL,
        1,
        vec![StaticMetricLabel::new("severity", severity)],
    );
}

register_logship_counter!(
    FETCH_REQUESTS_TOTAL,
    "Number of outbound HTTP requests issued through the pooled fetch client",
    &["status"],
);
pub fn log_fetch_request(is_ok: bool) {
    log_counter_with_labels(
        &FETCH_REQUESTS_TOTAL,
        1,
        vec![StaticMetricLabel::status(is_ok)],
    );
}

register_logship_gauge!(
    SUPERVISED_TASKS,
    "Number of currently supervised long-lived tasks"
);
pub fn log_supervised_tasks(count: usize) {
    log_gauge(&SUPERVISED_TASKS, count as f64);
}

register_logship_counter!(
    SUPERVISOR_FAILED_TASKS,
    "Number of tasks cancelled after missing their heartbeat",
    &["task"],
);
pub fn log_supervisor_task_failed(task_id: &str) {
    log_counter_with_labels(
        &SUPERVISOR_FAILED_TASKS,
        1,
        vec![StaticMetricLabel::new("task", task_id.to_owned())],
    );
}

register_logship_gauge!(
    FETCH_HOST_WAITERS_CONNECTIONS,
    "Requests currently waiting on a per-host connection permit",
    &["host"],
);
pub fn log_fetch_host_waiters(host: &str, waiters: usize) {
    metrics::log_gauge_with_labels(
        &FETCH_HOST_WAITERS_CONNECTIONS,
        waiters as f64,
        vec![StaticMetricLabel::new("host", host.to_owned())],
    );
}
