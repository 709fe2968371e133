use std::time::{
    Duration,
    Instant,
};

use prometheus::{
    Histogram,
    HistogramVec,
};

use crate::{
    labels::{
        MetricLabel,
        StaticMetricLabel,
    },
    log_distribution,
    log_distribution_with_labels,
};

/// Observes the elapsed wall-clock time into a histogram when dropped.
pub struct Timer {
    start: Instant,
    histogram: &'static Histogram,
}

impl Timer {
    pub fn new(histogram: &'static Histogram) -> Self {
        Self {
            start: Instant::now(),
            histogram,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        log_distribution(self.histogram, self.start.elapsed().as_secs_f64());
    }
}

/// Like [`Timer`], but for a labeled histogram with a `status` label.
///
/// The timer reports `status=error` unless `finish()` is called before it
/// drops, so early returns on error paths are counted correctly.
pub struct StatusTimer {
    start: Instant,
    histogram: &'static HistogramVec,
    label: StaticMetricLabel,
    extra_labels: Vec<StaticMetricLabel>,
}

impl StatusTimer {
    pub fn new(histogram: &'static HistogramVec) -> Self {
        Self {
            start: Instant::now(),
            histogram,
            label: MetricLabel::STATUS_ERROR,
            extra_labels: vec![],
        }
    }

    pub fn add_label(&mut self, label: StaticMetricLabel) {
        self.extra_labels.push(label);
    }

    pub fn finish(mut self) -> Duration {
        self.label = MetricLabel::STATUS_SUCCESS;
        self.start.elapsed()
    }
}

impl Drop for StatusTimer {
    fn drop(&mut self) {
        let mut labels = vec![self.label.clone()];
        labels.append(&mut self.extra_labels);
        log_distribution_with_labels(
            self.histogram,
            self.start.elapsed().as_secs_f64(),
            labels,
        );
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        register_logship_histogram,
        StatusTimer,
        Timer,
        STATUS_LABEL,
    };

    register_logship_histogram!(
        TIMER_TEST_SECONDS,
        "Histogram exercised by the timer test"
    );
    register_logship_histogram!(
        STATUS_TIMER_TEST_SECONDS,
        "Histogram exercised by the status timer test",
        &STATUS_LABEL
    );

    #[test]
    fn test_timer_observes_on_drop() {
        let before = TIMER_TEST_SECONDS.get_sample_count();
        drop(Timer::new(&TIMER_TEST_SECONDS));
        assert_eq!(TIMER_TEST_SECONDS.get_sample_count(), before + 1);
    }

    #[test]
    fn test_status_timer_finish() {
        let timer = StatusTimer::new(&STATUS_TIMER_TEST_SECONDS);
        timer.finish();
        let success = STATUS_TIMER_TEST_SECONDS.with_label_values(&["success"]);
        assert!(success.get_sample_count() >= 1);
    }
}
