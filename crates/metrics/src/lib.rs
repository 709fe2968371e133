//! Metrics registration and reporting for the logship pipeline.
//!
//! Every crate keeps its metric declarations in a private `metrics` module
//! and exposes high-level functions ("this event happened") rather than raw
//! metric handles. Registration goes through the macros in this crate so
//! metric names are validated at compile time and automatically prefixed
//! with the service name.

mod labels;
pub mod macros;
mod metrics;
mod reporting;
mod timer;

pub use crate::macros::{
    paste,
    prometheus,
};
pub use crate::{
    labels::{
        IntoLabel,
        MetricLabel,
        StaticMetricLabel,
        STATUS_LABEL,
    },
    metrics::{
        log_invalid_metric,
        MetricHelp,
        MetricName,
        LOGSHIP_METRICS_REGISTRY,
        SERVICE_NAME,
    },
    reporting::{
        get_desc,
        log_counter,
        log_counter_with_labels,
        log_distribution,
        log_distribution_with_labels,
        log_gauge,
        log_gauge_with_labels,
    },
    timer::{
        StatusTimer,
        Timer,
    },
};
