//! Tunable limits and parameters for the pipeline.
//!
//! Every knob here should have a comment explaining what it's for and the
//! upper/lower bounds if applicable so an oncall engineer can adjust these
//! safely if needed. Knobs cover operational tuning; user-facing behavior
//! belongs in the configuration schema instead.
//!
//! When running locally, these knobs can all be overridden with an
//! environment variable.
#![deny(missing_docs)]

use std::{
    env,
    fmt::Debug,
    str::FromStr,
    sync::LazyLock,
    time::Duration,
};

/// Read a knob override from the environment, falling back to the default
/// on absence or parse failure.
pub fn env_config<T: Debug + FromStr>(name: &str, default: T) -> T
where
    <T as FromStr>::Err: Debug,
{
    let var_s = match env::var(name) {
        Ok(s) => s,
        Err(env::VarError::NotPresent) => return default,
        Err(env::VarError::NotUnicode(..)) => {
            tracing::warn!("Invalid value for {name}, falling back to {default:?}.");
            return default;
        },
    };
    match T::from_str(&var_s) {
        Ok(v) => {
            tracing::info!("Overriding {name} to {v:?} from environment");
            v
        },
        Err(e) => {
            tracing::warn!("Invalid value {var_s} for {name}, falling back to {default:?}: {e:?}");
            default
        },
    }
}

/// 0 -> default (number of cores)
pub static RUNTIME_WORKER_THREADS: LazyLock<usize> =
    LazyLock::new(|| env_config("RUNTIME_WORKER_THREADS", 0));

/// Set a consistent thread stack size regardless of environment. This is
/// 2x Rust's default.
pub static RUNTIME_STACK_SIZE: LazyLock<usize> =
    LazyLock::new(|| env_config("RUNTIME_STACK_SIZE", 4 * 1024 * 1024));

/// How often a file tailer polls its file for growth once it has reached
/// EOF. Lowering this reduces delivery latency at the cost of stat traffic.
pub static FILE_POLL_INTERVAL_MILLIS: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_millis(env_config("FILE_POLL_INTERVAL_MILLIS", 250)));

/// How often the container tailer re-lists containers to pick up starts,
/// stops, and restarts.
pub static CONTAINER_POLL_INTERVAL_MILLIS: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_millis(env_config("CONTAINER_POLL_INTERVAL_MILLIS", 2000)));

/// Queue utilization above which admission logs a pressure warning.
pub static QUEUE_PRESSURE_WARN_THRESHOLD: LazyLock<f64> =
    LazyLock::new(|| env_config("QUEUE_PRESSURE_WARN_THRESHOLD", 0.8));

/// Queue utilization above which producers get an extended send timeout to
/// throttle them. Must be >= the warn threshold.
pub static QUEUE_PRESSURE_THROTTLE_THRESHOLD: LazyLock<f64> =
    LazyLock::new(|| env_config("QUEUE_PRESSURE_THROTTLE_THRESHOLD", 0.9));

/// Queue utilization above which the lowest-priority source kind
/// (containers) is shed outright.
pub static QUEUE_PRESSURE_SHED_THRESHOLD: LazyLock<f64> =
    LazyLock::new(|| env_config("QUEUE_PRESSURE_SHED_THRESHOLD", 0.95));

/// Multiplier applied to the producer send timeout while throttled.
pub static QUEUE_THROTTLE_SEND_TIMEOUT_FACTOR: LazyLock<u32> =
    LazyLock::new(|| env_config("QUEUE_THROTTLE_SEND_TIMEOUT_FACTOR", 4));

/// Capacity of the in-memory ring that absorbs batches when the dead-letter
/// store itself cannot be written. Sized in batches, not records.
pub static DLQ_EMERGENCY_BUFFER_CAP: LazyLock<usize> =
    LazyLock::new(|| env_config("DLQ_EMERGENCY_BUFFER_CAP", 128));
