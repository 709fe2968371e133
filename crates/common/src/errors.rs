//! Error reporting helpers. No error leaves the pipeline as a panic: every
//! spawned loop reports through here and keeps going (or lets the
//! supervisor decide).

use crate::metrics::log_error_reported;

/// Log an error from a background task and count it. Yields first so that a
/// task being torn down during shutdown completes its cancellation instead
/// of spamming the log.
pub async fn report_error(err: &mut anyhow::Error) {
    trace_error(err);
    tokio::task::yield_now().await;
    log_error_reported("error");
}

/// Synchronous version of [`report_error`] for use in sync contexts.
pub fn report_error_sync(err: &mut anyhow::Error) {
    trace_error(err);
    log_error_reported("error");
}

fn trace_error(err: &mut anyhow::Error) {
    let err_for_tracing = format!("{err:#}").replace('\n', "\\n");
    tracing::error!("Caught error (RUST_BACKTRACE=1 for full trace): {err_for_tracing}");
    tracing::debug!("{err:?}");
}
