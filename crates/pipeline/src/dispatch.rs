//! The dispatcher core: workers assemble time/size-bounded batches from the
//! shared queue and fan each batch out to every registered sink, with
//! at-most-once-per-sink-per-batch semantics and per-sink failure
//! isolation.

use std::{
    collections::BTreeSet,
    sync::Arc,
    time::Duration,
};

use common::{
    bounded_queue::QueueReceiver,
    record::{
        BatchEnvelope,
        LogRecord,
    },
    runtime::{
        Runtime,
        TimeoutError,
        WithTimeout,
    },
    sink::Sink,
    supervisor::Heartbeat,
};
use futures::{
    future::join_all,
    FutureExt,
    StreamExt,
};
use parking_lot::RwLock;

use crate::{
    metrics::{
        log_sink_send_failure,
        log_sink_send_seconds,
        log_sink_skipped_unhealthy,
    },
    retry::{
        FailureMode,
        RetryManager,
    },
    stats::PipelineStats,
    HotConfig,
};

pub(crate) struct SinkHandle {
    pub name: String,
    pub sink: Arc<dyn Sink>,
}

/// Everything a batch delivery needs; shared by dispatch workers and retry
/// executors.
pub(crate) struct DeliveryContext<RT: Runtime> {
    pub rt: RT,
    pub sinks: Vec<SinkHandle>,
    pub hot: Arc<RwLock<HotConfig>>,
    pub stats: Arc<PipelineStats>,
}

/// One dispatch worker: collect a batch (size cap or timeout from the
/// first record), fan it out, repeat. Exits when the queue closes and is
/// drained, which is the shutdown drain path.
pub(crate) struct DispatchWorker<RT: Runtime> {
    pub rt: RT,
    pub receiver: QueueReceiver<Arc<LogRecord>>,
    pub ctx: Arc<DeliveryContext<RT>>,
    pub retry: Arc<RetryManager<RT>>,
}

impl<RT: Runtime> DispatchWorker<RT> {
    pub(crate) async fn run(mut self, heartbeat: Heartbeat) {
        loop {
            let (batch_size, batch_timeout) = {
                let hot = self.ctx.hot.read();
                (hot.batch_size, hot.batch_timeout)
            };
            let Some(first) = self.receiver.next().await else {
                // Queue closed and drained.
                return;
            };
            let mut batch: Vec<Arc<LogRecord>> = Vec::with_capacity(batch_size);
            batch.push(first);

            let mut deadline = self.rt.wait(batch_timeout);
            while batch.len() < batch_size {
                futures::select_biased! {
                    record = self.receiver.next().fuse() => match record {
                        Some(record) => batch.push(record),
                        None => break,
                    },
                    _ = deadline => break,
                }
            }

            heartbeat.beat();
            deliver_batch(&self.ctx, &self.retry, BatchEnvelope::new(batch)).await;
        }
    }
}

/// Fan one batch out to every targeted healthy sink and route the outcome:
/// full success acks, full failure goes to retry in circuit mode, partial
/// failure retries against only the failed subset.
pub(crate) async fn deliver_batch<RT: Runtime>(
    ctx: &DeliveryContext<RT>,
    retry: &Arc<RetryManager<RT>>,
    mut envelope: BatchEnvelope,
) {
    if envelope.is_empty() {
        return;
    }
    let sink_send_timeout = ctx.hot.read().sink_send_timeout;

    let mut healthy: Vec<&SinkHandle> = Vec::new();
    for handle in ctx.sinks.iter().filter(|s| envelope.targets_sink(&s.name)) {
        if handle.sink.is_healthy() {
            healthy.push(handle);
        } else {
            log_sink_skipped_unhealthy(&handle.name);
        }
    }
    if healthy.is_empty() {
        // Nothing deliverable right now. Dropping here would silently lose
        // the batch, so treat it like a full failure and let retry/DLQ
        // decide.
        envelope.attempt += 1;
        if envelope.first_failure_reason.is_none() {
            envelope.first_failure_reason = Some("no_healthy_sinks".to_string());
        }
        retry.submit(envelope, FailureMode::CircuitFail);
        return;
    }

    let sends = healthy.iter().map(|handle| {
        let records = envelope.records.clone();
        let rt = ctx.rt.clone();
        let sink = &handle.sink;
        let name = handle.name.clone();
        async move {
            let started = rt.monotonic_now();
            let result = rt
                .with_timeout("sink_send", sink_send_timeout, sink.send(records))
                .await;
            let elapsed = started.elapsed().as_secs_f64();
            let status = match &result {
                Ok(()) => "success",
                Err(e) if e.is::<TimeoutError>() => "deadline_exceeded",
                Err(_) => "error",
            };
            log_sink_send_seconds(&name, status, elapsed);
            (name, result)
        }
        .boxed()
    });
    let outcomes = join_all(sends).await;

    let mut failed: BTreeSet<String> = BTreeSet::new();
    let mut first_error: Option<String> = None;
    let total = outcomes.len();
    for (name, result) in outcomes {
        if let Err(e) = result {
            tracing::warn!("Sink {name} failed a batch of {} records: {e:#}", envelope.len());
            log_sink_send_failure(&name);
            ctx.stats.record_sink_failure(&name, envelope.len());
            if first_error.is_none() {
                first_error = Some(format!("{name}: {e:#}"));
            }
            failed.insert(name);
        }
    }

    if failed.is_empty() {
        ctx.stats.record_processed(envelope.len());
        retry.note_success();
        return;
    }

    let all_failed = failed.len() == total;
    envelope.attempt += 1;
    if envelope.first_failure_reason.is_none() {
        envelope.first_failure_reason = first_error;
    }
    let mode = if all_failed {
        // Keep the existing filter: a fully-failed filtered retry still
        // only targets its subset.
        FailureMode::CircuitFail
    } else {
        envelope.sink_filter = Some(failed);
        FailureMode::PerSinkRetry
    };
    retry.submit(envelope, mode);
}

/// Close every sink, each bounded by its own timeout, sequentially so close
/// logging stays readable.
pub(crate) async fn close_sinks<RT: Runtime>(ctx: &DeliveryContext<RT>, timeout: Duration) {
    for handle in &ctx.sinks {
        if let Err(e) = handle.sink.close(timeout).await {
            tracing::warn!("Sink {} failed to close cleanly: {e:#}", handle.name);
        }
    }
}
