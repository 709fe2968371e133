//! Bounded retry scheduling for failed batches: exponential backoff with
//! jitter, a concurrency-capped executor pool, a circuit breaker that
//! widens delays while every sink is failing, and terminal routing to the
//! dead-letter store.

use std::{
    cmp,
    collections::VecDeque,
    sync::Arc,
    time::Duration,
};

use common::{
    config::RetryConfig,
    record::BatchEnvelope,
    runtime::{
        Runtime,
        SpawnHandle,
    },
    supervisor::{
        Heartbeat,
        TaskSupervisor,
    },
};
use parking_lot::{
    Mutex,
    RwLock,
};
use rand::Rng;
use tokio::sync::{
    Notify,
    Semaphore,
};

use crate::{
    dispatch::{
        deliver_batch,
        DeliveryContext,
    },
    dlq::{
        DeadLetterQueue,
        TerminalReason,
    },
    metrics::{
        log_retry_circuit_widened,
        log_retry_queue_depth,
        log_retry_scheduled,
    },
    HotConfig,
};

/// Ceiling on the circuit breaker's delay multiplier; the per-entry delay
/// is additionally clamped to the configured max backoff.
const MAX_WIDEN_MULTIPLIER: f64 = 64.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    /// Every targeted healthy sink failed the batch.
    CircuitFail,
    /// Only a subset failed; the envelope's sink filter names it.
    PerSinkRetry,
}

struct RetryEntry {
    envelope: BatchEnvelope,
    scheduled_at: tokio::time::Instant,
}

struct RetryInner {
    queue: VecDeque<RetryEntry>,
    consecutive_all_failed: u32,
    widen_multiplier: f64,
}

pub struct RetryManager<RT: Runtime> {
    rt: RT,
    config: RetryConfig,
    hot: Arc<RwLock<HotConfig>>,
    ctx: Arc<DeliveryContext<RT>>,
    dlq: Arc<DeadLetterQueue<RT>>,
    inner: Mutex<RetryInner>,
    wakeup: Notify,
    semaphore: Arc<Semaphore>,
    ticker: Mutex<Option<Box<dyn SpawnHandle>>>,
}

impl<RT: Runtime> RetryManager<RT> {
    pub(crate) fn start(
        rt: RT,
        config: RetryConfig,
        hot: Arc<RwLock<HotConfig>>,
        ctx: Arc<DeliveryContext<RT>>,
        dlq: Arc<DeadLetterQueue<RT>>,
        supervisor: &TaskSupervisor,
    ) -> Arc<Self> {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_retries));
        let manager = Arc::new(Self {
            rt: rt.clone(),
            config,
            hot,
            ctx,
            dlq,
            inner: Mutex::new(RetryInner {
                queue: VecDeque::new(),
                consecutive_all_failed: 0,
                widen_multiplier: 1.0,
            }),
            wakeup: Notify::new(),
            semaphore,
            ticker: Mutex::new(None),
        });

        let scheduler = manager.clone();
        let (hb_tx, hb_rx) = tokio::sync::oneshot::channel::<Heartbeat>();
        let handle = rt.spawn("retry_scheduler", async move {
            let Ok(heartbeat) = hb_rx.await else {
                return;
            };
            scheduler.scheduler_loop(heartbeat).await;
        });
        let heartbeat = supervisor.register("retry_scheduler", handle);
        let ticker = heartbeat.spawn_ticker(&manager.rt, supervisor.task_timeout() / 4);
        *manager.ticker.lock() = Some(ticker);
        let _ = hb_tx.send(heartbeat);
        manager
    }

    /// Accept a failed batch. The envelope's attempt count has already been
    /// advanced by the delivery that failed.
    pub(crate) fn submit(&self, envelope: BatchEnvelope, mode: FailureMode) {
        match mode {
            FailureMode::CircuitFail => {
                let mut inner = self.inner.lock();
                inner.consecutive_all_failed += 1;
                if inner.consecutive_all_failed >= self.config.circuit_failure_threshold {
                    let widened = (inner.widen_multiplier * self.config.circuit_widen_factor)
                        .min(MAX_WIDEN_MULTIPLIER);
                    if widened > inner.widen_multiplier {
                        inner.widen_multiplier = widened;
                        log_retry_circuit_widened();
                        tracing::warn!(
                            "All sinks failing; widening retry delays by {widened:.1}x"
                        );
                    }
                }
            },
            FailureMode::PerSinkRetry => {
                self.inner.lock().consecutive_all_failed = 0;
            },
        }

        if envelope.attempt >= self.config.max_attempts {
            tracing::warn!(
                "Batch of {} records exhausted {} attempts; dead-lettering",
                envelope.len(),
                envelope.attempt
            );
            self.dlq.append(&envelope, TerminalReason::MaxAttemptsExceeded);
            return;
        }

        let (base, max_backoff) = {
            let hot = self.hot.read();
            (hot.base_backoff, hot.max_backoff)
        };
        let delay = {
            let mut rng = self.rt.rng();
            retry_delay(envelope.attempt, base, max_backoff, &mut rng)
        };
        let widened = {
            let inner = self.inner.lock();
            cmp::min(delay.mul_f64(inner.widen_multiplier), max_backoff)
        };
        let entry = RetryEntry {
            envelope,
            scheduled_at: self.rt.monotonic_now() + widened,
        };
        {
            let mut inner = self.inner.lock();
            if inner.queue.len() >= self.config.retry_queue_cap {
                // Make room by sacrificing the oldest entry.
                if let Some(oldest) = inner.queue.pop_front() {
                    self.dlq
                        .append(&oldest.envelope, TerminalReason::RetryQueueOverflow);
                }
            }
            inner.queue.push_back(entry);
            log_retry_queue_depth(inner.queue.len());
        }
        log_retry_scheduled();
        self.wakeup.notify_one();
    }

    /// A batch was fully delivered; close the breaker.
    pub(crate) fn note_success(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_all_failed = 0;
        inner.widen_multiplier = 1.0;
    }

    pub fn queue_depth(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Route everything still scheduled to the dead-letter store; used at
    /// orderly shutdown.
    pub(crate) fn drain_to_dlq(&self) {
        let entries: Vec<RetryEntry> = {
            let mut inner = self.inner.lock();
            let drained = inner.queue.drain(..).collect();
            log_retry_queue_depth(0);
            drained
        };
        for entry in entries {
            self.dlq.append(&entry.envelope, TerminalReason::ShutdownDrain);
        }
    }

    pub(crate) fn shutdown(&self) {
        if let Some(mut ticker) = self.ticker.lock().take() {
            ticker.shutdown();
        }
    }

    async fn scheduler_loop(self: Arc<Self>, heartbeat: Heartbeat) {
        use futures::FutureExt;
        loop {
            heartbeat.beat();
            let now = self.rt.monotonic_now();
            let (due, next_deadline) = {
                let mut inner = self.inner.lock();
                let mut due = Vec::new();
                let mut i = 0;
                while i < inner.queue.len() {
                    if inner.queue[i].scheduled_at <= now {
                        if let Some(entry) = inner.queue.remove(i) {
                            due.push(entry);
                        }
                    } else {
                        i += 1;
                    }
                }
                log_retry_queue_depth(inner.queue.len());
                let next_deadline = inner.queue.iter().map(|e| e.scheduled_at).min();
                (due, next_deadline)
            };

            for entry in due {
                // The semaphore bounds live executors; the scheduler parks
                // here when all permits are out, which also bounds task
                // count at max_concurrent_retries + 1.
                let permit = self
                    .semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .expect("Retry semaphore closed?");
                let this = self.clone();
                let _detached = self.rt.spawn("retry_executor", async move {
                    deliver_batch(&this.ctx, &this, entry.envelope).await;
                    drop(permit);
                });
            }

            match next_deadline {
                Some(at) => {
                    futures::select_biased! {
                        _ = self.rt.wait(at.saturating_duration_since(self.rt.monotonic_now())) => {},
                        _ = self.wakeup.notified().fuse() => {},
                    }
                },
                None => self.wakeup.notified().await,
            }
        }
    }
}

/// `min(base * 2^(attempt-1), max_delay)` with ±10% jitter.
pub(crate) fn retry_delay(
    attempt: u32,
    base: Duration,
    max_delay: Duration,
    rng: &mut impl Rng,
) -> Duration {
    let exp = attempt.saturating_sub(1).min(31);
    let backoff = base
        .checked_mul(2u32.saturating_pow(exp))
        .unwrap_or(max_delay);
    let capped = cmp::min(backoff, max_delay);
    let jitter = 0.9 + 0.2 * rng.random::<f64>();
    capped.mul_f64(jitter)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rand::{
        rngs::StdRng,
        SeedableRng,
    };

    use super::retry_delay;

    #[test]
    fn test_retry_delay_doubles_and_caps() {
        let mut rng = StdRng::seed_from_u64(3);
        let base = Duration::from_millis(500);
        let max = Duration::from_secs(60);
        for attempt in 1..=20u32 {
            let delay = retry_delay(attempt, base, max, &mut rng);
            let nominal = std::cmp::min(base * 2u32.saturating_pow(attempt - 1), max);
            assert!(delay >= nominal.mul_f64(0.9), "attempt {attempt}: {delay:?}");
            assert!(delay <= nominal.mul_f64(1.1), "attempt {attempt}: {delay:?}");
        }
    }

    #[test]
    fn test_retry_delay_is_jittered() {
        let mut rng = StdRng::seed_from_u64(9);
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(60);
        let delays: Vec<Duration> = (0..16).map(|_| retry_delay(1, base, max, &mut rng)).collect();
        assert!(delays.iter().any(|d| d != &delays[0]));
    }
}
