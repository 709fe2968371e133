//! The in-process streaming pipeline: admission preprocessors in front of a
//! bounded queue, a worker pool that assembles batches and fans them out to
//! every registered sink, a bounded retry queue with exponential backoff,
//! and a disk dead-letter store for terminal failures.

pub mod admission;
mod dispatch;
pub mod dlq;
mod metrics;
pub mod retry;
pub mod stats;

use std::{
    sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use common::{
    bounded_queue::{
        new_bounded_queue,
        QueueReceiver,
        QueueSender,
    },
    config::{
        DispatcherConfig,
        LogshipConfig,
        TimestampConfig,
    },
    ingest::RecordSender,
    knobs::{
        QUEUE_PRESSURE_SHED_THRESHOLD,
        QUEUE_PRESSURE_THROTTLE_THRESHOLD,
        QUEUE_PRESSURE_WARN_THRESHOLD,
        QUEUE_THROTTLE_SEND_TIMEOUT_FACTOR,
    },
    record::{
        LogRecord,
        SourceKind,
    },
    runtime::{
        Runtime,
        SpawnHandle,
    },
    sink::Sink,
    supervisor::{
        Heartbeat,
        TaskSupervisor,
    },
};
use parking_lot::{
    Mutex,
    RwLock,
};

use crate::{
    admission::{
        normalize_timestamp,
        DedupCache,
        TimestampOutcome,
    },
    dispatch::{
        close_sinks,
        DeliveryContext,
        DispatchWorker,
        SinkHandle,
    },
    dlq::DeadLetterQueue,
    retry::RetryManager,
    stats::{
        PipelineStats,
        StatsSnapshot,
    },
};

/// The hot-reloadable slice of the configuration, snapshotted by workers
/// and the admission path on each use.
#[derive(Debug, Clone)]
pub struct HotConfig {
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub sink_send_timeout: Duration,
    pub send_timeout: Duration,
    pub dedup_ttl: Duration,
    pub timestamp: TimestampConfig,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl From<&LogshipConfig> for HotConfig {
    fn from(config: &LogshipConfig) -> Self {
        Self {
            batch_size: config.dispatcher.batch_size,
            batch_timeout: config.dispatcher.batch_timeout(),
            sink_send_timeout: config.dispatcher.sink_send_timeout(),
            send_timeout: config.dispatcher.send_timeout(),
            dedup_ttl: config.dedup.ttl(),
            timestamp: config.timestamp.clone(),
            base_backoff: config.retry.base_backoff(),
            max_backoff: config.retry.max_backoff(),
        }
    }
}

/// Admission front end handed to sources. Runs dedup and timestamp
/// discipline inline (no I/O) and applies the backpressure policy before
/// the bounded queue.
pub struct PipelineHandle<RT: Runtime> {
    rt: RT,
    dispatcher_config: DispatcherConfig,
    sender: Mutex<Option<QueueSender<Arc<LogRecord>>>>,
    dedup: Arc<DedupCache>,
    hot: Arc<RwLock<HotConfig>>,
    stats: Arc<PipelineStats>,
    closed: AtomicBool,
    pressure_warned: AtomicBool,
}

impl<RT: Runtime> PipelineHandle<RT> {
    /// Stop admitting records and let the queue drain: workers exit once
    /// the queue is empty and the last sender is gone.
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.sender.lock().take();
    }

    async fn admit(&self, mut record: LogRecord, replay: bool) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        let Some(sender) = self.sender.lock().clone() else {
            return false;
        };
        let now = self.rt.unix_timestamp();
        let (dedup_ttl, timestamp_config, base_send_timeout) = {
            let hot = self.hot.read();
            (hot.dedup_ttl, hot.timestamp.clone(), hot.send_timeout)
        };

        let utilization = sender.utilization();
        crate::metrics::log_queue_utilization(utilization);
        if utilization >= *QUEUE_PRESSURE_WARN_THRESHOLD {
            if !self.pressure_warned.swap(true, Ordering::Relaxed) {
                tracing::warn!(
                    "Dispatch queue at {:.0}% of capacity; admission under pressure",
                    utilization * 100.0
                );
            }
        } else {
            self.pressure_warned.store(false, Ordering::Relaxed);
        }
        // Shedding: containers are the lowest-priority source kind.
        if utilization >= *QUEUE_PRESSURE_SHED_THRESHOLD
            && record.source_kind == SourceKind::Container
        {
            self.stats.note_shed(record.source_kind.label());
            return false;
        }

        let fingerprint = record.fingerprint();
        if self
            .dedup
            .is_recent_duplicate(fingerprint, now, dedup_ttl)
        {
            self.stats.note_duplicate();
            // A replayed duplicate was already delivered once; that counts
            // as handled.
            return replay;
        }
        match normalize_timestamp(&mut record, now, &timestamp_config) {
            TimestampOutcome::Admitted => {},
            TimestampOutcome::AdmittedClamped => self.stats.note_timestamp_clamped(),
            TimestampOutcome::Dropped => {
                self.stats.note_timestamp_dropped();
                return replay;
            },
        }

        let source_kind = record.source_kind;
        let drop_on_full = match source_kind {
            SourceKind::File => self.dispatcher_config.file_drop_on_full,
            SourceKind::Container => self.dispatcher_config.container_drop_on_full,
        };
        let record = Arc::new(record);
        let admitted = if drop_on_full {
            sender.try_send(record).is_ok()
        } else {
            let mut send_timeout = base_send_timeout;
            if utilization >= *QUEUE_PRESSURE_THROTTLE_THRESHOLD {
                send_timeout *= *QUEUE_THROTTLE_SEND_TIMEOUT_FACTOR;
            }
            sender.send_timeout(record, send_timeout).await.is_ok()
        };
        if admitted {
            self.dedup.note(fingerprint, now);
        } else {
            self.stats.note_queue_full_drop(source_kind.label());
        }
        admitted
    }
}

#[async_trait]
impl<RT: Runtime> RecordSender for PipelineHandle<RT> {
    async fn send(&self, record: LogRecord) -> bool {
        self.admit(record, false).await
    }

    async fn reinject(&self, record: LogRecord) -> bool {
        self.admit(record, true).await
    }
}

pub struct Pipeline<RT: Runtime> {
    rt: RT,
    config: Mutex<LogshipConfig>,
    hot: Arc<RwLock<HotConfig>>,
    handle: Arc<PipelineHandle<RT>>,
    ctx: Arc<DeliveryContext<RT>>,
    retry: Arc<RetryManager<RT>>,
    dlq: Arc<DeadLetterQueue<RT>>,
    dedup: Arc<DedupCache>,
    supervisor: TaskSupervisor,
    queue_probe: QueueReceiver<Arc<LogRecord>>,
    worker_tickers: Mutex<Vec<Box<dyn SpawnHandle>>>,
    worker_count: usize,
}

impl<RT: Runtime> Pipeline<RT> {
    pub fn start(
        rt: RT,
        config: LogshipConfig,
        sinks: Vec<Arc<dyn Sink>>,
        supervisor: TaskSupervisor,
    ) -> anyhow::Result<Arc<Self>> {
        config.validate()?;
        let hot = Arc::new(RwLock::new(HotConfig::from(&config)));
        let (sender, receiver) = new_bounded_queue(config.dispatcher.queue_cap);
        let dedup = Arc::new(DedupCache::new(config.dedup.cap));
        let sink_handles: Vec<SinkHandle> = sinks
            .into_iter()
            .map(|sink| SinkHandle {
                name: sink.name().to_owned(),
                sink,
            })
            .collect();
        let stats = Arc::new(PipelineStats::new(
            sink_handles.iter().map(|handle| handle.name.clone()),
        ));
        let dlq = DeadLetterQueue::open(rt.clone(), config.dlq.clone())?;
        let ctx = Arc::new(DeliveryContext {
            rt: rt.clone(),
            sinks: sink_handles,
            hot: hot.clone(),
            stats: stats.clone(),
        });
        let retry = RetryManager::start(
            rt.clone(),
            config.retry.clone(),
            hot.clone(),
            ctx.clone(),
            dlq.clone(),
            &supervisor,
        );

        let mut worker_tickers = Vec::with_capacity(config.dispatcher.worker_count);
        for idx in 0..config.dispatcher.worker_count {
            let worker = DispatchWorker {
                rt: rt.clone(),
                receiver: receiver.clone(),
                ctx: ctx.clone(),
                retry: retry.clone(),
            };
            let (hb_tx, hb_rx) = tokio::sync::oneshot::channel::<Heartbeat>();
            let handle = rt.spawn("dispatch_worker", async move {
                let Ok(heartbeat) = hb_rx.await else {
                    return;
                };
                worker.run(heartbeat).await;
            });
            let heartbeat = supervisor.register(format!("dispatch_worker:{idx}"), handle);
            worker_tickers.push(heartbeat.spawn_ticker(&rt, supervisor.task_timeout() / 4));
            let _ = hb_tx.send(heartbeat);
        }

        let handle = Arc::new(PipelineHandle {
            rt: rt.clone(),
            dispatcher_config: config.dispatcher.clone(),
            sender: Mutex::new(Some(sender)),
            dedup: dedup.clone(),
            hot: hot.clone(),
            stats,
            closed: AtomicBool::new(false),
            pressure_warned: AtomicBool::new(false),
        });
        dlq.set_reinjector(handle.clone());
        dlq.start_maintenance(&supervisor);

        tracing::info!(
            "Started pipeline: {} workers, queue cap {}, {} sink(s)",
            config.dispatcher.worker_count,
            config.dispatcher.queue_cap,
            ctx.sinks.len()
        );
        Ok(Arc::new(Self {
            rt,
            worker_count: config.dispatcher.worker_count,
            config: Mutex::new(config),
            hot,
            handle,
            ctx,
            retry,
            dlq,
            dedup,
            supervisor,
            queue_probe: receiver,
            worker_tickers: Mutex::new(worker_tickers),
        }))
    }

    /// The admission front end for sources.
    pub fn handle(&self) -> Arc<PipelineHandle<RT>> {
        self.handle.clone()
    }

    pub fn record_sender(&self) -> Arc<dyn RecordSender> {
        self.handle.clone()
    }

    pub fn dlq(&self) -> Arc<DeadLetterQueue<RT>> {
        self.dlq.clone()
    }

    /// Current pipeline state for the admin surface.
    pub fn stats(&self) -> StatsSnapshot {
        let queue_cap = self.config.lock().dispatcher.queue_cap;
        let queue_len = self.queue_probe.len();
        let stats = &self.ctx.stats;
        StatsSnapshot {
            queue_len,
            queue_cap,
            queue_utilization: queue_len as f64 / queue_cap as f64,
            processed_records: stats.processed(),
            failed_per_sink: stats.failed_per_sink(),
            retry_queue_depth: self.retry.queue_depth(),
            dedup_entries: self.dedup.len(),
            duplicates_suppressed: stats.duplicates(),
            timestamp_clamped: stats.clamped(),
            timestamp_dropped: stats.timestamp_drops(),
            queue_full_drops: stats.queue_full_drops(),
            shed_records: stats.shed(),
            dlq: self.dlq.stats().unwrap_or(crate::dlq::DlqStats {
                entries: self.dlq.entry_count(),
                files: 0,
                emergency_buffered: self.dlq.emergency_len(),
            }),
            live_tasks: self.supervisor.live_tasks(),
            failed_tasks: self.supervisor.failed_tasks(),
        }
    }

    /// Apply a validated new configuration. Only the hot-reloadable subset
    /// may change; the first structural difference is rejected with a
    /// reason.
    pub fn apply_reload(&self, new_config: LogshipConfig) -> anyhow::Result<()> {
        let mut current = self.config.lock();
        current.ensure_reloadable(&new_config)?;
        *self.hot.write() = HotConfig::from(&new_config);
        *current = new_config;
        tracing::info!("Applied hot configuration reload");
        Ok(())
    }

    /// Orderly shutdown: stop admission, drain the queue up to the drain
    /// timeout, dead-letter everything still scheduled for retry, and close
    /// the sinks.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down pipeline");
        let (drain_timeout, sink_close_timeout, grace) = {
            let config = self.config.lock();
            (
                config.dispatcher.drain_timeout(),
                config.dispatcher.sink_close_timeout(),
                config.dispatcher.batch_timeout() + config.dispatcher.sink_send_timeout(),
            )
        };
        self.handle.close();

        let deadline = self.rt.monotonic_now() + drain_timeout;
        while self.queue_probe.len() > 0 && self.rt.monotonic_now() < deadline {
            self.rt.wait(Duration::from_millis(50)).await;
        }
        if self.queue_probe.len() > 0 {
            tracing::warn!(
                "Drain timeout elapsed with {} records still queued; accepting at-least-once \
                 duplication on next start",
                self.queue_probe.len()
            );
        } else {
            // Let in-flight batches clear their fan-out.
            let remaining = deadline.saturating_duration_since(self.rt.monotonic_now());
            self.rt.wait(remaining.min(grace)).await;
        }

        self.retry.drain_to_dlq();
        self.retry.shutdown();
        close_sinks(&self.ctx, sink_close_timeout).await;
        if let Err(e) = self.dlq.flush() {
            tracing::warn!("Failed to flush dead-letter store at shutdown: {e:#}");
        }
        self.dlq.shutdown();

        for mut ticker in self.worker_tickers.lock().drain(..) {
            ticker.shutdown();
        }
        for idx in 0..self.worker_count {
            self.supervisor.cancel(&format!("dispatch_worker:{idx}"));
        }
        self.supervisor.cancel("retry_scheduler");
        self.supervisor.cancel("dlq_maintenance");
        tracing::info!("Pipeline shut down");
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::BTreeSet,
        time::Duration,
    };

    use common::{
        config::{
            LogshipConfig,
            SupervisorConfig,
        },
        ingest::RecordSender,
        record::{
            FieldValue,
            LogRecord,
            SourceKind,
        },
        runtime::Runtime,
        sink::Sink,
        supervisor::TaskSupervisor,
    };
    use runtime::testing::{
        test_runtime,
        TestRuntime,
    };
    use sinks::mock::MockSink;
    use tempfile::TempDir;

    use super::Pipeline;
    use crate::admission::ORIGINAL_TIMESTAMP_FIELD;

    fn test_config(dir: &TempDir) -> LogshipConfig {
        let mut config = LogshipConfig::default();
        config.dispatcher.queue_cap = 1_000;
        config.dispatcher.worker_count = 2;
        config.dispatcher.batch_size = 10;
        config.dispatcher.batch_timeout_ms = 100;
        config.dispatcher.sink_send_timeout_ms = 1_000;
        config.dispatcher.send_timeout_ms = 100;
        config.dispatcher.drain_timeout_ms = 2_000;
        config.retry.max_attempts = 3;
        config.retry.base_backoff_ms = 100;
        config.retry.max_backoff_ms = 1_000;
        config.retry.retry_queue_cap = 64;
        config.dlq.dir = dir.path().join("dlq");
        config.dlq.fsync_interval_ms = 0;
        config
    }

    fn supervisor(rt: &TestRuntime) -> TaskSupervisor {
        TaskSupervisor::new(
            rt,
            &SupervisorConfig {
                task_timeout_ms: 60_000,
                cleanup_interval_ms: 1_000,
            },
        )
    }

    fn record(rt: &TestRuntime, message: impl Into<String>) -> LogRecord {
        LogRecord::new(
            message,
            rt.unix_timestamp(),
            SourceKind::File,
            "/var/log/app.log",
        )
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_secs(30)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_sink_receives_every_record() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let rt = test_runtime();
        let sink_a = MockSink::new("a");
        let sink_b = MockSink::new("b");
        let sink_c = MockSink::new("c");
        let pipeline = Pipeline::start(
            rt.clone(),
            test_config(&dir),
            vec![sink_a.clone(), sink_b.clone(), sink_c.clone()],
            supervisor(&rt),
        )?;
        let handle = pipeline.handle();

        let expected: BTreeSet<String> = (0..200).map(|i| format!("record-{i}")).collect();
        for message in &expected {
            assert!(handle.send(record(&rt, message.as_str())).await);
        }
        settle().await;

        for sink in [&sink_a, &sink_b, &sink_c] {
            let got: BTreeSet<String> = sink.messages().into_iter().collect();
            assert_eq!(got, expected, "sink {} missed records", sink.name());
        }
        let stats = pipeline.stats();
        assert_eq!(stats.processed_records, 200);
        assert_eq!(stats.failed_per_sink.values().sum::<u64>(), 0);
        assert_eq!(stats.dlq.entries, 0);
        assert_eq!(stats.retry_queue_depth, 0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_dead_sink_is_isolated_and_dead_letters() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let rt = test_runtime();
        let sink_a = MockSink::new("a");
        let sink_b = MockSink::new("b");
        let sink_c = MockSink::new("c");
        sink_b.always_fail();
        let pipeline = Pipeline::start(
            rt.clone(),
            test_config(&dir),
            vec![sink_a.clone(), sink_b.clone(), sink_c.clone()],
            supervisor(&rt),
        )?;
        let handle = pipeline.handle();

        for i in 0..100 {
            assert!(handle.send(record(&rt, format!("record-{i}"))).await);
        }
        settle().await;

        // The healthy sinks saw everything, exactly once.
        assert_eq!(sink_a.records().len(), 100);
        assert_eq!(sink_c.records().len(), 100);
        let batches = sink_a.batches().len() as u32;
        // Retries targeted only the failed sink: the healthy sinks were
        // never sent a batch twice.
        assert_eq!(sink_a.send_attempts(), batches);
        assert!(sink_b.send_attempts() > batches);

        // Every record the dead sink never took ended up dead-lettered
        // after max_attempts.
        let stats = pipeline.stats();
        assert_eq!(stats.dlq.entries, sink_a.batches().len());
        assert_eq!(stats.retry_queue_depth, 0);
        assert!(stats.failed_per_sink["b"] >= 100);
        assert_eq!(stats.failed_per_sink["a"], 0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_recovers_via_retry() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let rt = test_runtime();
        let sink = MockSink::new("flaky");
        sink.fail_times(1);
        let pipeline = Pipeline::start(
            rt.clone(),
            test_config(&dir),
            vec![sink.clone()],
            supervisor(&rt),
        )?;
        let handle = pipeline.handle();

        for i in 0..10 {
            assert!(handle.send(record(&rt, format!("record-{i}"))).await);
        }
        settle().await;

        assert_eq!(sink.records().len(), 10);
        let stats = pipeline.stats();
        assert_eq!(stats.processed_records, 10);
        assert_eq!(stats.dlq.entries, 0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_full_drops_are_observed() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let rt = test_runtime();
        let mut config = test_config(&dir);
        config.dispatcher.queue_cap = 10;
        config.dispatcher.worker_count = 1;
        config.dispatcher.file_drop_on_full = true;
        let sink = MockSink::new("slow");
        sink.set_send_delay(Duration::from_secs(5));
        config.dispatcher.sink_send_timeout_ms = 60_000;
        let pipeline = Pipeline::start(
            rt.clone(),
            config,
            vec![sink.clone()],
            supervisor(&rt),
        )?;
        let handle = pipeline.handle();

        let mut admitted = 0u64;
        for i in 0..100 {
            if handle.send(record(&rt, format!("record-{i}"))).await {
                admitted += 1;
            }
        }
        tokio::time::sleep(Duration::from_secs(600)).await;

        let stats = pipeline.stats();
        assert!(stats.queue_full_drops > 0);
        assert_eq!(stats.processed_records + stats.queue_full_drops, 100);
        assert_eq!(stats.processed_records, admitted);
        assert_eq!(sink.records().len() as u64, admitted);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_suppressed_within_ttl() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let rt = test_runtime();
        let sink = MockSink::new("only");
        let pipeline = Pipeline::start(
            rt.clone(),
            test_config(&dir),
            vec![sink.clone()],
            supervisor(&rt),
        )?;
        let handle = pipeline.handle();

        assert!(handle.send(record(&rt, "same line")).await);
        assert!(!handle.send(record(&rt, "same line")).await);
        settle().await;

        assert_eq!(sink.records().len(), 1);
        assert_eq!(pipeline.stats().duplicates_suppressed, 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_old_timestamp_clamped_end_to_end() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let rt = test_runtime();
        let sink = MockSink::new("only");
        let pipeline = Pipeline::start(
            rt.clone(),
            test_config(&dir),
            vec![sink.clone()],
            supervisor(&rt),
        )?;
        let handle = pipeline.handle();

        let now = rt.unix_timestamp();
        let mut old = record(&rt, "ancient");
        old.timestamp = now - Duration::from_secs(48 * 3_600);
        assert!(handle.send(old).await);
        settle().await;

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert!(records[0].timestamp >= now - Duration::from_secs(3_600));
        assert!(matches!(
            records[0].fields.get(ORIGINAL_TIMESTAMP_FIELD),
            Some(FieldValue::Int(_))
        ));
        assert_eq!(pipeline.stats().timestamp_clamped, 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drains_queue_and_dead_letters_retries() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let rt = test_runtime();
        let good = MockSink::new("good");
        let bad = MockSink::new("bad");
        bad.always_fail();
        let mut config = test_config(&dir);
        // Long enough that retries are still queued at shutdown.
        config.retry.base_backoff_ms = 60_000;
        config.retry.max_backoff_ms = 600_000;
        let pipeline = Pipeline::start(
            rt.clone(),
            config,
            vec![good.clone(), bad.clone()],
            supervisor(&rt),
        )?;
        let handle = pipeline.handle();

        for i in 0..20 {
            assert!(handle.send(record(&rt, format!("record-{i}"))).await);
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
        pipeline.shutdown().await;

        assert_eq!(good.records().len(), 20);
        assert!(good.was_closed());
        assert!(bad.was_closed());
        // Batches awaiting retry against the dead sink were dead-lettered
        // rather than lost.
        assert!(pipeline.stats().dlq.entries > 0);
        // Admission is refused after shutdown.
        assert!(!handle.send(record(&rt, "late")).await);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_hot_reload_subset() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let rt = test_runtime();
        let sink = MockSink::new("only");
        let pipeline = Pipeline::start(
            rt.clone(),
            test_config(&dir),
            vec![sink.clone()],
            supervisor(&rt),
        )?;

        let mut reloadable = test_config(&dir);
        reloadable.dispatcher.batch_timeout_ms = 50;
        reloadable.timestamp.max_past_age_secs = 60;
        pipeline.apply_reload(reloadable)?;

        let mut structural = test_config(&dir);
        structural.dispatcher.queue_cap = 5_000;
        let err = pipeline.apply_reload(structural).unwrap_err();
        assert!(err.to_string().contains("queue_cap"), "{err}");
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_container_records_shed_under_pressure() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let rt = test_runtime();
        let mut config = test_config(&dir);
        config.dispatcher.queue_cap = 10;
        config.dispatcher.worker_count = 1;
        config.dispatcher.file_drop_on_full = true;
        config.dispatcher.sink_send_timeout_ms = 60_000;
        let sink = MockSink::new("slow");
        sink.set_send_delay(Duration::from_secs(30));
        let pipeline = Pipeline::start(
            rt.clone(),
            config,
            vec![sink.clone()],
            supervisor(&rt),
        )?;
        let handle = pipeline.handle();

        // Saturate the queue with file records.
        for i in 0..50 {
            let _ = handle.send(record(&rt, format!("filler-{i}"))).await;
        }
        let container_record = LogRecord::new(
            "from container",
            rt.unix_timestamp(),
            SourceKind::Container,
            "c1",
        );
        assert!(!handle.send(container_record).await);
        assert!(pipeline.stats().shed_records >= 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_dlq_reprocess_feeds_admission() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let rt = test_runtime();
        let sink = MockSink::new("recovering");
        sink.always_fail();
        let mut config = test_config(&dir);
        config.dedup.ttl_ms = 1;
        let pipeline = Pipeline::start(
            rt.clone(),
            config,
            vec![sink.clone()],
            supervisor(&rt),
        )?;
        let handle = pipeline.handle();

        for i in 0..10 {
            assert!(handle.send(record(&rt, format!("record-{i}"))).await);
        }
        settle().await;
        assert!(pipeline.stats().dlq.entries > 0);
        assert!(sink.records().is_empty());

        // The sink comes back; scheduled reprocessing replays the dead
        // letters through admission.
        sink.succeed();
        pipeline.dlq().reprocess_now().await?;
        settle().await;
        assert_eq!(sink.records().len(), 10);
        assert_eq!(pipeline.stats().dlq.entries, 0);
        Ok(())
    }
}
