//! Tailers over container runtime log streams.
//!
//! A runtime log stream is a blocking, unbounded read that cannot be
//! reliably cancelled from the reading side. Instead of relying on
//! cooperative cancellation, every stream is short-lived: the tailer opens
//! it with `since` just past the last record it has seen, and a watcher
//! task closes the handle when the rotation deadline elapses. The reader
//! treats the resulting end-of-stream as normal and loops. This bounds the
//! number of blocked readers to one per container, forever.

use std::{
    collections::{
        BTreeMap,
        HashMap,
    },
    sync::Arc,
    time::Duration,
};

use common::{
    backoff::Backoff,
    config::ContainerConfig,
    errors::report_error,
    ingest::RecordSender,
    knobs::CONTAINER_POLL_INTERVAL_MILLIS,
    record::{
        LogRecord,
        SourceKind,
    },
    runtime::{
        shutdown_and_join,
        Runtime,
        SpawnHandle,
        UnixTimestamp,
    },
    supervisor::{
        Heartbeat,
        TaskSupervisor,
    },
};
use futures::{
    channel::oneshot,
    FutureExt,
    StreamExt,
};
use parking_lot::Mutex;

use crate::{
    docker::{
        ContainerRuntime,
        ContainerSummary,
    },
    metrics::{
        log_container_record_emitted,
        log_container_rotation,
        log_container_stream_error,
        log_record_not_admitted,
    },
};

const STREAM_ERROR_INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const STREAM_ERROR_MAX_BACKOFF: Duration = Duration::from_secs(30);

struct ContainerEntry {
    task_id: String,
    ticker: Box<dyn SpawnHandle>,
    last_record_timestamp: Arc<Mutex<UnixTimestamp>>,
}

/// Discovers containers and runs one rotating stream reader per container.
/// All per-container state lives in a flat table keyed by container id.
pub struct ContainerTailer<RT: Runtime> {
    rt: RT,
    config: ContainerConfig,
    client: Arc<dyn ContainerRuntime>,
    sender: Arc<dyn RecordSender>,
    supervisor: TaskSupervisor,
    containers: Arc<Mutex<HashMap<String, ContainerEntry>>>,
    poll_ticker: Mutex<Option<Box<dyn SpawnHandle>>>,
}

impl<RT: Runtime> ContainerTailer<RT> {
    pub fn start(
        rt: RT,
        config: ContainerConfig,
        client: Arc<dyn ContainerRuntime>,
        sender: Arc<dyn RecordSender>,
        supervisor: TaskSupervisor,
    ) -> Arc<Self> {
        let tailer = Arc::new(Self {
            rt: rt.clone(),
            config,
            client,
            sender,
            supervisor,
            containers: Arc::new(Mutex::new(HashMap::new())),
            poll_ticker: Mutex::new(None),
        });

        let poll_tailer = tailer.clone();
        let (hb_tx, hb_rx) = tokio::sync::oneshot::channel::<Heartbeat>();
        let handle = rt.spawn("container_poll", async move {
            let Ok(heartbeat) = hb_rx.await else {
                return;
            };
            poll_tailer.poll_loop(heartbeat).await;
        });
        let heartbeat = tailer.supervisor.register("container_poll", handle);
        let ticker = heartbeat.spawn_ticker(&tailer.rt, tailer.config.heartbeat_interval());
        *tailer.poll_ticker.lock() = Some(ticker);
        let _ = hb_tx.send(heartbeat);
        tracing::info!("Started container tailer");
        tailer
    }

    async fn poll_loop(&self, heartbeat: Heartbeat) {
        loop {
            self.rt.wait(*CONTAINER_POLL_INTERVAL_MILLIS).await;
            heartbeat.beat();
            match self.client.list_containers().await {
                Err(e) => {
                    let mut err = e.context("Failed to list containers");
                    report_error(&mut err).await;
                },
                Ok(containers) => self.reconcile(containers),
            }
        }
    }

    /// Start tailers for newly seen containers and tear down state for
    /// containers that disappeared or restarted under a new identity.
    fn reconcile(&self, current: Vec<ContainerSummary>) {
        let mut entries = self.containers.lock();
        let current_ids: HashMap<&str, &ContainerSummary> =
            current.iter().map(|c| (c.id.as_str(), c)).collect();

        let gone: Vec<String> = entries
            .keys()
            .filter(|id| !current_ids.contains_key(id.as_str()))
            .cloned()
            .collect();
        for id in gone {
            if let Some(mut entry) = entries.remove(&id) {
                tracing::info!("Container {id} is gone; stopping its tailer");
                entry.ticker.shutdown();
                self.supervisor.cancel(&entry.task_id);
            }
        }

        for summary in &current {
            if entries.contains_key(&summary.id) {
                continue;
            }
            let entry = self.spawn_container_task(summary);
            entries.insert(summary.id.clone(), entry);
        }
    }

    fn spawn_container_task(&self, summary: &ContainerSummary) -> ContainerEntry {
        tracing::info!(
            "Tailing container {} ({})",
            summary.name,
            &summary.id[..summary.id.len().min(12)]
        );
        // A fresh instance starts at its own start time; history belongs to
        // the previous identity.
        let last_record_timestamp = Arc::new(Mutex::new(self.rt.unix_timestamp()));
        let mut labels = self.config.labels.clone();
        labels.extend(summary.labels.clone());
        labels.insert("container_name".to_owned(), summary.name.clone());

        let task_id = format!("container:{}", summary.id);
        let task = TailContainerTask {
            rt: self.rt.clone(),
            config: self.config.clone(),
            client: self.client.clone(),
            container_id: summary.id.clone(),
            labels,
            sender: self.sender.clone(),
            last_record_timestamp: last_record_timestamp.clone(),
        };
        let (hb_tx, hb_rx) = tokio::sync::oneshot::channel::<Heartbeat>();
        let handle = self.rt.spawn("container_tailer", async move {
            let Ok(heartbeat) = hb_rx.await else {
                return;
            };
            task.run(heartbeat).await;
        });
        let heartbeat = self.supervisor.register(task_id.clone(), handle);
        let ticker = heartbeat.spawn_ticker(&self.rt, self.config.heartbeat_interval());
        let _ = hb_tx.send(heartbeat);
        ContainerEntry {
            task_id,
            ticker,
            last_record_timestamp,
        }
    }

    pub fn container_count(&self) -> usize {
        self.containers.lock().len()
    }

    pub fn last_record_timestamp(&self, container_id: &str) -> Option<UnixTimestamp> {
        self.containers
            .lock()
            .get(container_id)
            .map(|entry| *entry.last_record_timestamp.lock())
    }

    pub fn shutdown(&self) {
        if let Some(mut ticker) = self.poll_ticker.lock().take() {
            ticker.shutdown();
        }
        self.supervisor.cancel("container_poll");
        let entries: Vec<(String, ContainerEntry)> = self.containers.lock().drain().collect();
        for (_, mut entry) in entries {
            entry.ticker.shutdown();
            self.supervisor.cancel(&entry.task_id);
        }
    }
}

struct TailContainerTask<RT: Runtime> {
    rt: RT,
    config: ContainerConfig,
    client: Arc<dyn ContainerRuntime>,
    container_id: String,
    labels: BTreeMap<String, String>,
    sender: Arc<dyn RecordSender>,
    last_record_timestamp: Arc<Mutex<UnixTimestamp>>,
}

impl<RT: Runtime> TailContainerTask<RT> {
    /// One rotation per iteration: open a stream just past the last seen
    /// record, read until the watcher closes it, wait for the watcher, and
    /// go again.
    async fn run(self, heartbeat: Heartbeat) {
        let mut backoff = Backoff::new(STREAM_ERROR_INITIAL_BACKOFF, STREAM_ERROR_MAX_BACKOFF);
        loop {
            let since = *self.last_record_timestamp.lock() + Duration::from_nanos(1);
            let stream = match self.client.open_log_stream(&self.container_id, since).await {
                Ok(stream) => stream,
                Err(e) => {
                    log_container_stream_error();
                    let mut err = e.context(format!(
                        "Failed to open log stream for container {}",
                        self.container_id
                    ));
                    report_error(&mut err).await;
                    let delay = backoff.fail(&mut self.rt.rng());
                    self.rt.wait(delay).await;
                    continue;
                },
            };
            let opened_at = self.rt.monotonic_now();
            let (mut stream, abort_handle) = futures::stream::abortable(stream);

            // The watcher's only job is to close the stream handle when the
            // rotation deadline elapses; the reader below tolerates the
            // stream ending under it at any point.
            let (reader_done_tx, reader_done_rx) = oneshot::channel::<()>();
            let watcher_rt = self.rt.clone();
            let rotation_interval = self.config.rotation_interval();
            let watcher = self.rt.spawn("container_stream_watcher", async move {
                let mut reader_done = reader_done_rx.fuse();
                futures::select_biased! {
                    _ = watcher_rt.wait(rotation_interval) => abort_handle.abort(),
                    _ = reader_done => {},
                }
            });

            let mut stream_failed = false;
            while let Some(next) = stream.next().await {
                match next {
                    Ok(frame) => {
                        let timestamp = frame
                            .timestamp
                            .unwrap_or_else(|| self.rt.unix_timestamp());
                        {
                            let mut last = self.last_record_timestamp.lock();
                            if timestamp > *last {
                                *last = timestamp;
                            }
                        }
                        let mut record = LogRecord::new(
                            frame.line,
                            timestamp,
                            SourceKind::Container,
                            self.container_id.clone(),
                        );
                        record.labels = self.labels.clone();
                        record
                            .labels
                            .insert("stream".to_owned(), frame.stream.label().to_owned());
                        if self.sender.send(record).await {
                            log_container_record_emitted();
                        } else {
                            log_record_not_admitted("container");
                        }
                    },
                    Err(e) => {
                        stream_failed = true;
                        log_container_stream_error();
                        let mut err = e.context(format!(
                            "Error reading log stream for container {}",
                            self.container_id
                        ));
                        report_error(&mut err).await;
                        break;
                    },
                }
            }

            // Reader finished; let the watcher go and wait for it so
            // watcher tasks never accumulate across rotations.
            drop(reader_done_tx);
            let _ = shutdown_and_join(watcher).await;
            log_container_rotation();
            heartbeat.beat();

            let ran_full_window = opened_at.elapsed() >= rotation_interval / 2;
            if stream_failed || !ran_full_window {
                // EOF right after opening usually means the container is
                // stopping; back off instead of spinning on reopen.
                let delay = backoff.fail(&mut self.rt.rng());
                self.rt.wait(delay).await;
            } else {
                backoff.reset();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::Arc,
        time::Duration,
    };

    use common::{
        config::{
            ContainerConfig,
            SupervisorConfig,
        },
        runtime::Runtime,
        supervisor::TaskSupervisor,
    };
    use runtime::testing::test_runtime;

    use super::ContainerTailer;
    use crate::testing::{
        CollectingRecordSender,
        ScriptedContainerRuntime,
    };

    fn config() -> ContainerConfig {
        ContainerConfig {
            enabled: true,
            rotation_interval_ms: 2_000,
            heartbeat_interval_ms: 500,
            labels: Default::default(),
        }
    }

    fn supervisor_config() -> SupervisorConfig {
        SupervisorConfig {
            task_timeout_ms: 60_000,
            cleanup_interval_ms: 1_000,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rotation_loses_no_records() -> anyhow::Result<()> {
        let rt = test_runtime();
        let supervisor = TaskSupervisor::new(&rt, &supervisor_config());
        let sender = CollectingRecordSender::new();
        let script = Arc::new(ScriptedContainerRuntime::new());
        script.add_container("c1", "api");

        let tailer = ContainerTailer::start(
            rt.clone(),
            config(),
            script.clone(),
            sender.clone().into_arc(),
            supervisor,
        );

        // Emit sequence-numbered lines across many rotation windows. The
        // scripted runtime filters on `since`, so timestamps must lie after
        // the tailer's start instant.
        let base = rt.unix_timestamp() + Duration::from_secs(1);
        for seq in 0..100u64 {
            script.push_line("c1", base + Duration::from_millis(seq * 100), format!("seq={seq}"));
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        tokio::time::sleep(Duration::from_secs(5)).await;

        let messages = sender.messages();
        let expected: Vec<String> = (0..100).map(|seq| format!("seq={seq}")).collect();
        assert_eq!(messages, expected);

        // ~10 seconds of stream time at a 2 second rotation interval.
        let rotations = script.open_count();
        assert!(
            (4..=20).contains(&rotations),
            "expected a handful of rotations, saw {rotations}"
        );

        // Only the poll loop, one reader, and one watcher run per
        // container; state stays bounded.
        assert_eq!(tailer.container_count(), 1);
        let last = tailer.last_record_timestamp("c1").unwrap();
        assert_eq!(last, base + Duration::from_millis(99 * 100));
        tailer.shutdown();
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_gone_container_is_torn_down() -> anyhow::Result<()> {
        let rt = test_runtime();
        let supervisor = TaskSupervisor::new(&rt, &supervisor_config());
        let sender = CollectingRecordSender::new();
        let script = Arc::new(ScriptedContainerRuntime::new());
        script.add_container("c1", "api");

        let tailer = ContainerTailer::start(
            rt,
            config(),
            script.clone(),
            sender.clone().into_arc(),
            supervisor.clone(),
        );
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(tailer.container_count(), 1);

        script.remove_container("c1");
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(tailer.container_count(), 0);
        tailer.shutdown();
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_container_labels_applied() -> anyhow::Result<()> {
        let rt = test_runtime();
        let supervisor = TaskSupervisor::new(&rt, &supervisor_config());
        let sender = CollectingRecordSender::new();
        let script = Arc::new(ScriptedContainerRuntime::new());
        script.add_container("c1", "api");

        let mut cfg = config();
        cfg.labels.insert("env".to_owned(), "prod".to_owned());
        let tailer = ContainerTailer::start(
            rt.clone(),
            cfg,
            script.clone(),
            sender.clone().into_arc(),
            supervisor,
        );
        tokio::time::sleep(Duration::from_secs(3)).await;
        script.push_line(
            "c1",
            rt.unix_timestamp() + Duration::from_secs(1),
            "hello".to_owned(),
        );
        tokio::time::sleep(Duration::from_secs(3)).await;

        let records = sender.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].labels.get("env").map(String::as_str), Some("prod"));
        assert_eq!(
            records[0].labels.get("container_name").map(String::as_str),
            Some("api")
        );
        assert_eq!(records[0].labels.get("stream").map(String::as_str), Some("stdout"));
        assert_eq!(records[0].source_id, "c1");
        tailer.shutdown();
        Ok(())
    }
}
