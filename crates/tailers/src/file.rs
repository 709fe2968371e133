//! Tailers over growing local files with persistent read offsets.
//!
//! Paths are enumerated explicitly; there is no discovery. Each tracked
//! path gets one supervised task that follows the per-file state machine:
//! reopen on rotation (identity change), reset on truncation, demote to
//! gone when the path disappears or repeatedly fails to open. Offsets only
//! advance past complete lines; a partial trailing line is held in memory
//! until its newline arrives.

use std::{
    collections::{
        BTreeMap,
        HashMap,
    },
    path::{
        Path,
        PathBuf,
    },
    sync::Arc,
    time::Duration,
};

use common::{
    backoff::Backoff,
    config::FilePolicyConfig,
    errors::report_error,
    ingest::RecordSender,
    knobs::FILE_POLL_INTERVAL_MILLIS,
    record::{
        LogRecord,
        SourceKind,
    },
    runtime::{
        Runtime,
        SpawnHandle,
    },
    supervisor::{
        Heartbeat,
        TaskSupervisor,
    },
};
use parking_lot::Mutex;
use tokio::io::{
    AsyncBufReadExt,
    AsyncSeekExt,
    BufReader,
    SeekFrom,
};

use crate::{
    metrics::{
        log_file_gone,
        log_file_read_error,
        log_file_record_emitted,
        log_file_rotation,
        log_file_truncation,
        log_record_not_admitted,
    },
    offset_store::{
        FileIdentity,
        FileSourceState,
        OffsetStore,
    },
};

const READ_ERROR_INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const READ_ERROR_MAX_BACKOFF: Duration = Duration::from_secs(10);

struct ActiveFile {
    task_id: String,
    ticker: Box<dyn SpawnHandle>,
}

/// Manages one tailer task per tracked path and the offset flush loop.
pub struct FileTailerSet<RT: Runtime> {
    rt: RT,
    config: FilePolicyConfig,
    sender: Arc<dyn RecordSender>,
    supervisor: TaskSupervisor,
    offsets: Arc<OffsetStore>,
    active: Arc<Mutex<HashMap<PathBuf, ActiveFile>>>,
    flush_ticker: Mutex<Option<Box<dyn SpawnHandle>>>,
}

impl<RT: Runtime> FileTailerSet<RT> {
    pub fn new(
        rt: RT,
        config: FilePolicyConfig,
        sender: Arc<dyn RecordSender>,
        supervisor: TaskSupervisor,
    ) -> anyhow::Result<Self> {
        let offsets = Arc::new(OffsetStore::load(&config.offsets_path)?);
        let set = Self {
            rt,
            config,
            sender,
            supervisor,
            offsets,
            active: Arc::new(Mutex::new(HashMap::new())),
            flush_ticker: Mutex::new(None),
        };
        set.start_flush_loop();
        Ok(set)
    }

    fn start_flush_loop(&self) {
        let offsets = self.offsets.clone();
        let config = self.config.clone();
        let rt = self.rt.clone();
        let (hb_tx, hb_rx) = tokio::sync::oneshot::channel::<Heartbeat>();
        let handle = self.rt.spawn("offset_flush", async move {
            let Ok(heartbeat) = hb_rx.await else {
                return;
            };
            loop {
                rt.wait(config.flush_interval()).await;
                heartbeat.beat();
                offsets.purge_tombstones(rt.unix_timestamp(), config.tombstone_retention());
                if let Err(mut e) = offsets.flush() {
                    report_error(&mut e).await;
                }
            }
        });
        let heartbeat = self.supervisor.register("offset_flush", handle);
        let ticker = heartbeat.spawn_ticker(&self.rt, self.supervisor.task_timeout() / 4);
        *self.flush_ticker.lock() = Some(ticker);
        let _ = hb_tx.send(heartbeat);
    }

    /// Begin tailing `path`. Idempotent: tracking an already tracked path
    /// is a no-op.
    pub fn track(&self, path: impl AsRef<Path>, labels: BTreeMap<String, String>) {
        let path = path.as_ref().to_path_buf();
        {
            let active = self.active.lock();
            if active.contains_key(&path) {
                return;
            }
        }
        let source_id = path.to_string_lossy().into_owned();
        self.offsets.resurrect(&source_id);
        let task_id = format!("file_tailer:{source_id}");

        let (hb_tx, hb_rx) = tokio::sync::oneshot::channel::<Heartbeat>();
        let tail = TailFileTask {
            rt: self.rt.clone(),
            config: self.config.clone(),
            path: path.clone(),
            source_id,
            labels,
            sender: self.sender.clone(),
            offsets: self.offsets.clone(),
            active: self.active.clone(),
            supervisor: self.supervisor.clone(),
            task_id: task_id.clone(),
        };
        let handle = self.rt.spawn("file_tailer", async move {
            let Ok(heartbeat) = hb_rx.await else {
                return;
            };
            tail.run(heartbeat).await;
        });
        let heartbeat = self.supervisor.register(task_id.clone(), handle);
        let ticker = heartbeat.spawn_ticker(&self.rt, self.supervisor.task_timeout() / 4);
        self.active
            .lock()
            .insert(path.clone(), ActiveFile { task_id, ticker });
        let _ = hb_tx.send(heartbeat);
        tracing::info!("Tracking file {path:?}");
    }

    /// Stop tailing `path` and flush its offset. The offset entry is
    /// tombstoned so a re-added path resumes where it left off.
    pub async fn untrack(&self, path: impl AsRef<Path>) {
        let path = path.as_ref().to_path_buf();
        let Some(mut entry) = self.active.lock().remove(&path) else {
            return;
        };
        entry.ticker.shutdown();
        self.supervisor.cancel(&entry.task_id);
        let source_id = path.to_string_lossy().into_owned();
        self.offsets.tombstone(&source_id, self.rt.unix_timestamp());
        if let Err(mut e) = self.offsets.flush() {
            report_error(&mut e).await;
        }
        tracing::info!("Untracked file {path:?}");
    }

    /// Consistent view of all persisted offsets, for diagnostics.
    pub fn snapshot(&self) -> BTreeMap<String, FileSourceState> {
        self.offsets.snapshot()
    }

    pub fn tracked_paths(&self) -> Vec<PathBuf> {
        self.active.lock().keys().cloned().collect()
    }

    /// Orderly shutdown: stop every tailer, stop the flush loop, and flush
    /// offsets one last time.
    pub async fn shutdown(&self) {
        let entries: Vec<(PathBuf, ActiveFile)> = self.active.lock().drain().collect();
        for (_, mut entry) in entries {
            entry.ticker.shutdown();
            self.supervisor.cancel(&entry.task_id);
        }
        if let Some(mut ticker) = self.flush_ticker.lock().take() {
            ticker.shutdown();
        }
        self.supervisor.cancel("offset_flush");
        if let Err(mut e) = self.offsets.flush() {
            report_error(&mut e).await;
        }
    }
}

struct TailFileTask<RT: Runtime> {
    rt: RT,
    config: FilePolicyConfig,
    path: PathBuf,
    source_id: String,
    labels: BTreeMap<String, String>,
    sender: Arc<dyn RecordSender>,
    offsets: Arc<OffsetStore>,
    active: Arc<Mutex<HashMap<PathBuf, ActiveFile>>>,
    supervisor: TaskSupervisor,
    task_id: String,
}

impl<RT: Runtime> TailFileTask<RT> {
    async fn run(self, heartbeat: Heartbeat) {
        let mut open_failures = 0u32;
        let mut backoff = Backoff::new(READ_ERROR_INITIAL_BACKOFF, READ_ERROR_MAX_BACKOFF);
        'open: loop {
            heartbeat.beat();
            let file = match tokio::fs::File::open(&self.path).await {
                Ok(f) => {
                    open_failures = 0;
                    f
                },
                Err(e) => {
                    open_failures += 1;
                    if open_failures >= self.config.open_failures_before_gone {
                        tracing::warn!(
                            "Demoting {:?} after {open_failures} consecutive open failures: {e}",
                            self.path
                        );
                        break 'open;
                    }
                    let delay = backoff.fail(&mut self.rt.rng());
                    self.rt.wait(delay).await;
                    continue 'open;
                },
            };
            let meta = match file.metadata().await {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!("Failed to stat open handle for {:?}: {e}", self.path);
                    let delay = backoff.fail(&mut self.rt.rng());
                    self.rt.wait(delay).await;
                    continue 'open;
                },
            };
            let identity = file_identity(&meta);
            let mut offset = self.initial_offset(identity, meta.len());

            let mut reader = BufReader::new(file);
            if offset > 0 {
                if let Err(e) = reader.seek(SeekFrom::Start(offset)).await {
                    tracing::warn!("Failed to seek {:?} to {offset}: {e}", self.path);
                    let delay = backoff.fail(&mut self.rt.rng());
                    self.rt.wait(delay).await;
                    continue 'open;
                }
            }

            // Complete lines only; a partial trailing line stays here until
            // its newline arrives.
            let mut pending: Vec<u8> = Vec::new();
            let mut buf: Vec<u8> = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf).await {
                    Err(e) => {
                        log_file_read_error();
                        let mut err = anyhow::Error::from(e)
                            .context(format!("Transient read error on {:?}", self.path));
                        report_error(&mut err).await;
                        let delay = backoff.fail(&mut self.rt.rng());
                        self.rt.wait(delay).await;
                    },
                    Ok(0) => match self.at_eof(identity, offset).await {
                        EofAction::Poll => {
                            self.rt.wait(*FILE_POLL_INTERVAL_MILLIS).await;
                        },
                        EofAction::Reopen => continue 'open,
                        EofAction::Gone => break 'open,
                    },
                    Ok(_) => {
                        backoff.reset();
                        pending.extend_from_slice(&buf);
                        if pending.last() != Some(&b'\n') {
                            continue;
                        }
                        let line_len = pending.len() as u64;
                        pending.pop();
                        if pending.last() == Some(&b'\r') {
                            pending.pop();
                        }
                        let message = String::from_utf8_lossy(&pending).into_owned();
                        pending.clear();
                        offset += line_len;

                        heartbeat.beat();
                        let mut record = LogRecord::new(
                            message,
                            self.rt.unix_timestamp(),
                            SourceKind::File,
                            self.source_id.clone(),
                        );
                        record.labels = self.labels.clone();
                        if self.sender.send(record).await {
                            log_file_record_emitted();
                        } else {
                            log_record_not_admitted("file");
                        }
                        let dirty = self.offsets.update(
                            &self.source_id,
                            FileSourceState {
                                path: self.path.clone(),
                                identity,
                                offset,
                                last_read: self.rt.unix_timestamp(),
                                tombstone_at: None,
                            },
                        );
                        if dirty >= self.config.dirty_cap {
                            if let Err(mut e) = self.offsets.flush() {
                                report_error(&mut e).await;
                            }
                        }
                    },
                }
            }
        }

        // Gone: the state stays persisted, the file leaves the active set.
        log_file_gone();
        if let Err(mut e) = self.offsets.flush() {
            report_error(&mut e).await;
        }
        if let Some(mut entry) = self.active.lock().remove(&self.path) {
            entry.ticker.shutdown();
        }
        self.supervisor.deregister(&self.task_id);
    }

    fn initial_offset(&self, identity: FileIdentity, len: u64) -> u64 {
        match self.offsets.get(&self.source_id) {
            Some(state) if state.identity == identity => {
                if state.offset > len {
                    log_file_truncation();
                    tracing::info!(
                        "File {:?} shrank below the persisted offset; restarting from 0",
                        self.path
                    );
                    0
                } else {
                    state.offset
                }
            },
            // The persisted identity was superseded by a new file at the
            // same path.
            Some(_) => 0,
            None => {
                if self.config.start_from_end {
                    len
                } else {
                    0
                }
            },
        }
    }

    async fn at_eof(&self, identity: FileIdentity, offset: u64) -> EofAction {
        match tokio::fs::metadata(&self.path).await {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("File {:?} removed; stopping tailer", self.path);
                EofAction::Gone
            },
            Err(e) => {
                tracing::warn!("Failed to stat {:?}: {e}", self.path);
                EofAction::Poll
            },
            Ok(path_meta) => {
                let path_identity = file_identity(&path_meta);
                if path_identity != identity {
                    // The open handle was drained to EOF above, so nothing
                    // from the old identity is lost.
                    log_file_rotation();
                    tracing::info!("File {:?} rotated; reopening", self.path);
                    EofAction::Reopen
                } else if path_meta.len() < offset {
                    log_file_truncation();
                    tracing::info!("File {:?} truncated; restarting from 0", self.path);
                    self.offsets.update(
                        &self.source_id,
                        FileSourceState {
                            path: self.path.clone(),
                            identity,
                            offset: 0,
                            last_read: self.rt.unix_timestamp(),
                            tombstone_at: None,
                        },
                    );
                    EofAction::Reopen
                } else {
                    EofAction::Poll
                }
            },
        }
    }
}

enum EofAction {
    Poll,
    Reopen,
    Gone,
}

#[cfg(unix)]
fn file_identity(meta: &std::fs::Metadata) -> FileIdentity {
    use std::os::unix::fs::MetadataExt;
    FileIdentity {
        device: meta.dev(),
        inode: meta.ino(),
    }
}

#[cfg(not(unix))]
fn file_identity(meta: &std::fs::Metadata) -> FileIdentity {
    FileIdentity {
        device: 0,
        inode: meta.len(),
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::BTreeMap,
        io::Write,
        time::Duration,
    };

    use common::{
        config::{
            FilePolicyConfig,
            SupervisorConfig,
        },
        supervisor::TaskSupervisor,
    };
    use runtime::testing::test_runtime;
    use tempfile::TempDir;

    use super::FileTailerSet;
    use crate::testing::CollectingRecordSender;

    fn config(dir: &TempDir) -> FilePolicyConfig {
        FilePolicyConfig {
            offsets_path: dir.path().join("offsets.json"),
            flush_interval_ms: 200,
            dirty_cap: 2,
            start_from_end: false,
            open_failures_before_gone: 3,
            tombstone_retention_secs: 3600,
        }
    }

    fn supervisor_config() -> SupervisorConfig {
        SupervisorConfig {
            task_timeout_ms: 60_000,
            cleanup_interval_ms: 1_000,
        }
    }

    async fn settle() {
        // Polling happens in virtual time, but the file I/O itself runs on
        // the blocking pool, which the paused clock can race past. Step
        // through many small advances so in-flight reads complete between
        // them.
        for _ in 0..100 {
            tokio::task::yield_now().await;
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_tail_appended_lines() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let rt = test_runtime();
        let supervisor = TaskSupervisor::new(&rt, &supervisor_config());
        let sender = CollectingRecordSender::new();

        let log_path = dir.path().join("app.log");
        std::fs::write(&log_path, "one\ntwo\n")?;

        let set = FileTailerSet::new(rt, config(&dir), sender.clone().into_arc(), supervisor)?;
        set.track(&log_path, BTreeMap::from([("service".into(), "api".into())]));
        settle().await;
        assert_eq!(sender.messages(), vec!["one", "two"]);

        let mut file = std::fs::OpenOptions::new().append(true).open(&log_path)?;
        file.write_all(b"three\n")?;
        settle().await;
        assert_eq!(sender.messages(), vec!["one", "two", "three"]);
        let record = &sender.records()[0];
        assert_eq!(record.labels.get("service").map(String::as_str), Some("api"));
        set.shutdown().await;
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_line_held_until_newline() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let rt = test_runtime();
        let supervisor = TaskSupervisor::new(&rt, &supervisor_config());
        let sender = CollectingRecordSender::new();

        let log_path = dir.path().join("app.log");
        std::fs::write(&log_path, "complete\npar")?;

        let set = FileTailerSet::new(rt, config(&dir), sender.clone().into_arc(), supervisor)?;
        set.track(&log_path, BTreeMap::new());
        settle().await;
        assert_eq!(sender.messages(), vec!["complete"]);

        let mut file = std::fs::OpenOptions::new().append(true).open(&log_path)?;
        file.write_all(b"tial\n")?;
        settle().await;
        assert_eq!(sender.messages(), vec!["complete", "partial"]);
        set.shutdown().await;
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_resumes_from_persisted_offset() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let rt = test_runtime();
        let log_path = dir.path().join("app.log");
        std::fs::write(&log_path, "a\nb\n")?;

        {
            let supervisor = TaskSupervisor::new(&rt, &supervisor_config());
            let sender = CollectingRecordSender::new();
            let set = FileTailerSet::new(
                rt.clone(),
                config(&dir),
                sender.clone().into_arc(),
                supervisor,
            )?;
            set.track(&log_path, BTreeMap::new());
            settle().await;
            assert_eq!(sender.messages(), vec!["a", "b"]);
            set.shutdown().await;
        }

        let mut file = std::fs::OpenOptions::new().append(true).open(&log_path)?;
        file.write_all(b"c\n")?;

        // Restarted process: nothing before the persisted offset is
        // re-emitted.
        let supervisor = TaskSupervisor::new(&rt, &supervisor_config());
        let sender = CollectingRecordSender::new();
        let set = FileTailerSet::new(rt, config(&dir), sender.clone().into_arc(), supervisor)?;
        set.track(&log_path, BTreeMap::new());
        settle().await;
        assert_eq!(sender.messages(), vec!["c"]);
        set.shutdown().await;
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_truncation_resets_offset() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let rt = test_runtime();
        let supervisor = TaskSupervisor::new(&rt, &supervisor_config());
        let sender = CollectingRecordSender::new();

        let log_path = dir.path().join("app.log");
        std::fs::write(&log_path, "old line one\nold line two\n")?;

        let set = FileTailerSet::new(rt, config(&dir), sender.clone().into_arc(), supervisor)?;
        set.track(&log_path, BTreeMap::new());
        settle().await;
        assert_eq!(sender.records().len(), 2);

        std::fs::write(&log_path, "new\n")?;
        settle().await;
        assert_eq!(
            sender.messages(),
            vec!["old line one", "old line two", "new"]
        );
        set.shutdown().await;
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_rotation_reopens_new_identity() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let rt = test_runtime();
        let supervisor = TaskSupervisor::new(&rt, &supervisor_config());
        let sender = CollectingRecordSender::new();

        let log_path = dir.path().join("app.log");
        std::fs::write(&log_path, "before rotate\n")?;

        let set = FileTailerSet::new(rt, config(&dir), sender.clone().into_arc(), supervisor)?;
        set.track(&log_path, BTreeMap::new());
        settle().await;

        std::fs::rename(&log_path, dir.path().join("app.log.1"))?;
        std::fs::write(&log_path, "after rotate\n")?;
        settle().await;
        assert_eq!(sender.messages(), vec!["before rotate", "after rotate"]);
        set.shutdown().await;
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_untrack_tombstones_offset() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let rt = test_runtime();
        let supervisor = TaskSupervisor::new(&rt, &supervisor_config());
        let sender = CollectingRecordSender::new();

        let log_path = dir.path().join("app.log");
        std::fs::write(&log_path, "line\n")?;

        let set = FileTailerSet::new(rt, config(&dir), sender.clone().into_arc(), supervisor)?;
        set.track(&log_path, BTreeMap::new());
        settle().await;
        set.untrack(&log_path).await;

        let snapshot = set.snapshot();
        let entry = snapshot
            .get(&log_path.to_string_lossy().into_owned())
            .unwrap();
        assert!(entry.tombstone_at.is_some());
        assert_eq!(entry.offset, 5);
        set.shutdown().await;
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_from_end_skips_history() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let rt = test_runtime();
        let supervisor = TaskSupervisor::new(&rt, &supervisor_config());
        let sender = CollectingRecordSender::new();

        let log_path = dir.path().join("app.log");
        std::fs::write(&log_path, "history\n")?;

        let mut cfg = config(&dir);
        cfg.start_from_end = true;
        let set = FileTailerSet::new(rt, cfg, sender.clone().into_arc(), supervisor)?;
        set.track(&log_path, BTreeMap::new());
        settle().await;
        assert!(sender.messages().is_empty());

        let mut file = std::fs::OpenOptions::new().append(true).open(&log_path)?;
        file.write_all(b"fresh\n")?;
        settle().await;
        assert_eq!(sender.messages(), vec!["fresh"]);
        set.shutdown().await;
        Ok(())
    }
}
