//! Disk-persistent dead-letter store for batches that exhausted their
//! retries or overflowed the retry queue.
//!
//! Entries are appended one JSON object per line to rotating files named
//! `dlq-<seq>-<open-instant-ms>.jsonl`. Reprocessed entries are tombstoned
//! through a `.tomb` sidecar (one entry index per line); a file whose every
//! entry is tombstoned is deleted. Recovery discards a partial trailing
//! line. When the store itself cannot be written, batches land in a bounded
//! in-memory emergency ring instead of blocking the pipeline.

use std::{
    collections::{
        BTreeSet,
        VecDeque,
    },
    io::Write,
    path::{
        Path,
        PathBuf,
    },
    sync::Arc,
    time::Instant,
};

use common::{
    config::DlqConfig,
    errors::report_error,
    ingest::RecordSender,
    knobs::DLQ_EMERGENCY_BUFFER_CAP,
    record::{
        BatchEnvelope,
        LogRecord,
    },
    runtime::{
        Runtime,
        SpawnHandle,
        UnixTimestamp,
    },
    supervisor::{
        Heartbeat,
        TaskSupervisor,
    },
};
use parking_lot::Mutex;
use serde::{
    Deserialize,
    Serialize,
};

use crate::metrics::{
    log_dlq_appended,
    log_dlq_entries,
    log_dlq_reprocessed,
    log_dlq_write_failure,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalReason {
    MaxAttemptsExceeded,
    RetryQueueOverflow,
    ShutdownDrain,
}

impl TerminalReason {
    pub fn label(&self) -> &'static str {
        match self {
            TerminalReason::MaxAttemptsExceeded => "max_attempts_exceeded",
            TerminalReason::RetryQueueOverflow => "retry_queue_overflow",
            TerminalReason::ShutdownDrain => "shutdown_drain",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    pub records: Vec<LogRecord>,
    pub terminal_reason: TerminalReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_failure_reason: Option<String>,
    pub first_seen: UnixTimestamp,
    pub last_attempt: UnixTimestamp,
    pub attempts: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct DlqStats {
    pub entries: usize,
    pub files: usize,
    pub emergency_buffered: usize,
}

struct OpenFile {
    path: PathBuf,
    file: std::fs::File,
    opened_at_ms: u64,
    bytes: u64,
    last_fsync: Instant,
}

struct DlqInner {
    current: Option<OpenFile>,
    next_seq: u64,
    live_entries: usize,
}

pub struct DeadLetterQueue<RT: Runtime> {
    rt: RT,
    config: DlqConfig,
    inner: Mutex<DlqInner>,
    emergency: Mutex<VecDeque<DlqEntry>>,
    reinjector: Mutex<Option<Arc<dyn RecordSender>>>,
    maintenance: Mutex<Vec<Box<dyn SpawnHandle>>>,
}

impl<RT: Runtime> DeadLetterQueue<RT> {
    /// Open the store, recovering state from any files already in the
    /// directory.
    pub fn open(rt: RT, config: DlqConfig) -> anyhow::Result<Arc<Self>> {
        std::fs::create_dir_all(&config.dir)?;
        let mut next_seq = 0u64;
        let mut live_entries = 0usize;
        for (path, seq, _opened_ms) in list_dlq_files(&config.dir)? {
            next_seq = next_seq.max(seq + 1);
            let (valid, tombstoned) = recover_file(&path)?;
            live_entries += valid.saturating_sub(tombstoned);
        }
        let dlq = Arc::new(Self {
            rt,
            config,
            inner: Mutex::new(DlqInner {
                current: None,
                next_seq,
                live_entries,
            }),
            emergency: Mutex::new(VecDeque::new()),
            reinjector: Mutex::new(None),
            maintenance: Mutex::new(Vec::new()),
        });
        log_dlq_entries(live_entries);
        Ok(dlq)
    }

    /// Wire up the admission path used for replay; reprocessing is a no-op
    /// until this is set.
    pub fn set_reinjector(&self, reinjector: Arc<dyn RecordSender>) {
        *self.reinjector.lock() = Some(reinjector);
    }

    /// Start the scheduled reprocess/retention loop.
    pub fn start_maintenance(self: &Arc<Self>, supervisor: &TaskSupervisor) {
        let dlq = self.clone();
        let (hb_tx, hb_rx) = tokio::sync::oneshot::channel::<Heartbeat>();
        let handle = self.rt.spawn("dlq_maintenance", async move {
            let Ok(heartbeat) = hb_rx.await else {
                return;
            };
            loop {
                dlq.rt.wait(dlq.config.reprocess_interval()).await;
                heartbeat.beat();
                if let Err(mut e) = dlq.reprocess_now().await {
                    report_error(&mut e).await;
                }
                if let Err(mut e) = dlq.purge_expired() {
                    report_error(&mut e).await;
                }
            }
        });
        let heartbeat = supervisor.register("dlq_maintenance", handle);
        let ticker = heartbeat.spawn_ticker(&self.rt, supervisor.task_timeout() / 4);
        self.maintenance.lock().push(ticker);
        let _ = hb_tx.send(heartbeat);
    }

    /// Durably record a terminal batch. Never blocks the pipeline: on a
    /// write failure the batch goes to the in-memory emergency ring and the
    /// alarm counter is raised.
    pub fn append(&self, envelope: &BatchEnvelope, reason: TerminalReason) {
        let now = self.rt.unix_timestamp();
        let entry = DlqEntry {
            records: envelope
                .records
                .iter()
                .map(|record| (**record).clone())
                .collect(),
            terminal_reason: reason,
            first_failure_reason: envelope.first_failure_reason.clone(),
            first_seen: now,
            last_attempt: now,
            attempts: envelope.attempt,
        };
        match self.append_entry(&entry) {
            Ok(()) => log_dlq_appended(reason.label()),
            Err(e) => {
                log_dlq_write_failure();
                let mut err = e.context("Failed to write dead-letter entry");
                common::errors::report_error_sync(&mut err);
                let mut emergency = self.emergency.lock();
                if emergency.len() >= *DLQ_EMERGENCY_BUFFER_CAP {
                    emergency.pop_front();
                }
                emergency.push_back(entry);
            },
        }
    }

    fn append_entry(&self, entry: &DlqEntry) -> anyhow::Result<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let now_ms = self.rt.unix_timestamp().as_ms_since_epoch();

        let rotate = match &inner.current {
            None => true,
            Some(current) => {
                current.bytes >= self.config.file_cap_bytes
                    || now_ms.saturating_sub(current.opened_at_ms)
                        >= self.config.file_age().as_millis() as u64
            },
        };
        if rotate {
            if let Some(current) = inner.current.take() {
                current.file.sync_data()?;
            }
            let seq = inner.next_seq;
            inner.next_seq += 1;
            let path = self.config.dir.join(format!("dlq-{seq:08}-{now_ms}.jsonl"));
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)?;
            inner.current = Some(OpenFile {
                path,
                file,
                opened_at_ms: now_ms,
                bytes: 0,
                last_fsync: Instant::now(),
            });
        }

        let current = inner.current.as_mut().expect("current file was just opened");
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        current.file.write_all(&line)?;
        current.bytes += line.len() as u64;
        if current.last_fsync.elapsed() >= self.config.fsync_interval() {
            current.file.sync_data()?;
            current.last_fsync = Instant::now();
        }
        inner.live_entries += 1;
        log_dlq_entries(inner.live_entries);
        Ok(())
    }

    /// Scan files oldest-first and reinject every non-tombstoned entry with
    /// a fresh attempt count. Entries the pipeline cannot accept right now
    /// stay for the next cycle.
    pub async fn reprocess_now(&self) -> anyhow::Result<usize> {
        let Some(reinjector) = self.reinjector.lock().clone() else {
            return Ok(0);
        };
        let current_path = self
            .inner
            .lock()
            .current
            .as_ref()
            .map(|current| current.path.clone());

        let mut reprocessed = 0usize;
        'files: for (path, _seq, _opened_ms) in list_dlq_files(&self.config.dir)? {
            let entries = read_entries(&path)?;
            let mut tombstones = read_tombstones(&tomb_path(&path))?;
            for (idx, entry) in entries.iter().enumerate() {
                if tombstones.contains(&idx) {
                    continue;
                }
                let mut all_admitted = true;
                for record in entry.records.clone() {
                    if !reinjector.reinject(record).await {
                        all_admitted = false;
                        break;
                    }
                }
                if !all_admitted {
                    // Backpressure from admission; stop and let the next
                    // cycle pick up from here.
                    break 'files;
                }
                append_tombstone(&tomb_path(&path), idx)?;
                tombstones.insert(idx);
                reprocessed += 1;
                let mut inner = self.inner.lock();
                inner.live_entries = inner.live_entries.saturating_sub(1);
                log_dlq_entries(inner.live_entries);
            }
            let fully_tombstoned = tombstones.len() >= entries.len();
            if fully_tombstoned && Some(&path) != current_path.as_ref() {
                std::fs::remove_file(&path)?;
                let _ = std::fs::remove_file(tomb_path(&path));
            }
        }
        if reprocessed > 0 {
            log_dlq_reprocessed(reprocessed);
            tracing::info!("Reprocessed {reprocessed} dead-letter entries");
        }
        Ok(reprocessed)
    }

    /// Delete files older than the retention window unconditionally, then
    /// recount live entries from disk.
    pub fn purge_expired(&self) -> anyhow::Result<()> {
        let now_ms = self.rt.unix_timestamp().as_ms_since_epoch();
        let retention_ms = self.config.retention().as_millis() as u64;
        let current_path = self
            .inner
            .lock()
            .current
            .as_ref()
            .map(|current| current.path.clone());

        let mut purged_any = false;
        for (path, _seq, opened_ms) in list_dlq_files(&self.config.dir)? {
            if now_ms.saturating_sub(opened_ms) <= retention_ms {
                continue;
            }
            if Some(&path) == current_path.as_ref() {
                // Rotation will retire it; don't delete the open handle's
                // file out from under it.
                continue;
            }
            tracing::info!("Deleting expired dead-letter file {path:?}");
            std::fs::remove_file(&path)?;
            let _ = std::fs::remove_file(tomb_path(&path));
            purged_any = true;
        }
        if purged_any {
            let mut live = 0usize;
            for (path, _, _) in list_dlq_files(&self.config.dir)? {
                let entries = read_entries(&path)?.len();
                let tombstoned = read_tombstones(&tomb_path(&path))?.len();
                live += entries.saturating_sub(tombstoned);
            }
            let mut inner = self.inner.lock();
            inner.live_entries = live;
            log_dlq_entries(live);
        }
        Ok(())
    }

    pub fn entry_count(&self) -> usize {
        self.inner.lock().live_entries
    }

    pub fn emergency_len(&self) -> usize {
        self.emergency.lock().len()
    }

    pub fn stats(&self) -> anyhow::Result<DlqStats> {
        Ok(DlqStats {
            entries: self.entry_count(),
            files: list_dlq_files(&self.config.dir)?.len(),
            emergency_buffered: self.emergency_len(),
        })
    }

    /// Fsync the open file; used at orderly shutdown.
    pub fn flush(&self) -> anyhow::Result<()> {
        if let Some(current) = self.inner.lock().current.as_mut() {
            current.file.sync_data()?;
        }
        Ok(())
    }

    pub fn shutdown(&self) {
        for mut ticker in self.maintenance.lock().drain(..) {
            ticker.shutdown();
        }
    }
}

fn tomb_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tomb");
    PathBuf::from(name)
}

/// All dlq files in the directory, oldest sequence first.
fn list_dlq_files(dir: &Path) -> anyhow::Result<Vec<(PathBuf, u64, u64)>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if let Some((seq, opened_ms)) = parse_dlq_filename(name) {
            files.push((entry.path(), seq, opened_ms));
        }
    }
    files.sort_by_key(|(_, seq, _)| *seq);
    Ok(files)
}

fn parse_dlq_filename(name: &str) -> Option<(u64, u64)> {
    let rest = name.strip_prefix("dlq-")?.strip_suffix(".jsonl")?;
    let (seq, opened_ms) = rest.split_once('-')?;
    Some((seq.parse().ok()?, opened_ms.parse().ok()?))
}

/// Validate a file's entries, truncating a partial or corrupt tail up to
/// the last valid record boundary. Returns (valid entries, tombstoned).
fn recover_file(path: &Path) -> anyhow::Result<(usize, usize)> {
    let bytes = std::fs::read(path)?;
    let mut valid = 0usize;
    let mut valid_end = 0usize;
    let mut cursor = 0usize;
    while cursor < bytes.len() {
        let Some(newline) = bytes[cursor..].iter().position(|b| *b == b'\n') else {
            break;
        };
        let line = &bytes[cursor..cursor + newline];
        if serde_json::from_slice::<DlqEntry>(line).is_err() {
            break;
        }
        cursor += newline + 1;
        valid += 1;
        valid_end = cursor;
    }
    if valid_end < bytes.len() {
        tracing::warn!(
            "Discarding {} bytes of partial trailing data in {path:?}",
            bytes.len() - valid_end
        );
        let file = std::fs::OpenOptions::new().write(true).open(path)?;
        file.set_len(valid_end as u64)?;
        file.sync_data()?;
    }
    let tombstoned = read_tombstones(&tomb_path(path))?.len();
    Ok((valid, tombstoned))
}

fn read_entries(path: &Path) -> anyhow::Result<Vec<DlqEntry>> {
    let bytes = std::fs::read(path)?;
    let mut entries = Vec::new();
    for line in bytes.split(|b| *b == b'\n') {
        if line.is_empty() {
            continue;
        }
        match serde_json::from_slice::<DlqEntry>(line) {
            Ok(entry) => entries.push(entry),
            // Partial tail not yet recovered; skip it.
            Err(_) => break,
        }
    }
    Ok(entries)
}

fn read_tombstones(path: &Path) -> anyhow::Result<BTreeSet<usize>> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Ok(contents
            .lines()
            .filter_map(|line| line.trim().parse().ok())
            .collect()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeSet::new()),
        Err(e) => Err(e.into()),
    }
}

fn append_tombstone(path: &Path, idx: usize) -> anyhow::Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(file, "{idx}")?;
    file.sync_data()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use common::{
        config::DlqConfig,
        ingest::RecordSender,
        record::{
            BatchEnvelope,
            LogRecord,
            SourceKind,
        },
        runtime::UnixTimestamp,
    };
    use parking_lot::Mutex;
    use runtime::testing::test_runtime;
    use tempfile::TempDir;

    use super::{
        DeadLetterQueue,
        TerminalReason,
    };

    fn config(dir: &TempDir) -> DlqConfig {
        DlqConfig {
            dir: dir.path().to_path_buf(),
            file_cap_bytes: 16 * 1024 * 1024,
            file_age_secs: 3_600,
            retention_secs: 7 * 24 * 3_600,
            reprocess_interval_secs: 300,
            fsync_interval_ms: 0,
        }
    }

    fn envelope(messages: &[&str], attempt: u32) -> BatchEnvelope {
        let records = messages
            .iter()
            .map(|message| {
                Arc::new(LogRecord::new(
                    *message,
                    UnixTimestamp::from_millis(1_700_000_000_000),
                    SourceKind::File,
                    "/var/log/app.log",
                ))
            })
            .collect();
        let mut envelope = BatchEnvelope::new(records);
        envelope.attempt = attempt;
        envelope
    }

    #[derive(Clone, Default)]
    struct RecordingReinjector {
        records: Arc<Mutex<Vec<LogRecord>>>,
        reject: Arc<Mutex<bool>>,
    }

    #[async_trait]
    impl RecordSender for RecordingReinjector {
        async fn send(&self, record: LogRecord) -> bool {
            if *self.reject.lock() {
                return false;
            }
            self.records.lock().push(record);
            true
        }
    }

    #[tokio::test]
    async fn test_append_and_recover() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let rt = test_runtime();
        {
            let dlq = DeadLetterQueue::open(rt.clone(), config(&dir))?;
            dlq.append(&envelope(&["a", "b"], 5), TerminalReason::MaxAttemptsExceeded);
            dlq.append(&envelope(&["c"], 5), TerminalReason::RetryQueueOverflow);
            assert_eq!(dlq.entry_count(), 2);
            dlq.flush()?;
        }
        let dlq = DeadLetterQueue::open(rt, config(&dir))?;
        assert_eq!(dlq.entry_count(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_partial_trailing_record_discarded() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let rt = test_runtime();
        {
            let dlq = DeadLetterQueue::open(rt.clone(), config(&dir))?;
            dlq.append(&envelope(&["kept"], 1), TerminalReason::MaxAttemptsExceeded);
            dlq.flush()?;
        }
        // Simulate a crash mid-append.
        let file = super::list_dlq_files(dir.path())?.remove(0).0;
        let mut contents = std::fs::read(&file)?;
        contents.extend_from_slice(b"{\"records\": [");
        std::fs::write(&file, &contents)?;

        let dlq = DeadLetterQueue::open(rt, config(&dir))?;
        assert_eq!(dlq.entry_count(), 1);
        let recovered = std::fs::read(&file)?;
        assert!(recovered.ends_with(b"\n"));
        Ok(())
    }

    #[tokio::test]
    async fn test_file_rotation_by_size() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let rt = test_runtime();
        let mut cfg = config(&dir);
        cfg.file_cap_bytes = 64;
        let dlq = DeadLetterQueue::open(rt, cfg)?;
        for i in 0..4 {
            dlq.append(
                &envelope(&[&format!("record-{i}")], 3),
                TerminalReason::MaxAttemptsExceeded,
            );
        }
        assert!(dlq.stats()?.files >= 2);
        assert_eq!(dlq.entry_count(), 4);
        Ok(())
    }

    #[tokio::test]
    async fn test_reprocess_tombstones_entries() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let rt = test_runtime();
        let dlq = DeadLetterQueue::open(rt, config(&dir))?;
        dlq.append(&envelope(&["x", "y"], 5), TerminalReason::MaxAttemptsExceeded);

        let reinjector = RecordingReinjector::default();
        dlq.set_reinjector(Arc::new(reinjector.clone()));
        let reprocessed = dlq.reprocess_now().await?;
        assert_eq!(reprocessed, 1);
        assert_eq!(dlq.entry_count(), 0);
        let messages: Vec<String> = reinjector
            .records
            .lock()
            .iter()
            .map(|r| r.message.clone())
            .collect();
        assert_eq!(messages, vec!["x", "y"]);

        // A second pass finds nothing new.
        assert_eq!(dlq.reprocess_now().await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_reprocess_backs_off_when_not_admitted() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let rt = test_runtime();
        let dlq = DeadLetterQueue::open(rt, config(&dir))?;
        dlq.append(&envelope(&["held"], 5), TerminalReason::MaxAttemptsExceeded);

        let reinjector = RecordingReinjector::default();
        *reinjector.reject.lock() = true;
        dlq.set_reinjector(Arc::new(reinjector.clone()));
        assert_eq!(dlq.reprocess_now().await?, 0);
        assert_eq!(dlq.entry_count(), 1);

        *reinjector.reject.lock() = false;
        assert_eq!(dlq.reprocess_now().await?, 1);
        assert_eq!(dlq.entry_count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_retention_purges_old_files() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let rt = test_runtime();
        // A file whose open instant is far in the past.
        std::fs::write(dir.path().join("dlq-00000000-1000.jsonl"), b"")?;

        let dlq = DeadLetterQueue::open(rt, config(&dir))?;
        dlq.purge_expired()?;
        assert_eq!(dlq.stats()?.files, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_write_failure_uses_emergency_buffer() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let rt = test_runtime();
        let dlq = DeadLetterQueue::open(rt, config(&dir))?;
        // Remove the directory out from under the store.
        std::fs::remove_dir_all(dir.path())?;
        dlq.append(&envelope(&["lost?"], 2), TerminalReason::RetryQueueOverflow);
        assert_eq!(dlq.emergency_len(), 1);
        Ok(())
    }
}
