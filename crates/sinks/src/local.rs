//! Local append-only JSONL sink with size-based rotation.

use std::{
    path::PathBuf,
    sync::{
        atomic::{
            AtomicU32,
            Ordering,
        },
        Arc,
    },
    time::{
        Duration,
        SystemTime,
        UNIX_EPOCH,
    },
};

use async_trait::async_trait;
use common::{
    record::LogRecord,
    sink::Sink,
};
use parking_lot::Mutex;
use std::io::Write;

use crate::metrics::{
    log_local_sink_rotation,
    log_sink_records_written,
};

/// Consecutive write failures before the sink reports unhealthy; one
/// success clears it.
const UNHEALTHY_AFTER_FAILURES: u32 = 3;

struct OpenOutput {
    file: std::fs::File,
    bytes: u64,
}

pub struct LocalSink {
    name: String,
    path: PathBuf,
    rotate_bytes: u64,
    output: Mutex<Option<OpenOutput>>,
    consecutive_failures: AtomicU32,
}

impl LocalSink {
    pub fn new(name: String, path: PathBuf, rotate_bytes: u64) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(Self {
            name,
            path,
            rotate_bytes,
            output: Mutex::new(None),
            consecutive_failures: AtomicU32::new(0),
        })
    }

    fn write_batch(&self, records: &[Arc<LogRecord>]) -> anyhow::Result<()> {
        let mut output = self.output.lock();
        if output.is_none() {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            let bytes = file.metadata()?.len();
            *output = Some(OpenOutput { file, bytes });
        }
        let out = output.as_mut().expect("output was just opened");

        if out.bytes >= self.rotate_bytes {
            out.file.sync_all()?;
            let rotated = self.rotated_path();
            std::fs::rename(&self.path, &rotated)?;
            log_local_sink_rotation(&self.name);
            tracing::info!("Rotated local sink {} output to {rotated:?}", self.name);
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            *out = OpenOutput { file, bytes: 0 };
        }

        for record in records {
            let mut line = serde_json::to_vec(&record.to_json_map()?)?;
            line.push(b'\n');
            out.file.write_all(&line)?;
            out.bytes += line.len() as u64;
        }
        out.file.sync_all()?;
        Ok(())
    }

    fn rotated_path(&self) -> PathBuf {
        let ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let mut name = self.path.as_os_str().to_owned();
        name.push(format!(".{ms}"));
        PathBuf::from(name)
    }
}

#[async_trait]
impl Sink for LocalSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, records: Vec<Arc<LogRecord>>) -> anyhow::Result<()> {
        let count = records.len();
        match self.write_batch(&records) {
            Ok(()) => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
                log_sink_records_written(&self.name, count);
                tracing::debug!("Wrote {count} records to {:?}", self.path);
                Ok(())
            },
            Err(e) => {
                self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
                Err(e)
            },
        }
    }

    fn is_healthy(&self) -> bool {
        self.consecutive_failures.load(Ordering::Relaxed) < UNHEALTHY_AFTER_FAILURES
    }

    async fn close(&self, _timeout: Duration) -> anyhow::Result<()> {
        if let Some(output) = self.output.lock().take() {
            output.file.sync_all()?;
        }
        Ok(())
    }
}
