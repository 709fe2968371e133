//! Test doubles for source plumbing: a record sink that collects what it is
//! offered and a scripted container runtime.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{
            AtomicUsize,
            Ordering,
        },
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use common::{
    ingest::RecordSender,
    record::LogRecord,
    runtime::UnixTimestamp,
};
use futures::StreamExt;
use parking_lot::Mutex;

use crate::docker::{
    ContainerRuntime,
    ContainerSummary,
    LogFrame,
    LogStream,
    StdStream,
};

/// Admits everything and remembers it.
#[derive(Clone)]
pub struct CollectingRecordSender {
    records: Arc<Mutex<Vec<LogRecord>>>,
}

impl CollectingRecordSender {
    pub fn new() -> Self {
        Self {
            records: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn into_arc(self) -> Arc<dyn RecordSender> {
        Arc::new(self)
    }

    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().clone()
    }

    pub fn messages(&self) -> Vec<String> {
        self.records
            .lock()
            .iter()
            .map(|r| r.message.clone())
            .collect()
    }
}

#[async_trait]
impl RecordSender for CollectingRecordSender {
    async fn send(&self, record: LogRecord) -> bool {
        self.records.lock().push(record);
        true
    }
}

struct ContainerScript {
    summary: ContainerSummary,
    frames: Arc<Mutex<Vec<LogFrame>>>,
}

/// A container runtime whose containers and log history are driven by the
/// test. Opened log streams behave like the real thing: they deliver
/// frames after `since` and then block until more are pushed or the handle
/// is closed.
pub struct ScriptedContainerRuntime {
    containers: Mutex<Vec<ContainerScript>>,
    opened: AtomicUsize,
}

impl ScriptedContainerRuntime {
    pub fn new() -> Self {
        Self {
            containers: Mutex::new(Vec::new()),
            opened: AtomicUsize::new(0),
        }
    }

    pub fn add_container(&self, id: &str, name: &str) {
        self.containers.lock().push(ContainerScript {
            summary: ContainerSummary {
                id: id.to_owned(),
                name: name.to_owned(),
                labels: BTreeMap::new(),
            },
            frames: Arc::new(Mutex::new(Vec::new())),
        });
    }

    pub fn remove_container(&self, id: &str) {
        self.containers.lock().retain(|c| c.summary.id != id);
    }

    pub fn push_line(&self, id: &str, timestamp: UnixTimestamp, line: String) {
        let containers = self.containers.lock();
        let container = containers
            .iter()
            .find(|c| c.summary.id == id)
            .expect("push_line for unknown container");
        container.frames.lock().push(LogFrame {
            timestamp: Some(timestamp),
            stream: StdStream::Stdout,
            line,
        });
    }

    /// How many streams have been opened; each rotation opens one.
    pub fn open_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

struct ScriptStreamState {
    frames: Arc<Mutex<Vec<LogFrame>>>,
    since: UnixTimestamp,
    idx: usize,
}

#[async_trait]
impl ContainerRuntime for ScriptedContainerRuntime {
    async fn list_containers(&self) -> anyhow::Result<Vec<ContainerSummary>> {
        Ok(self
            .containers
            .lock()
            .iter()
            .map(|c| c.summary.clone())
            .collect())
    }

    async fn open_log_stream(
        &self,
        container_id: &str,
        since: UnixTimestamp,
    ) -> anyhow::Result<LogStream> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        let frames = {
            let containers = self.containers.lock();
            let container = containers
                .iter()
                .find(|c| c.summary.id == container_id)
                .ok_or_else(|| anyhow::anyhow!("No such container {container_id}"))?;
            container.frames.clone()
        };
        let state = ScriptStreamState {
            frames,
            since,
            idx: 0,
        };
        let stream = futures::stream::unfold(state, |mut state| async move {
            loop {
                let next = {
                    let frames = state.frames.lock();
                    let mut found = None;
                    while state.idx < frames.len() {
                        let frame = frames[state.idx].clone();
                        state.idx += 1;
                        if frame.timestamp.map_or(true, |ts| ts > state.since) {
                            found = Some(frame);
                            break;
                        }
                    }
                    found
                };
                if let Some(frame) = next {
                    return Some((Ok(frame), state));
                }
                // Block like a real follow-stream; the reader's watcher is
                // what ends this.
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        });
        Ok(stream.boxed())
    }
}
