//! MockSink captures every batch it is sent and can be scripted to fail,
//! stall, or report unhealthy, for dispatcher and retry tests.

use std::{
    sync::{
        atomic::{
            AtomicBool,
            AtomicU32,
            Ordering,
        },
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use common::{
    record::LogRecord,
    sink::Sink,
};
use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureScript {
    None,
    FailTimes(u32),
    AlwaysFail,
}

pub struct MockSink {
    name: String,
    batches: Mutex<Vec<Vec<Arc<LogRecord>>>>,
    script: Mutex<FailureScript>,
    send_delay: Mutex<Option<Duration>>,
    healthy: AtomicBool,
    send_attempts: AtomicU32,
    closed: AtomicBool,
}

impl MockSink {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            batches: Mutex::new(Vec::new()),
            script: Mutex::new(FailureScript::None),
            send_delay: Mutex::new(None),
            healthy: AtomicBool::new(true),
            send_attempts: AtomicU32::new(0),
            closed: AtomicBool::new(false),
        })
    }

    pub fn always_fail(&self) {
        *self.script.lock() = FailureScript::AlwaysFail;
    }

    pub fn fail_times(&self, times: u32) {
        *self.script.lock() = FailureScript::FailTimes(times);
    }

    pub fn succeed(&self) {
        *self.script.lock() = FailureScript::None;
    }

    pub fn set_send_delay(&self, delay: Duration) {
        *self.send_delay.lock() = Some(delay);
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn batches(&self) -> Vec<Vec<Arc<LogRecord>>> {
        self.batches.lock().clone()
    }

    pub fn records(&self) -> Vec<Arc<LogRecord>> {
        self.batches.lock().iter().flatten().cloned().collect()
    }

    pub fn messages(&self) -> Vec<String> {
        self.batches
            .lock()
            .iter()
            .flatten()
            .map(|record| record.message.clone())
            .collect()
    }

    pub fn send_attempts(&self) -> u32 {
        self.send_attempts.load(Ordering::SeqCst)
    }

    pub fn was_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Sink for MockSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, records: Vec<Arc<LogRecord>>) -> anyhow::Result<()> {
        self.send_attempts.fetch_add(1, Ordering::SeqCst);
        let delay = *self.send_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let fail = {
            let mut script = self.script.lock();
            match *script {
                FailureScript::None => false,
                FailureScript::AlwaysFail => true,
                FailureScript::FailTimes(0) => {
                    *script = FailureScript::None;
                    false
                },
                FailureScript::FailTimes(n) => {
                    *script = FailureScript::FailTimes(n - 1);
                    true
                },
            }
        };
        if fail {
            anyhow::bail!("MockSink {} scripted failure", self.name);
        }
        self.batches.lock().push(records);
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    async fn close(&self, _timeout: Duration) -> anyhow::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
