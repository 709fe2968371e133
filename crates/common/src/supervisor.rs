//! Heartbeat-based liveness for long-lived tasks.
//!
//! Tasks register on start and deregister on clean exit. A cleanup tick
//! cancels any task whose last heartbeat is older than the task timeout.
//! Every long-running loop should arm an independent heartbeat ticker
//! (`Heartbeat::spawn_ticker`), not only post-work beats: a ticker-only
//! heartbeat survives the loop being blocked on a single long operation.

use std::{
    collections::HashMap,
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;

use crate::{
    config::SupervisorConfig,
    metrics::{
        log_supervised_tasks,
        log_supervisor_task_failed,
    },
    runtime::{
        Runtime,
        SpawnHandle,
    },
};

struct SupervisedTask {
    last_heartbeat: tokio::time::Instant,
    handle: Box<dyn SpawnHandle>,
}

#[derive(Default)]
struct SupervisorInner {
    tasks: HashMap<String, SupervisedTask>,
    failed_tasks: u64,
}

#[derive(Clone)]
pub struct TaskSupervisor {
    inner: Arc<Mutex<SupervisorInner>>,
    task_timeout: Duration,
    cleanup_handle: Arc<Mutex<Option<Box<dyn SpawnHandle>>>>,
}

impl TaskSupervisor {
    pub fn new<RT: Runtime>(rt: &RT, config: &SupervisorConfig) -> Self {
        let inner = Arc::new(Mutex::new(SupervisorInner::default()));
        let task_timeout = config.task_timeout();
        let cleanup_interval = config.cleanup_interval();

        let cleanup_inner = inner.clone();
        let cleanup_rt = rt.clone();
        let cleanup_handle = rt.spawn("supervisor_cleanup", async move {
            loop {
                cleanup_rt.wait(cleanup_interval).await;
                Self::cleanup_once(&cleanup_inner, task_timeout);
            }
        });

        Self {
            inner,
            task_timeout,
            cleanup_handle: Arc::new(Mutex::new(Some(cleanup_handle))),
        }
    }

    /// Start supervising `handle`. The returned heartbeat must be beaten
    /// more often than the task timeout or the task will be cancelled.
    pub fn register(&self, task_id: impl Into<String>, handle: Box<dyn SpawnHandle>) -> Heartbeat {
        let task_id = task_id.into();
        let mut inner = self.inner.lock();
        if inner
            .tasks
            .insert(
                task_id.clone(),
                SupervisedTask {
                    last_heartbeat: tokio::time::Instant::now(),
                    handle,
                },
            )
            .is_some()
        {
            tracing::warn!("Task {task_id} registered twice; superseding the old registration");
        }
        log_supervised_tasks(inner.tasks.len());
        Heartbeat {
            task_id,
            inner: self.inner.clone(),
        }
    }

    /// Remove a task that exited cleanly.
    pub fn deregister(&self, task_id: &str) {
        let mut inner = self.inner.lock();
        inner.tasks.remove(task_id);
        log_supervised_tasks(inner.tasks.len());
    }

    /// Cancel a task on purpose (e.g. its source was untracked). Not
    /// counted as a failure.
    pub fn cancel(&self, task_id: &str) {
        let mut inner = self.inner.lock();
        if let Some(mut task) = inner.tasks.remove(task_id) {
            task.handle.shutdown();
        }
        log_supervised_tasks(inner.tasks.len());
    }

    pub fn live_tasks(&self) -> usize {
        self.inner.lock().tasks.len()
    }

    pub fn failed_tasks(&self) -> u64 {
        self.inner.lock().failed_tasks
    }

    pub fn task_timeout(&self) -> Duration {
        self.task_timeout
    }

    fn cleanup_once(inner: &Arc<Mutex<SupervisorInner>>, task_timeout: Duration) {
        let now = tokio::time::Instant::now();
        let mut inner = inner.lock();
        let stale: Vec<String> = inner
            .tasks
            .iter()
            .filter(|(_, task)| now.duration_since(task.last_heartbeat) > task_timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for task_id in stale {
            tracing::error!(
                "Task {task_id} missed its heartbeat for more than {task_timeout:?}; cancelling"
            );
            if let Some(mut task) = inner.tasks.remove(&task_id) {
                task.handle.shutdown();
            }
            inner.failed_tasks += 1;
            log_supervisor_task_failed(&task_id);
        }
        log_supervised_tasks(inner.tasks.len());
    }

    /// Cancel every supervised task and the cleanup loop. Used on service
    /// shutdown after the drain deadline.
    pub fn shutdown_all(&self) {
        if let Some(mut handle) = self.cleanup_handle.lock().take() {
            handle.shutdown();
        }
        let mut inner = self.inner.lock();
        for (_, task) in inner.tasks.iter_mut() {
            task.handle.shutdown();
        }
        inner.tasks.clear();
        log_supervised_tasks(0);
    }
}

/// Handle for a supervised task to prove liveness.
#[derive(Clone)]
pub struct Heartbeat {
    task_id: String,
    inner: Arc<Mutex<SupervisorInner>>,
}

impl Heartbeat {
    pub fn beat(&self) {
        let mut inner = self.inner.lock();
        if let Some(task) = inner.tasks.get_mut(&self.task_id) {
            task.last_heartbeat = tokio::time::Instant::now();
        }
    }

    /// Arm an independent ticker that beats this heartbeat every
    /// `interval`, regardless of what the owning loop is doing.
    pub fn spawn_ticker<RT: Runtime>(&self, rt: &RT, interval: Duration) -> Box<dyn SpawnHandle> {
        let heartbeat = self.clone();
        let ticker_rt = rt.clone();
        rt.spawn("heartbeat_ticker", async move {
            loop {
                ticker_rt.wait(interval).await;
                heartbeat.beat();
            }
        })
    }
}
