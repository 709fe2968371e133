//! The capability contract between the dispatcher and its delivery targets.

use std::{
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;

use crate::record::LogRecord;

/// A downstream delivery target. The dispatcher depends only on this shape;
/// wire protocols live in the `sinks` crate.
///
/// Batches are shared as `Arc<LogRecord>`s: a sink may retain them across
/// await points but cannot mutate them, so one sink can never corrupt
/// another's view of a batch.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Stable name, used for metrics, retry targeting, and logs.
    fn name(&self) -> &str;

    /// Deliver one batch. An `Err` marks this sink's delivery of the batch
    /// as failed; other sinks are unaffected.
    async fn send(&self, records: Vec<Arc<LogRecord>>) -> anyhow::Result<()>;

    /// O(1), read-only health indication. Unhealthy sinks are skipped by
    /// the dispatcher and do not count against batch success.
    fn is_healthy(&self) -> bool;

    /// Flush and release resources, bounded by `timeout`.
    async fn close(&self, timeout: Duration) -> anyhow::Result<()>;
}
