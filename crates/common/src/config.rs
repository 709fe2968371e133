//! The enumerated configuration schema the pipeline recognizes.
//!
//! Unknown keys are rejected at load time. Hot reload operates on a
//! restricted subset: batch shape, timeouts, and windows can change on a
//! running pipeline; structural fields (capacities, parallelism, the sink
//! set, on-disk locations) require a restart and are rejected with a clear
//! reason.

use std::{
    collections::{
        BTreeMap,
        BTreeSet,
    },
    path::PathBuf,
    time::Duration,
};

use serde::{
    Deserialize,
    Serialize,
};
use url::Url;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogshipConfig {
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub dlq: DlqConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub timestamp: TimestampConfig,
    #[serde(default)]
    pub file: FilePolicyConfig,
    #[serde(default)]
    pub container: ContainerConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Explicitly enumerated file sources; discovery is out of scope.
    #[serde(default)]
    pub files: Vec<FileSourceConfig>,
    #[serde(default)]
    pub sinks: Vec<SinkConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DispatcherConfig {
    #[serde(default = "default_queue_cap")]
    pub queue_cap: usize,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_timeout_ms")]
    pub batch_timeout_ms: u64,
    #[serde(default = "default_sink_send_timeout_ms")]
    pub sink_send_timeout_ms: u64,
    #[serde(default = "default_sink_close_timeout_ms")]
    pub sink_close_timeout_ms: u64,
    /// How long producers wait for queue space before observing failure.
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
    /// Per-source-kind admission policy when the queue is full: drop the
    /// record, or block the producer for up to `send_timeout_ms`.
    #[serde(default)]
    pub file_drop_on_full: bool,
    #[serde(default = "default_true")]
    pub container_drop_on_full: bool,
}

impl DispatcherConfig {
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    pub fn sink_send_timeout(&self) -> Duration {
        Duration::from_millis(self.sink_send_timeout_ms)
    }

    pub fn sink_close_timeout(&self) -> Duration {
        Duration::from_millis(self.sink_close_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("Empty dispatcher config must deserialize")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    #[serde(default = "default_retry_queue_cap")]
    pub retry_queue_cap: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_max_concurrent_retries")]
    pub max_concurrent_retries: usize,
    /// Consecutive all-sinks-failed batches before scheduled delays are
    /// widened.
    #[serde(default = "default_circuit_failure_threshold")]
    pub circuit_failure_threshold: u32,
    #[serde(default = "default_circuit_widen_factor")]
    pub circuit_widen_factor: f64,
}

impl RetryConfig {
    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("Empty retry config must deserialize")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DlqConfig {
    #[serde(default = "default_dlq_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_dlq_file_cap_bytes")]
    pub file_cap_bytes: u64,
    #[serde(default = "default_dlq_file_age_secs")]
    pub file_age_secs: u64,
    #[serde(default = "default_dlq_retention_secs")]
    pub retention_secs: u64,
    #[serde(default = "default_dlq_reprocess_interval_secs")]
    pub reprocess_interval_secs: u64,
    #[serde(default = "default_dlq_fsync_interval_ms")]
    pub fsync_interval_ms: u64,
}

impl DlqConfig {
    pub fn file_age(&self) -> Duration {
        Duration::from_secs(self.file_age_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn reprocess_interval(&self) -> Duration {
        Duration::from_secs(self.reprocess_interval_secs)
    }

    pub fn fsync_interval(&self) -> Duration {
        Duration::from_millis(self.fsync_interval_ms)
    }
}

impl Default for DlqConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("Empty dlq config must deserialize")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DedupConfig {
    #[serde(default = "default_dedup_cap")]
    pub cap: usize,
    #[serde(default = "default_dedup_ttl_ms")]
    pub ttl_ms: u64,
}

impl DedupConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("Empty dedup config must deserialize")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimestampConfig {
    #[serde(default = "default_max_past_age_secs")]
    pub max_past_age_secs: u64,
    #[serde(default = "default_max_future_age_secs")]
    pub max_future_age_secs: u64,
    #[serde(default = "default_true")]
    pub clamp: bool,
}

impl TimestampConfig {
    pub fn max_past_age(&self) -> Duration {
        Duration::from_secs(self.max_past_age_secs)
    }

    pub fn max_future_age(&self) -> Duration {
        Duration::from_secs(self.max_future_age_secs)
    }
}

impl Default for TimestampConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("Empty timestamp config must deserialize")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilePolicyConfig {
    #[serde(default = "default_offsets_path")]
    pub offsets_path: PathBuf,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_dirty_cap")]
    pub dirty_cap: usize,
    /// Skip historical content when a file is seen for the first time.
    #[serde(default)]
    pub start_from_end: bool,
    #[serde(default = "default_open_failures_before_gone")]
    pub open_failures_before_gone: u32,
    #[serde(default = "default_tombstone_retention_secs")]
    pub tombstone_retention_secs: u64,
}

impl FilePolicyConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn tombstone_retention(&self) -> Duration {
        Duration::from_secs(self.tombstone_retention_secs)
    }
}

impl Default for FilePolicyConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("Empty file config must deserialize")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContainerConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_rotation_interval_ms")]
    pub rotation_interval_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl ContainerConfig {
    pub fn rotation_interval(&self) -> Duration {
        Duration::from_millis(self.rotation_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

impl Default for ContainerConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("Empty container config must deserialize")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SupervisorConfig {
    #[serde(default = "default_task_timeout_ms")]
    pub task_timeout_ms: u64,
    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,
}

impl SupervisorConfig {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("Empty supervisor config must deserialize")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectionConfig {
    #[serde(default = "default_max_conns_per_host")]
    pub max_conns_per_host: usize,
    #[serde(default = "default_max_idle_conns_per_host")]
    pub max_idle_conns_per_host: usize,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

impl ConnectionConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("Empty connection config must deserialize")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileSourceConfig {
    pub path: PathBuf,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum SinkConfig {
    Local {
        name: String,
        path: PathBuf,
        #[serde(default = "default_local_rotate_bytes")]
        rotate_bytes: u64,
    },
    HttpPush {
        name: String,
        url: Url,
        #[serde(default = "default_max_logs_per_batch")]
        max_logs_per_batch: usize,
        #[serde(default = "default_max_request_attempts")]
        max_request_attempts: usize,
        #[serde(default = "default_unhealthy_after_failures")]
        unhealthy_after_failures: u32,
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
}

impl SinkConfig {
    pub fn name(&self) -> &str {
        match self {
            SinkConfig::Local { name, .. } => name,
            SinkConfig::HttpPush { name, .. } => name,
        }
    }
}

impl LogshipConfig {
    pub fn from_json_slice(bytes: &[u8]) -> anyhow::Result<Self> {
        let config: LogshipConfig = serde_json::from_slice(bytes)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let d = &self.dispatcher;
        anyhow::ensure!(d.worker_count >= 1, "dispatcher.worker_count must be >= 1");
        anyhow::ensure!(d.batch_size >= 1, "dispatcher.batch_size must be >= 1");
        anyhow::ensure!(
            d.queue_cap >= d.batch_size,
            "dispatcher.queue_cap must be >= dispatcher.batch_size"
        );
        anyhow::ensure!(
            d.batch_timeout_ms >= 1,
            "dispatcher.batch_timeout_ms must be >= 1"
        );

        let r = &self.retry;
        anyhow::ensure!(r.retry_queue_cap >= 1, "retry.retry_queue_cap must be >= 1");
        anyhow::ensure!(r.max_attempts >= 1, "retry.max_attempts must be >= 1");
        anyhow::ensure!(
            r.base_backoff_ms <= r.max_backoff_ms,
            "retry.base_backoff_ms must be <= retry.max_backoff_ms"
        );
        anyhow::ensure!(
            r.max_concurrent_retries >= 1,
            "retry.max_concurrent_retries must be >= 1"
        );
        anyhow::ensure!(
            r.circuit_widen_factor >= 1.0,
            "retry.circuit_widen_factor must be >= 1.0"
        );

        anyhow::ensure!(self.dedup.cap >= 1, "dedup.cap must be >= 1");
        anyhow::ensure!(self.dedup.ttl_ms >= 1, "dedup.ttl_ms must be >= 1");

        let s = &self.supervisor;
        anyhow::ensure!(
            s.cleanup_interval_ms * 2 <= s.task_timeout_ms,
            "supervisor.cleanup_interval_ms must be well under supervisor.task_timeout_ms"
        );

        anyhow::ensure!(
            self.dlq.file_cap_bytes >= 1,
            "dlq.file_cap_bytes must be >= 1"
        );
        anyhow::ensure!(
            self.connection.max_conns_per_host >= 1,
            "connection.max_conns_per_host must be >= 1"
        );

        let mut names = BTreeSet::new();
        for sink in &self.sinks {
            anyhow::ensure!(!sink.name().is_empty(), "sink names must be nonempty");
            anyhow::ensure!(
                names.insert(sink.name().to_owned()),
                "duplicate sink name {:?}",
                sink.name()
            );
            if let SinkConfig::HttpPush {
                name,
                max_logs_per_batch,
                ..
            } = sink
            {
                // Sink-level chunking may subdivide dispatcher batches, but a
                // sink batch cap more than an order of magnitude away from
                // the dispatcher's means one of the two was misconfigured.
                let floor = (d.batch_size / 10).max(1);
                let ceiling = d.batch_size.saturating_mul(10);
                anyhow::ensure!(
                    (floor..=ceiling).contains(max_logs_per_batch),
                    "sink {name:?}: max_logs_per_batch {max_logs_per_batch} is more than an order \
                     of magnitude away from dispatcher.batch_size {}",
                    d.batch_size
                );
            }
        }

        let mut paths = BTreeSet::new();
        for file in &self.files {
            anyhow::ensure!(
                paths.insert(file.path.clone()),
                "duplicate file source {:?}",
                file.path
            );
        }
        Ok(())
    }

    /// Check that `new` differs from `self` only in hot-reloadable fields.
    /// Structural changes are rejected with the first offending field.
    pub fn ensure_reloadable(&self, new: &LogshipConfig) -> anyhow::Result<()> {
        new.validate()?;
        macro_rules! frozen {
            ($($field:ident).+) => {
                anyhow::ensure!(
                    self.$($field).+ == new.$($field).+,
                    "{} cannot be changed by hot reload; restart required",
                    stringify!($($field).+),
                );
            };
        }
        frozen!(dispatcher.queue_cap);
        frozen!(dispatcher.worker_count);
        frozen!(dispatcher.file_drop_on_full);
        frozen!(dispatcher.container_drop_on_full);
        frozen!(retry.retry_queue_cap);
        frozen!(retry.max_attempts);
        frozen!(retry.max_concurrent_retries);
        frozen!(dedup.cap);
        frozen!(dlq.dir);
        frozen!(dlq.file_cap_bytes);
        frozen!(dlq.file_age_secs);
        frozen!(supervisor.task_timeout_ms);
        frozen!(supervisor.cleanup_interval_ms);
        frozen!(connection.max_conns_per_host);
        frozen!(connection.max_idle_conns_per_host);
        frozen!(connection.idle_timeout_secs);
        frozen!(file.offsets_path);
        frozen!(file.start_from_end);
        frozen!(file.open_failures_before_gone);
        frozen!(container.enabled);
        frozen!(sinks);
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_queue_cap() -> usize {
    10_000
}

fn default_worker_count() -> usize {
    4
}

// The authoritative dispatcher batch cap; sink-level chunking must stay
// within one order of magnitude of it.
fn default_batch_size() -> usize {
    500
}

fn default_batch_timeout_ms() -> u64 {
    1_000
}

fn default_sink_send_timeout_ms() -> u64 {
    5_000
}

fn default_sink_close_timeout_ms() -> u64 {
    5_000
}

fn default_send_timeout_ms() -> u64 {
    1_000
}

fn default_drain_timeout_ms() -> u64 {
    10_000
}

fn default_retry_queue_cap() -> usize {
    1_024
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    60_000
}

fn default_max_concurrent_retries() -> usize {
    4
}

fn default_circuit_failure_threshold() -> u32 {
    3
}

fn default_circuit_widen_factor() -> f64 {
    2.0
}

fn default_dlq_dir() -> PathBuf {
    PathBuf::from("dlq")
}

fn default_dlq_file_cap_bytes() -> u64 {
    16 * 1024 * 1024
}

fn default_dlq_file_age_secs() -> u64 {
    3_600
}

fn default_dlq_retention_secs() -> u64 {
    7 * 24 * 3_600
}

fn default_dlq_reprocess_interval_secs() -> u64 {
    300
}

fn default_dlq_fsync_interval_ms() -> u64 {
    1_000
}

fn default_dedup_cap() -> usize {
    65_536
}

fn default_dedup_ttl_ms() -> u64 {
    60_000
}

fn default_max_past_age_secs() -> u64 {
    3_600
}

fn default_max_future_age_secs() -> u64 {
    300
}

fn default_offsets_path() -> PathBuf {
    PathBuf::from("offsets.json")
}

fn default_flush_interval_ms() -> u64 {
    5_000
}

fn default_dirty_cap() -> usize {
    100
}

fn default_open_failures_before_gone() -> u32 {
    5
}

fn default_tombstone_retention_secs() -> u64 {
    24 * 3_600
}

fn default_rotation_interval_ms() -> u64 {
    30_000
}

fn default_heartbeat_interval_ms() -> u64 {
    10_000
}

fn default_task_timeout_ms() -> u64 {
    60_000
}

fn default_cleanup_interval_ms() -> u64 {
    5_000
}

fn default_max_conns_per_host() -> usize {
    8
}

fn default_max_idle_conns_per_host() -> usize {
    4
}

fn default_idle_timeout_secs() -> u64 {
    90
}

fn default_local_rotate_bytes() -> u64 {
    64 * 1024 * 1024
}

fn default_max_logs_per_batch() -> usize {
    500
}

fn default_max_request_attempts() -> usize {
    6
}

fn default_unhealthy_after_failures() -> u32 {
    3
}

#[cfg(test)]
mod tests {
    use super::{
        LogshipConfig,
        SinkConfig,
    };

    #[test]
    fn test_defaults_validate() {
        let config = LogshipConfig::default();
        config.validate().unwrap();
        assert_eq!(config.dispatcher.batch_size, 500);
        assert_eq!(config.retry.max_attempts, 5);
        assert!(config.timestamp.clamp);
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let err = LogshipConfig::from_json_slice(br#"{"dispatcher": {"qcap": 10}}"#).unwrap_err();
        assert!(err.to_string().contains("qcap"), "{err}");
    }

    #[test]
    fn test_sink_batch_order_of_magnitude() {
        let raw = br#"{
            "sinks": [
                {"type": "http_push", "name": "agg", "url": "https://agg.example.com/push",
                 "max_logs_per_batch": 20000}
            ]
        }"#;
        let err = LogshipConfig::from_json_slice(raw).unwrap_err();
        assert!(err.to_string().contains("order of magnitude"), "{err}");

        let raw_ok = br#"{
            "sinks": [
                {"type": "http_push", "name": "agg", "url": "https://agg.example.com/push",
                 "max_logs_per_batch": 200}
            ]
        }"#;
        LogshipConfig::from_json_slice(raw_ok).unwrap();
    }

    #[test]
    fn test_duplicate_sink_names_rejected() {
        let raw = br#"{
            "sinks": [
                {"type": "local", "name": "a", "path": "/tmp/a.jsonl"},
                {"type": "local", "name": "a", "path": "/tmp/b.jsonl"}
            ]
        }"#;
        let err = LogshipConfig::from_json_slice(raw).unwrap_err();
        assert!(err.to_string().contains("duplicate sink name"), "{err}");
    }

    #[test]
    fn test_reload_allows_timeout_changes() {
        let old = LogshipConfig::default();
        let mut new = old.clone();
        new.dispatcher.batch_timeout_ms = 250;
        new.dedup.ttl_ms = 10_000;
        new.timestamp.clamp = false;
        old.ensure_reloadable(&new).unwrap();
    }

    #[test]
    fn test_reload_rejects_structural_changes() {
        let old = LogshipConfig::default();
        let mut new = old.clone();
        new.dispatcher.worker_count = 16;
        let err = old.ensure_reloadable(&new).unwrap_err();
        assert!(err.to_string().contains("worker_count"), "{err}");

        let mut new = old.clone();
        new.sinks.push(SinkConfig::Local {
            name: "late".to_string(),
            path: "/tmp/late.jsonl".into(),
            rotate_bytes: 1024,
        });
        let err = old.ensure_reloadable(&new).unwrap_err();
        assert!(err.to_string().contains("sinks"), "{err}");
    }

    #[test]
    fn test_supervisor_interval_bound() {
        let raw = br#"{"supervisor": {"task_timeout_ms": 1000, "cleanup_interval_ms": 900}}"#;
        assert!(LogshipConfig::from_json_slice(raw).is_err());
    }
}
