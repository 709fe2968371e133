//! Container runtime access behind a narrow trait so the tailer can be
//! driven by a scripted runtime in tests and by Docker (bollard) in
//! production.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bollard::query_parameters::{
    ListContainersOptionsBuilder,
    LogsOptionsBuilder,
};
use common::runtime::UnixTimestamp;
use futures::{
    stream::BoxStream,
    StreamExt,
};

#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdStream {
    Stdout,
    Stderr,
}

impl StdStream {
    pub fn label(&self) -> &'static str {
        match self {
            StdStream::Stdout => "stdout",
            StdStream::Stderr => "stderr",
        }
    }
}

/// One parsed frame from a container log stream.
#[derive(Debug, Clone, PartialEq)]
pub struct LogFrame {
    /// The runtime's record timestamp, when the stream carries one.
    pub timestamp: Option<UnixTimestamp>,
    pub stream: StdStream,
    pub line: String,
}

/// A blocking, unbounded stream of frames. Readers must assume the stream
/// never terminates on its own; the rotation watcher closing the handle is
/// what unblocks them.
pub type LogStream = BoxStream<'static, anyhow::Result<LogFrame>>;

#[async_trait]
pub trait ContainerRuntime: Send + Sync + 'static {
    async fn list_containers(&self) -> anyhow::Result<Vec<ContainerSummary>>;

    /// Open a follow-stream of frames with timestamps strictly after
    /// `since`. Implementations may deliver at coarser granularity than
    /// nanoseconds; duplicates across rotations are suppressed downstream.
    async fn open_log_stream(
        &self,
        container_id: &str,
        since: UnixTimestamp,
    ) -> anyhow::Result<LogStream>;
}

pub struct DockerRuntime {
    docker: bollard::Docker,
}

impl DockerRuntime {
    pub fn connect() -> anyhow::Result<Self> {
        Ok(Self {
            docker: bollard::Docker::connect_with_defaults()?,
        })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list_containers(&self) -> anyhow::Result<Vec<ContainerSummary>> {
        let options = ListContainersOptionsBuilder::default().all(false).build();
        let containers = self.docker.list_containers(Some(options)).await?;
        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let id = c.id?;
                let name = c
                    .names
                    .as_ref()
                    .and_then(|names| names.first())
                    .map(|n| n.trim_start_matches('/').to_owned())
                    .unwrap_or_else(|| id.clone());
                let labels = c
                    .labels
                    .map(|l| l.into_iter().collect())
                    .unwrap_or_default();
                Some(ContainerSummary { id, name, labels })
            })
            .collect())
    }

    async fn open_log_stream(
        &self,
        container_id: &str,
        since: UnixTimestamp,
    ) -> anyhow::Result<LogStream> {
        // The Docker API accepts whole seconds; sub-second precision is
        // lost, so a rotation can re-deliver the tail of the previous
        // window. Dedup absorbs it.
        let options = LogsOptionsBuilder::default()
            .follow(true)
            .stdout(true)
            .stderr(true)
            .timestamps(true)
            .since(since.as_secs() as i32)
            .build();
        let stream = self
            .docker
            .logs(container_id, Some(options))
            .map(|item| item.map_err(anyhow::Error::from).map(parse_log_output));
        Ok(stream.boxed())
    }
}

fn parse_log_output(output: bollard::container::LogOutput) -> LogFrame {
    use bollard::container::LogOutput;
    let (stream, message) = match output {
        LogOutput::StdErr { message } => (StdStream::Stderr, message),
        LogOutput::StdOut { message }
        | LogOutput::StdIn { message }
        | LogOutput::Console { message } => (StdStream::Stdout, message),
    };
    let raw = String::from_utf8_lossy(&message);
    let raw = raw.strip_suffix('\n').unwrap_or(&raw);
    parse_timestamped_line(raw, stream)
}

/// Docker prefixes each line with an RFC3339Nano timestamp when
/// `timestamps=true`. A line that doesn't parse keeps its full content and
/// gets the ingest instant downstream.
fn parse_timestamped_line(raw: &str, stream: StdStream) -> LogFrame {
    if let Some((prefix, rest)) = raw.split_once(' ') {
        if let Ok(parsed) = chrono::DateTime::parse_from_rfc3339(prefix) {
            let nanos = parsed
                .timestamp_nanos_opt()
                .filter(|n| *n >= 0)
                .map(|n| n as u64);
            if let Some(nanos) = nanos {
                return LogFrame {
                    timestamp: Some(UnixTimestamp::from_nanos(nanos)),
                    stream,
                    line: rest.to_owned(),
                };
            }
        }
    }
    LogFrame {
        timestamp: None,
        stream,
        line: raw.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::{
        parse_timestamped_line,
        StdStream,
    };

    #[test]
    fn test_parse_timestamped_line() {
        let frame = parse_timestamped_line(
            "2024-05-01T10:20:30.000000123Z payload here",
            StdStream::Stdout,
        );
        assert_eq!(frame.line, "payload here");
        let ts = frame.timestamp.unwrap();
        assert_eq!(ts.as_nanos() % 1_000_000_000, 123);
    }

    #[test]
    fn test_parse_line_without_timestamp() {
        let frame = parse_timestamped_line("no timestamp prefix", StdStream::Stderr);
        assert_eq!(frame.timestamp, None);
        assert_eq!(frame.line, "no timestamp prefix");
        assert_eq!(frame.stream.label(), "stderr");
    }
}
