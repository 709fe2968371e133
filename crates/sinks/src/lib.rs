//! Sink drivers: delivery targets satisfying the `common::sink::Sink`
//! capability contract, plus the factory that builds the configured sink
//! set at startup.

pub mod http_push;
pub mod local;
mod metrics;
#[cfg(any(test, feature = "testing"))]
pub mod mock;

use std::sync::Arc;

use common::{
    config::SinkConfig,
    http::FetchClient,
    runtime::Runtime,
    sink::Sink,
};

use crate::{
    http_push::HttpPushSink,
    local::LocalSink,
};

/// Build every configured sink. HTTP sinks verify their endpoint before
/// the pipeline starts, so a misconfigured aggregator fails fast.
pub async fn build_sinks<RT: Runtime>(
    rt: &RT,
    configs: &[SinkConfig],
    fetch_client: Arc<dyn FetchClient>,
) -> anyhow::Result<Vec<Arc<dyn Sink>>> {
    let mut sinks: Vec<Arc<dyn Sink>> = Vec::with_capacity(configs.len());
    for config in configs {
        match config {
            SinkConfig::Local {
                name,
                path,
                rotate_bytes,
            } => {
                sinks.push(Arc::new(LocalSink::new(
                    name.clone(),
                    path.clone(),
                    *rotate_bytes,
                )?));
            },
            SinkConfig::HttpPush {
                name,
                url,
                max_logs_per_batch,
                max_request_attempts,
                unhealthy_after_failures,
                headers,
            } => {
                let sink = HttpPushSink::start(
                    rt.clone(),
                    name.clone(),
                    url.clone(),
                    headers.clone(),
                    *max_logs_per_batch,
                    *max_request_attempts,
                    *unhealthy_after_failures,
                    fetch_client.clone(),
                )
                .await?;
                sinks.push(sink);
            },
        }
        tracing::info!("Configured sink {:?}", config.name());
    }
    Ok(sinks)
}
