//! Generic HTTP push sink: POSTs JSON arrays of records to an aggregator
//! endpoint through the shared fetch client.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{
            AtomicU32,
            Ordering,
        },
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use common::{
    backoff::Backoff,
    http::{
        categorize_http_response,
        FetchClient,
        FetchError,
        HttpRequest,
    },
    record::LogRecord,
    runtime::Runtime,
    sink::Sink,
};
use http::{
    header::CONTENT_TYPE,
    HeaderMap,
    HeaderName,
    HeaderValue,
    Method,
};
use parking_lot::Mutex;
use url::Url;

use crate::metrics::{
    http_push_timer,
    log_http_push_request,
    log_sink_records_written,
};

const PUSH_INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const PUSH_MAX_BACKOFF: Duration = Duration::from_secs(60);

pub struct HttpPushSink<RT: Runtime> {
    rt: RT,
    name: String,
    url: Url,
    headers: HeaderMap,
    max_logs_per_batch: usize,
    max_request_attempts: usize,
    unhealthy_after_failures: u32,
    fetch_client: Arc<dyn FetchClient>,
    backoff: Mutex<Backoff>,
    consecutive_failures: AtomicU32,
}

impl<RT: Runtime> HttpPushSink<RT> {
    /// Build the sink and verify the endpoint with a probe request before
    /// any records flow.
    pub async fn start(
        rt: RT,
        name: String,
        url: Url,
        headers: BTreeMap<String, String>,
        max_logs_per_batch: usize,
        max_request_attempts: usize,
        unhealthy_after_failures: u32,
        fetch_client: Arc<dyn FetchClient>,
    ) -> anyhow::Result<Arc<Self>> {
        let mut header_map = HeaderMap::new();
        header_map.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        for (key, value) in &headers {
            header_map.insert(
                HeaderName::from_bytes(key.as_bytes())?,
                HeaderValue::from_str(value)?,
            );
        }
        let sink = Self {
            rt,
            name,
            url,
            headers: header_map,
            max_logs_per_batch,
            max_request_attempts,
            unhealthy_after_failures,
            fetch_client,
            backoff: Mutex::new(Backoff::new(PUSH_INITIAL_BACKOFF, PUSH_MAX_BACKOFF)),
            consecutive_failures: AtomicU32::new(0),
        };
        sink.verify().await?;
        tracing::info!("Verified HTTP push sink {} at {}", sink.name, sink.url);
        Ok(Arc::new(sink))
    }

    async fn verify(&self) -> anyhow::Result<()> {
        let probe = serde_json::json!([{
            "verification": true,
            "service": "logship",
        }]);
        self.push_payload(Bytes::from(serde_json::to_vec(&probe)?))
            .await
    }

    async fn push_payload(&self, payload: Bytes) -> anyhow::Result<()> {
        let timer = http_push_timer();
        for _ in 0..self.max_request_attempts {
            let response = self
                .fetch_client
                .fetch(HttpRequest {
                    url: self.url.clone(),
                    method: Method::POST,
                    headers: self.headers.clone(),
                    body: Some(payload.clone()),
                })
                .await;
            let outcome = response.and_then(|response| {
                categorize_http_response(&self.url, response).map_err(Into::into)
            });
            match outcome {
                Ok(_) => {
                    log_http_push_request(&self.name, "success");
                    self.backoff.lock().reset();
                    timer.finish();
                    return Ok(());
                },
                Err(e) => {
                    let retryable = e
                        .downcast_ref::<FetchError>()
                        .map_or(true, FetchError::is_retryable);
                    if !retryable {
                        log_http_push_request(&self.name, "rejected");
                        return Err(e.context(format!(
                            "Sink {} rejected the push; not retrying",
                            self.name
                        )));
                    }
                    log_http_push_request(&self.name, "retryable_error");
                    let delay = {
                        let mut backoff = self.backoff.lock();
                        let mut rng = self.rt.rng();
                        backoff.fail(&mut rng)
                    };
                    tracing::warn!(
                        "Push to sink {} failed: {e:#}. Waiting {delay:?} before retrying.",
                        self.name
                    );
                    self.rt.wait(delay).await;
                },
            }
        }
        anyhow::bail!(
            "Exceeded {} push attempts to sink {}",
            self.max_request_attempts,
            self.name
        )
    }
}

#[async_trait]
impl<RT: Runtime> Sink for HttpPushSink<RT> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, records: Vec<Arc<LogRecord>>) -> anyhow::Result<()> {
        let total = records.len();
        for chunk in build_record_batches(records, self.max_logs_per_batch) {
            let mut objects = Vec::with_capacity(chunk.len());
            for record in &chunk {
                objects.push(serde_json::Value::Object(record.to_json_map()?));
            }
            let payload = Bytes::from(serde_json::to_vec(&serde_json::Value::Array(objects))?);
            if let Err(e) = self.push_payload(payload).await {
                self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        }
        self.consecutive_failures.store(0, Ordering::Relaxed);
        log_sink_records_written(&self.name, total);
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.consecutive_failures.load(Ordering::Relaxed) < self.unhealthy_after_failures
    }

    async fn close(&self, _timeout: Duration) -> anyhow::Result<()> {
        // Nothing buffered; every send is flushed through the fetch client.
        Ok(())
    }
}

/// Split a dispatcher batch into sink-sized chunks, preserving order.
pub fn build_record_batches(
    records: Vec<Arc<LogRecord>>,
    batch_size: usize,
) -> Vec<Vec<Arc<LogRecord>>> {
    records
        .chunks(batch_size.max(1))
        .map(|chunk| chunk.to_vec())
        .collect()
}

#[cfg(test)]
mod tests {
    use std::{
        collections::BTreeMap,
        sync::Arc,
    };

    use bytes::Bytes;
    use common::{
        http::{
            HttpResponse,
            StaticFetchClient,
        },
        record::{
            LogRecord,
            SourceKind,
        },
        runtime::UnixTimestamp,
        sink::Sink,
    };
    use http::{
        HeaderMap,
        StatusCode,
    };
    use runtime::testing::test_runtime;
    use url::Url;

    use super::{
        build_record_batches,
        HttpPushSink,
    };

    fn record(message: &str) -> Arc<LogRecord> {
        Arc::new(LogRecord::new(
            message,
            UnixTimestamp::from_millis(1_700_000_000_000),
            SourceKind::Container,
            "c1",
        ))
    }

    fn push_url() -> Url {
        "https://agg.example.com/push".parse().unwrap()
    }

    async fn start_sink(
        client: Arc<StaticFetchClient>,
        max_request_attempts: usize,
    ) -> anyhow::Result<Arc<HttpPushSink<runtime::ProdRuntime>>> {
        HttpPushSink::start(
            test_runtime(),
            "agg".to_string(),
            push_url(),
            BTreeMap::from([("x-api-key".to_string(), "secret".to_string())]),
            100,
            max_request_attempts,
            3,
            client,
        )
        .await
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_posts_json_array() -> anyhow::Result<()> {
        let client = Arc::new(StaticFetchClient::new());
        let sink = start_sink(client.clone(), 3).await?;
        // Drop the verification probe.
        client.take_requests();

        sink.send(vec![record("a"), record("b")]).await?;
        let requests = client.take_requests();
        assert_eq!(requests.len(), 1);
        let body: serde_json::Value =
            serde_json::from_slice(requests[0].body.as_ref().unwrap())?;
        let array = body.as_array().unwrap();
        assert_eq!(array.len(), 2);
        assert_eq!(array[0]["message"], "a");
        assert_eq!(
            requests[0].headers.get("x-api-key").unwrap(),
            &"secret"
        );
        assert!(sink.is_healthy());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_server_errors() -> anyhow::Result<()> {
        let client = Arc::new(StaticFetchClient::new());
        let sink = start_sink(client.clone(), 4).await?;
        client.take_requests();

        // Two 502s, then success.
        for _ in 0..2 {
            client.register_response(
                &push_url(),
                HttpResponse {
                    status: StatusCode::BAD_GATEWAY,
                    headers: HeaderMap::new(),
                    body: Bytes::new(),
                },
            );
        }
        sink.send(vec![record("retried")]).await?;
        assert_eq!(client.take_requests().len(), 3);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_errors_fail_fast() -> anyhow::Result<()> {
        let client = Arc::new(StaticFetchClient::new());
        let sink = start_sink(client.clone(), 5).await?;
        client.take_requests();

        client.register_response(
            &push_url(),
            HttpResponse {
                status: StatusCode::UNPROCESSABLE_ENTITY,
                headers: HeaderMap::new(),
                body: Bytes::new(),
            },
        );
        let err = sink.send(vec![record("bad")]).await.unwrap_err();
        assert!(err.to_string().contains("not retrying"), "{err:#}");
        // No retries after a 4xx.
        assert_eq!(client.take_requests().len(), 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_verification_failure_aborts_startup() {
        let client = Arc::new(
            StaticFetchClient::new().with_fallback_status(StatusCode::UNAUTHORIZED),
        );
        assert!(start_sink(client, 3).await.is_err());
    }

    #[test]
    fn test_build_record_batches() {
        let records: Vec<_> = (0..23).map(|i| record(&format!("r{i}"))).collect();
        let batches = build_record_batches(records, 10);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].len(), 10);
        assert_eq!(batches[2].len(), 3);
        assert_eq!(batches[2][2].message, "r22");
    }
}
