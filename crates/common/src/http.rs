//! Outbound HTTP plumbing shared by sinks: a `FetchClient` capability so
//! delivery code is testable without a network, and a pooled implementation
//! with bounded per-host concurrency.

use std::{
    collections::{
        HashMap,
        VecDeque,
    },
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use http::{
    HeaderMap,
    Method,
    StatusCode,
};
use parking_lot::Mutex;
use tokio::sync::{
    OwnedSemaphorePermit,
    Semaphore,
};
use url::Url;

use crate::metrics::{
    log_fetch_host_waiters,
    log_fetch_request,
};

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(thiserror::Error, Debug)]
pub enum FetchError {
    #[error("HTTP {status} from {url}")]
    Status { status: StatusCode, url: Url },
    #[error("Transport error fetching {url}: {message}")]
    Transport { url: Url, message: String },
}

impl FetchError {
    /// Server-side and transport failures are worth retrying; 4xx responses
    /// are the caller's fault and retrying them only repeats the mistake.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Status { status, .. } => status.is_server_error(),
            FetchError::Transport { .. } => true,
        }
    }
}

/// Collapse a response into `Ok` for 2xx and a categorized `FetchError`
/// otherwise.
pub fn categorize_http_response(
    url: &Url,
    response: HttpResponse,
) -> Result<HttpResponse, FetchError> {
    if response.status.is_success() {
        Ok(response)
    } else {
        Err(FetchError::Status {
            status: response.status,
            url: url.clone(),
        })
    }
}

/// Http client capability used by sinks.
#[async_trait]
pub trait FetchClient: Send + Sync {
    async fn fetch(&self, request: HttpRequest) -> anyhow::Result<HttpResponse>;
}

/// Caps concurrent in-flight requests per target host. Connections can
/// never exceed in-flight requests, so this bounds per-host connections
/// too.
pub struct HostGovernor {
    max_conns_per_host: usize,
    hosts: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl HostGovernor {
    pub fn new(max_conns_per_host: usize) -> Self {
        assert!(max_conns_per_host > 0, "max_conns_per_host must be positive");
        Self {
            max_conns_per_host,
            hosts: Mutex::new(HashMap::new()),
        }
    }

    pub async fn acquire(&self, host: &str) -> OwnedSemaphorePermit {
        let semaphore = {
            let mut hosts = self.hosts.lock();
            hosts
                .entry(host.to_owned())
                .or_insert_with(|| Arc::new(Semaphore::new(self.max_conns_per_host)))
                .clone()
        };
        log_fetch_host_waiters(
            host,
            self.max_conns_per_host.saturating_sub(semaphore.available_permits()),
        );
        semaphore
            .acquire_owned()
            .await
            .expect("Host semaphore closed?")
    }
}

/// Production fetch client: reqwest with keep-alive, HTTP/1.1 only (HTTP/2
/// multiplexing would make the per-host connection accounting meaningless),
/// bounded idle pool, and the per-host governor in front.
pub struct PooledFetchClient {
    client: reqwest::Client,
    governor: HostGovernor,
}

impl PooledFetchClient {
    pub fn new(
        max_conns_per_host: usize,
        max_idle_conns_per_host: usize,
        idle_timeout: Duration,
    ) -> Self {
        let client = reqwest::Client::builder()
            .http1_only()
            .pool_max_idle_per_host(max_idle_conns_per_host)
            .pool_idle_timeout(idle_timeout)
            .tcp_keepalive(Duration::from_secs(60))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .expect("Failed to build reqwest client");
        Self {
            client,
            governor: HostGovernor::new(max_conns_per_host),
        }
    }
}

#[async_trait]
impl FetchClient for PooledFetchClient {
    async fn fetch(&self, request: HttpRequest) -> anyhow::Result<HttpResponse> {
        let host = request
            .url
            .host_str()
            .ok_or_else(|| anyhow::anyhow!("URL {} has no host", request.url))?
            .to_owned();
        let _permit = self.governor.acquire(&host).await;

        let mut builder = self
            .client
            .request(request.method, request.url.as_str())
            .headers(request.headers);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }
        let raw_response = match builder.send().await {
            Ok(r) => r,
            Err(e) => {
                log_fetch_request(false);
                return Err(FetchError::Transport {
                    url: request.url,
                    message: e.to_string(),
                }
                .into());
            },
        };
        let status = raw_response.status();
        let headers = raw_response.headers().to_owned();
        // Hold the permit until the body is fully read so the connection is
        // accounted for until it is actually idle again.
        let body = raw_response.bytes().await.map_err(|e| FetchError::Transport {
            url: request.url,
            message: e.to_string(),
        })?;
        log_fetch_request(status.is_success());
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

/// Test client serving canned responses keyed by URL, recording every
/// request it sees.
pub struct StaticFetchClient {
    responses: Mutex<HashMap<String, VecDeque<HttpResponse>>>,
    requests: Mutex<Vec<HttpRequest>>,
    fallback_status: StatusCode,
}

impl StaticFetchClient {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            fallback_status: StatusCode::OK,
        }
    }

    pub fn with_fallback_status(mut self, status: StatusCode) -> Self {
        self.fallback_status = status;
        self
    }

    /// Queue a response for the given URL; responses are served in FIFO
    /// order, falling back to an empty `fallback_status` response.
    pub fn register_response(&self, url: &Url, response: HttpResponse) {
        self.responses
            .lock()
            .entry(url.to_string())
            .or_default()
            .push_back(response);
    }

    pub fn take_requests(&self) -> Vec<HttpRequest> {
        std::mem::take(&mut self.requests.lock())
    }
}

#[async_trait]
impl FetchClient for StaticFetchClient {
    async fn fetch(&self, request: HttpRequest) -> anyhow::Result<HttpResponse> {
        let canned = self
            .responses
            .lock()
            .get_mut(&request.url.to_string())
            .and_then(|queue| queue.pop_front());
        self.requests.lock().push(request);
        Ok(canned.unwrap_or(HttpResponse {
            status: self.fallback_status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{
            AtomicUsize,
            Ordering,
        },
        Arc,
    };
    use std::time::Duration;

    use super::{
        categorize_http_response,
        FetchError,
        HostGovernor,
        HttpResponse,
    };

    #[tokio::test(start_paused = true)]
    async fn test_host_governor_caps_concurrency() {
        let governor = Arc::new(HostGovernor::new(2));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let high_water = Arc::new(AtomicUsize::new(0));

        let mut handles = vec![];
        for _ in 0..8 {
            let governor = governor.clone();
            let in_flight = in_flight.clone();
            let high_water = high_water.clone();
            handles.push(tokio::spawn(async move {
                let _permit = governor.acquire("sink.example.com").await;
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                high_water.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(high_water.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_governor_is_per_host() {
        let governor = HostGovernor::new(1);
        let _a = governor.acquire("a.example.com").await;
        // A different host is not blocked by a.example.com's permit.
        let _b = governor.acquire("b.example.com").await;
    }

    #[test]
    fn test_categorize_http_response() {
        let url: url::Url = "https://sink.example.com/push".parse().unwrap();
        let ok = HttpResponse {
            status: http::StatusCode::OK,
            headers: http::HeaderMap::new(),
            body: bytes::Bytes::new(),
        };
        assert!(categorize_http_response(&url, ok.clone()).is_ok());

        let server_error = HttpResponse {
            status: http::StatusCode::BAD_GATEWAY,
            ..ok.clone()
        };
        let err = categorize_http_response(&url, server_error).unwrap_err();
        assert!(err.is_retryable());

        let client_error = HttpResponse {
            status: http::StatusCode::UNPROCESSABLE_ENTITY,
            ..ok
        };
        let err = categorize_http_response(&url, client_error).unwrap_err();
        assert!(!err.is_retryable());
        assert!(matches!(err, FetchError::Status { .. }));
    }
}
