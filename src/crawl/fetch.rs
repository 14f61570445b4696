use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::{header, Client};
use thiserror::Error;
use tokio::{sync::Semaphore, time::sleep};
use url::Url;

use crate::config::FetchConfig;

/// Statuses that often come from broken or renegotiated certificate chains;
/// they earn one retry with verification disabled.
const TLS_RETRY_STATUSES: [u16; 5] = [401, 403, 495, 496, 497];

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("connection dropped: {0}")]
    Disconnected(String),
    #[error("request failed: {0}")]
    Request(String),
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TransportError::Request(_))
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("unsupported url `{0}`")]
    InvalidUrl(String),
    #[error("{url} failed after {attempts} attempt(s): {source}")]
    Exhausted {
        url: String,
        attempts: u32,
        #[source]
        source: TransportError,
    },
    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("fetch limiter closed")]
    LimiterClosed,
}

#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub body: String,
}

#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    pub body: String,
    pub attempts: u32,
}

/// One HTTP GET against the network, with no retry policy of its own.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(
        &self,
        url: &Url,
        timeout: Duration,
        verify_tls: bool,
    ) -> Result<RawResponse, TransportError>;
}

pub struct ReqwestTransport {
    strict: Client,
    lenient: Client,
}

impl ReqwestTransport {
    pub fn new(config: &FetchConfig) -> anyhow::Result<Self> {
        Ok(Self {
            strict: build_client(config, false)?,
            lenient: build_client(config, true)?,
        })
    }
}

fn build_client(config: &FetchConfig, accept_invalid_certs: bool) -> anyhow::Result<Client> {
    let mut headers = header::HeaderMap::new();
    headers.insert(
        header::ACCEPT,
        header::HeaderValue::from_static(
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8",
        ),
    );
    headers.insert(
        header::ACCEPT_LANGUAGE,
        header::HeaderValue::from_static("en-US,en;q=0.5"),
    );
    headers.insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("max-age=0"),
    );
    let client = Client::builder()
        .user_agent(config.user_agent.clone())
        .default_headers(headers)
        .redirect(reqwest::redirect::Policy::limited(10))
        .danger_accept_invalid_certs(accept_invalid_certs)
        .build()?;
    Ok(client)
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn get(
        &self,
        url: &Url,
        timeout: Duration,
        verify_tls: bool,
    ) -> Result<RawResponse, TransportError> {
        let client = if verify_tls { &self.strict } else { &self.lenient };
        let response = client
            .get(url.clone())
            .timeout(timeout)
            .send()
            .await
            .map_err(classify)?;
        let status = response.status().as_u16();
        let body = if response.status().is_success() {
            response.text().await.map_err(classify)?
        } else {
            String::new()
        };
        Ok(RawResponse { status, body })
    }
}

fn classify(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else if err.is_body() || err.is_request() || err.is_decode() {
        TransportError::Disconnected(err.to_string())
    } else {
        TransportError::Request(err.to_string())
    }
}

/// Issues GETs under a process-wide concurrency limit with retry, jittered
/// exponential backoff and a one-shot TLS-verification fallback.
pub struct FetchClient {
    transport: Arc<dyn Transport>,
    limiter: Arc<Semaphore>,
    max_retries: u32,
    backoff_base: Duration,
    default_timeout: Duration,
}

impl FetchClient {
    pub fn new(transport: Arc<dyn Transport>, config: &FetchConfig) -> Self {
        Self {
            transport,
            limiter: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            max_retries: config.max_retries,
            backoff_base: config.backoff_base,
            default_timeout: config.timeout,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn available_slots(&self) -> usize {
        self.limiter.available_permits()
    }

    pub async fn fetch(
        &self,
        raw_url: &str,
        timeout: Duration,
        verify_tls: bool,
    ) -> Result<FetchResponse, FetchError> {
        let url = match Url::parse(raw_url) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => url,
            _ => return Err(FetchError::InvalidUrl(raw_url.to_string())),
        };

        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|_| FetchError::LimiterClosed)?;

        let mut verify = verify_tls;
        let mut attempt: u32 = 0;
        loop {
            tracing::debug!(
                target: "fetch",
                url = %url,
                attempt = attempt + 1,
                max_attempts = self.max_retries + 1,
                verify_tls = verify,
                "fetching"
            );
            match self.transport.get(&url, timeout, verify).await {
                Ok(response) if (200..300).contains(&response.status) => {
                    return Ok(FetchResponse {
                        status: response.status,
                        body: response.body,
                        attempts: attempt + 1,
                    });
                }
                Ok(response)
                    if verify
                        && TLS_RETRY_STATUSES.contains(&response.status)
                        && attempt < self.max_retries =>
                {
                    tracing::info!(
                        target: "fetch",
                        url = %url,
                        status = response.status,
                        "retrying without TLS verification"
                    );
                    verify = false;
                    attempt += 1;
                }
                Ok(response) => {
                    tracing::warn!(target: "fetch", url = %url, status = response.status, "HTTP error");
                    return Err(FetchError::Status {
                        url: url.to_string(),
                        status: response.status,
                    });
                }
                Err(err) if err.is_retryable() && attempt < self.max_retries => {
                    let delay = backoff_delay(self.backoff_base, attempt, rand::random::<f64>());
                    tracing::warn!(
                        target: "fetch",
                        url = %url,
                        error = %err,
                        retry_in_ms = delay.as_millis() as u64,
                        "request error; retrying"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    tracing::error!(
                        target: "fetch",
                        url = %url,
                        attempts = attempt + 1,
                        error = %err,
                        "giving up"
                    );
                    return Err(FetchError::Exhausted {
                        url: url.to_string(),
                        attempts: attempt + 1,
                        source: err,
                    });
                }
            }
        }
    }
}

/// `base * 2^attempt * (0.5 + jitter)` with `jitter` in `[0, 1)`.
pub fn backoff_delay(base: Duration, attempt: u32, jitter: f64) -> Duration {
    let factor = 2f64.powi(attempt.min(16) as i32) * (0.5 + jitter.clamp(0.0, 1.0));
    base.mul_f64(factor)
}

#[cfg(test)]
pub(crate) mod testing {
    use std::{
        collections::HashMap,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use parking_lot::Mutex;

    use super::*;

    /// Scripted network: per-URL queue of outcomes; the last outcome repeats.
    #[derive(Default)]
    pub struct ScriptedTransport {
        scripts: Mutex<HashMap<String, Vec<Result<RawResponse, TransportError>>>>,
        pub calls: Mutex<Vec<(String, bool)>>,
        pub latency: Duration,
        in_flight: AtomicUsize,
        pub max_in_flight: AtomicUsize,
    }

    impl ScriptedTransport {
        pub fn with_latency(latency: Duration) -> Self {
            Self {
                latency,
                ..Default::default()
            }
        }

        pub fn script(&self, url: &str, outcomes: Vec<Result<RawResponse, TransportError>>) {
            self.scripts.lock().insert(url.to_string(), outcomes);
        }

        pub fn ok(url: &str, html: &str) -> (String, Vec<Result<RawResponse, TransportError>>) {
            (
                url.to_string(),
                vec![Ok(RawResponse {
                    status: 200,
                    body: html.to_string(),
                })],
            )
        }

        pub fn calls_for(&self, url: &str) -> usize {
            self.calls.lock().iter().filter(|(u, _)| u == url).count()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn get(
            &self,
            url: &Url,
            _timeout: Duration,
            verify_tls: bool,
        ) -> Result<RawResponse, TransportError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            self.calls.lock().push((url.to_string(), verify_tls));
            if !self.latency.is_zero() {
                sleep(self.latency).await;
            }
            let outcome = {
                let mut scripts = self.scripts.lock();
                match scripts.get_mut(url.as_str()) {
                    Some(queue) if queue.len() > 1 => queue.remove(0),
                    Some(queue) if queue.len() == 1 => queue[0].clone(),
                    _ => Err(TransportError::Connect("connection refused".to_string())),
                }
            };
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            outcome
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use tokio::time::Instant;

    use super::{testing::ScriptedTransport, *};

    fn client(transport: Arc<ScriptedTransport>, max_concurrency: usize) -> FetchClient {
        let config = FetchConfig {
            max_concurrency,
            max_retries: 3,
            backoff_base: Duration::from_secs(1),
            timeout: Duration::from_secs(30),
            ..FetchConfig::default()
        };
        FetchClient::new(transport, &config)
    }

    fn status(code: u16) -> Result<RawResponse, TransportError> {
        Ok(RawResponse {
            status: code,
            body: String::new(),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn connection_refused_is_tried_max_retries_plus_one() {
        let transport = Arc::new(ScriptedTransport::default());
        let fetcher = client(transport.clone(), 5);
        let started = Instant::now();

        let err = fetcher
            .fetch("https://down.example/", Duration::from_secs(30), true)
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::Exhausted { attempts: 4, .. }));
        assert_eq!(transport.calls_for("https://down.example/"), 4);
        // 1 + 2 + 4 seconds of backoff, each scaled by a jitter in [0.5, 1.5)
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(3_500), "{waited:?}");
        assert!(waited < Duration::from_millis(10_500), "{waited:?}");
    }

    #[test]
    fn backoff_grows_geometrically() {
        let base = Duration::from_secs(1);
        let delays: Vec<_> = (0..4).map(|a| backoff_delay(base, a, 0.5)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8)
            ]
        );
        assert_eq!(backoff_delay(base, 0, 0.0), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn forbidden_retries_once_without_tls_verification() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.script(
            "https://selfsigned.example/",
            vec![
                status(403),
                Ok(RawResponse {
                    status: 200,
                    body: "<html></html>".to_string(),
                }),
            ],
        );
        let fetcher = client(transport.clone(), 5);

        let response = fetcher
            .fetch("https://selfsigned.example/", Duration::from_secs(30), true)
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.attempts, 2);
        let calls = transport.calls.lock().clone();
        assert_eq!(calls[0].1, true);
        assert_eq!(calls[1].1, false);
    }

    #[tokio::test(start_paused = true)]
    async fn tls_fallback_happens_only_once() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.script("https://locked.example/", vec![status(401)]);
        let fetcher = client(transport.clone(), 5);

        let err = fetcher
            .fetch("https://locked.example/", Duration::from_secs(30), true)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Status { status: 401, .. }));
        assert_eq!(transport.calls_for("https://locked.example/"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn definitive_statuses_are_not_retried() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.script("https://gone.example/", vec![status(404)]);
        transport.script("https://ok.example/", vec![status(200)]);
        let fetcher = client(transport.clone(), 5);

        assert!(fetcher
            .fetch("https://gone.example/", Duration::from_secs(30), true)
            .await
            .is_err());
        assert!(fetcher
            .fetch("https://ok.example/", Duration::from_secs(30), true)
            .await
            .is_ok());
        assert_eq!(transport.calls_for("https://gone.example/"), 1);
        assert_eq!(transport.calls_for("https://ok.example/"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_requests_never_exceed_limit() {
        let transport = Arc::new(ScriptedTransport::with_latency(Duration::from_millis(200)));
        let urls: Vec<String> = (0..20).map(|i| format!("https://site{i}.example/")).collect();
        for url in &urls {
            transport.script(url, vec![status(200)]);
        }
        let fetcher = Arc::new(client(transport.clone(), 3));

        let tasks: Vec<_> = urls
            .iter()
            .cloned()
            .map(|url| {
                let fetcher = fetcher.clone();
                tokio::spawn(async move {
                    fetcher.fetch(&url, Duration::from_secs(30), true).await
                })
            })
            .collect();
        for result in futures::future::join_all(tasks).await {
            assert!(result.unwrap().is_ok());
        }

        assert_eq!(transport.max_in_flight.load(Ordering::SeqCst), 3);
        assert_eq!(fetcher.available_slots(), 3);
    }

    #[tokio::test]
    async fn rejects_non_http_urls() {
        let fetcher = client(Arc::new(ScriptedTransport::default()), 1);
        let err = fetcher
            .fetch("mailto:someone@example.com", Duration::from_secs(1), true)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::InvalidUrl(_)));
    }
}
