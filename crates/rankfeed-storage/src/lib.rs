//! HTTP fetch utilities, browser identity pools and session bootstrap.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use rand::seq::IndexedRandom;
use reqwest::header::{
    HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, COOKIE, REFERER, SET_COOKIE, USER_AGENT,
};
use reqwest::StatusCode;
use thiserror::Error;
use tracing::{debug, info, info_span, Instrument};

pub const CRATE_NAME: &str = "rankfeed-storage";

pub const ACCEPT_HTML: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";
pub const ACCEPT_JSON: &str = "application/json, text/plain, */*";

pub const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36 Edg/124.0.2478.67",
];

pub const ACCEPT_LANGUAGES: &[&str] = &[
    "en-US,en;q=0.9",
    "en-GB,en;q=0.9,en-US;q=0.8",
    "en-US,en;q=0.8,es;q=0.6",
    "en-CA,en;q=0.9,fr-CA;q=0.7",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_agent: String,
    pub accept_language: String,
}

/// Draws a user-agent and accept-language pair from the fixed pools.
pub fn random_identity() -> Identity {
    let mut rng = rand::rng();
    Identity {
        user_agent: USER_AGENTS.choose(&mut rng).copied().unwrap_or(USER_AGENTS[0]).to_string(),
        accept_language: ACCEPT_LANGUAGES
            .choose(&mut rng)
            .copied()
            .unwrap_or(ACCEPT_LANGUAGES[0])
            .to_string(),
    }
}

/// Browser-like request headers. An empty cookie is left off entirely.
pub fn browser_headers(
    identity: &Identity,
    accept: &str,
    referer: &str,
    cookie: Option<&str>,
) -> Result<HeaderMap, FetchError> {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, header_value(&identity.user_agent)?);
    headers.insert(ACCEPT_LANGUAGE, header_value(&identity.accept_language)?);
    headers.insert(ACCEPT, header_value(accept)?);
    headers.insert(REFERER, header_value(referer)?);
    if let Some(cookie) = cookie.filter(|c| !c.is_empty()) {
        headers.insert(COOKIE, header_value(cookie)?);
    }
    Ok(headers)
}

fn header_value(value: &str) -> Result<HeaderValue, FetchError> {
    HeaderValue::from_str(value).map_err(|err| FetchError::InvalidHeader(err.to_string()))
}

/// Joins the `name=value` part of every `Set-Cookie` into one `Cookie` header value.
pub fn cookie_header_from_set_cookies(set_cookies: &[String]) -> String {
    set_cookies
        .iter()
        .filter_map(|raw| raw.split(';').next())
        .map(str::trim)
        .filter(|pair| pair.contains('='))
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Transport-level retry policy. `max_retries == 0` means one attempt per request,
/// leaving retries of failed pages to the caller.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
    pub set_cookies: Vec<String>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid header value: {0}")]
    InvalidHeader(String),
    #[error("invalid url: {0}")]
    InvalidUrl(String),
}

/// Thin reqwest wrapper: per-request headers, timeout, optional status/connect retries.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()
            .context("building reqwest client")?;

        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn get(&self, url: &str, headers: HeaderMap) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0;
        loop {
            let resp_result = self.client.get(url).headers(headers.clone()).send().await;
            let can_retry = attempt < self.backoff.max_retries;

            match resp_result {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let set_cookies = resp
                            .headers()
                            .get_all(SET_COOKIE)
                            .iter()
                            .filter_map(|v| v.to_str().ok())
                            .map(str::to_owned)
                            .collect();
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                            set_cookies,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable && can_retry {
                        debug!(%status, attempt, url, "retrying after status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable && can_retry {
                        debug!(error = %err, attempt, url, "retrying after request error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

/// Identity material shared by every page request of one bulk run.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionContext {
    pub cookie: String,
    pub user_agent: String,
    pub accept_language: String,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("session bootstrap against {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: FetchError,
    },
}

#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn acquire_session(&self) -> Result<SessionContext, BootstrapError>;
}

/// Obtains a session cookie by loading the human-facing ranking page once.
#[derive(Debug, Clone)]
pub struct SessionBootstrapper {
    http: Arc<HttpFetcher>,
    bootstrap_url: String,
    referer: String,
}

impl SessionBootstrapper {
    pub fn new(
        http: Arc<HttpFetcher>,
        bootstrap_url: impl Into<String>,
        referer: impl Into<String>,
    ) -> Self {
        Self {
            http,
            bootstrap_url: bootstrap_url.into(),
            referer: referer.into(),
        }
    }
}

#[async_trait]
impl SessionProvider for SessionBootstrapper {
    async fn acquire_session(&self) -> Result<SessionContext, BootstrapError> {
        let identity = random_identity();
        let url = self.bootstrap_url.clone();
        let wrap = |source| BootstrapError::Request {
            url: url.clone(),
            source,
        };

        let headers = browser_headers(&identity, ACCEPT_HTML, &self.referer, None).map_err(wrap)?;
        let resp = self
            .http
            .get(&self.bootstrap_url, headers)
            .instrument(info_span!("session_bootstrap", url = %self.bootstrap_url))
            .await
            .map_err(wrap)?;

        let cookie = cookie_header_from_set_cookies(&resp.set_cookies);
        info!(cookies = resp.set_cookies.len(), "session bootstrap complete");
        Ok(SessionContext {
            cookie,
            user_agent: identity.user_agent,
            accept_language: identity.accept_language,
        })
    }
}

/// Hands out a fixed session; used for offline fixture runs.
#[derive(Debug, Clone, Default)]
pub struct StaticSession(pub SessionContext);

#[async_trait]
impl SessionProvider for StaticSession {
    async fn acquire_session(&self) -> Result<SessionContext, BootstrapError> {
        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::http::header::SET_COOKIE as AXUM_SET_COOKIE;
    use axum::http::{HeaderMap as AxumHeaderMap, StatusCode as AxumStatus};
    use axum::response::{AppendHeaders, IntoResponse};
    use axum::routing::get;
    use axum::Router;
    use tokio::net::TcpListener;

    async fn spawn_upstream(router: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn fetcher(max_retries: usize) -> Arc<HttpFetcher> {
        Arc::new(
            HttpFetcher::new(HttpClientConfig {
                timeout: Duration::from_secs(5),
                backoff: BackoffPolicy {
                    max_retries,
                    base_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(5),
                },
            })
            .unwrap(),
        )
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn cookie_header_keeps_only_name_value_pairs() {
        let set_cookies = vec![
            "sid=abc123; Path=/; HttpOnly".to_string(),
            "region=na; Secure".to_string(),
            "garbage".to_string(),
        ];
        assert_eq!(cookie_header_from_set_cookies(&set_cookies), "sid=abc123; region=na");
        assert_eq!(cookie_header_from_set_cookies(&[]), "");
    }

    #[test]
    fn identity_is_drawn_from_pools() {
        for _ in 0..20 {
            let identity = random_identity();
            assert!(USER_AGENTS.contains(&identity.user_agent.as_str()));
            assert!(ACCEPT_LANGUAGES.contains(&identity.accept_language.as_str()));
        }
    }

    #[test]
    fn empty_cookie_is_not_sent() {
        let identity = random_identity();
        let headers = browser_headers(&identity, ACCEPT_JSON, "https://ref.example/", Some("")).unwrap();
        assert!(headers.get(COOKIE).is_none());
        assert_eq!(headers.get(REFERER).unwrap(), "https://ref.example/");

        let headers =
            browser_headers(&identity, ACCEPT_JSON, "https://ref.example/", Some("sid=1")).unwrap();
        assert_eq!(headers.get(COOKIE).unwrap(), "sid=1");
    }

    #[tokio::test]
    async fn bootstrap_joins_all_set_cookie_values() {
        let router = Router::new().route(
            "/rankings",
            get(|headers: AxumHeaderMap| async move {
                assert!(headers.get("user-agent").is_some());
                assert!(headers.get("referer").is_some());
                (
                    AppendHeaders([
                        (AXUM_SET_COOKIE, "sid=abc; Path=/; HttpOnly"),
                        (AXUM_SET_COOKIE, "bm=xyz; Secure"),
                    ]),
                    "<html></html>",
                )
                    .into_response()
            }),
        );
        let base = spawn_upstream(router).await;
        let bootstrapper =
            SessionBootstrapper::new(fetcher(0), format!("{base}/rankings"), "https://ref.example/");

        let session = bootstrapper.acquire_session().await.unwrap();
        assert_eq!(session.cookie, "sid=abc; bm=xyz");
        assert!(USER_AGENTS.contains(&session.user_agent.as_str()));
    }

    #[tokio::test]
    async fn bootstrap_failure_is_a_bootstrap_error() {
        let router = Router::new().route("/rankings", get(|| async { AxumStatus::FORBIDDEN }));
        let base = spawn_upstream(router).await;
        let bootstrapper =
            SessionBootstrapper::new(fetcher(0), format!("{base}/rankings"), "https://ref.example/");

        let err = bootstrapper.acquire_session().await.unwrap_err();
        match err {
            BootstrapError::Request { source: FetchError::HttpStatus { status, .. }, .. } => {
                assert_eq!(status, 403)
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn server_errors_are_retried_only_when_configured() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let router = Router::new().route(
            "/flaky",
            get(move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        AxumStatus::SERVICE_UNAVAILABLE.into_response()
                    } else {
                        "ok".into_response()
                    }
                }
            }),
        );
        let base = spawn_upstream(router).await;
        let url = format!("{base}/flaky");

        let err = fetcher(0).get(&url, HeaderMap::new()).await.unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus { status: 503, .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        hits.store(0, Ordering::SeqCst);
        let resp = fetcher(2).get(&url, HeaderMap::new()).await.unwrap();
        assert_eq!(resp.body, b"ok");
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
