//! Resilient fetch layer.
//!
//! A retrying, rate-limit-aware request executor with no domain knowledge:
//! - 5xx and network-level failures retry on an exponential schedule
//!   (`min(initial_delay * 2^attempt, max_delay)`) up to `max_retries`.
//! - 429 responses consume a separate, larger budget and honor the server's
//!   retry hint when one is present, capped at `max_delay`. Exhausting the
//!   429 budget returns the last 429 response rather than an error.
//! - Any other 4xx is returned immediately without retrying.
//! - A cancellation token aborts in-flight waits and requests with a
//!   distinct outcome, never conflated with exhausted retries.

pub mod transport;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::sleep;

use crate::error::IngestError;
pub use transport::{FetchRequest, FetchResponse, HttpMethod, HttpTransport, ReqwestTransport};

/// Default per-request timeout for the production transport.
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Retry configuration for one fetch client.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Budget for 5xx and network-level failures.
    pub max_retries: u32,
    /// Separate budget for 429 responses.
    pub max_rate_limit_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_rate_limit_retries: 10,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(8000),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff delay for the given retry attempt (0-based).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self
            .initial_delay
            .saturating_mul(2u32.saturating_pow(attempt));
        exp.min(self.max_delay)
    }
}

/// Cooperative cancellation signal threaded through the fetch layer.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.inner.notify.notified();
            // Re-check after registering to close the notify race.
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Per-call options.
#[derive(Clone, Default)]
pub struct FetchOptions {
    pub cancel: Option<CancelToken>,
}

impl FetchOptions {
    pub fn with_cancel(token: CancelToken) -> Self {
        Self {
            cancel: Some(token),
        }
    }
}

/// Terminal fetch-layer failures. Status-code failures are not errors here:
/// the last non-2xx response is returned to the caller instead.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request cancelled")]
    Cancelled,
    #[error("network failure after {attempts} attempts: {message}")]
    Exhausted { attempts: u32, message: String },
}

impl From<FetchError> for IngestError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Cancelled => IngestError::Cancelled,
            FetchError::Exhausted { attempts, message } => {
                IngestError::TransientNetwork { attempts, message }
            }
        }
    }
}

/// Retrying request executor. Pure wrapper: no side effects beyond the
/// network calls and the sleeps they trigger.
pub struct FetchClient {
    transport: Arc<dyn HttpTransport>,
    policy: RetryPolicy,
}

impl FetchClient {
    /// Production client over reqwest with the default policy.
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self {
            transport: Arc::new(ReqwestTransport::new(Duration::from_secs(
                REQUEST_TIMEOUT_SECS,
            ))?),
            policy: RetryPolicy::default(),
        })
    }

    pub fn with_transport(transport: Arc<dyn HttpTransport>, policy: RetryPolicy) -> Self {
        Self { transport, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Execute a request with retries. Returns the terminal response for any
    /// HTTP status; errors only for cancellation or exhausted network
    /// failures.
    pub async fn execute(
        &self,
        request: &FetchRequest,
        options: &FetchOptions,
    ) -> Result<FetchResponse, FetchError> {
        let cancel = options.cancel.as_ref();
        let mut server_retries: u32 = 0;
        let mut rate_limit_retries: u32 = 0;
        let mut attempts: u32 = 0;

        loop {
            if cancel.map(|t| t.is_cancelled()).unwrap_or(false) {
                return Err(FetchError::Cancelled);
            }

            attempts += 1;
            let outcome = self.send_cancellable(request, cancel).await?;

            match outcome {
                Ok(response) if response.is_success() => return Ok(response),
                Ok(response) if response.status == 429 => {
                    if rate_limit_retries >= self.policy.max_rate_limit_retries {
                        log::warn!(
                            "Rate-limit budget exhausted for {} after {} attempts",
                            request.url,
                            attempts
                        );
                        return Ok(response);
                    }
                    let delay = parse_retry_hint(&response)
                        .unwrap_or_else(|| self.policy.backoff_delay(rate_limit_retries))
                        .min(self.policy.max_delay);
                    log::debug!(
                        "429 from {}, waiting {:?} (rate-limit retry {})",
                        request.url,
                        delay,
                        rate_limit_retries + 1
                    );
                    rate_limit_retries += 1;
                    self.wait_cancellable(delay, cancel).await?;
                }
                Ok(response) if (400..500).contains(&response.status) => {
                    // Client rejection: surfaced verbatim, never retried.
                    return Ok(response);
                }
                Ok(response) => {
                    // 5xx: standard budget.
                    if server_retries >= self.policy.max_retries {
                        log::warn!(
                            "Retry budget exhausted for {} with status {}",
                            request.url,
                            response.status
                        );
                        return Ok(response);
                    }
                    let delay = self.policy.backoff_delay(server_retries);
                    log::debug!(
                        "Status {} from {}, retrying in {:?}",
                        response.status,
                        request.url,
                        delay
                    );
                    server_retries += 1;
                    self.wait_cancellable(delay, cancel).await?;
                }
                Err(message) => {
                    if server_retries >= self.policy.max_retries {
                        return Err(FetchError::Exhausted { attempts, message });
                    }
                    let delay = self.policy.backoff_delay(server_retries);
                    log::debug!(
                        "Network failure for {} ({}), retrying in {:?}",
                        request.url,
                        message,
                        delay
                    );
                    server_retries += 1;
                    self.wait_cancellable(delay, cancel).await?;
                }
            }
        }
    }

    async fn send_cancellable(
        &self,
        request: &FetchRequest,
        cancel: Option<&CancelToken>,
    ) -> Result<Result<FetchResponse, String>, FetchError> {
        let send = self.transport.send(request);
        let result = match cancel {
            Some(token) => {
                tokio::select! {
                    _ = token.cancelled() => return Err(FetchError::Cancelled),
                    result = send => result,
                }
            }
            None => send.await,
        };
        Ok(result.map_err(|e| e.to_string()))
    }

    async fn wait_cancellable(
        &self,
        delay: Duration,
        cancel: Option<&CancelToken>,
    ) -> Result<(), FetchError> {
        match cancel {
            Some(token) => {
                tokio::select! {
                    _ = token.cancelled() => Err(FetchError::Cancelled),
                    _ = sleep(delay) => Ok(()),
                }
            }
            None => {
                sleep(delay).await;
                Ok(())
            }
        }
    }
}

/// Extract a retry hint from a 429 response.
///
/// Checks the `Retry-After` header (delta-seconds or HTTP-date), then falls
/// back to scanning the body for `retryDelay`/`retry in N` phrasing some
/// APIs embed in their error payloads.
pub fn parse_retry_hint(response: &FetchResponse) -> Option<Duration> {
    if let Some(value) = response.header("Retry-After") {
        let value = value.trim();
        if let Ok(secs) = value.parse::<u64>() {
            return Some(Duration::from_secs(secs));
        }
        if let Ok(at) = chrono::DateTime::parse_from_rfc2822(value) {
            let delta = at.with_timezone(&Utc) - Utc::now();
            return Some(delta.to_std().unwrap_or(Duration::ZERO));
        }
    }
    parse_body_retry_delay(&response.body).map(|secs| Duration::from_secs(secs as u64))
}

/// Parse retry delay from an error body (supports "4s", "4.5s", bare numbers).
fn parse_body_retry_delay(text: &str) -> Option<u32> {
    // "retryDelay": "Xs" pattern
    if let Some(idx) = text.find("retryDelay") {
        let after = &text[idx..];
        for word in after.split_whitespace().take(5) {
            let clean = word.trim_matches(|c: char| !c.is_numeric() && c != '.');
            if let Ok(secs) = clean.parse::<f64>() {
                return Some(secs.ceil() as u32);
            }
        }
    }
    // "retry in X" pattern
    if let Some(idx) = text.find("retry in") {
        let after = &text[idx + 8..];
        for word in after.split_whitespace().take(3) {
            let clean = word.trim_matches(|c: char| !c.is_numeric() && c != '.');
            if let Ok(secs) = clean.parse::<f64>() {
                return Some(secs.ceil() as u32);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;

    /// Scripted response for the mock transport.
    enum Script {
        Status(u16, Vec<(&'static str, &'static str)>, &'static str),
        NetworkError(&'static str),
    }

    struct MockTransport {
        script: Mutex<VecDeque<Script>>,
        attempts: AtomicU32,
    }

    impl MockTransport {
        fn new(script: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                attempts: AtomicU32::new(0),
            })
        }

        fn attempts(&self) -> u32 {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl HttpTransport for MockTransport {
        async fn send(&self, _request: &FetchRequest) -> anyhow::Result<FetchResponse> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let next = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .expect("mock transport script exhausted");
            match next {
                Script::Status(status, headers, body) => Ok(FetchResponse {
                    status,
                    headers: headers
                        .into_iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect::<HashMap<_, _>>(),
                    body: body.to_string(),
                }),
                Script::NetworkError(message) => Err(anyhow::anyhow!("{}", message)),
            }
        }
    }

    fn client(transport: Arc<MockTransport>, policy: RetryPolicy) -> FetchClient {
        FetchClient::with_transport(transport, policy)
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_failures_then_success_waits_1000_then_2000() {
        let transport = MockTransport::new(vec![
            Script::NetworkError("connection reset"),
            Script::NetworkError("connection reset"),
            Script::Status(200, vec![], "{}"),
        ]);
        let fetch = client(transport.clone(), RetryPolicy::default());

        let start = tokio::time::Instant::now();
        let response = fetch
            .execute(&FetchRequest::get("http://test/txs"), &FetchOptions::default())
            .await
            .unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(transport.attempts(), 3);
        assert_eq!(start.elapsed(), Duration::from_millis(3000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_caps_at_max_delay() {
        let transport = MockTransport::new(vec![
            Script::Status(500, vec![], ""),
            Script::Status(500, vec![], ""),
            Script::Status(500, vec![], ""),
            Script::Status(500, vec![], ""),
            Script::Status(200, vec![], "{}"),
        ]);
        let policy = RetryPolicy {
            max_retries: 4,
            ..RetryPolicy::default()
        };
        let fetch = client(transport.clone(), policy);

        let start = tokio::time::Instant::now();
        let response = fetch
            .execute(&FetchRequest::get("http://test/txs"), &FetchOptions::default())
            .await
            .unwrap();

        assert_eq!(response.status, 200);
        // 1000 + 2000 + 4000 + 8000 (capped)
        assert_eq!(start.elapsed(), Duration::from_millis(15_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_hint_capped_at_max_delay() {
        let transport = MockTransport::new(vec![
            Script::Status(429, vec![("Retry-After", "60")], ""),
            Script::Status(200, vec![], "{}"),
        ]);
        let fetch = client(transport.clone(), RetryPolicy::default());

        let start = tokio::time::Instant::now();
        let response = fetch
            .execute(&FetchRequest::get("http://test/txs"), &FetchOptions::default())
            .await
            .unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(transport.attempts(), 2);
        // 60s hint is capped at max_delay (8000ms), not honored in full.
        assert_eq!(start.elapsed(), Duration::from_millis(8000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_body_retry_hint_is_honored() {
        let transport = MockTransport::new(vec![
            Script::Status(429, vec![], r#"{"error":{"retryDelay": "3s"}}"#),
            Script::Status(200, vec![], "{}"),
        ]);
        let fetch = client(transport.clone(), RetryPolicy::default());

        let start = tokio::time::Instant::now();
        fetch
            .execute(&FetchRequest::get("http://test/txs"), &FetchOptions::default())
            .await
            .unwrap();

        assert_eq!(start.elapsed(), Duration::from_millis(3000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_budget_is_separate_and_returns_last_response() {
        // 429s far beyond the 5xx budget, then permanent 429s.
        let script: Vec<Script> = (0..11)
            .map(|_| Script::Status(429, vec![("Retry-After", "1")], "slow down"))
            .collect();
        let policy = RetryPolicy {
            max_retries: 0,
            max_rate_limit_retries: 10,
            ..RetryPolicy::default()
        };
        let transport = MockTransport::new(script);
        let fetch = client(transport.clone(), policy);

        let response = fetch
            .execute(&FetchRequest::get("http://test/txs"), &FetchOptions::default())
            .await
            .unwrap();

        // Exhausted 429 budget surfaces the last response, not an error.
        assert_eq!(response.status, 429);
        assert_eq!(response.body, "slow down");
        assert_eq!(transport.attempts(), 11);
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_error_is_returned_immediately() {
        let transport = MockTransport::new(vec![Script::Status(404, vec![], "not found")]);
        let fetch = client(transport.clone(), RetryPolicy::default());

        let start = tokio::time::Instant::now();
        let response = fetch
            .execute(&FetchRequest::get("http://test/txs"), &FetchOptions::default())
            .await
            .unwrap();

        assert_eq!(response.status, 404);
        assert_eq!(transport.attempts(), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_error_exhaustion_returns_last_response() {
        let transport = MockTransport::new(vec![
            Script::Status(503, vec![], "down"),
            Script::Status(502, vec![], "bad gateway"),
        ]);
        let policy = RetryPolicy {
            max_retries: 1,
            ..RetryPolicy::default()
        };
        let fetch = client(transport.clone(), policy);

        let response = fetch
            .execute(&FetchRequest::get("http://test/txs"), &FetchOptions::default())
            .await
            .unwrap();

        assert_eq!(response.status, 502);
        assert_eq!(transport.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_exhaustion_is_an_error() {
        let transport = MockTransport::new(vec![
            Script::NetworkError("dns failure"),
            Script::NetworkError("dns failure"),
            Script::NetworkError("dns failure"),
            Script::NetworkError("dns failure"),
        ]);
        let fetch = client(transport.clone(), RetryPolicy::default());

        let err = fetch
            .execute(&FetchRequest::get("http://test/txs"), &FetchOptions::default())
            .await
            .unwrap_err();

        match err {
            FetchError::Exhausted { attempts, message } => {
                assert_eq!(attempts, 4);
                assert!(message.contains("dns failure"));
            }
            other => panic!("expected Exhausted, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_during_backoff() {
        let transport = MockTransport::new(vec![
            Script::NetworkError("connection reset"),
            Script::Status(200, vec![], "{}"),
        ]);
        let fetch = client(transport.clone(), RetryPolicy::default());

        let token = CancelToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(500)).await;
            canceller.cancel();
        });

        let start = tokio::time::Instant::now();
        let err = fetch
            .execute(
                &FetchRequest::get("http://test/txs"),
                &FetchOptions::with_cancel(token),
            )
            .await
            .unwrap_err();

        // Cancelled mid-backoff, distinct from exhaustion.
        assert!(matches!(err, FetchError::Cancelled));
        assert_eq!(start.elapsed(), Duration::from_millis(500));
        assert_eq!(transport.attempts(), 1);
    }

    #[tokio::test]
    async fn test_pre_cancelled_token_short_circuits() {
        let transport = MockTransport::new(vec![Script::Status(200, vec![], "{}")]);
        let fetch = client(transport.clone(), RetryPolicy::default());

        let token = CancelToken::new();
        token.cancel();

        let err = fetch
            .execute(
                &FetchRequest::get("http://test/txs"),
                &FetchOptions::with_cancel(token),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::Cancelled));
        assert_eq!(transport.attempts(), 0);
    }

    #[test]
    fn test_parse_body_retry_delay() {
        assert_eq!(
            parse_body_retry_delay(r#""retryDelay": "4s""#),
            Some(4)
        );
        assert_eq!(
            parse_body_retry_delay(r#""retryDelay": "4.5s""#),
            Some(5)
        );
        assert_eq!(parse_body_retry_delay("please retry in 12 seconds"), Some(12));
        assert_eq!(parse_body_retry_delay("no hint here"), None);
    }

    #[test]
    fn test_backoff_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_delay(0), Duration::from_millis(1000));
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(2000));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(4000));
        assert_eq!(policy.backoff_delay(3), Duration::from_millis(8000));
        assert_eq!(policy.backoff_delay(10), Duration::from_millis(8000));
    }
}
