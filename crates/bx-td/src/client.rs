//! The exchange client: rate limiting, signing, retry, and envelope handling
//! applied uniformly to every call.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bx_core::config::ExchangeConfig;
use bx_core::error::{BxError, BxResult};
use bx_core::time_util::now_ms;
use tracing::{debug, info, warn};

use crate::auth::Credentials;
use crate::rate_limit::RateLimiter;
use crate::request::{HttpMethod, Params, SignedRequest};
use crate::transport::{ReqwestTransport, Transport};

/// Exponential backoff: attempt `n` (0-based) waits `base * 2^n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(1u32 << attempt.min(16))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

/// Signed, rate-limited REST client.
///
/// One instance is constructed at startup and passed down to every component;
/// it owns its transport and releases it in [`close`](Self::close). All
/// methods take `&self` and are safe to call from multiple tasks.
pub struct ExchangeClient {
    credentials: Credentials,
    transport: Arc<dyn Transport>,
    limiter: RateLimiter,
    retry: RetryPolicy,
    transient_codes: Vec<i64>,
    closed: AtomicBool,
}

impl ExchangeClient {
    /// Build a client with a `reqwest` transport from configuration.
    pub fn new(config: &ExchangeConfig) -> Self {
        let transport = Arc::new(ReqwestTransport::new(
            config.effective_base_url(),
            Duration::from_secs(config.request_timeout_secs),
        ));
        Self::with_transport(
            Credentials::new(config.api_key.clone(), config.secret_key.clone()),
            transport,
            config,
        )
    }

    /// Build a client on an arbitrary transport.
    pub fn with_transport(
        credentials: Credentials,
        transport: Arc<dyn Transport>,
        config: &ExchangeConfig,
    ) -> Self {
        Self {
            credentials,
            transport,
            limiter: RateLimiter::new(
                config.rate_limit_per_min,
                Duration::from_secs(config.rate_window_secs),
            ),
            retry: RetryPolicy {
                max_retries: config.max_retries,
                base_delay: Duration::from_millis(config.retry_base_ms),
            },
            transient_codes: config.transient_codes.clone(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Issue one API call and return the unwrapped `data` payload.
    ///
    /// Transport failures and exchange errors whose code is in the transient
    /// set are retried with exponential backoff, re-signing each attempt with
    /// a fresh timestamp over the same parameters. Other exchange errors are
    /// returned immediately.
    pub async fn request(
        &self,
        method: HttpMethod,
        path: &str,
        params: Params,
        signed: bool,
    ) -> BxResult<serde_json::Value> {
        let call = SignedRequest::new(method, path, params, signed);
        let mut attempt = 0u32;

        loop {
            if self.is_closed() {
                return Err(BxError::Closed);
            }
            self.limiter.acquire().await;

            let wire = call.build(&self.credentials, now_ms());
            let outcome = match self.transport.send(&wire).await {
                Ok(body) => unwrap_envelope(body),
                Err(e) => Err(e),
            };

            match outcome {
                Ok(data) => {
                    if attempt > 0 {
                        debug!("[bx-td] {method} {path} succeeded after {} attempts", attempt + 1);
                    }
                    return Ok(data);
                }
                Err(e) if e.is_transient(&self.transient_codes) => {
                    if attempt >= self.retry.max_retries {
                        warn!(
                            "[bx-td] {method} {path} failed after {} attempts: {e}",
                            attempt + 1
                        );
                        return Err(e);
                    }
                    let delay = self.retry.delay(attempt);
                    warn!(
                        "[bx-td] {method} {path} attempt {}/{} failed: {e}; retrying in {delay:?}",
                        attempt + 1,
                        self.retry.max_retries + 1,
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    debug!("[bx-td] {method} {path} failed (not retried): {e}");
                    return Err(e);
                }
            }
        }
    }

    /// Release the transport. Subsequent requests fail with [`BxError::Closed`].
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.transport.close().await;
        info!("[bx-td] exchange client closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Split the `{code, msg, data}` envelope: `code == 0` yields `data`,
/// anything else becomes [`BxError::Exchange`].
pub(crate) fn unwrap_envelope(mut body: serde_json::Value) -> BxResult<serde_json::Value> {
    let code = match body.get("code") {
        Some(serde_json::Value::Number(n)) => n.as_i64(),
        Some(serde_json::Value::String(s)) => s.parse().ok(),
        _ => None,
    }
    .ok_or_else(|| BxError::Decode(format!("response without code: {body}")))?;

    if code != 0 {
        let msg = body
            .get("msg")
            .and_then(|m| m.as_str())
            .unwrap_or_default()
            .to_string();
        return Err(BxError::Exchange { code, msg });
    }
    Ok(body
        .get_mut("data")
        .map(serde_json::Value::take)
        .unwrap_or(serde_json::Value::Null))
}
