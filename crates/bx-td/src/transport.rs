//! HTTP transport seam.
//!
//! [`ExchangeClient`](crate::ExchangeClient) talks to the network only through
//! the [`Transport`] trait, which returns the parsed JSON body (the
//! `{code, msg, data}` envelope) or a transport-level error. Production uses
//! [`ReqwestTransport`]; tests use the scripted mock behind the `test-util`
//! feature.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bx_core::error::{BxError, BxResult};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::auth::API_KEY_HEADER;
use crate::request::{HttpMethod, HttpRequest};

/// Sends one built request and returns the decoded JSON body.
///
/// Implementations map connection failures, timeouts, and gateway errors
/// without a JSON body to [`BxError::Network`], and unreadable bodies to
/// [`BxError::Decode`].
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &HttpRequest) -> BxResult<serde_json::Value>;

    /// Release the underlying session. Later sends fail with [`BxError::Closed`].
    async fn close(&self);
}

/// `reqwest`-backed transport.
///
/// The HTTP session is built on first use and cached until [`close`](Transport::close).
pub struct ReqwestTransport {
    base_url: String,
    timeout: Duration,
    session: Mutex<Option<reqwest::Client>>,
    closed: AtomicBool,
}

impl ReqwestTransport {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            base_url: base_url.into(),
            timeout,
            session: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn session(&self) -> BxResult<reqwest::Client> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BxError::Closed);
        }
        let mut guard = self.session.lock().await;
        if let Some(client) = guard.as_ref() {
            return Ok(client.clone());
        }
        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| BxError::Network(format!("failed to build HTTP client: {e}")))?;
        debug!("[transport] HTTP session created for {}", self.base_url);
        *guard = Some(client.clone());
        Ok(client)
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: &HttpRequest) -> BxResult<serde_json::Value> {
        let http = self.session().await?;
        let url = request.url(&self.base_url);

        let mut builder = match request.method {
            HttpMethod::Get => http.get(&url),
            HttpMethod::Post => http.post(&url),
            HttpMethod::Delete => http.delete(&url),
        };
        if let Some(key) = &request.api_key {
            builder = builder.header(API_KEY_HEADER, key);
        }

        let resp = builder
            .send()
            .await
            .map_err(|e| BxError::Network(format!("{} {}: {e}", request.method, request.path)))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| BxError::Network(format!("reading body of {}: {e}", request.path)))?;

        match serde_json::from_str::<serde_json::Value>(&text) {
            Ok(body) => Ok(body),
            Err(_) if status.is_server_error() || status.as_u16() == 429 => {
                Err(BxError::Network(format!("HTTP {status} on {}", request.path)))
            }
            Err(e) => {
                let snippet: String = text.chars().take(200).collect();
                Err(BxError::Decode(format!("HTTP {status} on {}: {e}: {snippet}", request.path)))
            }
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if self.session.lock().await.take().is_some() {
            info!("[transport] HTTP session released");
        }
    }
}
