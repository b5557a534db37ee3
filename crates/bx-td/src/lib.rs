//! # bx-td
//!
//! Exchange I/O for the perpetual-swap REST API. Every call goes through one
//! [`ExchangeClient`], which applies uniformly:
//!
//! - **rate limiting** (`rate_limit`): sliding 60 s window, sleeps for the exact deficit
//! - **signing** (`auth`, `request`): HMAC-SHA256 over the sorted query string
//! - **retry** (`client`): exponential backoff for transport failures and
//!   transient exchange codes, immediate failure for everything else
//! - **envelope handling**: `{code, msg, data}` unwrapped to `data` or `BxError::Exchange`
//!
//! Typed endpoint wrappers live in `endpoints`. The network is reached only
//! through the [`Transport`] trait; enable the `test-util` feature for the
//! scripted `mock::MockTransport`.

pub mod auth;
pub mod client;
pub mod endpoints;
pub mod rate_limit;
pub mod request;
pub mod transport;

#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use auth::Credentials;
pub use client::{ExchangeClient, RetryPolicy};
pub use request::{HttpMethod, HttpRequest, Params};
pub use transport::{ReqwestTransport, Transport};
