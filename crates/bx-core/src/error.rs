//! Typed error definitions for the BX execution system.
//!
//! Provides [`BxError`] for domain-specific errors that are more informative
//! than plain `anyhow::Error` strings. All variants implement `std::error::Error`
//! via `thiserror`, so they integrate seamlessly with `anyhow::Result`.

use thiserror::Error;

/// Domain-specific errors for the BX execution system.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BxError {
    /// Configuration parsing or validation error.
    #[error("config error: {0}")]
    Config(String),

    /// Transport-layer failure (connect, timeout, gateway error) that survived
    /// every retry.
    #[error("network error: {0}")]
    Network(String),

    /// The exchange answered with a non-zero `code`.
    #[error("exchange error {code}: {msg}")]
    Exchange { code: i64, msg: String },

    /// Response body could not be interpreted.
    #[error("decode error: {0}")]
    Decode(String),

    /// Position size could not be computed (bad stop distance, zero quantity).
    #[error("sizing error: {0}")]
    Sizing(String),

    /// A protective leg could not be placed after all retries.
    #[error("protection failure on {leg} leg: {message}")]
    ProtectionFailure { leg: String, message: String },

    /// Refused before any exchange I/O (risk gate, position limit, bad levels).
    #[error("rejected: {0}")]
    Rejected(String),

    /// The exchange client was closed.
    #[error("exchange client closed")]
    Closed,

    /// Unexpected internal failure (e.g. a panicked execution task).
    #[error("internal error: {0}")]
    Internal(String),
}

impl BxError {
    /// Exchange error code, if any.
    pub fn code(&self) -> Option<i64> {
        match self {
            Self::Exchange { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Whether a request that failed with this error may be re-sent.
    ///
    /// Transport failures always qualify; exchange errors only when their
    /// code is listed in `transient_codes`.
    pub fn is_transient(&self, transient_codes: &[i64]) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Exchange { code, .. } => transient_codes.contains(code),
            _ => false,
        }
    }
}

/// Result alias used across the library crates.
pub type BxResult<T> = Result<T, BxError>;
