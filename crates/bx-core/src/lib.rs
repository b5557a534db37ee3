//! # bx-core
//!
//! Core crate for the BX perpetual-futures execution system, providing:
//!
//! - **Types** (`types`): enums, order/position structs, strategy signals
//! - **Configuration** (`config`): JSON config deserialization and validation
//! - **Error types** (`error`): domain-specific `BxError` via thiserror
//! - **Time utilities** (`time_util`): wall-clock timestamps for signing
//! - **Logging** (`logging`): tracing-based structured logging

pub mod config;
pub mod error;
pub mod logging;
pub mod time_util;
pub mod types;

// Re-export types at crate root for convenience.
pub use error::{BxError, BxResult};
pub use types::*;
