//! Configuration parsing for the execution system.
//!
//! All components read their settings from a single JSON config file. Every
//! field except the credentials has a default, so a minimal file is:
//!
//! ```json
//! {
//!   "exchange": { "api_key": "...", "secret_key": "...", "sandbox": true },
//!   "runner": { "symbols": ["BTC-USDT"], "inbox_dir": "/var/lib/bx/inbox" }
//! }
//! ```
//!
//! Credentials left empty in the file are taken from the `BX_API_KEY` and
//! `BX_SECRET_KEY` environment variables.

use std::collections::HashMap;

use serde::Deserialize;

use crate::error::BxError;
use crate::types::{MarginMode, SizingMode, WorkingType};

/// Production REST endpoint.
pub const PRODUCTION_URL: &str = "https://open-api.bingx.com";
/// Sandbox (virtual funds) REST endpoint.
pub const SANDBOX_URL: &str = "https://open-api-vst.bingx.com";

/// Top-level application config, deserialized from a JSON file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub exchange: ExchangeConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub pending: PendingConfig,
    #[serde(default)]
    pub positions: PositionsConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
}

impl AppConfig {
    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), BxError> {
        if self.exchange.api_key.is_empty() || self.exchange.secret_key.is_empty() {
            return Err(BxError::Config("api_key and secret_key are required".into()));
        }
        if self.exchange.rate_limit_per_min == 0 {
            return Err(BxError::Config("rate_limit_per_min must be positive".into()));
        }
        match self.execution.sizing {
            SizingMode::FixedNotional { notional } if notional <= 0.0 => {
                return Err(BxError::Config("fixed notional must be positive".into()));
            }
            SizingMode::RiskPercent { percent } if !(percent > 0.0 && percent <= 100.0) => {
                return Err(BxError::Config("risk percent must be in (0, 100]".into()));
            }
            _ => {}
        }
        if self.execution.leverage == 0 {
            return Err(BxError::Config("leverage must be at least 1".into()));
        }
        if self.runner.tick_interval_secs == 0 {
            return Err(BxError::Config("tick_interval_secs must be positive".into()));
        }
        Ok(())
    }

    /// Fill empty credentials from `BX_API_KEY` / `BX_SECRET_KEY`.
    pub fn apply_env(&mut self) {
        if self.exchange.api_key.is_empty() {
            if let Ok(key) = std::env::var("BX_API_KEY") {
                self.exchange.api_key = key;
            }
        }
        if self.exchange.secret_key.is_empty() {
            if let Ok(secret) = std::env::var("BX_SECRET_KEY") {
                self.exchange.secret_key = secret;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Exchange client
// ---------------------------------------------------------------------------

/// Exchange connectivity, authentication, rate limiting and retry.
#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeConfig {
    /// API key (sent in the `X-BX-APIKEY` header).
    #[serde(default)]
    pub api_key: String,

    /// API secret (HMAC-SHA256 signing, never transmitted).
    #[serde(default)]
    pub secret_key: String,

    /// Use the sandbox endpoint instead of production.
    #[serde(default)]
    pub sandbox: bool,

    /// Explicit REST base URL, overriding `sandbox`.
    #[serde(default)]
    pub base_url: Option<String>,

    /// Request budget per rate window.
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_min: usize,

    /// Length of the rate window in seconds.
    #[serde(default = "default_rate_window")]
    pub rate_window_secs: u64,

    /// Retries after the first attempt for transient failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base backoff delay; attempt `n` waits `base * 2^n`.
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,

    /// Per-request HTTP timeout.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Exchange error codes that are retried like transport failures
    /// (rate limit, timestamp/nonce rejection, server busy).
    #[serde(default = "default_transient_codes")]
    pub transient_codes: Vec<i64>,
}

impl ExchangeConfig {
    /// Returns the effective REST base URL.
    pub fn effective_base_url(&self) -> String {
        match &self.base_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None if self.sandbox => SANDBOX_URL.to_string(),
            None => PRODUCTION_URL.to_string(),
        }
    }
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            secret_key: String::new(),
            sandbox: false,
            base_url: None,
            rate_limit_per_min: default_rate_limit(),
            rate_window_secs: default_rate_window(),
            max_retries: default_max_retries(),
            retry_base_ms: default_retry_base_ms(),
            request_timeout_secs: default_request_timeout(),
            transient_codes: default_transient_codes(),
        }
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// Order placement protocol settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default)]
    pub sizing: SizingMode,

    /// Leverage applied to every traded symbol at startup.
    #[serde(default = "default_leverage")]
    pub leverage: u32,

    #[serde(default)]
    pub margin_mode: MarginMode,

    /// Retries after the first attempt for each protective leg.
    #[serde(default = "default_max_retries")]
    pub protection_retries: u32,

    /// Fixed pause between protective-leg attempts.
    #[serde(default = "default_protection_pause_ms")]
    pub protection_retry_pause_ms: u64,

    /// Retries after the first attempt for the rollback flatten order.
    #[serde(default = "default_max_retries")]
    pub flatten_retries: u32,

    /// Trigger price reference for stop-loss / take-profit legs.
    #[serde(default)]
    pub working_type: WorkingType,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            sizing: SizingMode::default(),
            leverage: default_leverage(),
            margin_mode: MarginMode::default(),
            protection_retries: default_max_retries(),
            protection_retry_pause_ms: default_protection_pause_ms(),
            flatten_retries: default_max_retries(),
            working_type: WorkingType::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Pending limit orders
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct PendingConfig {
    /// Bars a limit order may rest when the request does not say.
    #[serde(default = "default_max_wait_bars")]
    pub default_max_wait_bars: u64,

    /// Allow a strategy more than one resting limit order at a time.
    #[serde(default = "default_true")]
    pub allow_multiple_per_strategy: bool,

    /// Attach stop-loss / take-profit as conditional legs of the limit order.
    /// When off, the legs are placed separately after the fill.
    #[serde(default = "default_true")]
    pub attach_protection: bool,
}

impl Default for PendingConfig {
    fn default() -> Self {
        Self {
            default_max_wait_bars: default_max_wait_bars(),
            allow_multiple_per_strategy: true,
            attach_protection: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Position limits
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct PositionsConfig {
    /// Concurrent positions allowed per strategy unless overridden.
    #[serde(default = "default_max_per_strategy")]
    pub default_max_per_strategy: usize,

    /// Per-strategy overrides.
    #[serde(default)]
    pub max_per_strategy: HashMap<String, usize>,
}

impl PositionsConfig {
    /// Returns the concurrent-position limit for `strategy`.
    pub fn limit_for(&self, strategy: &str) -> usize {
        self.max_per_strategy
            .get(strategy)
            .copied()
            .unwrap_or(self.default_max_per_strategy)
    }
}

impl Default for PositionsConfig {
    fn default() -> Self {
        Self {
            default_max_per_strategy: default_max_per_strategy(),
            max_per_strategy: HashMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct RunnerConfig {
    /// Log file prefix.
    #[serde(default = "default_module_name")]
    pub module_name: String,

    /// Directory for daily-rotated log files.
    #[serde(default)]
    pub log_path: Option<String>,

    /// Scheduler cadence; one tick is one bar.
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,

    /// Symbols configured (leverage, margin mode) at startup.
    #[serde(default)]
    pub symbols: Vec<String>,

    /// Directory polled for JSON signal files.
    #[serde(default)]
    pub inbox_dir: Option<String>,

    /// Flatten every open position on shutdown.
    #[serde(default)]
    pub close_positions_on_shutdown: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            module_name: default_module_name(),
            log_path: None,
            tick_interval_secs: default_tick_interval(),
            symbols: Vec::new(),
            inbox_dir: None,
            close_positions_on_shutdown: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Default helpers (used by serde)
// ---------------------------------------------------------------------------

fn default_rate_limit() -> usize {
    1200
}

fn default_rate_window() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_ms() -> u64 {
    1000
}

fn default_request_timeout() -> u64 {
    10
}

fn default_transient_codes() -> Vec<i64> {
    // 100410 rate limited, 100421 timestamp/nonce invalid, 109400 timestamp
    // outside recv window, 100500 internal error, 100503 server busy.
    vec![100410, 100421, 109400, 100500, 100503]
}

fn default_leverage() -> u32 {
    5
}

fn default_protection_pause_ms() -> u64 {
    1000
}

fn default_max_wait_bars() -> u64 {
    3
}

fn default_max_per_strategy() -> usize {
    1
}

fn default_module_name() -> String {
    "bx-runner".into()
}

fn default_tick_interval() -> u64 {
    3600
}

fn default_true() -> bool {
    true
}

/// Load and parse a JSON config file, then fill credentials from the
/// environment.
pub fn load_config(path: &std::path::Path) -> anyhow::Result<AppConfig> {
    let content = std::fs::read_to_string(path)?;
    let mut config: AppConfig = serde_json::from_str(&content)?;
    config.apply_env();
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_gets_defaults() {
        let json = r#"{ "exchange": { "api_key": "k", "secret_key": "s" } }"#;
        let cfg: AppConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.exchange.rate_limit_per_min, 1200);
        assert_eq!(cfg.exchange.max_retries, 3);
        assert_eq!(cfg.exchange.effective_base_url(), PRODUCTION_URL);
        assert_eq!(cfg.execution.protection_retry_pause_ms, 1000);
        assert!(cfg.pending.allow_multiple_per_strategy);
        assert_eq!(cfg.positions.limit_for("anything"), 1);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn sandbox_and_override_urls() {
        let mut ex = ExchangeConfig { sandbox: true, ..Default::default() };
        assert_eq!(ex.effective_base_url(), SANDBOX_URL);
        ex.base_url = Some("http://127.0.0.1:9000/".into());
        assert_eq!(ex.effective_base_url(), "http://127.0.0.1:9000");
    }

    #[test]
    fn per_strategy_override() {
        let json = r#"{ "positions": { "default_max_per_strategy": 2, "max_per_strategy": { "scalp": 5 } } }"#;
        let cfg: AppConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.positions.limit_for("scalp"), 5);
        assert_eq!(cfg.positions.limit_for("swing"), 2);
    }

    #[test]
    fn missing_credentials_fail_validation() {
        let cfg = AppConfig::default();
        assert!(matches!(cfg.validate(), Err(BxError::Config(_))));
    }

    #[test]
    fn bad_sizing_fails_validation() {
        let json = r#"{
            "exchange": { "api_key": "k", "secret_key": "s" },
            "execution": { "sizing": { "mode": "risk_percent", "percent": 0.0 } }
        }"#;
        let cfg: AppConfig = serde_json::from_str(json).unwrap();
        assert!(cfg.validate().is_err());
    }
}
