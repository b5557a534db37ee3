//! Interfaces to the components around the execution core: strategies,
//! risk checks, trade bookkeeping and notifications.
//!
//! Each trait ships with a default implementation that only logs, so the
//! scheduler can run with nothing but an exchange client.

use std::sync::Arc;

use async_trait::async_trait;
use bx_core::types::StrategySignal;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::registry::Position;

// ---------------------------------------------------------------------------
// Signal sources
// ---------------------------------------------------------------------------

/// What a strategy sees on each tick.
#[derive(Debug, Clone)]
pub struct TickContext {
    /// Monotonic bar counter, starting at 1 on the first tick.
    pub bar: u64,
    /// Account equity, if the balance query succeeded.
    pub equity: Option<f64>,
    /// Non-closed positions across all strategies.
    pub open_positions: Vec<Position>,
}

#[async_trait]
pub trait SignalSource: Send {
    fn name(&self) -> &str;

    /// At most one signal per tick.
    async fn generate_signal(&mut self, ctx: &TickContext) -> Option<StrategySignal>;
}

// ---------------------------------------------------------------------------
// Risk gate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct RiskDecision {
    pub allowed: bool,
    pub reason: String,
}

impl RiskDecision {
    pub fn allow() -> Self {
        Self { allowed: true, reason: String::new() }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self { allowed: false, reason: reason.into() }
    }
}

pub trait RiskGate: Send + Sync {
    fn validate(&self, signal: &StrategySignal, equity: f64) -> RiskDecision;
}

/// Accepts every signal.
pub struct AllowAll;

impl RiskGate for AllowAll {
    fn validate(&self, _signal: &StrategySignal, _equity: f64) -> RiskDecision {
        RiskDecision::allow()
    }
}

// ---------------------------------------------------------------------------
// Trade log
// ---------------------------------------------------------------------------

/// Durable record of trades. Called only after the exchange confirmed the
/// corresponding action.
#[async_trait]
pub trait TradeLogger: Send + Sync {
    async fn log_trade_open(&self, position: &Position);

    async fn close_trade(&self, position: &Position, exit_price: f64, reason: &str);
}

pub struct TracingTradeLogger;

#[async_trait]
impl TradeLogger for TracingTradeLogger {
    async fn log_trade_open(&self, position: &Position) {
        info!(
            "[trade] OPEN #{} {} {} {} qty={} entry={} sl={} tp={}",
            position.id,
            position.strategy,
            position.symbol,
            position.direction,
            position.quantity,
            position.entry_price,
            position.stop_loss,
            position.take_profit,
        );
    }

    async fn close_trade(&self, position: &Position, exit_price: f64, reason: &str) {
        let sign = match position.direction {
            bx_core::types::Direction::Long => 1.0,
            bx_core::types::Direction::Short => -1.0,
        };
        let pnl = (exit_price - position.entry_price) * position.quantity * sign;
        info!(
            "[trade] CLOSE #{} {} {} exit={exit_price} reason={reason} pnl≈{pnl:.4}",
            position.id, position.strategy, position.symbol,
        );
    }
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ExecutionEvent {
    TradeOpened { position: Position },
    TradeClosed { position: Position, exit_price: f64, reason: String },
    Error { context: String, message: String },
    /// Exposure the process could not remove on its own.
    Critical { symbol: String, message: String },
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &ExecutionEvent) -> anyhow::Result<()>;
}

pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, event: &ExecutionEvent) -> anyhow::Result<()> {
        match event {
            ExecutionEvent::Critical { symbol, message } => {
                error!("[notify] CRITICAL {symbol}: {message}")
            }
            ExecutionEvent::Error { context, message } => warn!("[notify] {context}: {message}"),
            other => info!("[notify] {}", serde_json::to_string(other)?),
        }
        Ok(())
    }
}

/// Deliver `event` on a background task. Delivery failures are logged and
/// never reach the caller.
pub fn notify_detached(notifier: &Arc<dyn Notifier>, event: ExecutionEvent) {
    let notifier = Arc::clone(notifier);
    tokio::spawn(async move {
        if let Err(e) = notifier.notify(&event).await {
            warn!("[notify] delivery failed: {e:#}");
        }
    });
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingNotifier;
    use super::*;

    struct FailingNotifier;

    #[async_trait]
    impl Notifier for FailingNotifier {
        async fn notify(&self, _event: &ExecutionEvent) -> anyhow::Result<()> {
            anyhow::bail!("webhook down")
        }
    }

    #[tokio::test]
    async fn detached_delivery_swallows_failures() {
        let failing: Arc<dyn Notifier> = Arc::new(FailingNotifier);
        notify_detached(
            &failing,
            ExecutionEvent::Error { context: "test".into(), message: "x".into() },
        );
        tokio::task::yield_now().await;
    }

    #[tokio::test]
    async fn detached_delivery_reaches_notifier() {
        let recording = Arc::new(RecordingNotifier::default());
        let notifier: Arc<dyn Notifier> = recording.clone();
        notify_detached(
            &notifier,
            ExecutionEvent::Critical { symbol: "BTC-USDT".into(), message: "naked".into() },
        );
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(recording.critical_count(), 1);
    }

    #[test]
    fn allow_all_allows() {
        let sig = StrategySignal::Immediate(bx_core::types::TradeSignal {
            strategy: "s".into(),
            symbol: "BTC-USDT".into(),
            direction: bx_core::types::Direction::Long,
            entry_price: 100.0,
            stop_loss: 90.0,
            take_profit: 120.0,
        });
        assert!(AllowAll.validate(&sig, 0.0).allowed);
    }
}
