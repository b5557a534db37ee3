//! Signals emitted by the strategy layer.
//!
//! A strategy either asks for immediate execution at market
//! ([`TradeSignal`]) or for a resting limit order that waits a bounded number
//! of bars for a fill ([`LimitRequest`]).

use serde::{Deserialize, Serialize};

use super::enums::Direction;
use crate::error::BxError;

/// Immediate-execution signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeSignal {
    pub strategy: String,
    pub symbol: String,
    pub direction: Direction,
    /// Reference entry price used for sizing.
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
}

impl TradeSignal {
    /// Check that prices are positive and the stop and target sit on the
    /// losing and winning sides of the entry respectively.
    pub fn validate(&self) -> Result<(), BxError> {
        check_levels(self.direction, self.entry_price, self.stop_loss, self.take_profit)
    }
}

/// Resting limit order request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitRequest {
    pub strategy: String,
    pub symbol: String,
    pub direction: Direction,
    pub limit_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    /// Bars to wait for a fill; falls back to the configured default.
    #[serde(default)]
    pub max_wait_bars: Option<u64>,
}

impl LimitRequest {
    pub fn validate(&self) -> Result<(), BxError> {
        check_levels(self.direction, self.limit_price, self.stop_loss, self.take_profit)
    }

    /// The signal that sizing and position registration use for this request.
    pub fn as_trade_signal(&self) -> TradeSignal {
        TradeSignal {
            strategy: self.strategy.clone(),
            symbol: self.symbol.clone(),
            direction: self.direction,
            entry_price: self.limit_price,
            stop_loss: self.stop_loss,
            take_profit: self.take_profit,
        }
    }
}

/// Anything a strategy can emit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StrategySignal {
    Immediate(TradeSignal),
    PendingLimit(LimitRequest),
}

impl StrategySignal {
    pub fn strategy(&self) -> &str {
        match self {
            Self::Immediate(s) => &s.strategy,
            Self::PendingLimit(r) => &r.strategy,
        }
    }

    pub fn symbol(&self) -> &str {
        match self {
            Self::Immediate(s) => &s.symbol,
            Self::PendingLimit(r) => &r.symbol,
        }
    }
}

fn check_levels(direction: Direction, entry: f64, stop: f64, target: f64) -> Result<(), BxError> {
    if !(entry > 0.0 && stop > 0.0 && target > 0.0) {
        return Err(BxError::Rejected(format!(
            "non-positive price level (entry={entry}, stop={stop}, target={target})"
        )));
    }
    let ordered = match direction {
        Direction::Long => stop < entry && entry < target,
        Direction::Short => target < entry && entry < stop,
    };
    if !ordered {
        return Err(BxError::Rejected(format!(
            "{direction} levels out of order (entry={entry}, stop={stop}, target={target})"
        )));
    }
    Ok(())
}
