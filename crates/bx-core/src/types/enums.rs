//! Enumerations used throughout the execution system.
//!
//! Every enum that travels over the wire has an `as_str()` returning the
//! exchange spelling, and a parser for the values the exchange sends back.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Order side / position side
// ---------------------------------------------------------------------------

/// Buy or sell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }
}

/// Direction of a position. Doubles as the exchange `positionSide` in hedge
/// mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Long => "LONG",
            Self::Short => "SHORT",
        }
    }

    /// Order side that opens (increases) a position in this direction.
    pub fn entry_side(self) -> Side {
        match self {
            Self::Long => Side::Buy,
            Self::Short => Side::Sell,
        }
    }

    /// Order side that reduces or flattens a position in this direction.
    /// Stop-loss and take-profit legs use it as well.
    pub fn exit_side(self) -> Side {
        match self {
            Self::Long => Side::Sell,
            Self::Short => Side::Buy,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Order type / status
// ---------------------------------------------------------------------------

/// Order types used by the placement protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Market,
    Limit,
    StopMarket,
    TakeProfitMarket,
}

impl OrderType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Market => "MARKET",
            Self::Limit => "LIMIT",
            Self::StopMarket => "STOP_MARKET",
            Self::TakeProfitMarket => "TAKE_PROFIT_MARKET",
        }
    }
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order status as reported by the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
    Expired,
}

impl OrderStatus {
    /// Map an exchange status string. Unknown values are treated as `New`
    /// so that a resting order is never assumed gone.
    pub fn parse(status: &str) -> Self {
        match status {
            "FILLED" => Self::Filled,
            "PARTIALLY_FILLED" => Self::PartiallyFilled,
            "CANCELED" | "CANCELLED" => Self::Cancelled,
            "REJECTED" | "FAILED" => Self::Rejected,
            "EXPIRED" => Self::Expired,
            _ => Self::New,
        }
    }

    /// `true` once the exchange will never change the order again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Filled | Self::Cancelled | Self::Rejected | Self::Expired)
    }
}

/// Price reference for conditional (stop / take-profit) orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkingType {
    #[default]
    MarkPrice,
    ContractPrice,
}

impl WorkingType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MarkPrice => "MARK_PRICE",
            Self::ContractPrice => "CONTRACT_PRICE",
        }
    }
}

// ---------------------------------------------------------------------------
// Account settings
// ---------------------------------------------------------------------------

/// Margin mode for a symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MarginMode {
    #[default]
    Isolated,
    Crossed,
}

impl MarginMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Isolated => "ISOLATED",
            Self::Crossed => "CROSSED",
        }
    }
}

/// How an entry's quantity is derived from the signal and account equity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SizingMode {
    /// Fixed position notional in quote currency (quantity = notional / entry).
    FixedNotional { notional: f64 },
    /// Risk a percentage of equity between entry and stop
    /// (quantity = equity * pct / 100 / |entry - stop|).
    RiskPercent { percent: f64 },
}

impl Default for SizingMode {
    fn default() -> Self {
        Self::RiskPercent { percent: 1.0 }
    }
}

// ---------------------------------------------------------------------------
// Local lifecycle states
// ---------------------------------------------------------------------------

/// Lifecycle of a locally tracked position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PositionStatus {
    /// Entry confirmed, protection not yet confirmed.
    Pending,
    /// Entry and both protective legs confirmed.
    Open,
    /// A manual, emergency, or rollback close is in progress.
    Closing,
    /// Exchange confirmed flat.
    Closed,
}

/// Lifecycle of a resting limit order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PendingStatus {
    Pending,
    Filled,
    Cancelled,
    Expired,
}

impl PendingStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// How the protective legs of a position were established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtectionMode {
    /// Stop-loss and take-profit placed as independent orders with their own ids.
    Separate,
    /// Stop-loss and take-profit attached as conditional legs of the entry order.
    Attached,
}
