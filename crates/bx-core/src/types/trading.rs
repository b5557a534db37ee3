//! Trading-related data structures: order requests, exchange order
//! snapshots, contract metadata, and account state.
//!
//! These types flow between the execution layer and the exchange client.

use serde::{Deserialize, Serialize};

use super::enums::{Direction, OrderStatus, OrderType, Side, WorkingType};

// ---------------------------------------------------------------------------
// Contract metadata
// ---------------------------------------------------------------------------

/// Per-symbol contract rules needed before any sizing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractInfo {
    pub symbol: String,
    /// Number of decimals allowed in order quantities.
    pub quantity_precision: u32,
    /// Number of decimals allowed in prices.
    pub price_precision: u32,
    /// Smallest order quantity the exchange accepts.
    pub min_qty: f64,
    /// Smallest order notional (quote currency), 0 if unrestricted.
    pub min_notional: f64,
}

impl ContractInfo {
    /// Round a quantity down to the contract's quantity precision.
    pub fn floor_quantity(&self, qty: f64) -> f64 {
        let factor = 10f64.powi(self.quantity_precision as i32);
        // The epsilon absorbs binary representation error (e.g. 3.9999999 for 4).
        (qty * factor + 1e-9).floor() / factor
    }

    /// Round a price to the nearest tick allowed by the price precision.
    pub fn round_price(&self, price: f64) -> f64 {
        let factor = 10f64.powi(self.price_precision as i32);
        (price * factor).round() / factor
    }
}

// ---------------------------------------------------------------------------
// Order request (execution layer → exchange client)
// ---------------------------------------------------------------------------

/// A conditional leg attached to an entry order (stop-loss or take-profit
/// that the exchange activates once the entry fills).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachedLeg {
    pub order_type: OrderType,
    pub stop_price: f64,
    pub working_type: WorkingType,
}

/// An order to be placed on the exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    /// Position side in hedge mode.
    pub position_side: Direction,
    pub order_type: OrderType,
    /// Quantity, already rounded to contract precision.
    pub quantity: f64,
    /// Limit price (LIMIT orders only).
    pub price: Option<f64>,
    /// Trigger price (STOP_MARKET / TAKE_PROFIT_MARKET only).
    pub stop_price: Option<f64>,
    pub working_type: Option<WorkingType>,
    /// Stop-loss attached to the order itself.
    pub stop_loss: Option<AttachedLeg>,
    /// Take-profit attached to the order itself.
    pub take_profit: Option<AttachedLeg>,
    pub client_order_id: Option<String>,
}

impl OrderRequest {
    /// A MARKET order for `quantity` on `position_side`.
    pub fn market(symbol: &str, side: Side, position_side: Direction, quantity: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            position_side,
            order_type: OrderType::Market,
            quantity,
            price: None,
            stop_price: None,
            working_type: None,
            stop_loss: None,
            take_profit: None,
            client_order_id: None,
        }
    }

    /// A GTC LIMIT order at `price`.
    pub fn limit(symbol: &str, side: Side, position_side: Direction, quantity: f64, price: f64) -> Self {
        Self {
            order_type: OrderType::Limit,
            price: Some(price),
            ..Self::market(symbol, side, position_side, quantity)
        }
    }

    /// A conditional market order (stop-loss or take-profit) triggering at
    /// `stop_price`.
    pub fn conditional(
        symbol: &str,
        order_type: OrderType,
        side: Side,
        position_side: Direction,
        quantity: f64,
        stop_price: f64,
        working_type: WorkingType,
    ) -> Self {
        Self {
            order_type,
            stop_price: Some(stop_price),
            working_type: Some(working_type),
            ..Self::market(symbol, side, position_side, quantity)
        }
    }
}

// ---------------------------------------------------------------------------
// Order snapshot (exchange client → execution layer)
// ---------------------------------------------------------------------------

/// An order as reported by the exchange (placement acknowledgement or query).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderInfo {
    /// Exchange-assigned order ID (opaque).
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub position_side: Direction,
    pub order_type: OrderType,
    pub status: OrderStatus,
    /// Limit price, 0 for market orders.
    pub price: f64,
    /// Trigger price, 0 for non-conditional orders.
    pub stop_price: f64,
    /// Original quantity.
    pub quantity: f64,
    /// Cumulative filled quantity.
    pub executed_qty: f64,
    /// Average fill price, 0 if unfilled.
    pub avg_price: f64,
    /// Last update time (ms since epoch).
    pub update_time: u64,
}

// ---------------------------------------------------------------------------
// Account state
// ---------------------------------------------------------------------------

/// Perpetual account balance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub asset: String,
    /// Wallet balance.
    pub balance: f64,
    /// Balance plus unrealized PnL.
    pub equity: f64,
    /// Margin available for new orders.
    pub available_margin: f64,
}

/// A position snapshot from the exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangePosition {
    pub symbol: String,
    pub position_side: Direction,
    /// Absolute position size.
    pub position_amt: f64,
    pub avg_price: f64,
    pub unrealized_pnl: f64,
    pub leverage: u32,
}

// ---------------------------------------------------------------------------
// Market data
// ---------------------------------------------------------------------------

/// One candlestick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kline {
    /// Open time (ms since epoch).
    pub open_time: u64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}
