//! Typed wrappers around the perpetual-swap REST endpoints.
//!
//! | Operation           | Method | Path                                    | Signed |
//! |---------------------|--------|-----------------------------------------|--------|
//! | Contract info       | GET    | `/openApi/swap/v2/quote/contracts`      | no     |
//! | Ticker              | GET    | `/openApi/swap/v2/quote/ticker`         | no     |
//! | Klines              | GET    | `/openApi/swap/v3/quote/klines`         | no     |
//! | Depth               | GET    | `/openApi/swap/v2/quote/depth`          | no     |
//! | Balance             | GET    | `/openApi/swap/v2/user/balance`         | yes    |
//! | Positions           | GET    | `/openApi/swap/v2/user/positions`       | yes    |
//! | Place order         | POST   | `/openApi/swap/v2/trade/order`          | yes    |
//! | Cancel order        | DELETE | `/openApi/swap/v2/trade/order`          | yes    |
//! | Query order         | GET    | `/openApi/swap/v2/trade/order`          | yes    |
//! | Cancel all orders   | DELETE | `/openApi/swap/v2/trade/allOpenOrders`  | yes    |
//! | Open orders         | GET    | `/openApi/swap/v2/trade/openOrders`     | yes    |
//! | Order history       | GET    | `/openApi/swap/v2/trade/allOrders`      | yes    |
//! | Set leverage        | POST   | `/openApi/swap/v2/trade/leverage`       | yes    |
//! | Set margin mode     | POST   | `/openApi/swap/v2/trade/marginType`     | yes    |
//! | Set position mode   | POST   | `/openApi/swap/v1/positionSide/dual`    | yes    |

use bx_core::error::{BxError, BxResult};
use bx_core::types::*;
use serde_json::{Value, json};
use tracing::info;

use crate::client::ExchangeClient;
use crate::request::{HttpMethod, Params};

pub const CONTRACTS: &str = "/openApi/swap/v2/quote/contracts";
pub const TICKER: &str = "/openApi/swap/v2/quote/ticker";
pub const KLINES: &str = "/openApi/swap/v3/quote/klines";
pub const DEPTH: &str = "/openApi/swap/v2/quote/depth";
pub const BALANCE: &str = "/openApi/swap/v2/user/balance";
pub const POSITIONS: &str = "/openApi/swap/v2/user/positions";
pub const ORDER: &str = "/openApi/swap/v2/trade/order";
pub const ALL_OPEN_ORDERS: &str = "/openApi/swap/v2/trade/allOpenOrders";
pub const OPEN_ORDERS: &str = "/openApi/swap/v2/trade/openOrders";
pub const ALL_ORDERS: &str = "/openApi/swap/v2/trade/allOrders";
pub const LEVERAGE: &str = "/openApi/swap/v2/trade/leverage";
pub const MARGIN_TYPE: &str = "/openApi/swap/v2/trade/marginType";
pub const POSITION_MODE: &str = "/openApi/swap/v1/positionSide/dual";

/// Top levels of an order book.
#[derive(Debug, Clone, PartialEq)]
pub struct Depth {
    /// `(price, quantity)`, best first.
    pub bids: Vec<(f64, f64)>,
    pub asks: Vec<(f64, f64)>,
}

impl ExchangeClient {
    // -----------------------------------------------------------------------
    // Market data (unsigned)
    // -----------------------------------------------------------------------

    /// Contract rules for `symbol`.
    pub async fn contract_info(&self, symbol: &str) -> BxResult<ContractInfo> {
        let data = self
            .request(HttpMethod::Get, CONTRACTS, Params::new().with("symbol", symbol), false)
            .await?;
        let entry = match &data {
            Value::Array(items) => items
                .iter()
                .find(|c| c.get("symbol").and_then(Value::as_str) == Some(symbol)),
            obj @ Value::Object(_) => Some(obj),
            _ => None,
        }
        .ok_or_else(|| BxError::Decode(format!("no contract info for {symbol}")))?;
        parse_contract(entry)
    }

    /// Last traded price.
    pub async fn ticker_price(&self, symbol: &str) -> BxResult<f64> {
        let data = self
            .request(HttpMethod::Get, TICKER, Params::new().with("symbol", symbol), false)
            .await?;
        let price = num(&data, "lastPrice");
        if price > 0.0 {
            Ok(price)
        } else {
            Err(BxError::Decode(format!("ticker for {symbol} has no lastPrice")))
        }
    }

    /// Most recent `limit` candles for `interval` (e.g. `"1h"`), oldest first.
    pub async fn klines(&self, symbol: &str, interval: &str, limit: u32) -> BxResult<Vec<Kline>> {
        let params = Params::new()
            .with("symbol", symbol)
            .with("interval", interval)
            .with("limit", limit);
        let data = self.request(HttpMethod::Get, KLINES, params, false).await?;
        let mut klines: Vec<Kline> = as_array(&data)?
            .iter()
            .map(|k| Kline {
                open_time: k.get("time").and_then(Value::as_u64).unwrap_or(0),
                open: num(k, "open"),
                high: num(k, "high"),
                low: num(k, "low"),
                close: num(k, "close"),
                volume: num(k, "volume"),
            })
            .collect();
        klines.sort_by_key(|k| k.open_time);
        Ok(klines)
    }

    pub async fn depth(&self, symbol: &str, limit: u32) -> BxResult<Depth> {
        let params = Params::new().with("symbol", symbol).with("limit", limit);
        let data = self.request(HttpMethod::Get, DEPTH, params, false).await?;
        Ok(Depth {
            bids: parse_levels(data.get("bids")),
            asks: parse_levels(data.get("asks")),
        })
    }

    // -----------------------------------------------------------------------
    // Account
    // -----------------------------------------------------------------------

    pub async fn balance(&self) -> BxResult<Balance> {
        let data = self.request(HttpMethod::Get, BALANCE, Params::new(), true).await?;
        let b = data.get("balance").unwrap_or(&data);
        Ok(Balance {
            asset: b.get("asset").and_then(Value::as_str).unwrap_or("USDT").to_string(),
            balance: num(b, "balance"),
            equity: num(b, "equity"),
            available_margin: num(b, "availableMargin"),
        })
    }

    /// Non-flat positions, optionally for one symbol.
    pub async fn positions(&self, symbol: Option<&str>) -> BxResult<Vec<ExchangePosition>> {
        let data = self
            .request(HttpMethod::Get, POSITIONS, Params::new().with_opt("symbol", symbol), true)
            .await?;
        Ok(as_array(&data)?.iter().filter_map(parse_position).collect())
    }

    /// Set leverage for one side of `symbol`.
    pub async fn set_leverage(&self, symbol: &str, side: Direction, leverage: u32) -> BxResult<()> {
        let params = Params::new()
            .with("symbol", symbol)
            .with("side", side.as_str())
            .with("leverage", leverage);
        self.request(HttpMethod::Post, LEVERAGE, params, true).await?;
        info!("[bx-td] leverage set: {symbol} {side} x{leverage}");
        Ok(())
    }

    pub async fn set_margin_mode(&self, symbol: &str, mode: MarginMode) -> BxResult<()> {
        let params = Params::new()
            .with("symbol", symbol)
            .with("marginType", mode.as_str());
        self.request(HttpMethod::Post, MARGIN_TYPE, params, true).await?;
        info!("[bx-td] margin mode set: {symbol} {}", mode.as_str());
        Ok(())
    }

    /// Switch between hedge (`dual = true`) and one-way position mode.
    pub async fn set_position_mode(&self, dual: bool) -> BxResult<()> {
        let params = Params::new().with("dualSidePosition", dual);
        self.request(HttpMethod::Post, POSITION_MODE, params, true).await?;
        info!("[bx-td] position mode set: dual={dual}");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Orders
    // -----------------------------------------------------------------------

    /// Place an order. Returns the acknowledged order; the fill state of a
    /// market order must be read with [`query_order`](Self::query_order).
    pub async fn place_order(&self, order: &OrderRequest) -> BxResult<OrderInfo> {
        let data = self
            .request(HttpMethod::Post, ORDER, order_params(order), true)
            .await?;
        let raw = data.get("order").unwrap_or(&data);
        let order_id = raw
            .get("orderId")
            .and_then(id_string)
            .ok_or_else(|| BxError::Decode(format!("order ack without orderId: {data}")))?;

        info!(
            "[bx-td] order placed: {} {} {} {} qty={} → id={order_id}",
            order.symbol,
            order.side.as_str(),
            order.position_side,
            order.order_type,
            order.quantity,
        );

        Ok(OrderInfo {
            order_id,
            symbol: order.symbol.clone(),
            side: order.side,
            position_side: order.position_side,
            order_type: order.order_type,
            status: raw
                .get("status")
                .and_then(Value::as_str)
                .map(OrderStatus::parse)
                .unwrap_or(OrderStatus::New),
            price: order.price.unwrap_or(0.0),
            stop_price: order.stop_price.unwrap_or(0.0),
            quantity: order.quantity,
            executed_qty: num(raw, "executedQty"),
            avg_price: num(raw, "avgPrice"),
            update_time: raw.get("updateTime").and_then(Value::as_u64).unwrap_or(0),
        })
    }

    pub async fn cancel_order(&self, symbol: &str, order_id: &str) -> BxResult<()> {
        let params = Params::new().with("symbol", symbol).with("orderId", order_id);
        self.request(HttpMethod::Delete, ORDER, params, true).await?;
        info!("[bx-td] order cancelled: {symbol} id={order_id}");
        Ok(())
    }

    /// Cancel every open order (including conditional ones) on `symbol`.
    pub async fn cancel_all_orders(&self, symbol: &str) -> BxResult<()> {
        self.request(HttpMethod::Delete, ALL_OPEN_ORDERS, Params::new().with("symbol", symbol), true)
            .await?;
        info!("[bx-td] all orders cancelled: {symbol}");
        Ok(())
    }

    pub async fn query_order(&self, symbol: &str, order_id: &str) -> BxResult<OrderInfo> {
        let params = Params::new().with("symbol", symbol).with("orderId", order_id);
        let data = self.request(HttpMethod::Get, ORDER, params, true).await?;
        parse_order(data.get("order").unwrap_or(&data))
    }

    pub async fn open_orders(&self, symbol: Option<&str>) -> BxResult<Vec<OrderInfo>> {
        let data = self
            .request(HttpMethod::Get, OPEN_ORDERS, Params::new().with_opt("symbol", symbol), true)
            .await?;
        parse_order_list(&data)
    }

    pub async fn order_history(&self, symbol: &str, limit: u32) -> BxResult<Vec<OrderInfo>> {
        let params = Params::new().with("symbol", symbol).with("limit", limit);
        let data = self.request(HttpMethod::Get, ALL_ORDERS, params, true).await?;
        parse_order_list(&data)
    }
}

// ---------------------------------------------------------------------------
// Request encoding
// ---------------------------------------------------------------------------

fn order_params(order: &OrderRequest) -> Params {
    let time_in_force = (order.order_type == OrderType::Limit).then_some("GTC");
    Params::new()
        .with("symbol", &order.symbol)
        .with("side", order.side.as_str())
        .with("positionSide", order.position_side.as_str())
        .with("type", order.order_type.as_str())
        .with("quantity", order.quantity)
        .with_opt("price", order.price)
        .with_opt("stopPrice", order.stop_price)
        .with_opt("workingType", order.working_type.map(WorkingType::as_str))
        .with_opt("timeInForce", time_in_force)
        .with_opt("stopLoss", order.stop_loss.as_ref().map(attached_leg_json))
        .with_opt("takeProfit", order.take_profit.as_ref().map(attached_leg_json))
        .with_opt("clientOrderID", order.client_order_id.as_deref())
}

/// Conditional leg encoded as the JSON string the order endpoint expects.
fn attached_leg_json(leg: &AttachedLeg) -> String {
    json!({
        "type": leg.order_type.as_str(),
        "stopPrice": leg.stop_price,
        "price": leg.stop_price,
        "workingType": leg.working_type.as_str(),
    })
    .to_string()
}

// ---------------------------------------------------------------------------
// JSON → typed helpers
// ---------------------------------------------------------------------------

/// Numeric field that may arrive as a JSON number or a decimal string.
fn num(v: &Value, key: &str) -> f64 {
    match v.get(key) {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

/// Order ids arrive as 64-bit integers or strings; keep them opaque.
fn id_string(v: &Value) -> Option<String> {
    match v {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

fn as_array(data: &Value) -> BxResult<&Vec<Value>> {
    data.as_array()
        .ok_or_else(|| BxError::Decode(format!("expected array, got {data}")))
}

fn parse_contract(v: &Value) -> BxResult<ContractInfo> {
    let symbol = v
        .get("symbol")
        .and_then(Value::as_str)
        .ok_or_else(|| BxError::Decode(format!("contract without symbol: {v}")))?;
    Ok(ContractInfo {
        symbol: symbol.to_string(),
        quantity_precision: num(v, "quantityPrecision") as u32,
        price_precision: num(v, "pricePrecision") as u32,
        min_qty: num(v, "tradeMinQuantity"),
        min_notional: num(v, "tradeMinUSDT"),
    })
}

fn parse_side(s: &str) -> Option<Side> {
    match s {
        "BUY" => Some(Side::Buy),
        "SELL" => Some(Side::Sell),
        _ => None,
    }
}

fn parse_direction(s: &str) -> Option<Direction> {
    match s {
        "LONG" => Some(Direction::Long),
        "SHORT" => Some(Direction::Short),
        _ => None,
    }
}

fn parse_order_type(s: &str) -> Option<OrderType> {
    match s {
        "MARKET" => Some(OrderType::Market),
        "LIMIT" => Some(OrderType::Limit),
        "STOP_MARKET" | "STOP" => Some(OrderType::StopMarket),
        "TAKE_PROFIT_MARKET" | "TAKE_PROFIT" => Some(OrderType::TakeProfitMarket),
        _ => None,
    }
}

pub(crate) fn parse_order(v: &Value) -> BxResult<OrderInfo> {
    let field = |key: &str| v.get(key).and_then(Value::as_str);
    let bad = || BxError::Decode(format!("malformed order: {v}"));

    let side = field("side").and_then(parse_side).ok_or_else(bad)?;
    Ok(OrderInfo {
        order_id: v.get("orderId").and_then(id_string).ok_or_else(bad)?,
        symbol: field("symbol").ok_or_else(bad)?.to_string(),
        side,
        // One-way mode reports BOTH; infer from the side.
        position_side: field("positionSide")
            .and_then(parse_direction)
            .unwrap_or(match side {
                Side::Buy => Direction::Long,
                Side::Sell => Direction::Short,
            }),
        order_type: field("type").and_then(parse_order_type).ok_or_else(bad)?,
        status: OrderStatus::parse(field("status").unwrap_or("NEW")),
        price: num(v, "price"),
        stop_price: num(v, "stopPrice"),
        quantity: num(v, "origQty"),
        executed_qty: num(v, "executedQty"),
        avg_price: num(v, "avgPrice"),
        update_time: v.get("updateTime").and_then(Value::as_u64).unwrap_or(0),
    })
}

fn parse_order_list(data: &Value) -> BxResult<Vec<OrderInfo>> {
    let list = data.get("orders").unwrap_or(data);
    as_array(list)?.iter().map(parse_order).collect()
}

fn parse_position(v: &Value) -> Option<ExchangePosition> {
    let amt = num(v, "positionAmt").abs();
    // Skip flat entries
    if amt < 1e-12 {
        return None;
    }
    Some(ExchangePosition {
        symbol: v.get("symbol")?.as_str()?.to_string(),
        position_side: parse_direction(v.get("positionSide")?.as_str()?)?,
        position_amt: amt,
        avg_price: num(v, "avgPrice"),
        unrealized_pnl: num(v, "unrealizedProfit"),
        leverage: num(v, "leverage") as u32,
    })
}

fn parse_levels(v: Option<&Value>) -> Vec<(f64, f64)> {
    let Some(Value::Array(levels)) = v else {
        return Vec::new();
    };
    levels
        .iter()
        .filter_map(|lvl| {
            let pair = lvl.as_array()?;
            let p = |i: usize| match pair.get(i)? {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.parse().ok(),
                _ => None,
            };
            Some((p(0)?, p(1)?))
        })
        .collect()
}
