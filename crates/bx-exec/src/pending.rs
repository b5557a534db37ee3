//! Resting limit orders that wait a bounded number of bars for a fill.
//!
//! Each tick, [`PendingOrderManager::check_pending_orders`] queries every
//! PENDING record. Filled orders are handed back to the caller, and orders
//! older than their `max_wait_bars` are cancelled on the exchange (one
//! cancel per expiry). Records are never deleted.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bx_core::config::PendingConfig;
use bx_core::error::{BxError, BxResult};
use bx_core::types::{Direction, LimitRequest, OrderInfo, OrderStatus, PendingStatus, TradeSignal};
use bx_td::ExchangeClient;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::executor::OrderExecutor;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingOrder {
    pub id: u64,
    pub strategy: String,
    pub symbol: String,
    pub direction: Direction,
    pub limit_price: f64,
    pub quantity: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub created_bar: u64,
    pub max_wait_bars: u64,
    pub exchange_order_id: String,
    pub protection_attached: bool,
    pub status: PendingStatus,
}

impl PendingOrder {
    /// Strictly more than `max_wait_bars` bars have elapsed.
    pub fn is_expired(&self, current_bar: u64) -> bool {
        current_bar.saturating_sub(self.created_bar) > self.max_wait_bars
    }
}

/// A limit entry the exchange reports as (fully or partially) filled.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FilledOrder {
    pub pending_id: u64,
    pub strategy: String,
    pub symbol: String,
    pub direction: Direction,
    /// Average fill price, or the limit price if the exchange did not report one.
    pub entry_price: f64,
    /// Executed quantity.
    pub quantity: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub exchange_order_id: String,
    pub protection_attached: bool,
}

impl FilledOrder {
    pub fn as_trade_signal(&self) -> TradeSignal {
        TradeSignal {
            strategy: self.strategy.clone(),
            symbol: self.symbol.clone(),
            direction: self.direction,
            entry_price: self.entry_price,
            stop_loss: self.stop_loss,
            take_profit: self.take_profit,
        }
    }

    fn from_pending(order: &PendingOrder, info: Option<&OrderInfo>) -> Self {
        let (entry_price, quantity) = match info {
            Some(info) => (
                if info.avg_price > 0.0 { info.avg_price } else { order.limit_price },
                if info.executed_qty > 0.0 { info.executed_qty } else { order.quantity },
            ),
            None => (order.limit_price, order.quantity),
        };
        Self {
            pending_id: order.id,
            strategy: order.strategy.clone(),
            symbol: order.symbol.clone(),
            direction: order.direction,
            entry_price,
            quantity,
            stop_loss: order.stop_loss,
            take_profit: order.take_profit,
            exchange_order_id: order.exchange_order_id.clone(),
            protection_attached: order.protection_attached,
        }
    }
}

pub struct PendingOrderManager {
    client: Arc<ExchangeClient>,
    executor: Arc<OrderExecutor>,
    config: PendingConfig,
    orders: Mutex<BTreeMap<u64, PendingOrder>>,
    next_id: AtomicU64,
}

impl PendingOrderManager {
    pub fn new(client: Arc<ExchangeClient>, executor: Arc<OrderExecutor>, config: PendingConfig) -> Self {
        Self {
            client,
            executor,
            config,
            orders: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Place the LIMIT entry for `request` and start tracking it from
    /// `current_bar`.
    pub async fn create_pending_order(&self, request: &LimitRequest, current_bar: u64) -> BxResult<PendingOrder> {
        request.validate()?;
        if !self.config.allow_multiple_per_strategy && self.has_pending(&request.strategy) {
            return Err(BxError::Rejected(format!(
                "strategy {} already has a pending order",
                request.strategy
            )));
        }

        let placed = self
            .executor
            .place_limit_entry(&request.as_trade_signal(), self.config.attach_protection)
            .await?;
        let order = PendingOrder {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            strategy: request.strategy.clone(),
            symbol: request.symbol.clone(),
            direction: request.direction,
            limit_price: placed.price,
            quantity: placed.quantity,
            stop_loss: request.stop_loss,
            take_profit: request.take_profit,
            created_bar: current_bar,
            max_wait_bars: request.max_wait_bars.unwrap_or(self.config.default_max_wait_bars),
            exchange_order_id: placed.order_id,
            protection_attached: placed.attached,
            status: PendingStatus::Pending,
        };
        info!(
            "[pending] #{} {} {} {} @ {} qty={} (order {}, waits {} bars from bar {})",
            order.id,
            order.strategy,
            order.symbol,
            order.direction,
            order.limit_price,
            order.quantity,
            order.exchange_order_id,
            order.max_wait_bars,
            current_bar,
        );
        self.orders().insert(order.id, order.clone());
        Ok(order)
    }

    /// Reconcile every PENDING record against the exchange and return the
    /// ones that filled.
    ///
    /// Expiry cancels the order and then re-reads it, so whatever executed
    /// before the cancel landed is reported as a fill. If the cancel or the
    /// re-read fails the record stays PENDING and the next tick settles it.
    pub async fn check_pending_orders(&self, current_bar: u64) -> Vec<FilledOrder> {
        let mut fills = Vec::new();
        for order in self.pending_orders() {
            let expired = order.is_expired(current_bar);
            let status = self.client.query_order(&order.symbol, &order.exchange_order_id).await;

            match status {
                Ok(info) if info.status == OrderStatus::Filled => {
                    info!("[pending] #{} filled @ {} ({})", order.id, info.avg_price, order.symbol);
                    self.set_status(order.id, PendingStatus::Filled);
                    fills.push(FilledOrder::from_pending(&order, Some(&info)));
                }
                Ok(info) if info.status.is_terminal() => {
                    if info.executed_qty > 0.0 {
                        info!(
                            "[pending] #{} ended {:?} with {} executed",
                            order.id, info.status, info.executed_qty
                        );
                        self.set_status(order.id, PendingStatus::Filled);
                        fills.push(FilledOrder::from_pending(&order, Some(&info)));
                    } else {
                        info!("[pending] #{} ended {:?} on exchange", order.id, info.status);
                        // An expiry whose cancel landed but whose re-read failed.
                        let status = if expired { PendingStatus::Expired } else { PendingStatus::Cancelled };
                        self.set_status(order.id, status);
                    }
                }
                Ok(_) if expired => {
                    if let Some(fill) = self.expire(&order).await {
                        fills.push(fill);
                    }
                }
                Ok(_) => debug!("[pending] #{} still resting", order.id),
                Err(e) => {
                    warn!("[pending] #{} status unavailable: {e}", order.id);
                    if expired {
                        if let Some(fill) = self.expire(&order).await {
                            fills.push(fill);
                        }
                    }
                }
            }
        }
        fills
    }

    /// Cancel one pending order on the exchange and mark it CANCELLED.
    pub async fn cancel_pending_order(&self, id: u64) -> BxResult<()> {
        let order = self
            .get(id)
            .filter(|o| o.status == PendingStatus::Pending)
            .ok_or_else(|| BxError::Rejected(format!("no pending order {id}")))?;
        self.client.cancel_order(&order.symbol, &order.exchange_order_id).await?;
        self.set_status(id, PendingStatus::Cancelled);
        info!("[pending] #{id} cancelled");
        Ok(())
    }

    /// Cancel every PENDING order. Records end CANCELLED even when the
    /// exchange cancel fails; each such order may still rest on the exchange
    /// and is escalated as critical. Returns how many records were closed.
    pub async fn cancel_all_pending_orders(&self) -> usize {
        let pending = self.pending_orders();
        let mut stranded = Vec::new();
        for order in &pending {
            if let Err(e) = self.client.cancel_order(&order.symbol, &order.exchange_order_id).await {
                self.executor.escalate(
                    &order.symbol,
                    &format!(
                        "pending #{} limit order {} not cancelled, may still fill: {e}",
                        order.id, order.exchange_order_id
                    ),
                );
                stranded.push(order.exchange_order_id.clone());
            }
            self.set_status(order.id, PendingStatus::Cancelled);
        }
        if !stranded.is_empty() {
            error!("[pending] orders left on the exchange: {stranded:?}");
        }
        if !pending.is_empty() {
            info!("[pending] cancelled {} pending orders", pending.len());
        }
        pending.len()
    }

    pub fn get(&self, id: u64) -> Option<PendingOrder> {
        self.orders().get(&id).cloned()
    }

    /// PENDING records, oldest first.
    pub fn pending_orders(&self) -> Vec<PendingOrder> {
        self.orders()
            .values()
            .filter(|o| o.status == PendingStatus::Pending)
            .cloned()
            .collect()
    }

    /// Every record, terminal ones included.
    pub fn all_orders(&self) -> Vec<PendingOrder> {
        self.orders().values().cloned().collect()
    }

    fn has_pending(&self, strategy: &str) -> bool {
        self.orders()
            .values()
            .any(|o| o.status == PendingStatus::Pending && o.strategy == strategy)
    }

    async fn expire(&self, order: &PendingOrder) -> Option<FilledOrder> {
        if let Err(e) = self.client.cancel_order(&order.symbol, &order.exchange_order_id).await {
            warn!("[pending] #{} expiry cancel failed, retrying next tick: {e}", order.id);
            return None;
        }
        // Fills can land between the last query and the cancel.
        let info = match self.client.query_order(&order.symbol, &order.exchange_order_id).await {
            Ok(info) => info,
            Err(e) => {
                warn!("[pending] #{} cancelled, fill state unknown until next tick: {e}", order.id);
                return None;
            }
        };
        if info.executed_qty > 0.0 {
            info!(
                "[pending] #{} expired partially filled ({} of {})",
                order.id, info.executed_qty, order.quantity
            );
            self.set_status(order.id, PendingStatus::Filled);
            Some(FilledOrder::from_pending(order, Some(&info)))
        } else {
            info!("[pending] #{} expired after {} bars", order.id, order.max_wait_bars);
            self.set_status(order.id, PendingStatus::Expired);
            None
        }
    }

    fn set_status(&self, id: u64, status: PendingStatus) {
        if let Some(order) = self.orders().get_mut(&id) {
            order.status = status;
        }
    }

    fn orders(&self) -> MutexGuard<'_, BTreeMap<u64, PendingOrder>> {
        self.orders.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
