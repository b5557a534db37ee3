//! Order execution with protection.
//!
//! A market entry runs three legs in order: entry, then stop-loss, then
//! take-profit. Once the entry is confirmed the position exists on the
//! exchange, so from that point the flow either ends with both protective
//! legs confirmed or with the position flattened:
//!
//! ```text
//!  entry ──fail──► no exposure, nothing to undo
//!    │ok
//!    ▼
//!  stop-loss ──fail (after retries)──► flatten
//!    │ok
//!    ▼
//!  take-profit ──fail (after retries)──► cancel stop-loss, flatten
//!    │ok
//!    ▼
//!  OPEN
//! ```
//!
//! The post-entry phase runs on its own task that owns the symbol lock, so
//! dropping the caller's future never abandons a half-protected position,
//! and a panic inside it is caught and rolled back like any other failure.
//! A rollback that cannot flatten is logged and escalated as critical.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bx_core::config::ExecutionConfig;
use bx_core::error::{BxError, BxResult};
use bx_core::types::{
    AttachedLeg, ContractInfo, Direction, OrderInfo, OrderRequest, OrderStatus, OrderType,
    PositionStatus, ProtectionMode, SizingMode, TradeSignal,
};
use bx_td::ExchangeClient;
use futures_util::FutureExt;
use serde::Serialize;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, info, warn};

use crate::collaborators::{ExecutionEvent, Notifier, notify_detached};
use crate::locks::SymbolLocks;
use crate::pending::FilledOrder;
use crate::registry::{Position, PositionFilter, PositionRegistry};
use crate::sizing::size_position;

/// What a rollback did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RollbackOutcome {
    /// Protective legs cancelled before flattening.
    pub cancelled_orders: Vec<String>,
    pub cancel_errors: Vec<String>,
    pub flatten_order_id: Option<String>,
    /// Set when the position could not be flattened.
    pub flatten_error: Option<String>,
}

impl RollbackOutcome {
    pub fn flattened(&self) -> bool {
        self.flatten_order_id.is_some()
    }
}

/// Outcome of one execution request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub error: Option<String>,
    pub error_code: Option<i64>,
    pub symbol: String,
    pub direction: Direction,
    pub position_id: Option<u64>,
    pub entry_order_id: Option<String>,
    pub sl_order_id: Option<String>,
    pub tp_order_id: Option<String>,
    pub protection: Option<ProtectionMode>,
    pub entry_price: f64,
    pub quantity: f64,
    pub rollback: Option<RollbackOutcome>,
}

impl ExecutionResult {
    fn failed(symbol: &str, direction: Direction, err: &BxError) -> Self {
        Self {
            success: false,
            error: Some(err.to_string()),
            error_code: err.code(),
            symbol: symbol.to_string(),
            direction,
            position_id: None,
            entry_order_id: None,
            sl_order_id: None,
            tp_order_id: None,
            protection: None,
            entry_price: 0.0,
            quantity: 0.0,
            rollback: None,
        }
    }

    fn from_position(position: &Position) -> Self {
        Self {
            success: true,
            error: None,
            error_code: None,
            symbol: position.symbol.clone(),
            direction: position.direction,
            position_id: Some(position.id),
            entry_order_id: position.entry_order_id.clone(),
            sl_order_id: position.sl_order_id.clone(),
            tp_order_id: position.tp_order_id.clone(),
            protection: position.protection,
            entry_price: position.entry_price,
            quantity: position.quantity,
            rollback: None,
        }
    }
}

/// A resting limit entry accepted by the exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct LimitPlacement {
    pub order_id: String,
    pub quantity: f64,
    /// Limit price after rounding to the contract tick.
    pub price: f64,
    /// Stop-loss and take-profit ride on the order itself.
    pub attached: bool,
}

/// A position that left the book, with the price it left at.
#[derive(Debug, Clone, PartialEq)]
pub struct ClosedPosition {
    pub position: Position,
    pub exit_price: f64,
    pub reason: String,
}

pub struct OrderExecutor {
    core: Arc<ExecCore>,
    locks: SymbolLocks,
}

/// State shared with the detached protection tasks.
struct ExecCore {
    client: Arc<ExchangeClient>,
    registry: Arc<PositionRegistry>,
    notifier: Arc<dyn Notifier>,
    config: ExecutionConfig,
}

struct ProtectionJob {
    position_id: u64,
    signal: TradeSignal,
    quantity: f64,
    entry_order_id: String,
    contract: Option<ContractInfo>,
}

/// Protective legs confirmed so far; read by the rollback.
#[derive(Debug, Clone, Default)]
struct ConfirmedLegs {
    stop_loss: Option<String>,
    take_profit: Option<String>,
}

impl OrderExecutor {
    pub fn new(
        client: Arc<ExchangeClient>,
        registry: Arc<PositionRegistry>,
        notifier: Arc<dyn Notifier>,
        config: ExecutionConfig,
    ) -> Self {
        Self {
            core: Arc::new(ExecCore { client, registry, notifier, config }),
            locks: SymbolLocks::new(),
        }
    }

    pub fn registry(&self) -> &Arc<PositionRegistry> {
        &self.core.registry
    }

    pub fn client(&self) -> &Arc<ExchangeClient> {
        &self.core.client
    }

    // -----------------------------------------------------------------------
    // Market entry
    // -----------------------------------------------------------------------

    /// Market entry followed by a separate stop-loss and take-profit.
    pub async fn execute_trade(&self, signal: &TradeSignal) -> ExecutionResult {
        let guard = self.locks.lock(&signal.symbol).await;
        let (symbol, direction) = (signal.symbol.as_str(), signal.direction);

        if let Err(e) = self.precheck(signal) {
            info!("[executor] {symbol} {direction} rejected: {e}");
            return ExecutionResult::failed(symbol, direction, &e);
        }
        let (contract, quantity) = match self.size(signal).await {
            Ok(sized) => sized,
            Err(e) => {
                warn!("[executor] {symbol} sizing failed: {e}");
                return ExecutionResult::failed(symbol, direction, &e);
            }
        };

        let entry = OrderRequest::market(symbol, direction.entry_side(), direction, quantity);
        let ack = match self.core.client.place_order(&entry).await {
            Ok(ack) => ack,
            Err(e) => {
                warn!("[executor] {symbol} {direction} entry failed: {e}");
                return ExecutionResult::failed(symbol, direction, &e);
            }
        };

        let position = self.core.registry.open(signal, quantity);
        if let Err(e) = self.core.registry.set_entry(position.id, &ack.order_id, 0.0) {
            warn!("[executor] {e}");
        }
        let job = ProtectionJob {
            position_id: position.id,
            signal: signal.clone(),
            quantity,
            entry_order_id: ack.order_id,
            contract: Some(contract),
        };
        self.spawn_protection(job, guard).await
    }

    // -----------------------------------------------------------------------
    // Limit entry
    // -----------------------------------------------------------------------

    /// Place a resting LIMIT entry at `signal.entry_price`.
    ///
    /// With `attach` the stop-loss and take-profit ride on the order and the
    /// exchange activates them on fill. Nothing is registered until the
    /// fill is observed (see [`adopt_filled_limit`](Self::adopt_filled_limit)
    /// and [`attach_protection`](Self::attach_protection)).
    pub async fn place_limit_entry(&self, signal: &TradeSignal, attach: bool) -> BxResult<LimitPlacement> {
        let _guard = self.locks.lock(&signal.symbol).await;
        self.precheck(signal)?;
        let (contract, quantity) = self.size(signal).await?;

        let direction = signal.direction;
        let price = contract.round_price(signal.entry_price);
        let mut order = OrderRequest::limit(&signal.symbol, direction.entry_side(), direction, quantity, price);
        if attach {
            let working_type = self.core.config.working_type;
            order.stop_loss = Some(AttachedLeg {
                order_type: OrderType::StopMarket,
                stop_price: contract.round_price(signal.stop_loss),
                working_type,
            });
            order.take_profit = Some(AttachedLeg {
                order_type: OrderType::TakeProfitMarket,
                stop_price: contract.round_price(signal.take_profit),
                working_type,
            });
        }
        let ack = self.core.client.place_order(&order).await?;
        Ok(LimitPlacement { order_id: ack.order_id, quantity, price, attached: attach })
    }

    /// LIMIT entry at `limit_price` with the stop-loss and take-profit
    /// attached. The result carries the entry order id only; no position
    /// exists until the order fills.
    pub async fn execute_limit_trade(&self, signal: &TradeSignal, limit_price: f64) -> ExecutionResult {
        let signal = TradeSignal { entry_price: limit_price, ..signal.clone() };
        match self.place_limit_entry(&signal, true).await {
            Ok(placed) => ExecutionResult {
                success: true,
                error: None,
                error_code: None,
                symbol: signal.symbol.clone(),
                direction: signal.direction,
                position_id: None,
                entry_order_id: Some(placed.order_id),
                sl_order_id: None,
                tp_order_id: None,
                protection: Some(ProtectionMode::Attached),
                entry_price: placed.price,
                quantity: placed.quantity,
                rollback: None,
            },
            Err(e) => {
                warn!("[executor] {} limit entry failed: {e}", signal.symbol);
                ExecutionResult::failed(&signal.symbol, signal.direction, &e)
            }
        }
    }

    /// Register a filled limit entry and place its stop-loss and take-profit
    /// as separate orders, rolling back exactly like a market entry.
    pub async fn attach_protection(&self, fill: &FilledOrder) -> ExecutionResult {
        let guard = self.locks.lock(&fill.symbol).await;
        let signal = fill.as_trade_signal();
        let position = self.core.registry.open(&signal, fill.quantity);
        if let Err(e) = self
            .core
            .registry
            .set_entry(position.id, &fill.exchange_order_id, fill.entry_price)
        {
            warn!("[executor] {e}");
        }
        let job = ProtectionJob {
            position_id: position.id,
            signal,
            quantity: fill.quantity,
            entry_order_id: fill.exchange_order_id.clone(),
            contract: None,
        };
        self.spawn_protection(job, guard).await
    }

    /// Register a filled limit entry whose protection was attached at
    /// placement.
    pub async fn adopt_filled_limit(&self, fill: &FilledOrder) -> ExecutionResult {
        let _guard = self.locks.lock(&fill.symbol).await;
        let registry = &self.core.registry;
        let position = registry.open(&fill.as_trade_signal(), fill.quantity);
        let adopted = registry
            .set_entry(position.id, &fill.exchange_order_id, fill.entry_price)
            .and_then(|_| registry.mark_open(position.id, ProtectionMode::Attached));
        match adopted.map(|_| registry.get(position.id)) {
            Ok(Some(position)) => {
                info!(
                    "[executor] position {} adopted from limit {} ({} qty={})",
                    position.id, fill.exchange_order_id, position.symbol, position.quantity
                );
                ExecutionResult::from_position(&position)
            }
            Ok(None) => ExecutionResult::failed(
                &fill.symbol,
                fill.direction,
                &BxError::Internal(format!("position {} vanished", position.id)),
            ),
            Err(e) => ExecutionResult::failed(&fill.symbol, fill.direction, &e),
        }
    }

    // -----------------------------------------------------------------------
    // Closing
    // -----------------------------------------------------------------------

    /// Cancel every open order on `symbol`, then flatten `quantity` on
    /// `direction` with a market order.
    pub async fn close_position(&self, symbol: &str, quantity: f64, direction: Direction) -> BxResult<OrderInfo> {
        if !(quantity > 0.0) {
            return Err(BxError::Rejected(format!("close quantity must be positive, got {quantity}")));
        }
        let _guard = self.locks.lock(symbol).await;
        if let Err(e) = self.core.client.cancel_all_orders(symbol).await {
            warn!("[executor] {symbol} cancel-all before close failed: {e}");
        }
        self.core.flatten(symbol, quantity, direction).await
    }

    /// Close one tracked position: cancel its protective legs, flatten it
    /// and mark it closed with `reason`.
    pub async fn close_registered_position(&self, id: u64, reason: &str) -> BxResult<ClosedPosition> {
        let position = self
            .core
            .registry
            .get(id)
            .filter(Position::is_active)
            .ok_or_else(|| BxError::Rejected(format!("no active position {id}")))?;
        let _guard = self.locks.lock(&position.symbol).await;
        // Re-read under the lock; a sync may have closed it meanwhile.
        let position = self
            .core
            .registry
            .get(id)
            .filter(Position::is_active)
            .ok_or_else(|| BxError::Rejected(format!("position {id} closed concurrently")))?;
        self.core.registry.mark_closing(id)?;
        self.core.cancel_protection(&position).await;

        match self
            .core
            .flatten(&position.symbol, position.quantity, position.direction)
            .await
        {
            Ok(ack) => {
                let exit_price = self.core.exit_price(&position.symbol, &ack).await;
                self.core.registry.mark_closed(id, reason)?;
                let position = self.core.registry.get(id).unwrap_or(position);
                info!(
                    "[executor] position {id} closed ({reason}) {} @ {exit_price}",
                    position.symbol
                );
                Ok(ClosedPosition { position, exit_price, reason: reason.to_string() })
            }
            Err(e) => {
                self.core.escalate(&position.symbol, &format!("position {id} close failed: {e}"));
                Err(e)
            }
        }
    }

    /// Close every active position. Results are per position.
    pub async fn close_all_positions(&self, reason: &str) -> Vec<(u64, BxResult<ClosedPosition>)> {
        let mut results = Vec::new();
        for position in self.core.registry.get_open(&PositionFilter::all()) {
            let outcome = self.close_registered_position(position.id, reason).await;
            results.push((position.id, outcome));
        }
        results
    }

    /// Detect positions the exchange reports flat and mark them closed.
    ///
    /// Covers OPEN positions closed on the exchange's side (stop-loss or
    /// take-profit triggered, liquidation, manual close) and CLOSING ones
    /// whose flatten failed earlier but which are flat by now. The surviving
    /// protective leg is cancelled.
    pub async fn sync_closed_positions(&self) -> BxResult<Vec<ClosedPosition>> {
        let open: Vec<Position> = self
            .core
            .registry
            .get_open(&PositionFilter::all())
            .into_iter()
            .filter(awaiting_exchange_close)
            .collect();
        if open.is_empty() {
            return Ok(Vec::new());
        }

        let live = self.core.client.positions(None).await?;
        let mut closed = Vec::new();
        for position in open {
            let still_open = live.iter().any(|l| {
                l.symbol == position.symbol && l.position_side == position.direction && l.position_amt > 0.0
            });
            if still_open {
                continue;
            }

            let _guard = self.locks.lock(&position.symbol).await;
            let Some(position) = self
                .core
                .registry
                .get(position.id)
                .filter(awaiting_exchange_close)
            else {
                continue;
            };
            let (exit_price, reason) = self.core.resolve_exit(&position).await;
            if let Err(e) = self.core.registry.mark_closed(position.id, &reason) {
                warn!("[executor] position {} not marked closed: {e}", position.id);
                continue;
            }
            info!(
                "[executor] position {} closed on exchange ({reason}) {} @ {exit_price}",
                position.id, position.symbol
            );
            let position = self.core.registry.get(position.id).unwrap_or(position);
            closed.push(ClosedPosition { position, exit_price, reason });
        }
        Ok(closed)
    }

    /// Log `message` as critical and send it to the notifier.
    pub(crate) fn escalate(&self, symbol: &str, message: &str) {
        self.core.escalate(symbol, message);
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn precheck(&self, signal: &TradeSignal) -> BxResult<()> {
        signal.validate()?;
        if !self.core.registry.can_open(&signal.strategy) {
            return Err(BxError::Rejected(format!(
                "strategy {} is at its position limit",
                signal.strategy
            )));
        }
        Ok(())
    }

    async fn size(&self, signal: &TradeSignal) -> BxResult<(ContractInfo, f64)> {
        let contract = self.core.client.contract_info(&signal.symbol).await?;
        let sizing = self.core.config.sizing;
        let equity = match sizing {
            SizingMode::RiskPercent { .. } => self.core.client.balance().await?.equity,
            SizingMode::FixedNotional { .. } => 0.0,
        };
        let quantity = size_position(signal, &contract, sizing, equity)?;
        debug!("[executor] {} sized to {quantity} ({sizing:?})", signal.symbol);
        Ok((contract, quantity))
    }

    async fn spawn_protection(&self, job: ProtectionJob, guard: OwnedMutexGuard<()>) -> ExecutionResult {
        let core = Arc::clone(&self.core);
        let (symbol, direction, id) = (job.signal.symbol.clone(), job.signal.direction, job.position_id);
        let task = tokio::spawn(async move {
            let _guard = guard;
            core.protect(job).await
        });
        match task.await {
            Ok(result) => result,
            Err(e) => {
                let msg = format!("protection task for position {id} aborted: {e}");
                self.core.escalate(&symbol, &msg);
                ExecutionResult::failed(&symbol, direction, &BxError::Internal(msg))
            }
        }
    }
}

impl ExecCore {
    async fn protect(&self, job: ProtectionJob) -> ExecutionResult {
        let confirmed = Mutex::new(ConfirmedLegs::default());
        let attempt = AssertUnwindSafe(self.establish(&job, &confirmed))
            .catch_unwind()
            .await;

        let failure = match attempt {
            Ok(Ok(position)) => {
                info!(
                    "[executor] position {} OPEN {} {} qty={} entry={} sl={:?} tp={:?}",
                    position.id,
                    position.symbol,
                    position.direction,
                    position.quantity,
                    position.entry_price,
                    position.sl_order_id,
                    position.tp_order_id,
                );
                return ExecutionResult::from_position(&position);
            }
            Ok(Err(e)) => e,
            Err(panic) => BxError::Internal(format!("protection panicked: {}", panic_message(&*panic))),
        };

        let legs = confirmed.lock().unwrap_or_else(PoisonError::into_inner).clone();
        warn!(
            "[executor] position {} protection failed, rolling back: {failure}",
            job.position_id
        );
        let rollback = self.rollback(&job, &legs).await;

        let mut result = ExecutionResult::failed(&job.signal.symbol, job.signal.direction, &failure);
        result.position_id = Some(job.position_id);
        result.entry_order_id = Some(job.entry_order_id.clone());
        result.sl_order_id = legs.stop_loss;
        result.tp_order_id = legs.take_profit;
        result.entry_price = job.signal.entry_price;
        result.quantity = job.quantity;
        result.rollback = Some(rollback);
        result
    }

    async fn establish(&self, job: &ProtectionJob, confirmed: &Mutex<ConfirmedLegs>) -> BxResult<Position> {
        let signal = &job.signal;
        let contract = match &job.contract {
            Some(contract) => contract.clone(),
            None => self.client.contract_info(&signal.symbol).await?,
        };
        let direction = signal.direction;
        let working_type = self.config.working_type;

        let stop = OrderRequest::conditional(
            &signal.symbol,
            OrderType::StopMarket,
            direction.exit_side(),
            direction,
            job.quantity,
            contract.round_price(signal.stop_loss),
            working_type,
        );
        let sl = self
            .place_with_retries(&stop, "stop-loss", self.config.protection_retries)
            .await
            .map_err(|e| protection_failure("stop-loss", e))?;
        lock_legs(confirmed).stop_loss = Some(sl.order_id.clone());
        self.registry.set_stop_loss(job.position_id, &sl.order_id)?;

        let target = OrderRequest::conditional(
            &signal.symbol,
            OrderType::TakeProfitMarket,
            direction.exit_side(),
            direction,
            job.quantity,
            contract.round_price(signal.take_profit),
            working_type,
        );
        let tp = self
            .place_with_retries(&target, "take-profit", self.config.protection_retries)
            .await
            .map_err(|e| protection_failure("take-profit", e))?;
        lock_legs(confirmed).take_profit = Some(tp.order_id.clone());
        self.registry.set_take_profit(job.position_id, &tp.order_id)?;

        let entry_price = self.realized_entry_price(job).await;
        self.registry.set_entry(job.position_id, &job.entry_order_id, entry_price)?;
        self.registry.mark_open(job.position_id, ProtectionMode::Separate)?;
        self.registry
            .get(job.position_id)
            .ok_or_else(|| BxError::Internal(format!("position {} vanished", job.position_id)))
    }

    /// Undo a confirmed entry: cancel whatever protective legs exist, then
    /// flatten.
    async fn rollback(&self, job: &ProtectionJob, legs: &ConfirmedLegs) -> RollbackOutcome {
        let symbol = &job.signal.symbol;
        if let Err(e) = self.registry.mark_closing(job.position_id) {
            warn!("[executor] {e}");
        }

        let mut outcome = RollbackOutcome::default();
        for (leg, order_id) in [("take-profit", &legs.take_profit), ("stop-loss", &legs.stop_loss)] {
            let Some(order_id) = order_id else { continue };
            match self.client.cancel_order(symbol, order_id).await {
                Ok(()) => outcome.cancelled_orders.push(order_id.clone()),
                Err(e) => {
                    warn!("[executor] rollback: cancel {leg} {order_id} failed: {e}");
                    outcome.cancel_errors.push(format!("{leg} {order_id}: {e}"));
                }
            }
        }

        match self.flatten(symbol, job.quantity, job.signal.direction).await {
            Ok(ack) => {
                info!(
                    "[executor] rollback: position {} flattened by order {}",
                    job.position_id, ack.order_id
                );
                outcome.flatten_order_id = Some(ack.order_id);
                if let Err(e) = self.registry.mark_closed(job.position_id, "rollback") {
                    warn!("[executor] {e}");
                }
            }
            Err(e) => {
                self.escalate(
                    symbol,
                    &format!(
                        "rollback of position {} could not flatten {} {}: {e}",
                        job.position_id, job.quantity, job.signal.direction
                    ),
                );
                outcome.flatten_error = Some(e.to_string());
            }
        }
        outcome
    }

    /// Market exit of `quantity` on `direction`.
    async fn flatten(&self, symbol: &str, quantity: f64, direction: Direction) -> BxResult<OrderInfo> {
        let exit = OrderRequest::market(symbol, direction.exit_side(), direction, quantity);
        self.place_with_retries(&exit, "flatten", self.config.flatten_retries).await
    }

    /// Place `order`, retrying any failure `retries` times with a fixed pause.
    async fn place_with_retries(&self, order: &OrderRequest, leg: &str, retries: u32) -> BxResult<OrderInfo> {
        let attempts = retries + 1;
        let pause = Duration::from_millis(self.config.protection_retry_pause_ms);
        let mut attempt = 1;
        loop {
            match self.client.place_order(order).await {
                Ok(ack) => return Ok(ack),
                Err(BxError::Closed) => return Err(BxError::Closed),
                Err(e) if attempt >= attempts => {
                    warn!("[executor] {leg} on {} failed after {attempts} attempts: {e}", order.symbol);
                    return Err(e);
                }
                Err(e) => {
                    warn!("[executor] {leg} on {} attempt {attempt}/{attempts} failed: {e}", order.symbol);
                }
            }
            attempt += 1;
            tokio::time::sleep(pause).await;
        }
    }

    /// Average fill of the entry, or the signal's reference price.
    async fn realized_entry_price(&self, job: &ProtectionJob) -> f64 {
        match self.client.query_order(&job.signal.symbol, &job.entry_order_id).await {
            Ok(order) if order.avg_price > 0.0 => order.avg_price,
            Ok(_) => job.signal.entry_price,
            Err(e) => {
                debug!("[executor] entry {} fill price unavailable: {e}", job.entry_order_id);
                job.signal.entry_price
            }
        }
    }

    /// Cancel the protective orders of `position`. Separate legs are
    /// cancelled by id; attached ones are found among the open orders.
    async fn cancel_protection(&self, position: &Position) {
        let mut ids: Vec<String> = [&position.sl_order_id, &position.tp_order_id]
            .into_iter()
            .flatten()
            .cloned()
            .collect();
        if position.protection == Some(ProtectionMode::Attached) {
            match self.client.open_orders(Some(&position.symbol)).await {
                Ok(orders) => ids.extend(
                    orders
                        .into_iter()
                        .filter(|o| {
                            o.position_side == position.direction
                                && matches!(o.order_type, OrderType::StopMarket | OrderType::TakeProfitMarket)
                        })
                        .map(|o| o.order_id),
                ),
                Err(e) => warn!("[executor] {} open orders unavailable: {e}", position.symbol),
            }
        }
        for id in ids {
            if let Err(e) = self.client.cancel_order(&position.symbol, &id).await {
                warn!("[executor] cancel {id} on {} failed: {e}", position.symbol);
            }
        }
    }

    /// Exit price and reason for a position the exchange reports flat.
    async fn resolve_exit(&self, position: &Position) -> (f64, String) {
        let legs = [
            (&position.sl_order_id, "stop_loss"),
            (&position.tp_order_id, "take_profit"),
        ];
        let mut exit = None;
        let mut survivors = Vec::new();
        for (id, reason) in legs {
            let Some(id) = id else { continue };
            match self.client.query_order(&position.symbol, id).await {
                Ok(order) if order.status == OrderStatus::Filled && exit.is_none() => {
                    let price = if order.avg_price > 0.0 { order.avg_price } else { order.stop_price };
                    exit = Some((price, reason.to_string()));
                }
                Ok(order) if !order.status.is_terminal() => survivors.push(id.clone()),
                Ok(_) => {}
                Err(e) => debug!("[executor] leg {id} status unavailable: {e}"),
            }
        }
        for id in survivors {
            if let Err(e) = self.client.cancel_order(&position.symbol, &id).await {
                warn!("[executor] cancel surviving leg {id} failed: {e}");
            }
        }
        match exit {
            Some(exit) => exit,
            None => {
                let price = self
                    .client
                    .ticker_price(&position.symbol)
                    .await
                    .unwrap_or(position.entry_price);
                (price, "closed_externally".to_string())
            }
        }
    }

    async fn exit_price(&self, symbol: &str, ack: &OrderInfo) -> f64 {
        if ack.avg_price > 0.0 {
            return ack.avg_price;
        }
        match self.client.query_order(symbol, &ack.order_id).await {
            Ok(order) if order.avg_price > 0.0 => order.avg_price,
            _ => self.client.ticker_price(symbol).await.unwrap_or(0.0),
        }
    }

    fn escalate(&self, symbol: &str, message: &str) {
        error!("[executor] CRITICAL {symbol}: {message}");
        notify_detached(
            &self.notifier,
            ExecutionEvent::Critical { symbol: symbol.to_string(), message: message.to_string() },
        );
    }
}

/// OPEN positions, and CLOSING ones left behind by a failed flatten. A
/// PENDING position is still inside its protection task.
fn awaiting_exchange_close(position: &Position) -> bool {
    matches!(position.status, PositionStatus::Open | PositionStatus::Closing)
}

fn protection_failure(leg: &str, err: BxError) -> BxError {
    match err {
        BxError::Closed => BxError::Closed,
        other => BxError::ProtectionFailure { leg: leg.to_string(), message: other.to_string() },
    }
}

fn lock_legs(legs: &Mutex<ConfirmedLegs>) -> std::sync::MutexGuard<'_, ConfirmedLegs> {
    legs.lock().unwrap_or_else(PoisonError::into_inner)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use bx_core::config::{ExchangeConfig, PositionsConfig};
    use bx_core::types::Side;
    use bx_td::Credentials;
    use bx_td::endpoints::{ALL_OPEN_ORDERS, BALANCE, CONTRACTS, ORDER, POSITIONS, TICKER};
    use bx_td::mock::{MockReply, MockTransport};
    use bx_td::request::HttpMethod;
    use serde_json::json;
    use tokio::time::Instant;

    use super::*;
    use crate::collaborators::testing::RecordingNotifier;

    struct Harness {
        pub mock: Arc<MockTransport>,
        pub executor: OrderExecutor,
        pub notifier: Arc<RecordingNotifier>,
    }

    fn harness(config: ExecutionConfig) -> Harness {
        let mock = Arc::new(MockTransport::new());
        let client = Arc::new(ExchangeClient::with_transport(
            Credentials::new("key", "secret"),
            mock.clone(),
            &ExchangeConfig::default(),
        ));
        let registry = Arc::new(PositionRegistry::new(PositionsConfig::default()));
        let notifier = Arc::new(RecordingNotifier::default());
        let executor = OrderExecutor::new(client, registry, notifier.clone(), config);
        Harness { mock, executor, notifier }
    }

    fn fixed(notional: f64) -> ExecutionConfig {
        ExecutionConfig {
            sizing: SizingMode::FixedNotional { notional },
            ..Default::default()
        }
    }

    fn contract(mock: &MockTransport, symbol: &str, precision: u32, min_qty: f64) {
        mock.always(
            HttpMethod::Get,
            CONTRACTS,
            MockReply::data(json!([{
                "symbol": symbol, "quantityPrecision": precision, "pricePrecision": 2,
                "tradeMinQuantity": min_qty
            }])),
        );
    }

    fn ack(id: &str) -> MockReply {
        MockReply::data(json!({"order": {"orderId": id}}))
    }

    fn long(entry: f64, stop: f64, target: f64) -> TradeSignal {
        TradeSignal {
            strategy: "trend".into(),
            symbol: "DOGE-USDT".into(),
            direction: Direction::Long,
            entry_price: entry,
            stop_loss: stop,
            take_profit: target,
        }
    }

    fn standard_routes(mock: &MockTransport) {
        contract(mock, "DOGE-USDT", 0, 10.0);
        mock.push_when(HttpMethod::Post, ORDER, "type", "MARKET", ack("E1"));
        mock.always_when(HttpMethod::Post, ORDER, "type", "STOP_MARKET", ack("S1"));
        mock.always_when(HttpMethod::Post, ORDER, "type", "TAKE_PROFIT_MARKET", ack("T1"));
        mock.always(
            HttpMethod::Get,
            ORDER,
            MockReply::data(json!({"order": {
                "orderId": "E1", "symbol": "DOGE-USDT", "side": "BUY", "positionSide": "LONG",
                "type": "MARKET", "status": "FILLED", "origQty": "10", "executedQty": "10",
                "avgPrice": "10.02"
            }})),
        );
    }

    #[tokio::test(start_paused = true)]
    async fn quantity_clamped_to_minimum_and_legs_placed_in_order() {
        let h = harness(fixed(40.0));
        standard_routes(&h.mock);

        let result = h.executor.execute_trade(&long(10.0, 9.0, 12.0)).await;
        assert!(result.success, "{result:?}");
        assert_eq!(result.quantity, 10.0);
        assert_eq!(result.entry_order_id.as_deref(), Some("E1"));
        assert_eq!(result.sl_order_id.as_deref(), Some("S1"));
        assert_eq!(result.tp_order_id.as_deref(), Some("T1"));
        assert_eq!(result.entry_price, 10.02);
        assert_eq!(result.protection, Some(ProtectionMode::Separate));

        let posts = h.mock.calls_to(HttpMethod::Post, ORDER);
        let kinds: Vec<_> = posts.iter().map(|c| c.param("type").unwrap().to_string()).collect();
        assert_eq!(kinds, ["MARKET", "STOP_MARKET", "TAKE_PROFIT_MARKET"]);
        for call in &posts {
            assert_eq!(call.param("quantity"), Some("10"));
            assert_eq!(call.param("positionSide"), Some("LONG"));
        }
        assert_eq!(posts[0].param("side"), Some("BUY"));
        assert_eq!(posts[1].param("side"), Some("SELL"));
        assert_eq!(posts[1].param("stopPrice"), Some("9"));
        assert_eq!(posts[2].param("stopPrice"), Some("12"));

        let position = h.executor.registry().get(result.position_id.unwrap()).unwrap();
        assert_eq!(position.status, PositionStatus::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_loss_retry_pauses_once() {
        let h = harness(fixed(40.0));
        standard_routes(&h.mock);
        h.mock.push_when(
            HttpMethod::Post,
            ORDER,
            "type",
            "STOP_MARKET",
            MockReply::exchange(-1001, "internal error"),
        );

        let started = Instant::now();
        let result = h.executor.execute_trade(&long(10.0, 9.0, 12.0)).await;
        assert!(result.success, "{result:?}");
        assert_eq!(result.sl_order_id.as_deref(), Some("S1"));
        assert_eq!(h.mock.count_when(HttpMethod::Post, ORDER, "type", "STOP_MARKET"), 2);
        assert_eq!(started.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_loss_exhaustion_flattens_once() {
        let h = harness(fixed(40.0));
        contract(&h.mock, "DOGE-USDT", 0, 10.0);
        h.mock.push_when(HttpMethod::Post, ORDER, "type", "MARKET", ack("E1"));
        h.mock.push_when(HttpMethod::Post, ORDER, "type", "MARKET", ack("F1"));
        h.mock.always_when(
            HttpMethod::Post,
            ORDER,
            "type",
            "STOP_MARKET",
            MockReply::exchange(-1001, "internal error"),
        );

        let started = Instant::now();
        let result = h.executor.execute_trade(&long(10.0, 9.0, 12.0)).await;
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("stop-loss"));
        // 4 attempts, 3 pauses.
        assert_eq!(h.mock.count_when(HttpMethod::Post, ORDER, "type", "STOP_MARKET"), 4);
        assert_eq!(started.elapsed(), Duration::from_secs(3));
        assert_eq!(h.mock.count_when(HttpMethod::Post, ORDER, "type", "TAKE_PROFIT_MARKET"), 0);

        let markets: Vec<_> = h
            .mock
            .calls_to(HttpMethod::Post, ORDER)
            .into_iter()
            .filter(|c| c.param("type") == Some("MARKET"))
            .collect();
        assert_eq!(markets.len(), 2);
        let flatten = &markets[1];
        assert_eq!(flatten.param("side"), Some(Side::Sell.as_str()));
        assert_eq!(flatten.param("positionSide"), Some("LONG"));
        assert_eq!(flatten.param("quantity"), Some("10"));
        assert_eq!(h.mock.count(HttpMethod::Delete, ORDER), 0);

        let rollback = result.rollback.unwrap();
        assert!(rollback.flattened());
        assert_eq!(rollback.flatten_order_id.as_deref(), Some("F1"));
        let position = h.executor.registry().get(result.position_id.unwrap()).unwrap();
        assert_eq!(position.status, PositionStatus::Closed);
        assert!(h.executor.registry().can_open("trend"));
    }

    #[tokio::test(start_paused = true)]
    async fn take_profit_failure_cancels_stop_then_flattens() {
        let h = harness(fixed(40.0));
        contract(&h.mock, "DOGE-USDT", 0, 10.0);
        h.mock.push_when(HttpMethod::Post, ORDER, "type", "MARKET", ack("E1"));
        h.mock.push_when(HttpMethod::Post, ORDER, "type", "MARKET", ack("F1"));
        h.mock.always_when(HttpMethod::Post, ORDER, "type", "STOP_MARKET", ack("S1"));
        h.mock.always_when(
            HttpMethod::Post,
            ORDER,
            "type",
            "TAKE_PROFIT_MARKET",
            MockReply::exchange(101204, "insufficient margin"),
        );
        h.mock.always(HttpMethod::Delete, ORDER, MockReply::data(json!({})));

        let result = h.executor.execute_trade(&long(10.0, 9.0, 12.0)).await;
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("take-profit"));

        let calls = h.mock.calls();
        let cancel_idx = calls
            .iter()
            .position(|c| c.method == HttpMethod::Delete && c.param("orderId") == Some("S1"))
            .expect("stop-loss cancelled");
        let flatten_idx = calls
            .iter()
            .rposition(|c| c.method == HttpMethod::Post && c.param("type") == Some("MARKET"))
            .unwrap();
        assert!(cancel_idx < flatten_idx);
        assert_eq!(calls[flatten_idx].param("side"), Some("SELL"));
        assert_eq!(h.mock.count(HttpMethod::Delete, ORDER), 1);

        let rollback = result.rollback.unwrap();
        assert_eq!(rollback.cancelled_orders, ["S1"]);
        assert!(rollback.flattened());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_flatten_is_escalated() {
        let h = harness(fixed(40.0));
        contract(&h.mock, "DOGE-USDT", 0, 10.0);
        h.mock.push_when(HttpMethod::Post, ORDER, "type", "MARKET", ack("E1"));
        h.mock.always_when(HttpMethod::Post, ORDER, "type", "STOP_MARKET", MockReply::exchange(-1001, "x"));
        // Every flatten attempt fails once the entry ack is consumed.
        h.mock.always_when(HttpMethod::Post, ORDER, "type", "MARKET", MockReply::exchange(-1001, "x"));

        let result = h.executor.execute_trade(&long(10.0, 9.0, 12.0)).await;
        assert!(!result.success);
        let rollback = result.rollback.unwrap();
        assert!(!rollback.flattened());
        assert!(rollback.flatten_error.is_some());
        // Entry + 4 flatten attempts.
        assert_eq!(h.mock.count_when(HttpMethod::Post, ORDER, "type", "MARKET"), 5);

        let position = h.executor.registry().get(result.position_id.unwrap()).unwrap();
        assert_eq!(position.status, PositionStatus::Closing);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(h.notifier.critical_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn entry_failure_has_no_side_effects() {
        let h = harness(fixed(40.0));
        contract(&h.mock, "DOGE-USDT", 0, 10.0);
        h.mock.always_when(HttpMethod::Post, ORDER, "type", "MARKET", MockReply::exchange(101400, "bad qty"));

        let result = h.executor.execute_trade(&long(10.0, 9.0, 12.0)).await;
        assert!(!result.success);
        assert_eq!(result.error_code, Some(101400));
        assert!(result.rollback.is_none());
        assert_eq!(h.mock.count(HttpMethod::Post, ORDER), 1);
        assert!(h.executor.registry().get_open(&PositionFilter::all()).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn position_limit_rejects_before_any_call() {
        let h = harness(fixed(40.0));
        standard_routes(&h.mock);
        assert!(h.executor.execute_trade(&long(10.0, 9.0, 12.0)).await.success);
        let before = h.mock.calls().len();

        let second = h.executor.execute_trade(&long(10.0, 9.0, 12.0)).await;
        assert!(!second.success);
        assert!(second.error.unwrap().contains("position limit"));
        assert_eq!(h.mock.calls().len(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn risk_sizing_reads_equity() {
        let h = harness(ExecutionConfig {
            sizing: SizingMode::RiskPercent { percent: 2.0 },
            ..Default::default()
        });
        standard_routes(&h.mock);
        h.mock.always(
            HttpMethod::Get,
            BALANCE,
            MockReply::data(json!({"balance": {"asset": "USDT", "balance": "1000", "equity": "1000",
                                               "availableMargin": "900"}})),
        );
        // 2% of 1000 = 20 risk over a 1.0 stop distance → 20 contracts.
        let result = h.executor.execute_trade(&long(10.0, 9.0, 12.0)).await;
        assert!(result.success, "{result:?}");
        assert_eq!(result.quantity, 20.0);
    }

    #[tokio::test(start_paused = true)]
    async fn limit_entry_carries_attached_legs() {
        let h = harness(fixed(40.0));
        contract(&h.mock, "DOGE-USDT", 0, 1.0);
        h.mock.always_when(HttpMethod::Post, ORDER, "type", "LIMIT", ack("L1"));

        let result = h.executor.execute_limit_trade(&long(10.5, 9.0, 12.0), 10.0).await;
        assert!(result.success, "{result:?}");
        assert_eq!(result.entry_order_id.as_deref(), Some("L1"));
        assert_eq!(result.protection, Some(ProtectionMode::Attached));
        assert!(result.position_id.is_none());

        let call = &h.mock.calls_to(HttpMethod::Post, ORDER)[0];
        assert_eq!(call.param("price"), Some("10"));
        assert_eq!(call.param("quantity"), Some("4"));
        let sl: serde_json::Value = serde_json::from_str(call.param("stopLoss").unwrap()).unwrap();
        assert_eq!(sl["type"], "STOP_MARKET");
        assert_eq!(sl["stopPrice"], 9.0);
        assert!(call.param("takeProfit").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn close_position_cancels_all_then_flattens() {
        let h = harness(fixed(40.0));
        h.mock.always(HttpMethod::Delete, ALL_OPEN_ORDERS, MockReply::data(json!({})));
        h.mock.always(HttpMethod::Post, ORDER, ack("X1"));

        let ack = h
            .executor
            .close_position("BTC-USDT", 0.5, Direction::Short)
            .await
            .unwrap();
        assert_eq!(ack.order_id, "X1");

        let calls = h.mock.calls();
        assert_eq!(calls[0].method, HttpMethod::Delete);
        assert_eq!(calls[0].path, ALL_OPEN_ORDERS);
        assert_eq!(calls[1].param("side"), Some("BUY"));
        assert_eq!(calls[1].param("positionSide"), Some("SHORT"));
        assert_eq!(calls[1].param("type"), Some("MARKET"));

        assert!(h.executor.close_position("BTC-USDT", 0.0, Direction::Short).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn sync_detects_stop_loss_exit() {
        let h = harness(fixed(40.0));
        standard_routes(&h.mock);
        let opened = h.executor.execute_trade(&long(10.0, 9.0, 12.0)).await;
        let id = opened.position_id.unwrap();

        h.mock.always(HttpMethod::Get, POSITIONS, MockReply::data(json!([])));
        h.mock.always_when(
            HttpMethod::Get,
            ORDER,
            "orderId",
            "S1",
            MockReply::data(json!({"order": {
                "orderId": "S1", "symbol": "DOGE-USDT", "side": "SELL", "positionSide": "LONG",
                "type": "STOP_MARKET", "status": "FILLED", "avgPrice": "8.99", "stopPrice": "9"
            }})),
        );
        h.mock.always_when(
            HttpMethod::Get,
            ORDER,
            "orderId",
            "T1",
            MockReply::data(json!({"order": {
                "orderId": "T1", "symbol": "DOGE-USDT", "side": "SELL", "positionSide": "LONG",
                "type": "TAKE_PROFIT_MARKET", "status": "NEW", "stopPrice": "12"
            }})),
        );
        h.mock.always(HttpMethod::Delete, ORDER, MockReply::data(json!({})));

        let closed = h.executor.sync_closed_positions().await.unwrap();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].position.id, id);
        assert_eq!(closed[0].exit_price, 8.99);
        assert_eq!(closed[0].reason, "stop_loss");
        // The untriggered take-profit is cleaned up.
        let cancels = h.mock.calls_to(HttpMethod::Delete, ORDER);
        assert_eq!(cancels.len(), 1);
        assert_eq!(cancels[0].param("orderId"), Some("T1"));
        assert_eq!(h.executor.registry().get(id).unwrap().status, PositionStatus::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn sync_keeps_live_positions() {
        let h = harness(fixed(40.0));
        standard_routes(&h.mock);
        let opened = h.executor.execute_trade(&long(10.0, 9.0, 12.0)).await;
        h.mock.always(
            HttpMethod::Get,
            POSITIONS,
            MockReply::data(json!([{"symbol": "DOGE-USDT", "positionSide": "LONG",
                                    "positionAmt": "10", "avgPrice": "10.02"}])),
        );
        assert!(h.executor.sync_closed_positions().await.unwrap().is_empty());
        let position = h.executor.registry().get(opened.position_id.unwrap()).unwrap();
        assert_eq!(position.status, PositionStatus::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn registered_close_cancels_legs_and_flattens() {
        let h = harness(fixed(40.0));
        standard_routes(&h.mock);
        let opened = h.executor.execute_trade(&long(10.0, 9.0, 12.0)).await;
        let id = opened.position_id.unwrap();

        h.mock.always(HttpMethod::Delete, ORDER, MockReply::data(json!({})));
        h.mock.push_when(HttpMethod::Post, ORDER, "type", "MARKET", ack("X1"));
        h.mock.always(HttpMethod::Get, TICKER, MockReply::data(json!({"lastPrice": "10.5"})));

        let closed = h.executor.close_registered_position(id, "shutdown").await.unwrap();
        assert_eq!(closed.reason, "shutdown");
        assert_eq!(closed.position.status, PositionStatus::Closed);
        let cancelled: Vec<_> = h
            .mock
            .calls_to(HttpMethod::Delete, ORDER)
            .iter()
            .map(|c| c.param("orderId").unwrap().to_string())
            .collect();
        assert_eq!(cancelled, ["S1", "T1"]);
        assert!(h.executor.close_registered_position(id, "again").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn filled_limit_gets_separate_protection() {
        let h = harness(fixed(40.0));
        contract(&h.mock, "DOGE-USDT", 0, 1.0);
        h.mock.always_when(HttpMethod::Post, ORDER, "type", "STOP_MARKET", ack("S9"));
        h.mock.always_when(HttpMethod::Post, ORDER, "type", "TAKE_PROFIT_MARKET", ack("T9"));

        let fill = FilledOrder {
            pending_id: 1,
            strategy: "trend".into(),
            symbol: "DOGE-USDT".into(),
            direction: Direction::Long,
            entry_price: 10.0,
            quantity: 4.0,
            stop_loss: 9.0,
            take_profit: 12.0,
            exchange_order_id: "L1".into(),
            protection_attached: false,
        };
        let result = h.executor.attach_protection(&fill).await;
        assert!(result.success, "{result:?}");
        assert_eq!(result.entry_order_id.as_deref(), Some("L1"));
        assert_eq!(result.sl_order_id.as_deref(), Some("S9"));
        assert_eq!(h.mock.count_when(HttpMethod::Post, ORDER, "quantity", "4"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn attached_fill_is_adopted_without_orders() {
        let h = harness(fixed(40.0));
        let fill = FilledOrder {
            pending_id: 1,
            strategy: "trend".into(),
            symbol: "DOGE-USDT".into(),
            direction: Direction::Long,
            entry_price: 10.0,
            quantity: 4.0,
            stop_loss: 9.0,
            take_profit: 12.0,
            exchange_order_id: "L1".into(),
            protection_attached: true,
        };
        let result = h.executor.adopt_filled_limit(&fill).await;
        assert!(result.success);
        assert_eq!(result.protection, Some(ProtectionMode::Attached));
        assert!(h.mock.calls().is_empty());
        let position = h.executor.registry().get(result.position_id.unwrap()).unwrap();
        assert_eq!(position.status, PositionStatus::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn closing_position_is_closed_once_exchange_is_flat() {
        let h = harness(fixed(40.0));
        contract(&h.mock, "DOGE-USDT", 0, 10.0);
        h.mock.push_when(HttpMethod::Post, ORDER, "type", "MARKET", ack("E1"));
        h.mock.always_when(HttpMethod::Post, ORDER, "type", "STOP_MARKET", MockReply::exchange(-1001, "x"));
        h.mock.always_when(HttpMethod::Post, ORDER, "type", "MARKET", MockReply::exchange(-1001, "x"));

        let result = h.executor.execute_trade(&long(10.0, 9.0, 12.0)).await;
        let id = result.position_id.unwrap();
        assert_eq!(h.executor.registry().get(id).unwrap().status, PositionStatus::Closing);
        assert!(!h.executor.registry().can_open("trend"));

        // Still on the book: stays CLOSING.
        h.mock.push(
            HttpMethod::Get,
            POSITIONS,
            MockReply::data(json!([{"symbol": "DOGE-USDT", "positionSide": "LONG",
                                    "positionAmt": "10", "avgPrice": "10"}])),
        );
        h.mock.always(HttpMethod::Get, POSITIONS, MockReply::data(json!([])));
        h.mock.always(HttpMethod::Get, TICKER, MockReply::data(json!({"lastPrice": "9.5"})));
        assert!(h.executor.sync_closed_positions().await.unwrap().is_empty());
        assert_eq!(h.executor.registry().get(id).unwrap().status, PositionStatus::Closing);

        let closed = h.executor.sync_closed_positions().await.unwrap();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].position.id, id);
        assert_eq!(closed[0].exit_price, 9.5);
        assert_eq!(closed[0].reason, "closed_externally");
        assert_eq!(h.executor.registry().get(id).unwrap().status, PositionStatus::Closed);
        assert!(h.executor.registry().can_open("trend"));
        assert_eq!(h.mock.count(HttpMethod::Get, POSITIONS), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn panic_after_take_profit_rolls_back() {
        let h = harness(fixed(40.0));
        contract(&h.mock, "DOGE-USDT", 0, 10.0);
        h.mock.push_when(HttpMethod::Post, ORDER, "type", "MARKET", ack("E1"));
        h.mock.push_when(HttpMethod::Post, ORDER, "type", "MARKET", ack("F1"));
        h.mock.always_when(HttpMethod::Post, ORDER, "type", "STOP_MARKET", ack("S1"));
        h.mock.always_when(HttpMethod::Post, ORDER, "type", "TAKE_PROFIT_MARKET", ack("T1"));
        // The fill-price lookup runs after both legs are confirmed.
        h.mock.always(HttpMethod::Get, ORDER, MockReply::panic("malformed fill"));
        h.mock.always(HttpMethod::Delete, ORDER, MockReply::data(json!({})));

        let result = h.executor.execute_trade(&long(10.0, 9.0, 12.0)).await;
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("panicked"), "{result:?}");

        let rollback = result.rollback.unwrap();
        assert_eq!(rollback.cancelled_orders, ["T1", "S1"]);
        assert_eq!(rollback.flatten_order_id.as_deref(), Some("F1"));
        let position = h.executor.registry().get(result.position_id.unwrap()).unwrap();
        assert_eq!(position.status, PositionStatus::Closed);
        assert_eq!(position.close_reason.as_deref(), Some("rollback"));
        assert!(h.executor.registry().can_open("trend"));
    }

    #[tokio::test(start_paused = true)]
    async fn registry_failure_after_take_profit_rolls_back() {
        let h = harness(fixed(40.0));
        standard_routes(&h.mock);
        h.mock.push_when(HttpMethod::Post, ORDER, "type", "MARKET", ack("F1"));
        h.mock.push_when(HttpMethod::Post, ORDER, "type", "STOP_MARKET", MockReply::exchange(-1001, "x"));
        h.mock.always(HttpMethod::Delete, ORDER, MockReply::data(json!({})));

        // Moves the position out of PENDING during the stop-loss pause, so
        // the final OPEN transition fails after both legs are placed.
        let registry = h.executor.registry().clone();
        let interfere = async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            let id = registry.get_open(&PositionFilter::all())[0].id;
            registry.mark_closing(id).unwrap();
        };
        let signal = long(10.0, 9.0, 12.0);
        let (result, ()) = tokio::join!(h.executor.execute_trade(&signal), interfere);

        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("not allowed"), "{result:?}");
        assert_eq!(result.tp_order_id.as_deref(), Some("T1"));
        let rollback = result.rollback.unwrap();
        assert_eq!(rollback.cancelled_orders, ["T1", "S1"]);
        assert!(rollback.flattened());
        let position = h.executor.registry().get(result.position_id.unwrap()).unwrap();
        assert_eq!(position.status, PositionStatus::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_caller_does_not_abandon_protection() {
        let h = harness(fixed(40.0));
        standard_routes(&h.mock);
        h.mock.push_when(HttpMethod::Post, ORDER, "type", "STOP_MARKET", MockReply::exchange(-1001, "x"));

        // Gives up while the stop-loss is waiting for its second attempt.
        let outcome = tokio::time::timeout(
            Duration::from_millis(500),
            h.executor.execute_trade(&long(10.0, 9.0, 12.0)),
        )
        .await;
        assert!(outcome.is_err());
        let id = h.executor.registry().get_open(&PositionFilter::all())[0].id;
        assert_eq!(h.executor.registry().get(id).unwrap().status, PositionStatus::Pending);

        tokio::time::sleep(Duration::from_secs(2)).await;
        let position = h.executor.registry().get(id).unwrap();
        assert_eq!(position.status, PositionStatus::Open);
        assert_eq!(position.sl_order_id.as_deref(), Some("S1"));
        assert_eq!(position.tp_order_id.as_deref(), Some("T1"));
        assert_eq!(h.mock.count_when(HttpMethod::Post, ORDER, "type", "STOP_MARKET"), 2);
        assert_eq!(h.mock.count_when(HttpMethod::Post, ORDER, "type", "TAKE_PROFIT_MARKET"), 1);

        // The symbol lock went with the task.
        let next = h.executor.execute_trade(&long(10.0, 9.0, 12.0)).await;
        assert!(next.error.unwrap().contains("position limit"));
    }

    #[tokio::test(start_paused = true)]
    async fn sync_skips_position_closed_underneath_it() {
        let h = harness(fixed(40.0));
        standard_routes(&h.mock);
        h.mock.push_when(HttpMethod::Post, ORDER, "type", "MARKET", ack("E2"));
        let first = h.executor.execute_trade(&long(10.0, 9.0, 12.0)).await.position_id.unwrap();
        let swing = TradeSignal { strategy: "swing".into(), ..long(10.0, 9.0, 12.0) };
        let second = h.executor.execute_trade(&swing).await.position_id.unwrap();

        h.mock.always(HttpMethod::Get, POSITIONS, MockReply::data(json!([])));
        h.mock.always(HttpMethod::Get, TICKER, MockReply::data(json!({"lastPrice": "9.5"})));
        h.mock.always(HttpMethod::Delete, ORDER, MockReply::data(json!({})));
        // The first position's stop-loss lookup retries for a while.
        for _ in 0..4 {
            h.mock.push_when(HttpMethod::Get, ORDER, "orderId", "S1", MockReply::network("timeout"));
        }
        h.mock.always_when(
            HttpMethod::Get,
            ORDER,
            "orderId",
            "S1",
            MockReply::data(json!({"order": {
                "orderId": "S1", "symbol": "DOGE-USDT", "side": "SELL", "positionSide": "LONG",
                "type": "STOP_MARKET", "status": "FILLED", "avgPrice": "8.99", "stopPrice": "9"
            }})),
        );
        h.mock.always_when(
            HttpMethod::Get,
            ORDER,
            "orderId",
            "T1",
            MockReply::data(json!({"order": {
                "orderId": "T1", "symbol": "DOGE-USDT", "side": "SELL", "positionSide": "LONG",
                "type": "TAKE_PROFIT_MARKET", "status": "NEW", "stopPrice": "12"
            }})),
        );

        let registry = h.executor.registry().clone();
        let interfere = async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            registry.mark_closed(first, "manual").unwrap();
        };
        let (closed, ()) = tokio::join!(h.executor.sync_closed_positions(), interfere);

        let closed = closed.unwrap();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].position.id, second);
        assert_eq!(closed[0].reason, "stop_loss");
        assert_eq!(registry.get(first).unwrap().close_reason.as_deref(), Some("manual"));
    }
}
