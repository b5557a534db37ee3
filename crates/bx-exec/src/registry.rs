//! Position registry.
//!
//! Every position the executor opens is tracked here from the moment its
//! entry order is confirmed until it is flat again. The registry is the only
//! place that enforces the per-strategy concurrency limit.
//!
//! ```text
//!   open()        mark_open()        mark_closing()       mark_closed()
//!  ───────► PENDING ────────► OPEN ───────────► CLOSING ───────────► CLOSED
//!              │                │                                   ▲
//!              └────────────────┴───────────── mark_closed() ───────┘
//! ```
//!
//! Reads are public; transitions are crate-private so that only the
//! executor moves positions through their lifecycle.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use bx_core::config::PositionsConfig;
use bx_core::error::{BxError, BxResult};
use bx_core::time_util::now_ms;
use bx_core::types::{Direction, PositionStatus, ProtectionMode, TradeSignal};
use serde::Serialize;
use tracing::{debug, info};

/// A tracked position.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Position {
    pub id: u64,
    pub strategy: String,
    pub symbol: String,
    pub direction: Direction,
    pub quantity: f64,
    /// Realized entry price when known, otherwise the signal's reference.
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub entry_order_id: Option<String>,
    pub sl_order_id: Option<String>,
    pub tp_order_id: Option<String>,
    pub protection: Option<ProtectionMode>,
    pub status: PositionStatus,
    pub opened_at_ms: u64,
    pub closed_at_ms: Option<u64>,
    pub close_reason: Option<String>,
}

impl Position {
    pub fn is_active(&self) -> bool {
        self.status != PositionStatus::Closed
    }
}

/// Selection for [`PositionRegistry::get_open`]. Empty fields match anything.
#[derive(Debug, Clone, Default)]
pub struct PositionFilter {
    pub symbol: Option<String>,
    pub strategy: Option<String>,
}

impl PositionFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn symbol(symbol: &str) -> Self {
        Self { symbol: Some(symbol.to_string()), strategy: None }
    }

    pub fn strategy(strategy: &str) -> Self {
        Self { symbol: None, strategy: Some(strategy.to_string()) }
    }

    fn matches(&self, p: &Position) -> bool {
        self.symbol.as_deref().is_none_or(|s| s == p.symbol)
            && self.strategy.as_deref().is_none_or(|s| s == p.strategy)
    }
}

#[derive(Default)]
struct Book {
    next_id: u64,
    positions: BTreeMap<u64, Position>,
}

pub struct PositionRegistry {
    limits: PositionsConfig,
    book: Mutex<Book>,
}

impl PositionRegistry {
    pub fn new(limits: PositionsConfig) -> Self {
        Self { limits, book: Mutex::new(Book::default()) }
    }

    /// True while `strategy` holds fewer active positions than its limit.
    pub fn can_open(&self, strategy: &str) -> bool {
        self.active_count(strategy) < self.limits.limit_for(strategy)
    }

    /// Positions of `strategy` that are not yet closed.
    pub fn active_count(&self, strategy: &str) -> usize {
        self.book()
            .positions
            .values()
            .filter(|p| p.is_active() && p.strategy == strategy)
            .count()
    }

    /// Snapshot of every non-closed position matching `filter`.
    pub fn get_open(&self, filter: &PositionFilter) -> Vec<Position> {
        self.book()
            .positions
            .values()
            .filter(|p| p.is_active() && filter.matches(p))
            .cloned()
            .collect()
    }

    pub fn get(&self, id: u64) -> Option<Position> {
        self.book().positions.get(&id).cloned()
    }

    /// Every position ever registered, closed ones included.
    pub fn history(&self) -> Vec<Position> {
        self.book().positions.values().cloned().collect()
    }

    // -----------------------------------------------------------------------
    // Transitions (executor only)
    // -----------------------------------------------------------------------

    /// Register a position whose entry has just been confirmed.
    pub(crate) fn open(&self, signal: &TradeSignal, quantity: f64) -> Position {
        let mut book = self.book();
        book.next_id += 1;
        let position = Position {
            id: book.next_id,
            strategy: signal.strategy.clone(),
            symbol: signal.symbol.clone(),
            direction: signal.direction,
            quantity,
            entry_price: signal.entry_price,
            stop_loss: signal.stop_loss,
            take_profit: signal.take_profit,
            entry_order_id: None,
            sl_order_id: None,
            tp_order_id: None,
            protection: None,
            status: PositionStatus::Pending,
            opened_at_ms: now_ms(),
            closed_at_ms: None,
            close_reason: None,
        };
        book.positions.insert(position.id, position.clone());
        info!(
            "[registry] position {} registered: {} {} {} qty={quantity}",
            position.id, position.strategy, position.symbol, position.direction
        );
        position
    }

    pub(crate) fn set_entry(&self, id: u64, order_id: &str, entry_price: f64) -> BxResult<()> {
        self.update(id, |p| {
            p.entry_order_id = Some(order_id.to_string());
            if entry_price > 0.0 {
                p.entry_price = entry_price;
            }
        })
    }

    pub(crate) fn set_stop_loss(&self, id: u64, order_id: &str) -> BxResult<()> {
        self.update(id, |p| p.sl_order_id = Some(order_id.to_string()))
    }

    pub(crate) fn set_take_profit(&self, id: u64, order_id: &str) -> BxResult<()> {
        self.update(id, |p| p.tp_order_id = Some(order_id.to_string()))
    }

    pub(crate) fn mark_open(&self, id: u64, protection: ProtectionMode) -> BxResult<()> {
        self.transition(id, PositionStatus::Open, |p| {
            if p.status != PositionStatus::Pending {
                return false;
            }
            p.protection = Some(protection);
            true
        })
    }

    pub(crate) fn mark_closing(&self, id: u64) -> BxResult<()> {
        self.transition(id, PositionStatus::Closing, |p| {
            matches!(p.status, PositionStatus::Pending | PositionStatus::Open | PositionStatus::Closing)
        })
    }

    pub(crate) fn mark_closed(&self, id: u64, reason: &str) -> BxResult<()> {
        self.transition(id, PositionStatus::Closed, |p| {
            if !p.is_active() {
                return false;
            }
            p.closed_at_ms = Some(now_ms());
            p.close_reason = Some(reason.to_string());
            true
        })
    }

    fn transition(
        &self,
        id: u64,
        to: PositionStatus,
        allow: impl FnOnce(&mut Position) -> bool,
    ) -> BxResult<()> {
        let mut book = self.book();
        let position = book
            .positions
            .get_mut(&id)
            .ok_or_else(|| BxError::Internal(format!("unknown position {id}")))?;
        let from = position.status;
        if !allow(position) {
            return Err(BxError::Internal(format!(
                "position {id}: transition {from:?} -> {to:?} not allowed"
            )));
        }
        position.status = to;
        debug!("[registry] position {id}: {from:?} -> {to:?}");
        Ok(())
    }

    fn update(&self, id: u64, f: impl FnOnce(&mut Position)) -> BxResult<()> {
        let mut book = self.book();
        let position = book
            .positions
            .get_mut(&id)
            .ok_or_else(|| BxError::Internal(format!("unknown position {id}")))?;
        f(position);
        Ok(())
    }

    fn book(&self) -> MutexGuard<'_, Book> {
        self.book.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
