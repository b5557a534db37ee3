//! Periodic driver.
//!
//! One tick: advance the bar counter, reconcile pending limit orders,
//! detect positions closed on the exchange, then ask every signal source
//! for at most one signal and execute the ones the risk gate allows.
//! Ticks never overlap and a shutdown request is only honoured between
//! ticks, so no execution protocol is ever interrupted half-way.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bx_core::types::StrategySignal;
use bx_td::ExchangeClient;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::collaborators::{
    AllowAll, ExecutionEvent, Notifier, RiskGate, SignalSource, TickContext, TracingNotifier,
    TracingTradeLogger, TradeLogger, notify_detached,
};
use crate::executor::{ClosedPosition, ExecutionResult, OrderExecutor};
use crate::pending::PendingOrderManager;
use crate::registry::{PositionFilter, PositionRegistry};

/// What one tick did.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub bar: u64,
    pub fills: usize,
    pub closed: usize,
    pub executed: Vec<ExecutionResult>,
    pub pending_created: Vec<u64>,
    /// `(strategy, reason)` for every signal that was not acted on.
    pub rejected: Vec<(String, String)>,
}

pub struct Scheduler {
    client: Arc<ExchangeClient>,
    registry: Arc<PositionRegistry>,
    executor: Arc<OrderExecutor>,
    pending: Arc<PendingOrderManager>,
    sources: Vec<Box<dyn SignalSource>>,
    risk: Box<dyn RiskGate>,
    trade_logger: Arc<dyn TradeLogger>,
    notifier: Arc<dyn Notifier>,
    bar: u64,
}

impl Scheduler {
    pub fn new(executor: Arc<OrderExecutor>, pending: Arc<PendingOrderManager>) -> Self {
        Self {
            client: Arc::clone(executor.client()),
            registry: Arc::clone(executor.registry()),
            executor,
            pending,
            sources: Vec::new(),
            risk: Box::new(AllowAll),
            trade_logger: Arc::new(TracingTradeLogger),
            notifier: Arc::new(TracingNotifier),
            bar: 0,
        }
    }

    pub fn with_source(mut self, source: Box<dyn SignalSource>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn with_risk_gate(mut self, risk: Box<dyn RiskGate>) -> Self {
        self.risk = risk;
        self
    }

    pub fn with_trade_logger(mut self, logger: Arc<dyn TradeLogger>) -> Self {
        self.trade_logger = logger;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn bar(&self) -> u64 {
        self.bar
    }

    pub async fn tick(&mut self) -> TickReport {
        self.bar += 1;
        let mut report = TickReport { bar: self.bar, ..Default::default() };

        for fill in self.pending.check_pending_orders(self.bar).await {
            report.fills += 1;
            let result = if fill.protection_attached {
                self.executor.adopt_filled_limit(&fill).await
            } else {
                self.executor.attach_protection(&fill).await
            };
            self.record_execution(&result).await;
            report.executed.push(result);
        }

        match self.executor.sync_closed_positions().await {
            Ok(closed) => {
                report.closed = closed.len();
                for c in &closed {
                    self.record_close(c).await;
                }
            }
            Err(e) => warn!("[scheduler] position sync failed: {e}"),
        }

        let equity = match self.client.balance().await {
            Ok(balance) => Some(balance.equity),
            Err(e) => {
                warn!("[scheduler] balance unavailable, skipping signals this tick: {e}");
                None
            }
        };
        let ctx = TickContext {
            bar: self.bar,
            equity,
            open_positions: self.registry.get_open(&PositionFilter::all()),
        };

        let mut signals = Vec::new();
        for source in &mut self.sources {
            if let Some(signal) = source.generate_signal(&ctx).await {
                signals.push(signal);
            }
        }
        if let Some(equity) = equity {
            for signal in signals {
                self.process_signal(signal, equity, &mut report).await;
            }
        }

        info!(
            "[scheduler] bar {} done: fills={} closed={} executed={} pending={} rejected={}",
            report.bar,
            report.fills,
            report.closed,
            report.executed.len(),
            report.pending_created.len(),
            report.rejected.len(),
        );
        report
    }

    /// Tick every `interval` until `shutdown` resolves, then shut down.
    pub async fn run(&mut self, interval: Duration, shutdown: impl Future<Output = ()>, close_positions: bool) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                _ = &mut shutdown => {
                    info!("[scheduler] shutdown requested");
                    break;
                }
            }
        }
        self.shutdown(close_positions).await;
    }

    /// Cancel all pending orders, optionally close every open position, and
    /// release the exchange client.
    pub async fn shutdown(&mut self, close_positions: bool) {
        let cancelled = self.pending.cancel_all_pending_orders().await;
        info!("[scheduler] shutdown: {cancelled} pending orders cancelled");

        if close_positions {
            for (id, outcome) in self.executor.close_all_positions("shutdown").await {
                match outcome {
                    Ok(closed) => self.record_close(&closed).await,
                    Err(e) => warn!("[scheduler] shutdown close of position {id} failed: {e}"),
                }
            }
        }

        self.client.close().await;
        info!("[scheduler] shutdown complete");
    }

    async fn process_signal(&mut self, signal: StrategySignal, equity: f64, report: &mut TickReport) {
        let strategy = signal.strategy().to_string();
        let decision = self.risk.validate(&signal, equity);
        if !decision.allowed {
            info!("[scheduler] {strategy} signal denied by risk gate: {}", decision.reason);
            report.rejected.push((strategy, decision.reason));
            return;
        }
        if !self.registry.can_open(&strategy) {
            report.rejected.push((strategy, "position limit".to_string()));
            return;
        }

        match signal {
            StrategySignal::Immediate(trade) => {
                let result = self.executor.execute_trade(&trade).await;
                self.record_execution(&result).await;
                report.executed.push(result);
            }
            StrategySignal::PendingLimit(request) => {
                match self.pending.create_pending_order(&request, self.bar).await {
                    Ok(order) => report.pending_created.push(order.id),
                    Err(e) => {
                        warn!("[scheduler] {strategy} limit order failed: {e}");
                        notify_detached(
                            &self.notifier,
                            ExecutionEvent::Error { context: format!("{strategy} limit"), message: e.to_string() },
                        );
                        report.rejected.push((strategy, e.to_string()));
                    }
                }
            }
        }
    }

    async fn record_execution(&self, result: &ExecutionResult) {
        if !result.success {
            notify_detached(
                &self.notifier,
                ExecutionEvent::Error {
                    context: format!("{} {}", result.symbol, result.direction),
                    message: result.error.clone().unwrap_or_default(),
                },
            );
            return;
        }
        let Some(position) = result.position_id.and_then(|id| self.registry.get(id)) else {
            return;
        };
        self.trade_logger.log_trade_open(&position).await;
        notify_detached(&self.notifier, ExecutionEvent::TradeOpened { position });
    }

    async fn record_close(&self, closed: &ClosedPosition) {
        self.trade_logger
            .close_trade(&closed.position, closed.exit_price, &closed.reason)
            .await;
        notify_detached(
            &self.notifier,
            ExecutionEvent::TradeClosed {
                position: closed.position.clone(),
                exit_price: closed.exit_price,
                reason: closed.reason.clone(),
            },
        );
    }
}
