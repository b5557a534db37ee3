//! # bx-runner
//!
//! Main entry point for the perpetual-swap execution service.
//!
//! Loads a JSON configuration file, prepares the account (position mode,
//! margin mode and leverage for each configured symbol), then ticks the
//! scheduler until Ctrl+C. On shutdown every pending limit order is
//! cancelled and, if configured, every open position is closed.
//!
//! # Usage
//!
//! ```bash
//! BX_API_KEY=... BX_SECRET_KEY=... bx-runner config.json --log-level info
//! ```

mod inbox;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bx_core::config::AppConfig;
use bx_core::types::Direction;
use bx_exec::{OrderExecutor, PendingOrderManager, PositionRegistry, Scheduler};
use bx_exec::collaborators::TracingNotifier;
use bx_td::ExchangeClient;
use clap::Parser;
use tracing::{error, info, warn};

use crate::inbox::InboxSource;

/// Perpetual-swap order execution runner.
#[derive(Parser)]
#[command(name = "bx-runner", about = "Perpetual-swap order execution runner")]
struct Cli {
    /// Configuration file path (JSON).
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Optional log directory for file output. Overrides `runner.log_path`.
    #[arg(long)]
    log_dir: Option<String>,

    /// Run one tick and exit.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Load configuration
    let config = bx_core::config::load_config(&cli.config)?;

    // 2. Initialize logging
    let log_dir = cli.log_dir.as_deref().or(config.runner.log_path.as_deref());
    bx_core::logging::init_logging(&cli.log_level, log_dir, &config.runner.module_name);

    config.validate().context("invalid configuration")?;
    info!(
        "bx-runner starting: config={}, sandbox={}, symbols={:?}",
        cli.config.display(),
        config.exchange.sandbox,
        config.runner.symbols,
    );

    // 3. Exchange client and account setup
    let client = Arc::new(ExchangeClient::new(&config.exchange));
    prepare_account(&client, &config).await?;

    // 4. Execution core
    let notifier = Arc::new(TracingNotifier);
    let registry = Arc::new(PositionRegistry::new(config.positions.clone()));
    let executor = Arc::new(OrderExecutor::new(
        client.clone(),
        registry,
        notifier.clone(),
        config.execution.clone(),
    ));
    let pending = Arc::new(PendingOrderManager::new(
        client.clone(),
        executor.clone(),
        config.pending.clone(),
    ));

    let mut scheduler = Scheduler::new(executor, pending).with_notifier(notifier);
    match &config.runner.inbox_dir {
        Some(dir) => {
            info!("reading signals from {dir}");
            scheduler = scheduler.with_source(Box::new(InboxSource::new(dir)));
        }
        None => warn!("no inbox_dir configured; the runner will only manage existing orders"),
    }

    // 5. Run until Ctrl+C
    let close_positions = config.runner.close_positions_on_shutdown;
    if cli.once {
        scheduler.tick().await;
        scheduler.shutdown(close_positions).await;
    } else {
        let interval = Duration::from_secs(config.runner.tick_interval_secs);
        info!("ticking every {interval:?}; press Ctrl+C to stop");
        let shutdown = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("cannot listen for Ctrl+C: {e}");
                std::future::pending::<()>().await;
            }
        };
        scheduler.run(interval, shutdown, close_positions).await;
    }

    info!("bx-runner stopped");
    Ok(())
}

/// Hedge position mode, then margin mode and leverage for every configured
/// symbol. Only a leverage failure is fatal.
async fn prepare_account(client: &ExchangeClient, config: &AppConfig) -> Result<()> {
    let execution = &config.execution;
    // Refused while positions are open, and a no-op when already dual.
    if let Err(e) = client.set_position_mode(true).await {
        warn!("position mode unchanged: {e}");
    }

    for symbol in &config.runner.symbols {
        if let Err(e) = client.set_margin_mode(symbol, execution.margin_mode).await {
            warn!("{symbol}: margin mode unchanged: {e}");
        }
        for side in [Direction::Long, Direction::Short] {
            client
                .set_leverage(symbol, side, execution.leverage)
                .await
                .with_context(|| format!("{symbol}: setting {side} leverage"))?;
        }
        info!(
            "{symbol}: {:?} margin, {}x leverage",
            execution.margin_mode, execution.leverage
        );
    }
    Ok(())
}
