//! The trading supervisor: wires the concurrent workers over a shared
//! shutdown signal and owns startup recovery and graceful teardown.

mod monitor;
mod reconciler;
mod signal_worker;

pub use monitor::PositionMonitor;
pub use reconciler::{ReconReport, Reconciler};
pub use signal_worker::{SignalOutcome, SignalWorker};

use crate::calendar::{Clock, TradingCalendar};
use crate::config::AppConfig;
use crate::gateway::{GatewayError, MarketGateway, OrderRequest, OrderResult};
use crate::persistence::TradeStore;
use crate::signal::SignalReceiver;
use crate::strategy::{FlowStrategy, StrategyContext};
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

const MAX_PLACE_ATTEMPTS: u32 = 3;

pub struct TradingEngine {
    ctx: StrategyContext,
    strategy: Arc<dyn FlowStrategy>,
}

impl TradingEngine {
    pub fn new(
        config: Arc<AppConfig>,
        store: Arc<TradeStore>,
        gateway: Arc<dyn MarketGateway>,
        calendar: Arc<TradingCalendar>,
        clock: Arc<dyn Clock>,
        strategy: Arc<dyn FlowStrategy>,
    ) -> Self {
        Self {
            ctx: StrategyContext {
                config,
                store,
                gateway,
                calendar,
                clock,
            },
            strategy,
        }
    }

    /// Run until the signal stream ends or shutdown is requested.
    pub async fn run(self, signals: SignalReceiver) -> Result<()> {
        let config = self.ctx.config.clone();

        self.ctx
            .gateway
            .connect()
            .await
            .context("gateway unreachable")?;

        recover_state(&self.ctx).await?;
        self.strategy.on_start();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let signal_worker = SignalWorker::new(self.ctx.clone(), self.strategy.clone());
        let signal_handle = tokio::spawn(signal_worker.run(signals, shutdown_rx.clone()));

        let monitor = PositionMonitor::new(self.ctx.clone(), self.strategy.clone());
        let monitor_handle = tokio::spawn(monitor.run(shutdown_rx.clone()));

        let reconciler = Reconciler::from_context(&self.ctx)?;
        let recon_handle = tokio::spawn(reconciler.run_scheduler(shutdown_rx));

        let aborts = [
            signal_handle.abort_handle(),
            monitor_handle.abort_handle(),
            recon_handle.abort_handle(),
        ];

        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for shutdown signal")?;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);

        // Let in-flight work finish inside the grace window, then cancel.
        let grace = Duration::from_secs(config.system.shutdown_grace_seconds);
        let drained = tokio::time::timeout(grace, async {
            let _ = signal_handle.await;
            let _ = monitor_handle.await;
            let _ = recon_handle.await;
        })
        .await;
        if drained.is_err() {
            warn!(grace_seconds = grace.as_secs(), "grace deadline hit, cancelling workers");
            for abort in &aborts {
                abort.abort();
            }
        }

        self.strategy.on_shutdown();
        self.ctx.gateway.disconnect().await;
        info!("engine stopped cleanly");
        Ok(())
    }
}

/// Restore runtime state after a restart: daily usage, the cooldown
/// horizon rebuilt from recent filled buys, and a boot-time comparison of
/// the local book against the broker.
pub async fn recover_state(ctx: &StrategyContext) -> Result<()> {
    let now = ctx.clock.now_eastern();
    let today = now.date_naive();

    let (trade_count, gross) = ctx.store.daily_used(today)?;

    // Re-derive cooldown entries from filled buys inside the horizon, in
    // case a crash landed between order and blacklist writes.
    let blacklist_days = ctx.config.blacklist_days;
    let horizon_start = now - chrono::Duration::days(i64::from(blacklist_days) * 2);
    let mut restored = 0u32;
    for (symbol, buy_time) in ctx.store.bought_symbols_since(horizon_start)? {
        let until_date = ctx
            .calendar
            .add_trading_days(buy_time.date_naive(), blacklist_days);
        let until = ctx.calendar.session_close(until_date);
        if until > now {
            ctx.store.upsert_blacklist(&symbol, until)?;
            restored += 1;
        }
    }

    // Boot-time book comparison; differences only warn here, the daily
    // reconciliation repairs them.
    let local = ctx.store.open_positions()?;
    match ctx.gateway.get_positions().await {
        Ok(broker) => {
            let local_symbols: HashSet<&str> = local.iter().map(|p| p.symbol.as_str()).collect();
            let broker_symbols: HashSet<&str> = broker.iter().map(|p| p.symbol.as_str()).collect();
            for symbol in local_symbols.difference(&broker_symbols) {
                warn!(%symbol, "book has a position the broker does not");
            }
            for symbol in broker_symbols.difference(&local_symbols) {
                warn!(%symbol, "broker has a position the book does not");
            }
        }
        Err(e) => warn!(error = %e, "boot-time position check skipped"),
    }

    info!(
        trade_count,
        gross_ratio = %gross,
        cooldowns_restored = restored,
        open_positions = local.len(),
        "state recovered"
    );
    Ok(())
}

/// Place an order with per-call timeout, exponential backoff on transient
/// errors, and a status follow-up after a timeout: an elapsed call does
/// not imply the order was not placed.
pub async fn place_order_with_retry(
    gateway: &Arc<dyn MarketGateway>,
    req: OrderRequest,
    call_timeout: Duration,
) -> Result<OrderResult, GatewayError> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match tokio::time::timeout(call_timeout, gateway.place_order(req.clone())).await {
            Ok(Ok(result)) => return Ok(result),
            Ok(Err(e)) if e.is_transient() && attempt < MAX_PLACE_ATTEMPTS => {
                let backoff = Duration::from_secs(1 << attempt);
                warn!(client_id = %req.client_id, error = %e, attempt, "transient error, backing off");
                tokio::time::sleep(backoff).await;
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                // The venue may have accepted the order; query before any
                // retry to keep placement idempotent on our side too.
                match gateway.get_order(&req.client_id).await {
                    Ok(Some(result)) => return Ok(result),
                    Ok(None) if attempt < MAX_PLACE_ATTEMPTS => {
                        warn!(client_id = %req.client_id, attempt, "timeout, order not found, retrying");
                        tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
                    }
                    Ok(None) => return Err(GatewayError::Timeout(call_timeout)),
                    Err(e) => {
                        error!(client_id = %req.client_id, error = %e, "status follow-up failed");
                        return Err(GatewayError::Timeout(call_timeout));
                    }
                }
            }
        }
    }
}
