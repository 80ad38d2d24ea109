//! Signal consumer: buffer -> strategy -> reservation -> order -> book.

use super::place_order_with_retry;
use crate::gateway::{GatewayError, OrderRequest, OrderResult, OrderSide, OrderStatus};
use crate::persistence::NewPosition;
use crate::signal::{Signal, SignalReceiver};
use crate::strategy::{EntryDecision, FlowStrategy, StrategyContext, Vetting};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// What became of one signal, for statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOutcome {
    /// Already-seen signal_id, skipped at the persistence boundary.
    Duplicate,
    /// The strategy declined it.
    Filtered,
    /// The strategy emitted an entry decision (regardless of how order
    /// placement then went).
    Accepted,
}

pub struct SignalWorker {
    ctx: StrategyContext,
    strategy: Arc<dyn FlowStrategy>,
}

impl SignalWorker {
    pub fn new(ctx: StrategyContext, strategy: Arc<dyn FlowStrategy>) -> Self {
        Self { ctx, strategy }
    }

    pub async fn run(self, mut signals: SignalReceiver, mut shutdown: watch::Receiver<bool>) {
        info!("signal worker started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        // Stop accepting; in-flight handling completes below.
                        signals.close();
                        break;
                    }
                }
                maybe = signals.recv() => {
                    let Some(signal) = maybe else { break };
                    if let Err(e) = self.handle_signal(&signal).await {
                        error!(symbol = %signal.symbol, error = %e, "signal handling failed");
                    }
                }
            }
        }
        info!("signal worker stopped");
    }

    /// Full pipeline for one signal. Duplicates and filter rejections are
    /// normal outcomes, not errors.
    pub async fn handle_signal(&self, signal: &Signal) -> Result<SignalOutcome> {
        let now = self.ctx.clock.now_eastern();
        if !self.ctx.store.insert_signal_if_new(signal, now)? {
            debug!(signal_id = %signal.signal_id, "duplicate signal skipped");
            return Ok(SignalOutcome::Duplicate);
        }
        info!(
            symbol = %signal.symbol,
            premium = %signal.premium_usd,
            signal_time = %signal.signal_time_eastern,
            "signal received"
        );

        match self.strategy.on_signal(&self.ctx, signal).await? {
            Vetting::Reject(reason) => {
                info!(symbol = %signal.symbol, %reason, "signal filtered");
                Ok(SignalOutcome::Filtered)
            }
            Vetting::Accept(decision) => {
                self.execute_entry(signal, decision).await?;
                Ok(SignalOutcome::Accepted)
            }
        }
    }

    async fn execute_entry(&self, signal: &Signal, decision: EntryDecision) -> Result<()> {
        let config = &self.ctx.config;
        let exec_date = decision.exec_time_eastern.date_naive();

        let Some(reservation_id) = self.ctx.store.reserve_daily_capacity(
            exec_date,
            decision.pos_ratio,
            config.sizing.daily_gross_cap,
            config.sizing.max_trades_per_day,
            self.ctx.clock.now_eastern(),
        )?
        else {
            info!(symbol = %decision.symbol, ratio = %decision.pos_ratio, "daily capacity exhausted");
            return Ok(());
        };

        let request = OrderRequest {
            client_id: decision.client_id.clone(),
            symbol: decision.symbol.clone(),
            side: OrderSide::Buy,
            shares: decision.shares,
            limit_price: decision.limit_price,
        };
        self.ctx
            .store
            .record_order_event(&pending_result(&request, &decision))?;

        info!(
            symbol = %decision.symbol,
            shares = decision.shares,
            limit = %decision.limit_price,
            ratio = %decision.pos_ratio,
            "placing buy"
        );
        let timeout = Duration::from_secs(config.system.gateway_timeout_seconds);
        let result = match place_order_with_retry(&self.ctx.gateway, request, timeout).await {
            Ok(result) => result,
            Err(GatewayError::IdempotencyConflict(client_id)) => {
                error!(
                    %client_id,
                    symbol = %decision.symbol,
                    "idempotency conflict, aborting decision for reconciliation"
                );
                self.ctx.store.rollback_daily_capacity(reservation_id)?;
                return Ok(());
            }
            Err(e) => {
                // The order may or may not exist; reconciliation repairs
                // either way, so the reservation stays held for today.
                warn!(symbol = %decision.symbol, error = %e, "buy unresolved, leaving for reconciliation");
                return Ok(());
            }
        };
        self.ctx.store.record_order_event(&result)?;

        match result.status {
            OrderStatus::Filled => {
                self.record_fill(signal, &decision, &result)?;
                self.ctx.store.commit_daily_capacity(reservation_id)?;
                Ok(())
            }
            OrderStatus::Rejected | OrderStatus::Cancelled => {
                info!(
                    symbol = %decision.symbol,
                    status = result.status.as_str(),
                    "buy did not fill, releasing reservation"
                );
                self.ctx.store.rollback_daily_capacity(reservation_id)?;
                Ok(())
            }
            OrderStatus::Pending | OrderStatus::Partial => {
                // Terminal state arrives later; capacity stays held and
                // reconciliation sweeps up if we crash in between.
                info!(
                    symbol = %decision.symbol,
                    status = result.status.as_str(),
                    "buy in flight"
                );
                Ok(())
            }
        }
    }

    fn record_fill(
        &self,
        signal: &Signal,
        decision: &EntryDecision,
        result: &OrderResult,
    ) -> Result<()> {
        let config = &self.ctx.config;
        let exec_date = decision.exec_time_eastern.date_naive();

        let exit_date = self
            .ctx
            .calendar
            .add_trading_days(exec_date, config.exit.holding_days);
        let scheduled_exit = crate::calendar::at_eastern(exit_date, config.exit_time()?);

        let cooldown_date = self
            .ctx
            .calendar
            .add_trading_days(exec_date, config.blacklist_days);
        let blacklist_until = self.ctx.calendar.session_close(cooldown_date);

        let position_id = self.ctx.store.record_open(&NewPosition {
            order: result,
            signal_id: Some(&signal.signal_id),
            cost_price: result.net_fill_price(),
            scheduled_exit_eastern: scheduled_exit,
            strike: decision.strike,
            blacklist_until,
            meta: decision.meta.clone(),
        })?;
        info!(
            position_id,
            symbol = %decision.symbol,
            shares = result.filled_shares,
            cost = %result.net_fill_price(),
            scheduled_exit = %scheduled_exit,
            "position opened"
        );
        Ok(())
    }
}

fn pending_result(request: &OrderRequest, decision: &EntryDecision) -> OrderResult {
    OrderResult {
        client_id: request.client_id.clone(),
        broker_id: None,
        symbol: request.symbol.clone(),
        side: request.side,
        shares: request.shares,
        limit_price: request.limit_price,
        status: OrderStatus::Pending,
        filled_shares: 0,
        avg_price: None,
        fees: rust_decimal::Decimal::ZERO,
        created_eastern: decision.exec_time_eastern,
        updated_eastern: decision.exec_time_eastern,
    }
}
