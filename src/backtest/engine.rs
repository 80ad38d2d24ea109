//! Backtest replay engine.
//!
//! Drives the same signal pipeline, strategy and persistence as the live
//! loop against the simulated gateway, stepping the sim clock from signal
//! to signal and sweeping exit scans between entries.

use super::data::load_flow_dir;
use super::metrics::{BacktestMetrics, EquityPoint};
use crate::calendar::{at_eastern, Clock, EtDateTime, SimClock, TradingCalendar};
use crate::config::AppConfig;
use crate::engine::{SignalOutcome, SignalWorker};
use crate::gateway::{
    BarStore, MarketGateway, OrderRequest, OrderSide, OrderStatus, SimCosts, SimGateway,
};
use crate::persistence::{ClosedPosition, TradeStore};
use crate::strategy::{build_strategy, exec_time_for, ExitReason, FlowStrategy, StrategyContext};
use anyhow::Result;
use chrono::{Duration, NaiveDate, NaiveTime};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct BacktestResult {
    pub metrics: BacktestMetrics,
    pub equity_curve: Vec<EquityPoint>,
    pub start: Option<EtDateTime>,
    pub end: Option<EtDateTime>,
}

pub struct BacktestEngine {
    config: Arc<AppConfig>,
    store: Arc<TradeStore>,
    gateway: Arc<dyn MarketGateway>,
    sim: Arc<SimGateway>,
    clock: Arc<SimClock>,
    strategy: Arc<dyn FlowStrategy>,
    worker: SignalWorker,
    last_scanned: HashMap<i64, EtDateTime>,
    equity_curve: Vec<EquityPoint>,
}

impl BacktestEngine {
    pub fn new(config: Arc<AppConfig>) -> Result<Self> {
        let settings = &config.backtest;

        let calendar = Arc::new(match &settings.calendar_overrides {
            Some(path) => TradingCalendar::with_overrides(path)?,
            None => TradingCalendar::builtin(),
        });
        let bars = Arc::new(match (&settings.bar_base_url, &settings.bar_api_key) {
            (Some(base_url), Some(api_key)) => BarStore::remote(base_url, api_key),
            _ => BarStore::csv_dir(settings.bar_dir.clone()),
        });
        let clock = Arc::new(SimClock::new(at_eastern(
            NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or_default(),
            NaiveTime::MIN,
        )));
        let sim = Arc::new(SimGateway::new(
            settings.initial_cash,
            clock.clone(),
            bars,
            calendar.clone(),
            SimCosts {
                slippage: config.costs.slippage,
                fee_per_share: config.costs.fee_per_share,
                fee_min: config.costs.fee_min,
            },
            config.risk.min_cash_ratio,
        ));
        let gateway: Arc<dyn MarketGateway> = sim.clone();

        // The backtest keeps its book in a scratch store.
        let store = Arc::new(TradeStore::open_in_memory()?);
        let strategy = build_strategy(&config)?;
        let ctx = StrategyContext {
            config: config.clone(),
            store: store.clone(),
            gateway: gateway.clone(),
            calendar,
            clock: clock.clone(),
        };
        let worker = SignalWorker::new(ctx, strategy.clone());

        Ok(Self {
            config,
            store,
            gateway,
            sim,
            clock,
            strategy,
            worker,
            last_scanned: HashMap::new(),
            equity_curve: Vec::new(),
        })
    }

    pub async fn run(&mut self) -> Result<BacktestResult> {
        let signals = load_flow_dir(
            &self.config.backtest.signal_dir,
            self.config.source_tz()?,
            self.config.entry.historical.lookback_days,
        )?;
        anyhow::ensure!(!signals.is_empty(), "no flow records in signal directory");

        let start = signals.first().map(|s| s.signal_time_eastern);
        let delay = self.config.entry.entry_delay_minutes;
        info!(
            signals = signals.len(),
            initial_cash = %self.config.backtest.initial_cash,
            strategy = self.strategy.tag(),
            "backtest starting"
        );
        self.strategy.on_start();

        let mut accepted = 0usize;
        for signal in &signals {
            let exec = exec_time_for(signal.signal_time_eastern, delay);
            // Exits that would have triggered before this entry happen
            // first, in bar-time order.
            self.sweep_exits(exec).await?;
            self.clock.set(exec);
            if self.worker.handle_signal(signal).await? == SignalOutcome::Accepted {
                accepted += 1;
            }
            self.record_equity_point().await?;
        }

        // Drain: scan every remaining position through its scheduled exit.
        let horizon = self
            .store
            .open_positions()?
            .iter()
            .map(|p| p.scheduled_exit_eastern)
            .max();
        if let Some(latest) = horizon {
            self.sweep_exits(latest + Duration::minutes(1)).await?;
        }
        self.close_remaining().await?;
        self.record_equity_point().await?;

        let end = Some(self.clock.now_eastern());
        let account = self
            .gateway
            .get_account()
            .await
            .map_err(|e| anyhow::anyhow!("final account query failed: {e}"))?;
        let closed = self.store.closed_positions()?;
        let metrics = BacktestMetrics::compute(
            self.config.backtest.initial_cash,
            account.equity,
            &self.equity_curve,
            &closed,
            signals.len(),
            accepted,
        );
        self.strategy.on_shutdown();
        info!(final_equity = %account.equity, trades = metrics.num_trades, "backtest finished");

        Ok(BacktestResult {
            metrics,
            equity_curve: std::mem::take(&mut self.equity_curve),
            start,
            end,
        })
    }

    /// Walk each open position's bars up to `until` and execute the first
    /// exit trigger at its bar time.
    async fn sweep_exits(&mut self, until: EtDateTime) -> Result<()> {
        for position in self.store.open_positions()? {
            let from = match self.last_scanned.get(&position.position_id) {
                Some(t) => *t + Duration::seconds(1),
                None => position.open_time_eastern,
            };
            if from > until {
                continue;
            }

            // Bars up to the sweep horizon must be visible to the query.
            self.clock.set(until);
            let bars = match self
                .gateway
                .get_minute_bars(&position.symbol, from, until)
                .await
            {
                Ok(bars) => bars,
                Err(e) => {
                    warn!(symbol = %position.symbol, error = %e, "bar fetch failed in sweep");
                    continue;
                }
            };

            let scan = self.strategy.on_position_check(&position, &bars);
            if scan.high_water > position.high_water_price {
                self.store
                    .update_high_water(position.position_id, scan.high_water)?;
            }

            let Some(exit) = scan.decision else {
                self.last_scanned.insert(position.position_id, until);
                continue;
            };

            // Fill at the bar that triggered the exit.
            self.clock.set(exit.triggered_at);
            let result = self
                .gateway
                .place_order(OrderRequest {
                    client_id: exit.client_id.clone(),
                    symbol: exit.symbol.clone(),
                    side: OrderSide::Sell,
                    shares: exit.shares,
                    limit_price: exit.limit_price,
                })
                .await
                .map_err(|e| anyhow::anyhow!("sim sell failed: {e}"))?;
            self.store.record_order_event(&result)?;

            if result.status == OrderStatus::Filled {
                self.store.record_close(
                    position.position_id,
                    &ClosedPosition {
                        order: Some(&result),
                        reason: exit.reason.as_str(),
                        close_price: result.net_fill_price(),
                        close_time_eastern: exit.triggered_at,
                    },
                )?;
                self.last_scanned.remove(&position.position_id);
                info!(
                    symbol = %position.symbol,
                    reason = %exit.reason,
                    at = %exit.triggered_at,
                    price = %result.net_fill_price(),
                    "backtest exit"
                );
                self.record_equity_point().await?;
            } else {
                warn!(symbol = %position.symbol, status = result.status.as_str(), "sweep sell not filled");
            }
        }
        Ok(())
    }

    /// Force-close whatever survived the drain (no bar data at or past the
    /// scheduled exit) at the last known mark.
    async fn close_remaining(&mut self) -> Result<()> {
        for position in self.store.open_positions()? {
            let price = self
                .gateway
                .get_quote(&position.symbol)
                .await
                .unwrap_or(position.cost_price);
            warn!(
                symbol = %position.symbol,
                %price,
                "force-closing position without exit bars"
            );
            self.store.record_close(
                position.position_id,
                &ClosedPosition {
                    order: None,
                    reason: ExitReason::Timed.as_str(),
                    close_price: price,
                    close_time_eastern: self.clock.now_eastern(),
                },
            )?;
        }
        Ok(())
    }

    async fn record_equity_point(&mut self) -> Result<()> {
        let account = self
            .gateway
            .get_account()
            .await
            .map_err(|e| anyhow::anyhow!("account query failed: {e}"))?;
        let open = self.store.open_positions()?.len();

        let peak = self
            .equity_curve
            .iter()
            .map(|p| p.equity)
            .fold(self.config.backtest.initial_cash, Decimal::max);
        let drawdown = if peak > Decimal::ZERO && account.equity < peak {
            (peak - account.equity) / peak
        } else {
            Decimal::ZERO
        };
        self.equity_curve.push(EquityPoint {
            timestamp: self.clock.now_eastern(),
            equity: account.equity,
            drawdown,
            position_count: open,
        });
        Ok(())
    }

    /// Read access for tests and reporting.
    pub fn store(&self) -> &Arc<TradeStore> {
        &self.store
    }

    pub fn sim(&self) -> &Arc<SimGateway> {
        &self.sim
    }
}
