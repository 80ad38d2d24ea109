//! Position monitor: periodic exit scanning over fresh minute bars.
//!
//! The monitor owns its per-position last-checked map and never holds the
//! store guard across gateway I/O. Sells for distinct symbols run
//! concurrently; a symbol with an in-flight sell is skipped until it
//! resolves.

use super::place_order_with_retry;
use crate::calendar::EtDateTime;
use crate::gateway::{OrderRequest, OrderSide, OrderStatus};
use crate::persistence::{ClosedPosition, Position};
use crate::strategy::{ExitDecision, FlowStrategy, StrategyContext};
use anyhow::Result;
use chrono::Duration as ChronoDuration;
use futures_util::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

pub struct PositionMonitor {
    ctx: StrategyContext,
    strategy: Arc<dyn FlowStrategy>,
    last_checked: HashMap<i64, EtDateTime>,
    pending_sells: HashSet<String>,
}

impl PositionMonitor {
    pub fn new(ctx: StrategyContext, strategy: Arc<dyn FlowStrategy>) -> Self {
        Self {
            ctx,
            strategy,
            last_checked: HashMap::new(),
            pending_sells: HashSet::new(),
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let period = Duration::from_secs(self.ctx.config.system.check_interval_seconds);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(period_seconds = period.as_secs(), "position monitor started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!(error = %e, "monitor tick failed");
                    }
                }
            }
        }
        info!("position monitor stopped");
    }

    /// One pass over the open book: each position is processed at most
    /// once, bars strictly newer than the last processed window.
    pub async fn tick(&mut self) -> Result<()> {
        let now = self.ctx.clock.now_eastern();
        let positions = self.ctx.store.open_positions()?;

        let mut exits: Vec<(Position, ExitDecision)> = Vec::new();
        for position in positions {
            if self.pending_sells.contains(&position.symbol) {
                continue;
            }

            let from = match self.last_checked.get(&position.position_id) {
                // Past the first pass, skip the already-processed boundary
                // minute.
                Some(t) => *t + ChronoDuration::seconds(1),
                None => position.open_time_eastern,
            };
            if from > now {
                continue;
            }

            let bars = match self
                .ctx
                .gateway
                .get_minute_bars(&position.symbol, from, now)
                .await
            {
                Ok(bars) => bars,
                Err(e) => {
                    // Do not advance the window: these bars get rescanned.
                    warn!(symbol = %position.symbol, error = %e, "bar fetch failed");
                    continue;
                }
            };

            let scan = self.strategy.on_position_check(&position, &bars);
            if scan.high_water > position.high_water_price {
                self.ctx
                    .store
                    .update_high_water(position.position_id, scan.high_water)?;
            }

            match scan.decision {
                Some(exit) => {
                    // Keep the window: a failed sell rescans the same bars
                    // and re-derives the same decision.
                    self.pending_sells.insert(position.symbol.clone());
                    exits.push((position, exit));
                }
                None => {
                    self.last_checked.insert(position.position_id, now);
                }
            }
        }

        if exits.is_empty() {
            return Ok(());
        }
        self.execute_exits(exits).await
    }

    async fn execute_exits(&mut self, exits: Vec<(Position, ExitDecision)>) -> Result<()> {
        // Distinct symbols sell concurrently; each position yields at most
        // one close so per-position ordering is trivial.
        let timeout = Duration::from_secs(self.ctx.config.system.gateway_timeout_seconds);
        let gateway = self.ctx.gateway.clone();
        let placements = exits.into_iter().map(|(position, exit)| {
            let gateway = gateway.clone();
            async move {
                let request = OrderRequest {
                    client_id: exit.client_id.clone(),
                    symbol: exit.symbol.clone(),
                    side: OrderSide::Sell,
                    shares: exit.shares,
                    limit_price: exit.limit_price,
                };
                let outcome = place_order_with_retry(&gateway, request, timeout).await;
                (position, exit, outcome)
            }
        });

        for (position, exit, outcome) in join_all(placements).await {
            self.pending_sells.remove(&position.symbol);
            match outcome {
                Ok(result) => {
                    self.ctx.store.record_order_event(&result)?;
                    match result.status {
                        OrderStatus::Filled => {
                            self.ctx.store.record_close(
                                position.position_id,
                                &ClosedPosition {
                                    order: Some(&result),
                                    reason: exit.reason.as_str(),
                                    close_price: result.net_fill_price(),
                                    close_time_eastern: exit.triggered_at,
                                },
                            )?;
                            self.last_checked.remove(&position.position_id);
                            info!(
                                position_id = position.position_id,
                                symbol = %position.symbol,
                                reason = %exit.reason,
                                price = %result.net_fill_price(),
                                "position closed"
                            );
                        }
                        status => {
                            warn!(
                                symbol = %position.symbol,
                                status = status.as_str(),
                                "sell not filled; will retry next tick"
                            );
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        symbol = %position.symbol,
                        error = %e,
                        "sell unresolved, leaving for reconciliation"
                    );
                }
            }
        }
        Ok(())
    }
}
