//! End-of-day reconciliation of the local book against the broker.
//!
//! Advisory by default: the report is persisted and logged. With
//! `auto_fix` the local book is repaired toward the broker's view —
//! positions the broker no longer holds are closed synthetically, broker
//! positions missing locally are adopted, and share counts follow the
//! broker.

use crate::calendar::{Clock, TradingCalendar};
use crate::config::AppConfig;
use crate::gateway::{MarketGateway, OrderResult, OrderSide, OrderStatus};
use crate::persistence::{ClosedPosition, DailyStats, NewPosition, TradeStore};
use crate::strategy::{ExitReason, StrategyContext};
use crate::utils::fingerprint::fingerprint;
use anyhow::Result;
use chrono::{NaiveDate, NaiveTime};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct LocalExtra {
    pub symbol: String,
    pub shares: i64,
    pub closed_at: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BrokerExtra {
    pub symbol: String,
    pub shares: i64,
    pub avg_cost: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShareMismatch {
    pub symbol: String,
    pub local_shares: i64,
    pub broker_shares: i64,
}

/// Point-in-time comparison result.
#[derive(Debug, Clone, Serialize)]
pub struct ReconReport {
    pub date: NaiveDate,
    pub extras_local: Vec<LocalExtra>,
    pub extras_broker: Vec<BrokerExtra>,
    pub share_mismatches: Vec<ShareMismatch>,
    /// Local book gross value minus broker gross value, at shared marks.
    pub account_delta: Decimal,
    pub auto_fixed: bool,
    pub stats: DailyStats,
}

impl ReconReport {
    pub fn is_clean(&self) -> bool {
        self.extras_local.is_empty()
            && self.extras_broker.is_empty()
            && self.share_mismatches.is_empty()
    }
}

pub struct Reconciler {
    store: Arc<TradeStore>,
    gateway: Arc<dyn MarketGateway>,
    calendar: Arc<TradingCalendar>,
    clock: Arc<dyn Clock>,
    auto_fix: bool,
    recon_time: NaiveTime,
    exit_time: NaiveTime,
    holding_days: u32,
    blacklist_days: u32,
}

/// How often the scheduler re-checks the wall clock. The once-per-day
/// guard is the persisted report, so frequent checks are harmless and
/// double as startup catch-up.
const SCHEDULER_POLL: Duration = Duration::from_secs(30);

impl Reconciler {
    pub fn from_context(ctx: &StrategyContext) -> Result<Self> {
        Self::new(
            &ctx.config,
            ctx.store.clone(),
            ctx.gateway.clone(),
            ctx.calendar.clone(),
            ctx.clock.clone(),
        )
    }

    pub fn new(
        config: &AppConfig,
        store: Arc<TradeStore>,
        gateway: Arc<dyn MarketGateway>,
        calendar: Arc<TradingCalendar>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        Ok(Self {
            store,
            gateway,
            calendar,
            clock,
            auto_fix: config.reconciliation.auto_fix,
            recon_time: config.reconciliation_time()?,
            exit_time: config.exit_time()?,
            holding_days: config.exit.holding_days,
            blacklist_days: config.blacklist_days,
        })
    }

    /// Fire once per trading day at the configured time; a process that
    /// starts after that time reconciles immediately.
    pub async fn run_scheduler(self, mut shutdown: watch::Receiver<bool>) {
        info!(recon_time = %self.recon_time, auto_fix = self.auto_fix, "reconciliation scheduler started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(SCHEDULER_POLL) => {
                    let now = self.clock.now_eastern();
                    let today = now.date_naive();
                    if !self.calendar.is_trading_day(today) || now.time() < self.recon_time {
                        continue;
                    }
                    match self.store.has_reconciliation(today) {
                        Ok(true) => continue,
                        Ok(false) => {
                            if let Err(e) = self.run_once(today).await {
                                error!(error = %e, "daily reconciliation failed");
                            }
                        }
                        Err(e) => error!(error = %e, "reconciliation lookup failed"),
                    }
                }
            }
        }
        info!("reconciliation scheduler stopped");
    }

    /// Snapshot both sides, diff, optionally repair, persist the report.
    pub async fn run_once(&self, date: NaiveDate) -> Result<ReconReport> {
        let local = self.store.open_positions()?;
        let broker = self.gateway.get_positions().await?;

        let local_by_symbol: HashMap<&str, &crate::persistence::Position> =
            local.iter().map(|p| (p.symbol.as_str(), p)).collect();
        let broker_by_symbol: HashMap<&str, &crate::gateway::BrokerPosition> =
            broker.iter().map(|p| (p.symbol.as_str(), p)).collect();

        let mut extras_local = Vec::new();
        let mut extras_broker = Vec::new();
        let mut share_mismatches = Vec::new();
        let mut account_delta = Decimal::ZERO;

        for position in &local {
            match broker_by_symbol.get(position.symbol.as_str()) {
                None => extras_local.push(LocalExtra {
                    symbol: position.symbol.clone(),
                    shares: position.shares,
                    closed_at: None,
                }),
                Some(theirs) if theirs.shares != position.shares => {
                    share_mismatches.push(ShareMismatch {
                        symbol: position.symbol.clone(),
                        local_shares: position.shares,
                        broker_shares: theirs.shares,
                    });
                    let mark = self.mark_for(&position.symbol, position.cost_price).await;
                    account_delta += mark * Decimal::from(position.shares - theirs.shares);
                }
                Some(_) => {}
            }
        }
        for position in &broker {
            if !local_by_symbol.contains_key(position.symbol.as_str()) {
                extras_broker.push(BrokerExtra {
                    symbol: position.symbol.clone(),
                    shares: position.shares,
                    avg_cost: position.avg_cost,
                });
            }
        }
        for extra in &extras_local {
            let mark = self
                .mark_for(
                    &extra.symbol,
                    local_by_symbol
                        .get(extra.symbol.as_str())
                        .map(|p| p.cost_price)
                        .unwrap_or_default(),
                )
                .await;
            account_delta += mark * Decimal::from(extra.shares);
        }
        for extra in &extras_broker {
            account_delta -= extra.avg_cost * Decimal::from(extra.shares);
        }

        let fixed = if self.auto_fix
            && !(extras_local.is_empty() && extras_broker.is_empty() && share_mismatches.is_empty())
        {
            self.apply_fixes(&local, &mut extras_local, &extras_broker, &share_mismatches)
                .await?;
            true
        } else {
            false
        };

        let report = ReconReport {
            date,
            extras_local,
            extras_broker,
            share_mismatches,
            account_delta,
            auto_fixed: fixed,
            stats: self.store.daily_stats(date)?,
        };

        if report.is_clean() {
            info!(%date, "reconciliation clean");
        } else {
            warn!(
                %date,
                extras_local = report.extras_local.len(),
                extras_broker = report.extras_broker.len(),
                mismatches = report.share_mismatches.len(),
                delta = %report.account_delta,
                auto_fixed = report.auto_fixed,
                "reconciliation found drift"
            );
        }
        info!(
            %date,
            orders = report.stats.orders_placed,
            buys = report.stats.buys_filled,
            sells = report.stats.sells_filled,
            realized_pnl = %report.stats.realized_pnl,
            "daily summary"
        );

        self.store.record_reconciliation(
            date,
            &serde_json::to_value(&report)?,
            self.clock.now_eastern(),
        )?;
        Ok(report)
    }

    async fn apply_fixes(
        &self,
        local: &[crate::persistence::Position],
        extras_local: &mut [LocalExtra],
        extras_broker: &[BrokerExtra],
        mismatches: &[ShareMismatch],
    ) -> Result<()> {
        let now = self.clock.now_eastern();
        let today = now.date_naive();

        // Positions we believe in but the broker does not hold: close at
        // the last known price.
        for extra in extras_local.iter_mut() {
            let Some(position) = local.iter().find(|p| p.symbol == extra.symbol) else {
                continue;
            };
            let price = self.mark_for(&position.symbol, position.cost_price).await;
            self.store.record_close(
                position.position_id,
                &ClosedPosition {
                    order: None,
                    reason: ExitReason::ReconDrop.as_str(),
                    close_price: price,
                    close_time_eastern: now,
                },
            )?;
            extra.closed_at = Some(price);
            warn!(symbol = %extra.symbol, %price, "dropped local-only position");
        }

        // Broker positions we do not track: adopt at the broker's cost.
        for extra in extras_broker {
            let client_id = fingerprint(&[&extra.symbol, "RECON_OPEN", &now.to_rfc3339()]);
            let order = OrderResult {
                client_id,
                broker_id: None,
                symbol: extra.symbol.clone(),
                side: OrderSide::Buy,
                shares: extra.shares,
                limit_price: extra.avg_cost,
                status: OrderStatus::Filled,
                filled_shares: extra.shares,
                avg_price: Some(extra.avg_cost),
                fees: Decimal::ZERO,
                created_eastern: now,
                updated_eastern: now,
            };
            self.store.record_order_event(&order)?;

            let exit_date = self.calendar.add_trading_days(today, self.holding_days);
            let cooldown_date = self.calendar.add_trading_days(today, self.blacklist_days);
            self.store.record_open(&NewPosition {
                order: &order,
                signal_id: None,
                cost_price: extra.avg_cost,
                scheduled_exit_eastern: crate::calendar::at_eastern(exit_date, self.exit_time),
                strike: None,
                blacklist_until: self.calendar.session_close(cooldown_date),
                meta: serde_json::json!({"source": "reconciliation"}),
            })?;
            warn!(symbol = %extra.symbol, shares = extra.shares, "adopted broker-only position");
        }

        // Shared symbols with share drift follow the broker's count.
        for mismatch in mismatches {
            if let Some(position) = local.iter().find(|p| p.symbol == mismatch.symbol) {
                self.store
                    .adjust_position_shares(position.position_id, mismatch.broker_shares)?;
                warn!(
                    symbol = %mismatch.symbol,
                    from = mismatch.local_shares,
                    to = mismatch.broker_shares,
                    "share count reconciled to broker"
                );
            }
        }
        Ok(())
    }

    async fn mark_for(&self, symbol: &str, fallback: Decimal) -> Decimal {
        self.gateway.get_quote(symbol).await.unwrap_or(fallback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::{at_eastern, SimClock};
    use crate::gateway::{BarStore, OrderRequest, SimCosts, SimGateway};
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;
    use std::io::Write;

    const DAY_CSV: &str = "time,open,high,low,close\n\
        15:35:00,100.0,100.5,99.8,100.0\n";

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 3).unwrap()
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<TradeStore>,
        gateway: Arc<SimGateway>,
        reconciler: Reconciler,
    }

    fn fixture(auto_fix: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        for symbol in ["AAA", "BBB"] {
            let path = dir.path().join(format!("{symbol}_{}.csv", date()));
            let mut file = std::fs::File::create(path).unwrap();
            file.write_all(DAY_CSV.as_bytes()).unwrap();
        }

        let clock = Arc::new(SimClock::new(at_eastern(
            date(),
            NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
        )));
        let calendar = Arc::new(TradingCalendar::builtin());
        let gateway = Arc::new(SimGateway::new(
            dec!(100000),
            clock.clone(),
            Arc::new(BarStore::csv_dir(dir.path())),
            calendar.clone(),
            SimCosts {
                slippage: dec!(0),
                fee_per_share: dec!(0),
                fee_min: dec!(0),
            },
            dec!(-1.0),
        ));
        let store = Arc::new(TradeStore::open_in_memory().unwrap());

        let mut config = AppConfig::default();
        config.reconciliation.auto_fix = auto_fix;
        let gateway_dyn: Arc<dyn MarketGateway> = gateway.clone();
        let reconciler =
            Reconciler::new(&config, store.clone(), gateway_dyn, calendar, clock).unwrap();
        Fixture {
            _dir: dir,
            store,
            gateway,
            reconciler,
        }
    }

    fn open_local(store: &TradeStore, symbol: &str, shares: i64) {
        let t = at_eastern(date(), NaiveTime::from_hms_opt(15, 35, 0).unwrap());
        let order = OrderResult {
            client_id: format!("buy-{symbol}"),
            broker_id: None,
            symbol: symbol.to_string(),
            side: OrderSide::Buy,
            shares,
            limit_price: dec!(100),
            status: OrderStatus::Filled,
            filled_shares: shares,
            avg_price: Some(dec!(100)),
            fees: dec!(0),
            created_eastern: t,
            updated_eastern: t,
        };
        store
            .record_open(&NewPosition {
                order: &order,
                signal_id: None,
                cost_price: dec!(100),
                scheduled_exit_eastern: at_eastern(
                    NaiveDate::from_ymd_opt(2024, 6, 11).unwrap(),
                    NaiveTime::from_hms_opt(15, 0, 0).unwrap(),
                ),
                strike: None,
                blacklist_until: at_eastern(
                    NaiveDate::from_ymd_opt(2024, 6, 24).unwrap(),
                    NaiveTime::from_hms_opt(16, 0, 0).unwrap(),
                ),
                meta: serde_json::json!({}),
            })
            .unwrap();
    }

    async fn buy_at_broker(gateway: &SimGateway, symbol: &str, shares: i64) {
        let result = gateway
            .place_order(OrderRequest {
                client_id: format!("broker-{symbol}"),
                symbol: symbol.to_string(),
                side: OrderSide::Buy,
                shares,
                limit_price: dec!(100),
            })
            .await
            .unwrap();
        assert_eq!(result.status, OrderStatus::Filled);
    }

    #[tokio::test]
    async fn test_clean_book_produces_empty_report() {
        let f = fixture(true);
        open_local(&f.store, "AAA", 100);
        buy_at_broker(&f.gateway, "AAA", 100).await;

        let report = f.reconciler.run_once(date()).await.unwrap();
        assert!(report.is_clean());
        assert!(f.store.has_reconciliation(date()).unwrap());
    }

    #[tokio::test]
    async fn test_auto_fix_drops_and_adopts() {
        // Local book says AAA; broker says BBB. Both sides repaired.
        let f = fixture(true);
        open_local(&f.store, "AAA", 100);
        buy_at_broker(&f.gateway, "BBB", 50).await;

        let report = f.reconciler.run_once(date()).await.unwrap();
        assert_eq!(report.extras_local.len(), 1);
        assert_eq!(report.extras_local[0].symbol, "AAA");
        assert_eq!(report.extras_broker.len(), 1);
        assert_eq!(report.extras_broker[0].symbol, "BBB");
        assert!(report.auto_fixed);

        let open = f.store.open_positions().unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].symbol, "BBB");
        assert_eq!(open[0].shares, 50);
        assert_eq!(open[0].cost_price, dec!(100));

        // Fixed point: a second run with no intervening activity is clean.
        let second = f.reconciler.run_once(date()).await.unwrap();
        assert!(second.is_clean());
    }

    #[tokio::test]
    async fn test_share_mismatch_follows_broker() {
        let f = fixture(true);
        open_local(&f.store, "AAA", 100);
        buy_at_broker(&f.gateway, "AAA", 60).await;

        let report = f.reconciler.run_once(date()).await.unwrap();
        assert_eq!(report.share_mismatches.len(), 1);
        assert_eq!(report.share_mismatches[0].broker_shares, 60);

        let open = f.store.open_positions().unwrap();
        assert_eq!(open[0].shares, 60);

        let second = f.reconciler.run_once(date()).await.unwrap();
        assert!(second.is_clean());
    }

    #[tokio::test]
    async fn test_advisory_mode_reports_without_repair() {
        let f = fixture(false);
        open_local(&f.store, "AAA", 100);

        let report = f.reconciler.run_once(date()).await.unwrap();
        assert_eq!(report.extras_local.len(), 1);
        assert!(!report.auto_fixed);

        // Nothing was touched.
        let open = f.store.open_positions().unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].symbol, "AAA");
    }
}
