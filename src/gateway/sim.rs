//! Simulated gateway for backtests and as a test double.
//!
//! The ledger lives in a single owner behind a lock and is mutated only
//! through order placement; every read returns a snapshot so harnesses can
//! diff state across steps. The clock pointer is advanced externally by
//! the backtest driver; all queries answer as of that pointer.

use super::bars::BarStore;
use super::traits::{GatewayError, MarketGateway};
use super::types::{
    AccountSnapshot, BrokerPosition, MinuteBar, OrderRequest, OrderResult, OrderSide, OrderStatus,
};
use crate::calendar::{Clock, EtDateTime, SimClock, TradingCalendar};
use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Simulated execution costs.
#[derive(Debug, Clone, Copy)]
pub struct SimCosts {
    /// Single-side slippage: buys fill at +s%, sells at -s%.
    pub slippage: Decimal,
    pub fee_per_share: Decimal,
    pub fee_min: Decimal,
}

impl SimCosts {
    pub fn fee_for(&self, shares: i64) -> Decimal {
        let per_share = Decimal::from(shares) * self.fee_per_share;
        per_share.max(self.fee_min)
    }
}

#[derive(Debug, Clone)]
struct SimPosition {
    shares: i64,
    avg_cost: Decimal,
}

struct StoredOrder {
    result: OrderResult,
    args_digest: String,
}

/// Ledger state: cash plus the positions book and the idempotency map.
struct SimLedger {
    initial_cash: Decimal,
    cash: Decimal,
    positions: HashMap<String, SimPosition>,
    orders: HashMap<String, StoredOrder>,
}

/// Simulated market gateway.
pub struct SimGateway {
    ledger: RwLock<SimLedger>,
    clock: Arc<SimClock>,
    bars: Arc<BarStore>,
    calendar: Arc<TradingCalendar>,
    costs: SimCosts,
    min_cash_ratio: Decimal,
}

impl SimGateway {
    pub fn new(
        initial_cash: Decimal,
        clock: Arc<SimClock>,
        bars: Arc<BarStore>,
        calendar: Arc<TradingCalendar>,
        costs: SimCosts,
        min_cash_ratio: Decimal,
    ) -> Self {
        Self {
            ledger: RwLock::new(SimLedger {
                initial_cash,
                cash: initial_cash,
                positions: HashMap::new(),
                orders: HashMap::new(),
            }),
            clock,
            bars,
            calendar,
            costs,
            min_cash_ratio,
        }
    }

    /// Reset cash and book for a fresh run.
    pub async fn reset(&self, initial_cash: Decimal) {
        let mut ledger = self.ledger.write().await;
        ledger.initial_cash = initial_cash;
        ledger.cash = initial_cash;
        ledger.positions.clear();
        ledger.orders.clear();
        debug!(cash = %initial_cash, "sim ledger reset");
    }

    pub async fn cash(&self) -> Decimal {
        self.ledger.read().await.cash
    }

    pub async fn initial_cash(&self) -> Decimal {
        self.ledger.read().await.initial_cash
    }

    /// Fill price basis: the close of the minute bar containing the clock
    /// pointer, forward-filled when that minute is a gap.
    async fn mark_price(&self, symbol: &str) -> Result<MinuteBar, GatewayError> {
        let now = self.clock.now_eastern();
        if let Some(bar) = self
            .bars
            .bar_containing(symbol, now)
            .await
            .map_err(|e| GatewayError::Network(e.to_string()))?
        {
            return Ok(bar);
        }
        self.bars
            .bar_at_or_before(symbol, now)
            .await
            .map_err(|e| GatewayError::Network(e.to_string()))?
            .ok_or_else(|| GatewayError::SymbolUnknown(symbol.to_string()))
    }

    /// Mark-to-market equity of the ledger as of the clock pointer.
    async fn equity_of(&self, ledger: &SimLedger) -> Decimal {
        let mut equity = ledger.cash;
        for (symbol, pos) in &ledger.positions {
            let mark = match self.mark_price(symbol).await {
                Ok(bar) => bar.close,
                Err(_) => pos.avg_cost,
            };
            equity += mark * Decimal::from(pos.shares);
        }
        equity
    }

    fn finish_order(
        ledger: &mut SimLedger,
        req: &OrderRequest,
        status: OrderStatus,
        filled: i64,
        avg_price: Option<Decimal>,
        fees: Decimal,
        now: EtDateTime,
    ) -> OrderResult {
        let result = OrderResult {
            client_id: req.client_id.clone(),
            broker_id: Some(format!("SIM-{:06}", ledger.orders.len() + 1)),
            symbol: req.symbol.clone(),
            side: req.side,
            shares: req.shares,
            limit_price: req.limit_price,
            status,
            filled_shares: filled,
            avg_price,
            fees,
            created_eastern: now,
            updated_eastern: now,
        };
        ledger.orders.insert(
            req.client_id.clone(),
            StoredOrder {
                result: result.clone(),
                args_digest: req.args_digest(),
            },
        );
        result
    }
}

#[async_trait]
impl MarketGateway for SimGateway {
    async fn connect(&self) -> Result<(), GatewayError> {
        info!("sim gateway connected");
        Ok(())
    }

    async fn disconnect(&self) {
        let ledger = self.ledger.read().await;
        info!(
            cash = %ledger.cash,
            positions = ledger.positions.len(),
            orders = ledger.orders.len(),
            "sim gateway disconnected"
        );
    }

    async fn get_quote(&self, symbol: &str) -> Result<Decimal, GatewayError> {
        self.mark_price(symbol).await.map(|bar| bar.close)
    }

    async fn get_minute_bars(
        &self,
        symbol: &str,
        from: EtDateTime,
        to: EtDateTime,
    ) -> Result<Vec<MinuteBar>, GatewayError> {
        // Queries never look past the clock pointer.
        let capped_to = to.min(self.clock.now_eastern());
        self.bars
            .bars_between(symbol, from, capped_to)
            .await
            .map_err(|e| GatewayError::Network(e.to_string()))
    }

    async fn get_account(&self) -> Result<AccountSnapshot, GatewayError> {
        let ledger = self.ledger.read().await;
        let equity = self.equity_of(&ledger).await;
        Ok(AccountSnapshot {
            equity,
            cash: ledger.cash,
            buying_power: ledger.cash.max(Decimal::ZERO),
        })
    }

    async fn get_positions(&self) -> Result<Vec<BrokerPosition>, GatewayError> {
        let ledger = self.ledger.read().await;
        let mut positions: Vec<BrokerPosition> = ledger
            .positions
            .iter()
            .filter(|(_, p)| p.shares > 0)
            .map(|(symbol, p)| BrokerPosition {
                symbol: symbol.clone(),
                shares: p.shares,
                avg_cost: p.avg_cost,
            })
            .collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(positions)
    }

    async fn place_order(&self, req: OrderRequest) -> Result<OrderResult, GatewayError> {
        // Idempotency gate before any execution effect.
        {
            let ledger = self.ledger.read().await;
            if let Some(stored) = ledger.orders.get(&req.client_id) {
                if stored.args_digest == req.args_digest() {
                    return Ok(stored.result.clone());
                }
                return Err(GatewayError::IdempotencyConflict(req.client_id.clone()));
            }
        }

        let bar = self.mark_price(&req.symbol).await?;
        let now = self.clock.now_eastern();
        let fill_price = match req.side {
            OrderSide::Buy => bar.close * (Decimal::ONE + self.costs.slippage),
            OrderSide::Sell => bar.close * (Decimal::ONE - self.costs.slippage),
        };
        let fees = self.costs.fee_for(req.shares);
        let shares_dec = Decimal::from(req.shares);

        let mut ledger = self.ledger.write().await;

        match req.side {
            OrderSide::Buy => {
                let cost = fill_price * shares_dec + fees;
                let equity = self.equity_of(&ledger).await;
                let cash_after = ledger.cash - cost;
                if equity <= Decimal::ZERO || cash_after / equity < self.min_cash_ratio {
                    let result = Self::finish_order(
                        &mut ledger,
                        &req,
                        OrderStatus::Rejected,
                        0,
                        None,
                        Decimal::ZERO,
                        now,
                    );
                    debug!(
                        symbol = %req.symbol,
                        need = %cost,
                        cash = %ledger.cash,
                        "buy rejected: insufficient funds"
                    );
                    return Ok(result);
                }

                ledger.cash = cash_after;
                let entry = ledger
                    .positions
                    .entry(req.symbol.clone())
                    .or_insert(SimPosition {
                        shares: 0,
                        avg_cost: Decimal::ZERO,
                    });
                let total_shares = entry.shares + req.shares;
                entry.avg_cost = (entry.avg_cost * Decimal::from(entry.shares)
                    + fill_price * shares_dec)
                    / Decimal::from(total_shares);
                entry.shares = total_shares;

                info!(
                    symbol = %req.symbol,
                    shares = req.shares,
                    price = %fill_price,
                    fees = %fees,
                    "sim buy filled"
                );
                Ok(Self::finish_order(
                    &mut ledger,
                    &req,
                    OrderStatus::Filled,
                    req.shares,
                    Some(fill_price),
                    fees,
                    now,
                ))
            }
            OrderSide::Sell => {
                let held = ledger
                    .positions
                    .get(&req.symbol)
                    .map(|p| p.shares)
                    .unwrap_or(0);
                if held < req.shares {
                    let result = Self::finish_order(
                        &mut ledger,
                        &req,
                        OrderStatus::Rejected,
                        0,
                        None,
                        Decimal::ZERO,
                        now,
                    );
                    debug!(
                        symbol = %req.symbol,
                        want = req.shares,
                        held,
                        "sell rejected: insufficient position"
                    );
                    return Ok(result);
                }

                ledger.cash += fill_price * shares_dec - fees;
                if let Some(pos) = ledger.positions.get_mut(&req.symbol) {
                    pos.shares -= req.shares;
                    if pos.shares == 0 {
                        ledger.positions.remove(&req.symbol);
                    }
                }

                info!(
                    symbol = %req.symbol,
                    shares = req.shares,
                    price = %fill_price,
                    fees = %fees,
                    "sim sell filled"
                );
                Ok(Self::finish_order(
                    &mut ledger,
                    &req,
                    OrderStatus::Filled,
                    req.shares,
                    Some(fill_price),
                    fees,
                    now,
                ))
            }
        }
    }

    async fn get_order(&self, client_id: &str) -> Result<Option<OrderResult>, GatewayError> {
        let ledger = self.ledger.read().await;
        Ok(ledger.orders.get(client_id).map(|o| o.result.clone()))
    }

    fn count_trading_days_between(&self, from: NaiveDate, to: NaiveDate) -> u32 {
        self.calendar.count_trading_days_between(from, to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::at_eastern;
    use chrono::NaiveTime;
    use rust_decimal_macros::dec;
    use std::io::Write;

    const DAY_CSV: &str = "time,open,high,low,close\n\
        15:35:00,100.0,100.5,99.8,100.0\n\
        15:37:00,100.2,101.0,100.1,100.0\n";

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn sim_costs() -> SimCosts {
        SimCosts {
            slippage: dec!(0.001),
            fee_per_share: dec!(0.005),
            fee_min: dec!(1),
        }
    }

    fn setup(initial_cash: Decimal) -> (tempfile::TempDir, SimGateway) {
        let dir = tempfile::tempdir().unwrap();
        let date = d(2024, 6, 3);
        let path = dir.path().join(format!("XYZ_{date}.csv"));
        let mut file = std::fs::File::create(path).unwrap();
        file.write_all(DAY_CSV.as_bytes()).unwrap();

        let clock = Arc::new(SimClock::new(at_eastern(
            date,
            NaiveTime::from_hms_opt(15, 37, 0).unwrap(),
        )));
        let gateway = SimGateway::new(
            initial_cash,
            clock,
            Arc::new(BarStore::csv_dir(dir.path())),
            Arc::new(TradingCalendar::builtin()),
            sim_costs(),
            dec!(-1.0),
        );
        (dir, gateway)
    }

    fn buy_req(client_id: &str, shares: i64) -> OrderRequest {
        OrderRequest {
            client_id: client_id.to_string(),
            symbol: "XYZ".to_string(),
            side: OrderSide::Buy,
            shares,
            limit_price: dec!(100.10),
        }
    }

    #[tokio::test]
    async fn test_buy_applies_slippage_and_fees() {
        let (_dir, gateway) = setup(dec!(100000));
        let result = gateway.place_order(buy_req("b1", 100)).await.unwrap();

        assert_eq!(result.status, OrderStatus::Filled);
        // 100.00 close * 1.001 slippage
        assert_eq!(result.avg_price, Some(dec!(100.100)));
        // 100 * 0.005 = 0.50, floored to the 1.00 minimum
        assert_eq!(result.fees, dec!(1));

        let cash = gateway.cash().await;
        assert_eq!(cash, dec!(100000) - dec!(100.100) * dec!(100) - dec!(1));
    }

    #[tokio::test]
    async fn test_fee_floor_applies_to_small_orders() {
        let costs = sim_costs();
        assert_eq!(costs.fee_for(10), dec!(1)); // 0.05 floored to 1.0
        assert_eq!(costs.fee_for(1000), dec!(5));
    }

    #[tokio::test]
    async fn test_place_order_is_idempotent_on_client_id() {
        let (_dir, gateway) = setup(dec!(100000));
        let first = gateway.place_order(buy_req("b1", 100)).await.unwrap();
        let second = gateway.place_order(buy_req("b1", 100)).await.unwrap();
        assert_eq!(first, second);

        // Only one execution effect.
        let positions = gateway.get_positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].shares, 100);
    }

    #[tokio::test]
    async fn test_idempotency_conflict_on_changed_args() {
        let (_dir, gateway) = setup(dec!(100000));
        gateway.place_order(buy_req("b1", 100)).await.unwrap();

        let err = gateway.place_order(buy_req("b1", 200)).await.unwrap_err();
        assert!(matches!(err, GatewayError::IdempotencyConflict(_)));
    }

    #[tokio::test]
    async fn test_insufficient_funds_rejection() {
        // min_cash_ratio of -1.0 allows borrowing up to equity; a tiny
        // account cannot absorb a large order.
        let (_dir, gateway) = setup(dec!(1000));
        let result = gateway.place_order(buy_req("b1", 100)).await.unwrap();
        assert_eq!(result.status, OrderStatus::Rejected);
        assert_eq!(gateway.cash().await, dec!(1000));

        // The rejection is itself replayed idempotently.
        let replay = gateway.place_order(buy_req("b1", 100)).await.unwrap();
        assert_eq!(replay.status, OrderStatus::Rejected);
    }

    #[tokio::test]
    async fn test_sell_roundtrip_credits_cash() {
        let (_dir, gateway) = setup(dec!(100000));
        gateway.place_order(buy_req("b1", 100)).await.unwrap();

        let sell = OrderRequest {
            client_id: "s1".to_string(),
            symbol: "XYZ".to_string(),
            side: OrderSide::Sell,
            shares: 100,
            limit_price: dec!(99.90),
        };
        let result = gateway.place_order(sell).await.unwrap();
        assert_eq!(result.status, OrderStatus::Filled);
        // 100.00 close * 0.999 slippage
        assert_eq!(result.avg_price, Some(dec!(99.900)));
        assert!(gateway.get_positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sell_without_position_rejected() {
        let (_dir, gateway) = setup(dec!(100000));
        let sell = OrderRequest {
            client_id: "s1".to_string(),
            symbol: "XYZ".to_string(),
            side: OrderSide::Sell,
            shares: 50,
            limit_price: dec!(99.90),
        };
        let result = gateway.place_order(sell).await.unwrap();
        assert_eq!(result.status, OrderStatus::Rejected);
    }

    #[tokio::test]
    async fn test_account_snapshot_marks_to_market() {
        let (_dir, gateway) = setup(dec!(100000));
        gateway.place_order(buy_req("b1", 100)).await.unwrap();

        let account = gateway.get_account().await.unwrap();
        // Cash went down by cost; equity adds back 100 shares at the mark.
        let expected_cash = dec!(100000) - dec!(100.100) * dec!(100) - dec!(1);
        assert_eq!(account.cash, expected_cash);
        assert_eq!(account.equity, expected_cash + dec!(100) * dec!(100.0));
    }
}
