//! Performance metrics for backtest runs.

use crate::calendar::EtDateTime;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;

/// One sample of the equity curve.
#[derive(Debug, Clone, Serialize)]
pub struct EquityPoint {
    pub timestamp: EtDateTime,
    pub equity: Decimal,
    /// Drawdown from the running peak, as a ratio.
    pub drawdown: Decimal,
    pub position_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BacktestMetrics {
    pub initial_balance: Decimal,
    pub final_equity: Decimal,
    pub total_return: Decimal,
    pub max_drawdown: Decimal,
    pub num_trades: usize,
    pub wins: usize,
    pub losses: usize,
    pub win_rate: f64,
    pub realized_pnl: Decimal,
    pub signals_processed: usize,
    pub signals_accepted: usize,
}

impl BacktestMetrics {
    /// Build from the equity curve and the closed-trade ledger
    /// (`(cost_price, close_price, shares)` per trade).
    pub fn compute(
        initial_balance: Decimal,
        final_equity: Decimal,
        equity_curve: &[EquityPoint],
        closed: &[(Decimal, Decimal, i64)],
        signals_processed: usize,
        signals_accepted: usize,
    ) -> Self {
        let total_return = if initial_balance > Decimal::ZERO {
            (final_equity - initial_balance) / initial_balance
        } else {
            Decimal::ZERO
        };

        let mut max_drawdown = Decimal::ZERO;
        let mut peak = initial_balance;
        for point in equity_curve {
            if point.equity > peak {
                peak = point.equity;
            }
            if peak > Decimal::ZERO {
                let drawdown = (peak - point.equity) / peak;
                if drawdown > max_drawdown {
                    max_drawdown = drawdown;
                }
            }
        }

        let mut wins = 0usize;
        let mut losses = 0usize;
        let mut realized_pnl = Decimal::ZERO;
        for (cost, close, shares) in closed {
            let pnl = (*close - *cost) * Decimal::from(*shares);
            realized_pnl += pnl;
            if pnl > Decimal::ZERO {
                wins += 1;
            } else if pnl < Decimal::ZERO {
                losses += 1;
            }
        }
        let total = wins + losses;
        let win_rate = if total > 0 {
            wins as f64 / total as f64
        } else {
            0.0
        };

        Self {
            initial_balance,
            final_equity,
            total_return,
            max_drawdown,
            num_trades: closed.len(),
            wins,
            losses,
            win_rate,
            realized_pnl,
            signals_processed,
            signals_accepted,
        }
    }

    /// Human-readable run summary.
    pub fn summary(&self) -> String {
        format!(
            "Backtest Results\n\
             ================\n\
             Initial balance:  ${}\n\
             Final equity:     ${}\n\
             Total return:     {:.2}%\n\
             Max drawdown:     {:.2}%\n\
             Trades:           {} ({} wins / {} losses, {:.1}% win rate)\n\
             Realized P&L:     ${}\n\
             Signals:          {} processed, {} accepted",
            self.initial_balance.round_dp(2),
            self.final_equity.round_dp(2),
            (self.total_return * Decimal::ONE_HUNDRED)
                .to_f64()
                .unwrap_or(0.0),
            (self.max_drawdown * Decimal::ONE_HUNDRED)
                .to_f64()
                .unwrap_or(0.0),
            self.num_trades,
            self.wins,
            self.losses,
            self.win_rate * 100.0,
            self.realized_pnl.round_dp(2),
            self.signals_processed,
            self.signals_accepted,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::at_eastern;
    use chrono::{NaiveDate, NaiveTime};
    use rust_decimal_macros::dec;

    fn point(equity: Decimal) -> EquityPoint {
        EquityPoint {
            timestamp: at_eastern(
                NaiveDate::from_ymd_opt(2024, 6, 3).unwrap(),
                NaiveTime::from_hms_opt(16, 0, 0).unwrap(),
            ),
            equity,
            drawdown: Decimal::ZERO,
            position_count: 0,
        }
    }

    #[test]
    fn test_metrics_compute() {
        let curve = vec![
            point(dec!(100000)),
            point(dec!(110000)),
            point(dec!(99000)),
            point(dec!(104500)),
        ];
        let closed = vec![
            (dec!(100), dec!(120), 100i64), // +2000
            (dec!(50), dec!(45), 100i64),   // -500
        ];
        let metrics = BacktestMetrics::compute(dec!(100000), dec!(104500), &curve, &closed, 10, 2);

        assert_eq!(metrics.total_return, dec!(0.045));
        assert_eq!(metrics.realized_pnl, dec!(1500));
        assert_eq!(metrics.wins, 1);
        assert_eq!(metrics.losses, 1);
        assert!((metrics.win_rate - 0.5).abs() < f64::EPSILON);
        // Peak 110000 down to 99000 is a 10% drawdown.
        assert_eq!(metrics.max_drawdown, dec!(0.1));
    }

    #[test]
    fn test_summary_renders() {
        let metrics = BacktestMetrics::compute(dec!(100000), dec!(100000), &[], &[], 0, 0);
        let summary = metrics.summary();
        assert!(summary.contains("Total return"));
        assert!(summary.contains("0 processed"));
    }
}
