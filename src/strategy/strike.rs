//! Strike-target variant: fixed-cap sizing, exits when the underlying
//! reaches the triggering option's strike.

use super::entry::{EntryPipeline, SizingMode};
use super::exit::{scan_window, ExitRules};
use super::{ExitScan, FlowStrategy, StrategyContext, Vetting};
use crate::config::AppConfig;
use crate::gateway::MinuteBar;
use crate::persistence::Position;
use crate::signal::Signal;
use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

/// Variant keyed off the option contract itself: the stored strike acts
/// as the price target, ahead of take profit and stop loss. Positions
/// opened from signals without a strike simply skip that check.
pub struct StrikeStrategy {
    entry: EntryPipeline,
    rules: ExitRules,
}

impl StrikeStrategy {
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        Ok(Self {
            entry: EntryPipeline::from_config(config, SizingMode::FixedCap)?,
            rules: ExitRules {
                stop_loss: config.exit.stop_loss,
                take_profit: config.exit.take_profit,
                trailing_stop: None,
                strike_exit: true,
            },
        })
    }
}

#[async_trait]
impl FlowStrategy for StrikeStrategy {
    fn tag(&self) -> &'static str {
        "strike"
    }

    async fn on_signal(&self, ctx: &StrategyContext, signal: &Signal) -> Result<Vetting> {
        self.entry.vet(ctx, signal).await
    }

    fn on_position_check(&self, position: &Position, bars: &[MinuteBar]) -> ExitScan {
        scan_window(position, bars, &self.rules)
    }

    fn on_start(&self) {
        info!(
            stop_loss = %self.rules.stop_loss,
            take_profit = %self.rules.take_profit,
            "strike strategy started"
        );
    }

    fn on_shutdown(&self) {
        info!("strike strategy shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::{at_eastern, EtDateTime};
    use crate::strategy::ExitReason;
    use chrono::{NaiveDate, NaiveTime};
    use rust_decimal_macros::dec;

    fn ts(h: u32, m: u32) -> EtDateTime {
        at_eastern(
            NaiveDate::from_ymd_opt(2024, 6, 4).unwrap(),
            NaiveTime::from_hms_opt(h, m, 0).unwrap(),
        )
    }

    fn position_with_strike() -> Position {
        Position {
            position_id: 3,
            open_order_client_id: "b1".to_string(),
            symbol: "XYZ".to_string(),
            shares: 50,
            cost_price: dec!(100),
            fees_paid: dec!(1),
            open_time_eastern: ts(10, 0),
            scheduled_exit_eastern: at_eastern(
                NaiveDate::from_ymd_opt(2024, 6, 12).unwrap(),
                NaiveTime::from_hms_opt(15, 0, 0).unwrap(),
            ),
            high_water_price: dec!(100),
            strike: Some(dec!(115)),
            meta: serde_json::Value::Null,
        }
    }

    #[test]
    fn test_strike_outranks_take_profit() {
        let strategy = StrikeStrategy::from_config(&AppConfig::default()).unwrap();
        // TP at 120 and strike at 115 both inside the bar range; strike
        // has the higher priority.
        let bars = vec![MinuteBar {
            timestamp: ts(11, 0),
            open: dec!(110),
            high: dec!(125),
            low: dec!(108),
            close: dec!(122),
        }];
        let scan = strategy.on_position_check(&position_with_strike(), &bars);
        let exit = scan.decision.unwrap();
        assert_eq!(exit.reason, ExitReason::Strike);
        assert_eq!(exit.limit_price, dec!(115));
    }

    #[test]
    fn test_no_trailing_stop_in_this_variant() {
        let strategy = StrikeStrategy::from_config(&AppConfig::default()).unwrap();
        let mut position = position_with_strike();
        position.strike = Some(dec!(200));

        // Ran up then retraced hard; without a trailing stop the position
        // holds as long as SL/TP/strike stay untouched.
        let bars = vec![
            MinuteBar {
                timestamp: ts(11, 0),
                open: dec!(100),
                high: dec!(118),
                low: dec!(100),
                close: dec!(117),
            },
            MinuteBar {
                timestamp: ts(11, 1),
                open: dec!(117),
                high: dec!(117),
                low: dec!(95),
                close: dec!(96),
            },
        ];
        let scan = strategy.on_position_check(&position, &bars);
        assert!(scan.decision.is_none());
        assert_eq!(scan.high_water, dec!(118));
    }
}
