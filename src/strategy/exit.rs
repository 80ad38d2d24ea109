//! Exit scanning: walk minute bars in time order and emit the first
//! trigger.
//!
//! Priority within a single bar is strict — scheduled exit, strike, take
//! profit, trailing stop, stop loss — so a bar that gaps through several
//! thresholds resolves to the highest-ranked condition.

use super::{ExitDecision, ExitReason, ExitScan};
use crate::gateway::MinuteBar;
use crate::persistence::Position;
use crate::utils::decimal::round_to_cent;
use rust_decimal::Decimal;

#[derive(Debug, Clone, Copy)]
pub struct ExitRules {
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
    /// None disables the trailing stop entirely.
    pub trailing_stop: Option<Decimal>,
    /// Exit when the underlying reaches the triggering option's strike.
    pub strike_exit: bool,
}

/// Walk `bars` (ascending) updating the high-water mark, and return the
/// first exit trigger with its fill price. Bars after the trigger are not
/// examined.
pub fn scan_window(position: &Position, bars: &[MinuteBar], rules: &ExitRules) -> ExitScan {
    let cost = position.cost_price;
    // The stored mark is already >= cost; keep it monotone.
    let mut high_water = position.high_water_price.max(cost);

    let take_profit_price = round_to_cent(cost * (Decimal::ONE + rules.take_profit));
    let stop_loss_price = round_to_cent(cost * (Decimal::ONE - rules.stop_loss));

    for bar in bars {
        high_water = high_water.max(bar.high);

        // 1. Scheduled exit at the bar close.
        if bar.timestamp >= position.scheduled_exit_eastern {
            return triggered(position, bar, ExitReason::Timed, bar.close, high_water);
        }

        // 2. Strike reached (skipped when no strike was stored).
        if rules.strike_exit {
            if let Some(strike) = position.strike {
                if bar.high >= strike {
                    return triggered(position, bar, ExitReason::Strike, strike, high_water);
                }
            }
        }

        // 3. Take profit at the threshold.
        if bar.high >= take_profit_price {
            return triggered(
                position,
                bar,
                ExitReason::TakeProfit,
                take_profit_price,
                high_water,
            );
        }

        // 4. Trailing stop, armed only once the position has been in
        //    profit.
        if let Some(trail) = rules.trailing_stop {
            if high_water > cost {
                let trail_price = round_to_cent(high_water * (Decimal::ONE - trail));
                if bar.low <= trail_price {
                    return triggered(position, bar, ExitReason::Trail, trail_price, high_water);
                }
            }
        }

        // 5. Stop loss at the threshold.
        if bar.low <= stop_loss_price {
            return triggered(
                position,
                bar,
                ExitReason::StopLoss,
                stop_loss_price,
                high_water,
            );
        }
    }

    ExitScan {
        decision: None,
        high_water,
    }
}

fn triggered(
    position: &Position,
    bar: &MinuteBar,
    reason: ExitReason,
    fill_price: Decimal,
    high_water: Decimal,
) -> ExitScan {
    ExitScan {
        decision: Some(ExitDecision {
            position_id: position.position_id,
            symbol: position.symbol.clone(),
            shares: position.shares,
            limit_price: fill_price,
            reason,
            triggered_at: bar.timestamp,
            client_id: ExitDecision::client_id_for(position.position_id, bar.timestamp),
        }),
        high_water,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::{at_eastern, EtDateTime};
    use chrono::{NaiveDate, NaiveTime};
    use rust_decimal_macros::dec;

    fn ts(day: u32, h: u32, m: u32) -> EtDateTime {
        at_eastern(
            NaiveDate::from_ymd_opt(2024, 6, day).unwrap(),
            NaiveTime::from_hms_opt(h, m, 0).unwrap(),
        )
    }

    fn bar(t: EtDateTime, low: Decimal, high: Decimal, close: Decimal) -> MinuteBar {
        MinuteBar {
            timestamp: t,
            open: close,
            high,
            low,
            close,
        }
    }

    fn position(cost: Decimal) -> Position {
        Position {
            position_id: 7,
            open_order_client_id: "b1".to_string(),
            symbol: "XYZ".to_string(),
            shares: 100,
            cost_price: cost,
            fees_paid: dec!(1),
            open_time_eastern: ts(3, 14, 0),
            scheduled_exit_eastern: ts(11, 15, 0),
            high_water_price: cost,
            strike: None,
            meta: serde_json::Value::Null,
        }
    }

    fn rules() -> ExitRules {
        ExitRules {
            stop_loss: dec!(0.10),
            take_profit: dec!(0.40),
            trailing_stop: Some(dec!(0.08)),
            strike_exit: false,
        }
    }

    #[test]
    fn test_gap_bar_resolves_take_profit_over_stop_loss() {
        // cost 100, SL 10%, TP 40%. One bar spans low 80 / high 145: both
        // conditions hold, TP outranks SL and fills at the threshold.
        let pos = position(dec!(100));
        let bars = vec![bar(ts(4, 10, 0), dec!(80), dec!(145), dec!(120))];

        let scan = scan_window(&pos, &bars, &rules());
        let exit = scan.decision.unwrap();
        assert_eq!(exit.reason, ExitReason::TakeProfit);
        assert_eq!(exit.limit_price, dec!(140));
    }

    #[test]
    fn test_stop_loss_fills_at_threshold() {
        let pos = position(dec!(100));
        let bars = vec![bar(ts(4, 10, 0), dec!(88), dec!(91), dec!(89))];

        let scan = scan_window(&pos, &bars, &rules());
        let exit = scan.decision.unwrap();
        assert_eq!(exit.reason, ExitReason::StopLoss);
        assert_eq!(exit.limit_price, dec!(90));
    }

    #[test]
    fn test_trailing_stop_arms_only_in_profit() {
        let mut no_sl = rules();
        no_sl.stop_loss = dec!(0.50); // keep SL out of the way

        // Never above cost: an 8% dip must not trail out.
        let pos = position(dec!(100));
        let bars = vec![
            bar(ts(4, 10, 0), dec!(95), dec!(99), dec!(96)),
            bar(ts(4, 10, 1), dec!(90), dec!(95), dec!(91)),
        ];
        assert!(scan_window(&pos, &bars, &no_sl).decision.is_none());

        // Once in profit, an 8% retrace from the high-water mark fires.
        let bars = vec![
            bar(ts(4, 10, 0), dec!(100), dec!(120), dec!(119)),
            bar(ts(4, 10, 1), dec!(109), dec!(119), dec!(110)),
        ];
        let scan = scan_window(&pos, &bars, &no_sl);
        let exit = scan.decision.unwrap();
        assert_eq!(exit.reason, ExitReason::Trail);
        // 120 * 0.92
        assert_eq!(exit.limit_price, dec!(110.40));
    }

    #[test]
    fn test_high_water_monotone_across_scan() {
        let pos = position(dec!(100));
        let bars = vec![
            bar(ts(4, 10, 0), dec!(99), dec!(112), dec!(111)),
            bar(ts(4, 10, 1), dec!(104), dec!(108), dec!(105)),
        ];
        let mut relaxed = rules();
        relaxed.trailing_stop = None;
        let scan = scan_window(&pos, &bars, &relaxed);
        assert!(scan.decision.is_none());
        assert_eq!(scan.high_water, dec!(112));
    }

    #[test]
    fn test_scheduled_exit_outranks_everything_and_fills_at_close() {
        let pos = position(dec!(100));
        // At the scheduled time the bar also gaps through TP; TIMED wins.
        let bars = vec![bar(ts(11, 15, 0), dec!(80), dec!(150), dec!(142))];
        let scan = scan_window(&pos, &bars, &rules());
        let exit = scan.decision.unwrap();
        assert_eq!(exit.reason, ExitReason::Timed);
        assert_eq!(exit.limit_price, dec!(142));
    }

    #[test]
    fn test_holds_before_scheduled_time_fires_at_it() {
        // 14:59 on exit day holds; 15:00 emits TIMED.
        let mut calm = rules();
        calm.trailing_stop = None;
        let pos = position(dec!(100));

        let before = vec![bar(ts(11, 14, 59), dec!(101), dec!(103), dec!(102))];
        assert!(scan_window(&pos, &before, &calm).decision.is_none());

        let at = vec![bar(ts(11, 15, 0), dec!(101), dec!(103), dec!(102))];
        let exit = scan_window(&pos, &at, &calm).decision.unwrap();
        assert_eq!(exit.reason, ExitReason::Timed);
        assert_eq!(exit.limit_price, dec!(102));
    }

    #[test]
    fn test_strike_exit_when_stored_and_enabled() {
        let mut with_strike = rules();
        with_strike.strike_exit = true;
        with_strike.take_profit = dec!(0.40);

        let mut pos = position(dec!(100));
        pos.strike = Some(dec!(125));

        let bars = vec![bar(ts(4, 10, 0), dec!(120), dec!(130), dec!(128))];
        let exit = scan_window(&pos, &bars, &with_strike).decision.unwrap();
        assert_eq!(exit.reason, ExitReason::Strike);
        assert_eq!(exit.limit_price, dec!(125));

        // Without a stored strike the check is skipped, not an error.
        pos.strike = None;
        let scan = scan_window(&pos, &bars, &with_strike);
        assert!(scan.decision.is_none());
    }

    #[test]
    fn test_first_trigger_wins_across_bars() {
        let mut calm = rules();
        calm.trailing_stop = None;
        let pos = position(dec!(100));
        // SL fires on the first bar even though TP would fire later.
        let bars = vec![
            bar(ts(4, 10, 0), dec!(89), dec!(95), dec!(90)),
            bar(ts(4, 10, 1), dec!(139), dec!(150), dec!(145)),
        ];
        let exit = scan_window(&pos, &bars, &calm).decision.unwrap();
        assert_eq!(exit.reason, ExitReason::StopLoss);
        assert_eq!(exit.triggered_at, ts(4, 10, 0));
    }

    #[test]
    fn test_exit_client_id_is_deterministic() {
        let pos = position(dec!(100));
        let bars = vec![bar(ts(4, 10, 0), dec!(80), dec!(145), dec!(120))];
        let a = scan_window(&pos, &bars, &rules()).decision.unwrap();
        let b = scan_window(&pos, &bars, &rules()).decision.unwrap();
        assert_eq!(a.client_id, b.client_id);
    }
}
