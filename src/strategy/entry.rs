//! Entry vetting: the multi-stage filter from signal to entry decision.
//!
//! Each stage either passes the signal along or rejects it with an
//! explicit reason; side effects (reservation, order placement) belong to
//! the trading loops.

use super::risk::{scale_down_to_fit, RiskInputs, RiskLimits};
use super::{EntryDecision, RejectReason, StrategyContext, Vetting};
use crate::calendar::EtDateTime;
use crate::config::{
    AppConfig, BarFallback, CostsConfig, EarningsFilterConfig, HistoricalFilterConfig,
    MacdFilterConfig, Mode, RiskConfig, SizingConfig, TrendFilterConfig,
};
use crate::gateway::GatewayError;
use crate::signal::Signal;
use crate::strategy::indicators::Macd;
use crate::utils::decimal::{mean, round_to_cent};
use anyhow::{Context, Result};
use chrono::{Duration, NaiveDate, NaiveTime, Timelike};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::HashMap;
use tracing::{debug, warn};

/// How the base position ratio is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizingMode {
    /// Always the per-trade cap.
    FixedCap,
    /// `min(premium / premium_divisor, per_trade_cap)` when a divisor is
    /// configured; the cap otherwise.
    PremiumProportional,
}

/// Earnings dates per symbol, loaded once at strategy construction.
#[derive(Debug, Default)]
struct EarningsCalendar {
    dates: HashMap<String, Vec<NaiveDate>>,
    window_days: i64,
}

impl EarningsCalendar {
    fn load(config: &EarningsFilterConfig) -> Result<Self> {
        let content = std::fs::read_to_string(&config.calendar_path)
            .with_context(|| format!("failed to read {}", config.calendar_path))?;
        let mut dates: HashMap<String, Vec<NaiveDate>> = HashMap::new();
        for (line_num, line) in content.lines().enumerate() {
            if line_num == 0 && line.starts_with("symbol") {
                continue;
            }
            if line.trim().is_empty() {
                continue;
            }
            let (symbol, date) = line
                .split_once(',')
                .with_context(|| format!("bad earnings row on line {}", line_num + 1))?;
            let date: NaiveDate = date
                .trim()
                .parse()
                .with_context(|| format!("bad earnings date on line {}", line_num + 1))?;
            dates.entry(symbol.trim().to_string()).or_default().push(date);
        }
        Ok(Self {
            dates,
            window_days: config.window_days,
        })
    }

    fn in_window(&self, symbol: &str, date: NaiveDate) -> bool {
        self.dates
            .get(symbol)
            .map(|ds| {
                ds.iter()
                    .any(|d| (*d - date).num_days().abs() <= self.window_days)
            })
            .unwrap_or(false)
    }
}

/// Shared entry filter used by every strategy variant.
pub struct EntryPipeline {
    mode: Mode,
    windows: Vec<(NaiveTime, NaiveTime)>,
    close_buffer: NaiveTime,
    min_premium: Decimal,
    premium_max: Option<Decimal>,
    historical: HistoricalFilterConfig,
    entry_delay: Duration,
    bar_fallback: BarFallback,
    sizing_mode: SizingMode,
    sizing: SizingConfig,
    risk: RiskConfig,
    costs: CostsConfig,
    macd: Option<MacdFilterConfig>,
    earnings: Option<EarningsCalendar>,
    trend: Option<TrendFilterConfig>,
}

impl EntryPipeline {
    pub fn from_config(config: &AppConfig, sizing_mode: SizingMode) -> Result<Self> {
        let earnings = match &config.entry.earnings {
            Some(cfg) => Some(EarningsCalendar::load(cfg)?),
            None => None,
        };
        Ok(Self {
            mode: config.mode,
            windows: config.entry_windows()?,
            close_buffer: config.close_buffer_time()?,
            min_premium: config.entry.min_premium_usd,
            premium_max: config.entry.premium_max_usd,
            historical: config.entry.historical.clone(),
            entry_delay: Duration::minutes(config.entry.entry_delay_minutes),
            bar_fallback: config.entry.bar_fallback,
            sizing_mode,
            sizing: config.sizing.clone(),
            risk: config.risk.clone(),
            costs: config.costs.clone(),
            macd: config.entry.macd.clone(),
            earnings,
            trend: config.entry.trend.clone(),
        })
    }

    /// Run the full filter chain.
    pub async fn vet(&self, ctx: &StrategyContext, signal: &Signal) -> Result<Vetting> {
        let signal_time = signal.signal_time_eastern;

        // Live mode drops records dated before today: replayed files must
        // not trigger entries.
        if self.mode == Mode::Live
            && signal_time.date_naive() < ctx.clock.now_eastern().date_naive()
        {
            return Ok(Vetting::Reject(RejectReason::StaleSignal));
        }

        // 1. Entry time windows plus the close buffer.
        let tod = signal_time.time();
        if tod >= self.close_buffer {
            return Ok(Vetting::Reject(RejectReason::NearClose));
        }
        if !self.windows.iter().any(|(open, close)| tod >= *open && tod <= *close) {
            return Ok(Vetting::Reject(RejectReason::OutsideWindow));
        }

        // 2. Premium band.
        if signal.premium_usd < self.min_premium {
            return Ok(Vetting::Reject(RejectReason::PremiumTooLow));
        }
        if let Some(max) = self.premium_max {
            if signal.premium_usd > max {
                return Ok(Vetting::Reject(RejectReason::PremiumTooHigh));
            }
        }

        // 3. Historical-premium filter, fail-open without history.
        if self.historical.enabled && !self.passes_historical(signal) {
            return Ok(Vetting::Reject(RejectReason::HistoricalPremium));
        }

        // 4. Cooldown.
        if let Some(until) = ctx.store.blacklist_until(&signal.symbol)? {
            if until > signal_time {
                debug!(symbol = %signal.symbol, %until, "cooldown active");
                return Ok(Vetting::Reject(RejectReason::Blacklisted));
            }
        }

        // 5. One open position per symbol.
        if ctx.store.open_position_for_symbol(&signal.symbol)?.is_some() {
            return Ok(Vetting::Reject(RejectReason::AlreadyHeld));
        }

        // 6. Daily trade count (committed plus held reservations).
        let (used_count, used_gross) = ctx.store.daily_used(signal_time.date_naive())?;
        if used_count >= self.sizing.max_trades_per_day {
            return Ok(Vetting::Reject(RejectReason::DailyTradeCap));
        }

        // Execution time and price.
        let exec_time = ceil_to_minute(signal_time + self.entry_delay);
        let Some((exec_time, exec_close)) = self.resolve_exec_price(ctx, signal, exec_time).await?
        else {
            return Ok(Vetting::Reject(RejectReason::NoPrice));
        };
        let limit_price = round_to_cent(exec_close * (Decimal::ONE + self.costs.slippage));

        // Sizing under the per-trade and remaining-daily caps.
        let account = ctx
            .gateway
            .get_account()
            .await
            .context("account query failed during vetting")?;
        if account.equity <= Decimal::ZERO {
            return Ok(Vetting::Reject(RejectReason::ZeroShares));
        }
        let base_ratio = match (self.sizing_mode, self.sizing.premium_divisor) {
            (SizingMode::PremiumProportional, Some(divisor)) if divisor > Decimal::ZERO => {
                (signal.premium_usd / divisor).min(self.sizing.per_trade_cap)
            }
            _ => self.sizing.per_trade_cap,
        };
        let remaining_daily = (self.sizing.daily_gross_cap - used_gross).max(Decimal::ZERO);
        if remaining_daily == Decimal::ZERO {
            return Ok(Vetting::Reject(RejectReason::DailyGrossCap));
        }
        let target_notional = base_ratio.min(remaining_daily) * account.equity;
        let mut shares = (target_notional / limit_price)
            .floor()
            .to_i64()
            .unwrap_or(0);
        if shares < self.risk.min_shares.max(1) {
            return Ok(Vetting::Reject(RejectReason::ZeroShares));
        }

        // 7. Risk simulation with scale-down.
        let gross_exposure = self.current_gross_exposure(ctx).await;
        let inputs = RiskInputs {
            equity: account.equity,
            cash: account.cash,
            gross_exposure,
        };
        let limits = RiskLimits {
            daily_gross_cap: self.sizing.daily_gross_cap,
            max_leverage: self.risk.max_leverage,
            min_cash_ratio: self.risk.min_cash_ratio,
            min_shares: self.risk.min_shares,
        };
        let costs = self.costs.clone();
        match scale_down_to_fit(inputs, limits, shares, limit_price, |s| {
            (Decimal::from(s) * costs.fee_per_share).max(costs.fee_min)
        }) {
            Some(fitted) => shares = fitted,
            None => return Ok(Vetting::Reject(RejectReason::RiskRejected)),
        }

        // 8. Optional toggled filters.
        if let Some(reason) = self.optional_filters(ctx, signal).await? {
            return Ok(Vetting::Reject(reason));
        }

        let pos_ratio = Decimal::from(shares) * limit_price / account.equity;
        let decision = EntryDecision {
            symbol: signal.symbol.clone(),
            shares,
            limit_price,
            exec_time_eastern: exec_time,
            pos_ratio,
            client_id: EntryDecision::client_id_for(&signal.signal_id, exec_time),
            strike: signal.strike,
            meta: serde_json::json!({
                "signal_id": signal.signal_id,
                "premium_usd": signal.premium_usd.to_string(),
                "signal_time": signal_time.to_rfc3339(),
                "exec_close": exec_close.to_string(),
                "slippage": self.costs.slippage.to_string(),
            }),
        };
        Ok(Vetting::Accept(decision))
    }

    /// Strict `>` against multiplier x mean of the lookback premiums;
    /// passes when no usable history exists.
    fn passes_historical(&self, signal: &Signal) -> bool {
        let earliest = signal.signal_time_eastern.date_naive()
            - Duration::days(i64::from(self.historical.lookback_days));
        let premiums: Vec<Decimal> = signal
            .history
            .iter()
            .filter(|h| {
                h.time_eastern < signal.signal_time_eastern
                    && h.time_eastern.date_naive() >= earliest
            })
            .map(|h| h.premium)
            .collect();
        if premiums.is_empty() {
            debug!(symbol = %signal.symbol, "no premium history, filter skipped");
            return true;
        }
        let threshold = mean(&premiums) * self.historical.multiplier;
        let passes = signal.premium_usd > threshold;
        if !passes {
            debug!(
                symbol = %signal.symbol,
                premium = %signal.premium_usd,
                %threshold,
                samples = premiums.len(),
                "historical premium below threshold"
            );
        }
        passes
    }

    /// Find the close to execute against, honoring the gap fallback
    /// policy; falls back to the price carried in the flow record.
    async fn resolve_exec_price(
        &self,
        ctx: &StrategyContext,
        signal: &Signal,
        exec_time: EtDateTime,
    ) -> Result<Option<(EtDateTime, Decimal)>> {
        let symbol = &signal.symbol;
        let exact = ctx
            .gateway
            .get_minute_bars(symbol, exec_time, exec_time)
            .await
            .unwrap_or_default();
        if let Some(bar) = exact.first() {
            return Ok(Some((exec_time, bar.close)));
        }

        let resolved = match self.bar_fallback {
            BarFallback::Skip => None,
            BarFallback::NextBar => ctx
                .gateway
                .get_minute_bars(symbol, exec_time, exec_time + Duration::minutes(30))
                .await
                .unwrap_or_default()
                .first()
                .map(|bar| (bar.timestamp, bar.close)),
            BarFallback::UseLast => ctx
                .gateway
                .get_minute_bars(symbol, exec_time - Duration::days(3), exec_time)
                .await
                .unwrap_or_default()
                .last()
                .map(|bar| (exec_time, bar.close)),
            BarFallback::UseRealtime => match ctx.gateway.get_quote(symbol).await {
                Ok(price) => Some((exec_time, price)),
                Err(GatewayError::SymbolUnknown(_)) | Err(GatewayError::Stale(_)) => None,
                Err(e) => {
                    warn!(%symbol, error = %e, "realtime quote failed");
                    None
                }
            },
        };

        // Recovered fallback: the flow record carries the underlying price
        // at signal time.
        if resolved.is_none() {
            if let Some(price) = signal.stock_price.filter(|p| *p > Decimal::ZERO) {
                debug!(%symbol, %price, "using stock price from the flow record");
                return Ok(Some((exec_time, price)));
            }
        }
        Ok(resolved)
    }

    /// Long market value across the venue's open positions, marked with
    /// live quotes where available.
    async fn current_gross_exposure(&self, ctx: &StrategyContext) -> Decimal {
        let positions = match ctx.gateway.get_positions().await {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "positions query failed; assuming zero exposure");
                return Decimal::ZERO;
            }
        };
        let mut gross = Decimal::ZERO;
        for position in positions {
            let mark = ctx
                .gateway
                .get_quote(&position.symbol)
                .await
                .unwrap_or(position.avg_cost);
            gross += mark * Decimal::from(position.shares);
        }
        gross
    }

    async fn optional_filters(
        &self,
        ctx: &StrategyContext,
        signal: &Signal,
    ) -> Result<Option<RejectReason>> {
        if let Some(earnings) = &self.earnings {
            if earnings.in_window(&signal.symbol, signal.signal_time_eastern.date_naive()) {
                return Ok(Some(RejectReason::EarningsWindow));
            }
        }

        if let Some(macd_cfg) = &self.macd {
            let open = ctx
                .calendar
                .session_open(signal.signal_time_eastern.date_naive());
            let bars = ctx
                .gateway
                .get_minute_bars(&signal.symbol, open, signal.signal_time_eastern)
                .await
                .unwrap_or_default();
            if !bars.is_empty() {
                let mut macd = Macd::new(macd_cfg.fast, macd_cfg.slow, macd_cfg.signal);
                for bar in &bars {
                    macd.update(bar.close);
                }
                if macd.histogram() < macd_cfg.min_histogram {
                    return Ok(Some(RejectReason::MacdBelowThreshold));
                }
            }
        }

        if let Some(trend) = &self.trend {
            let from = signal.signal_time_eastern - Duration::minutes(trend.lookback_minutes);
            let bars = ctx
                .gateway
                .get_minute_bars(&signal.symbol, from, signal.signal_time_eastern)
                .await
                .unwrap_or_default();
            if let (Some(first), Some(last)) = (bars.first(), bars.last()) {
                if last.close <= first.close {
                    return Ok(Some(RejectReason::Downtrend));
                }
            }
        }

        Ok(None)
    }
}

/// Execution instant for a signal: the configured delay later, rounded up
/// to the next bar boundary. The backtest driver uses the same function to
/// position the sim clock before vetting.
pub fn exec_time_for(signal_time: EtDateTime, delay_minutes: i64) -> EtDateTime {
    ceil_to_minute(signal_time + Duration::minutes(delay_minutes))
}

/// Round up to the next minute boundary; already-aligned times stay.
fn ceil_to_minute(t: EtDateTime) -> EtDateTime {
    let secs = i64::from(t.second());
    let nanos = i64::from(t.nanosecond());
    if secs == 0 && nanos == 0 {
        t
    } else {
        t + Duration::seconds(60 - secs) - Duration::nanoseconds(nanos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::at_eastern;

    #[test]
    fn test_ceil_to_minute() {
        let base = at_eastern(
            NaiveDate::from_ymd_opt(2024, 6, 3).unwrap(),
            NaiveTime::from_hms_opt(15, 35, 20).unwrap(),
        );
        let ceiled = ceil_to_minute(base);
        assert_eq!(ceiled.time(), NaiveTime::from_hms_opt(15, 36, 0).unwrap());

        let aligned = at_eastern(
            NaiveDate::from_ymd_opt(2024, 6, 3).unwrap(),
            NaiveTime::from_hms_opt(15, 36, 0).unwrap(),
        );
        assert_eq!(ceil_to_minute(aligned), aligned);
    }
}
