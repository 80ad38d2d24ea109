//! Trading strategy: pure decision functions over an explicit context.
//!
//! Strategies never place orders or mutate persistence; they return
//! decisions and the trading loops perform the side effects. Variants are
//! registered by tag and built through [`build_strategy`].

mod entry;
mod exit;
mod indicators;
mod momentum;
mod risk;
mod strike;

pub use entry::{exec_time_for, EntryPipeline, SizingMode};
pub use exit::{scan_window, ExitRules};
pub use indicators::{Ema, Macd};
pub use momentum::MomentumStrategy;
pub use risk::{scale_down_to_fit, simulate, RiskInputs, RiskLimits, RiskOutcome};
pub use strike::StrikeStrategy;

use crate::calendar::{Clock, EtDateTime, TradingCalendar};
use crate::config::AppConfig;
use crate::gateway::{MarketGateway, MinuteBar};
use crate::persistence::{Position, TradeStore};
use crate::signal::Signal;
use crate::utils::fingerprint::fingerprint;
use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::Arc;

/// Everything a strategy may read. No ambient state: config, book reads
/// and market reads all arrive through this struct.
#[derive(Clone)]
pub struct StrategyContext {
    pub config: Arc<AppConfig>,
    pub store: Arc<TradeStore>,
    pub gateway: Arc<dyn MarketGateway>,
    pub calendar: Arc<TradingCalendar>,
    pub clock: Arc<dyn Clock>,
}

/// Why a signal was declined. Counted in statistics, never an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    StaleSignal,
    OutsideWindow,
    NearClose,
    PremiumTooLow,
    PremiumTooHigh,
    HistoricalPremium,
    Blacklisted,
    AlreadyHeld,
    DailyTradeCap,
    DailyGrossCap,
    ZeroShares,
    NoPrice,
    RiskRejected,
    MacdBelowThreshold,
    EarningsWindow,
    Downtrend,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RejectReason::StaleSignal => "stale signal",
            RejectReason::OutsideWindow => "outside entry window",
            RejectReason::NearClose => "too close to market close",
            RejectReason::PremiumTooLow => "premium below minimum",
            RejectReason::PremiumTooHigh => "premium above maximum",
            RejectReason::HistoricalPremium => "premium below historical threshold",
            RejectReason::Blacklisted => "symbol on cooldown",
            RejectReason::AlreadyHeld => "open position exists",
            RejectReason::DailyTradeCap => "daily trade count reached",
            RejectReason::DailyGrossCap => "daily gross cap reached",
            RejectReason::ZeroShares => "sized to zero shares",
            RejectReason::NoPrice => "no execution price available",
            RejectReason::RiskRejected => "risk simulation rejected",
            RejectReason::MacdBelowThreshold => "macd below threshold",
            RejectReason::EarningsWindow => "inside earnings window",
            RejectReason::Downtrend => "price trend filter",
        };
        f.write_str(s)
    }
}

/// Accepted entry with the full order intent.
#[derive(Debug, Clone)]
pub struct EntryDecision {
    pub symbol: String,
    pub shares: i64,
    pub limit_price: Decimal,
    pub exec_time_eastern: EtDateTime,
    /// `shares * limit_price / equity` at decision time.
    pub pos_ratio: Decimal,
    pub client_id: String,
    pub strike: Option<Decimal>,
    pub meta: serde_json::Value,
}

impl EntryDecision {
    pub fn client_id_for(signal_id: &str, exec_time: EtDateTime) -> String {
        fingerprint(&[signal_id, "BUY", &exec_time.to_rfc3339()])
    }
}

/// Entry vetting outcome: explicit variants instead of exceptions.
#[derive(Debug, Clone)]
pub enum Vetting {
    Accept(EntryDecision),
    Reject(RejectReason),
}

/// Exit trigger, in strict priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Timed,
    Strike,
    TakeProfit,
    Trail,
    StopLoss,
    /// Synthetic close written by reconciliation.
    ReconDrop,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::Timed => "TIMED",
            ExitReason::Strike => "STRIKE",
            ExitReason::TakeProfit => "TP",
            ExitReason::Trail => "TRAIL",
            ExitReason::StopLoss => "SL",
            ExitReason::ReconDrop => "RECON_DROP",
        }
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A close instruction for the monitor.
#[derive(Debug, Clone)]
pub struct ExitDecision {
    pub position_id: i64,
    pub symbol: String,
    pub shares: i64,
    pub limit_price: Decimal,
    pub reason: ExitReason,
    pub triggered_at: EtDateTime,
    pub client_id: String,
}

impl ExitDecision {
    pub fn client_id_for(position_id: i64, triggered_at: EtDateTime) -> String {
        fingerprint(&[&position_id.to_string(), "SELL", &triggered_at.to_rfc3339()])
    }
}

/// Result of walking a bar window: at most one exit, plus the updated
/// high-water mark (needed even when nothing triggers).
#[derive(Debug, Clone)]
pub struct ExitScan {
    pub decision: Option<ExitDecision>,
    pub high_water: Decimal,
}

/// Capability set every strategy variant implements.
#[async_trait]
pub trait FlowStrategy: Send + Sync {
    fn tag(&self) -> &'static str;

    /// Signal to entry decision or rejection. Reads context, performs no
    /// side effects.
    async fn on_signal(&self, ctx: &StrategyContext, signal: &Signal) -> Result<Vetting>;

    /// Walk the bars since the last check in time order and emit the first
    /// exit trigger, if any.
    fn on_position_check(&self, position: &Position, bars: &[MinuteBar]) -> ExitScan;

    fn on_start(&self) {}

    fn on_shutdown(&self) {}
}

/// Resolve the configured variant tag to a strategy instance.
pub fn build_strategy(config: &AppConfig) -> Result<Arc<dyn FlowStrategy>> {
    match config.strategy.variant.as_str() {
        "momentum" => Ok(Arc::new(MomentumStrategy::from_config(config)?)),
        "strike" => Ok(Arc::new(StrikeStrategy::from_config(config)?)),
        other => anyhow::bail!("unknown strategy variant: {other}"),
    }
}
