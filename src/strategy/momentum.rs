//! Flow-momentum variant: premium-proportional sizing, trailing stop.

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

/// The default strategy: enters on unusually large flow, exits on the
/// scheduled day, take profit, trailing stop or stop loss.
pub struct MomentumStrategy {
    entry: EntryPipeline,
    rules: ExitRules,
}

impl MomentumStrategy {
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        Ok(Self {
            entry: EntryPipeline::from_config(config, SizingMode::PremiumProportional)?,
            rules: ExitRules {
                stop_loss: config.exit.stop_loss,
                take_profit: config.exit.take_profit,
                trailing_stop: Some(config.exit.trailing_stop),
                strike_exit: false,
            },
        })
    }
}

#[async_trait]
impl FlowStrategy for MomentumStrategy {
    fn tag(&self) -> &'static str {
        "momentum"
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
            "momentum strategy started"
        );
    }

    fn on_shutdown(&self) {
        info!("momentum strategy shut down");
    }
}
