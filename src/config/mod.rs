//! Configuration management for the option-flow trader.
//!
//! Loads settings from a config file plus `OFT`-prefixed environment
//! variables and validates the combined result.

use anyhow::{Context, Result};
use chrono::NaiveTime;
use chrono_tz::Tz;
use rust_decimal::Decimal;
use serde::Deserialize;

/// Engine mode: which gateway backs the trading loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Live,
    Backtest,
}

/// Policy when the minute bar at execution time is missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BarFallback {
    /// Drop the entry.
    Skip,
    /// Execute at the next available bar.
    NextBar,
    /// Use the last known close before execution time.
    UseLast,
    /// Query a live quote (live mode only).
    UseRealtime,
}

/// Main application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// live or backtest
    pub mode: Mode,
    /// IANA zone the producer stamps records in (e.g. "Asia/Shanghai")
    #[serde(default = "default_source_timezone")]
    pub source_timezone: String,
    #[serde(default)]
    pub system: SystemConfig,
    #[serde(default)]
    pub entry: EntryConfig,
    #[serde(default)]
    pub sizing: SizingConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub exit: ExitConfig,
    /// Post-buy cooldown in trading days
    #[serde(default = "default_blacklist_days")]
    pub blacklist_days: u32,
    #[serde(default)]
    pub costs: CostsConfig,
    #[serde(default)]
    pub reconciliation: ReconciliationConfig,
    #[serde(default)]
    pub strategy: StrategyConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub backtest: BacktestSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemConfig {
    /// Position-monitor tick period
    #[serde(default = "default_check_interval")]
    pub check_interval_seconds: u64,
    /// Per-call gateway timeout
    #[serde(default = "default_gateway_timeout")]
    pub gateway_timeout_seconds: u64,
    /// Grace period for in-flight work on shutdown
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_seconds: u64,
    /// Signal buffer capacity
    #[serde(default = "default_buffer_capacity")]
    pub signal_buffer_capacity: usize,
    /// Path of the sqlite store
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EntryConfig {
    /// Eastern `[open, close]` windows, "HH:MM:SS"
    #[serde(default = "default_time_windows")]
    pub time_windows: Vec<[String; 2]>,
    /// No new entries at or after this Eastern time
    #[serde(default = "default_close_buffer")]
    pub close_buffer: String,
    /// Minimum option premium in USD
    #[serde(default = "default_min_premium")]
    pub min_premium_usd: Decimal,
    /// Optional premium ceiling
    #[serde(default)]
    pub premium_max_usd: Option<Decimal>,
    #[serde(default)]
    pub historical: HistoricalFilterConfig,
    /// Signal-to-execution delay in minutes
    #[serde(default = "default_entry_delay")]
    pub entry_delay_minutes: i64,
    /// Missing-bar policy at execution time
    #[serde(default = "default_bar_fallback")]
    pub bar_fallback: BarFallback,
    /// Optional MACD histogram gate
    #[serde(default)]
    pub macd: Option<MacdFilterConfig>,
    /// Optional earnings-window exclusion
    #[serde(default)]
    pub earnings: Option<EarningsFilterConfig>,
    /// Optional price-trend lookback gate
    #[serde(default)]
    pub trend: Option<TrendFilterConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoricalFilterConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Ratio against the mean premium over the lookback window
    #[serde(default = "default_historical_multiplier")]
    pub multiplier: Decimal,
    #[serde(default = "default_historical_lookback")]
    pub lookback_days: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MacdFilterConfig {
    #[serde(default = "default_macd_fast")]
    pub fast: usize,
    #[serde(default = "default_macd_slow")]
    pub slow: usize,
    #[serde(default = "default_macd_signal")]
    pub signal: usize,
    /// Minimum histogram value over the day's minute closes
    pub min_histogram: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EarningsFilterConfig {
    /// CSV of `symbol,date` rows
    pub calendar_path: String,
    /// Reject signals within +/- this many calendar days of earnings
    #[serde(default = "default_earnings_window")]
    pub window_days: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrendFilterConfig {
    /// Require the close now above the close this many minutes ago
    #[serde(default = "default_trend_lookback")]
    pub lookback_minutes: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SizingConfig {
    /// Max ratio of equity per new position
    #[serde(default = "default_per_trade_cap")]
    pub per_trade_cap: Decimal,
    /// Max total gross exposure as a ratio of equity per day
    #[serde(default = "default_daily_gross_cap")]
    pub daily_gross_cap: Decimal,
    /// Hard cap on trades per day
    #[serde(default = "default_max_trades")]
    pub max_trades_per_day: u32,
    /// Premium-proportional sizing divisor; position ratio =
    /// min(premium / divisor, per_trade_cap) when set
    #[serde(default)]
    pub premium_divisor: Option<Decimal>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RiskConfig {
    #[serde(default = "default_max_leverage")]
    pub max_leverage: Decimal,
    /// May be negative when margin is permitted
    #[serde(default = "default_min_cash_ratio")]
    pub min_cash_ratio: Decimal,
    /// Reject entries scaled below this share count
    #[serde(default = "default_min_shares")]
    pub min_shares: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExitConfig {
    /// Stop loss as a ratio of cost, e.g. 0.10
    #[serde(default = "default_stop_loss")]
    pub stop_loss: Decimal,
    /// Take profit as a ratio of cost, e.g. 0.20
    #[serde(default = "default_take_profit")]
    pub take_profit: Decimal,
    /// Retrace ratio from the high-water mark
    #[serde(default = "default_trailing_stop")]
    pub trailing_stop: Decimal,
    /// Scheduled exit after this many trading days
    #[serde(default = "default_holding_days")]
    pub holding_days: u32,
    /// Time-of-day for the scheduled exit, "HH:MM:SS" Eastern
    #[serde(default = "default_exit_time")]
    pub exit_time_eastern: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CostsConfig {
    /// Single-side slippage ratio
    #[serde(default = "default_slippage")]
    pub slippage: Decimal,
    #[serde(default = "default_fee_per_share")]
    pub fee_per_share: Decimal,
    /// Per-order fee floor
    #[serde(default = "default_fee_min")]
    pub fee_min: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconciliationConfig {
    /// Daily run time, "HH:MM:SS" Eastern
    #[serde(default = "default_recon_time")]
    pub time_eastern: String,
    #[serde(default = "default_auto_fix")]
    pub auto_fix: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StrategyConfig {
    /// Registered strategy tag: "momentum" or "strike"
    #[serde(default = "default_strategy_variant")]
    pub variant: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub live: LiveGatewayConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LiveGatewayConfig {
    /// Brokerage daemon endpoint
    #[serde(default = "default_live_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub account_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BacktestSettings {
    /// Directory of option-flow CSV files
    #[serde(default = "default_signal_dir")]
    pub signal_dir: String,
    /// Directory of minute-bar CSV files
    #[serde(default = "default_bar_dir")]
    pub bar_dir: String,
    #[serde(default = "default_initial_cash")]
    pub initial_cash: Decimal,
    /// Optional JSON calendar override cache
    #[serde(default)]
    pub calendar_overrides: Option<String>,
    /// Optional remote minute-bar source
    #[serde(default)]
    pub bar_base_url: Option<String>,
    #[serde(default)]
    pub bar_api_key: Option<String>,
}

// Default value functions

fn default_source_timezone() -> String {
    "Asia/Shanghai".to_string()
}

fn default_check_interval() -> u64 {
    20
}

fn default_gateway_timeout() -> u64 {
    10
}

fn default_shutdown_grace() -> u64 {
    15
}

fn default_buffer_capacity() -> usize {
    256
}

fn default_db_path() -> String {
    "data/trading.db".to_string()
}

fn default_time_windows() -> Vec<[String; 2]> {
    vec![["10:00:00".to_string(), "16:00:00".to_string()]]
}

fn default_close_buffer() -> String {
    "15:54:00".to_string()
}

fn default_min_premium() -> Decimal {
    Decimal::new(100_000, 0)
}

fn default_historical_multiplier() -> Decimal {
    Decimal::new(2, 0)
}

fn default_historical_lookback() -> u32 {
    7
}

fn default_entry_delay() -> i64 {
    2
}

fn default_bar_fallback() -> BarFallback {
    BarFallback::NextBar
}

fn default_macd_fast() -> usize {
    12
}

fn default_macd_slow() -> usize {
    26
}

fn default_macd_signal() -> usize {
    9
}

fn default_earnings_window() -> i64 {
    1
}

fn default_trend_lookback() -> i64 {
    30
}

fn default_per_trade_cap() -> Decimal {
    Decimal::new(40, 2) // 0.40
}

fn default_daily_gross_cap() -> Decimal {
    Decimal::new(99, 2) // 0.99
}

fn default_max_trades() -> u32 {
    5
}

fn default_max_leverage() -> Decimal {
    Decimal::new(195, 2) // 1.95
}

fn default_min_cash_ratio() -> Decimal {
    Decimal::new(-100, 2) // -1.00
}

fn default_min_shares() -> i64 {
    1
}

fn default_stop_loss() -> Decimal {
    Decimal::new(10, 2) // 0.10
}

fn default_take_profit() -> Decimal {
    Decimal::new(20, 2) // 0.20
}

fn default_trailing_stop() -> Decimal {
    Decimal::new(8, 2) // 0.08
}

fn default_holding_days() -> u32 {
    6
}

fn default_exit_time() -> String {
    "15:00:00".to_string()
}

fn default_slippage() -> Decimal {
    Decimal::new(1, 3) // 0.001
}

fn default_fee_per_share() -> Decimal {
    Decimal::new(5, 3) // 0.005
}

fn default_fee_min() -> Decimal {
    Decimal::ONE
}

fn default_recon_time() -> String {
    "17:00:00".to_string()
}

fn default_auto_fix() -> bool {
    true
}

fn default_strategy_variant() -> String {
    "momentum".to_string()
}

fn default_live_base_url() -> String {
    "http://127.0.0.1:11111".to_string()
}

fn default_signal_dir() -> String {
    "data/signals".to_string()
}

fn default_bar_dir() -> String {
    "data/bars".to_string()
}

fn default_initial_cash() -> Decimal {
    Decimal::new(100_000, 0)
}

fn default_blacklist_days() -> u32 {
    15
}

impl AppConfig {
    /// Load configuration from a file and `OFT__`-prefixed env vars.
    pub fn load(path: Option<&str>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut builder = config::Config::builder();
        builder = match path {
            Some(p) => builder.add_source(config::File::with_name(p)),
            None => builder.add_source(config::File::with_name("config").required(false)),
        };
        let settings = builder
            .add_source(config::Environment::default().separator("__").prefix("OFT"))
            .build()
            .context("failed to build configuration")?;

        settings
            .try_deserialize()
            .context("failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.sizing.per_trade_cap > Decimal::ZERO && self.sizing.per_trade_cap <= Decimal::ONE,
            "per_trade_cap must be in (0, 1]"
        );
        anyhow::ensure!(
            self.sizing.daily_gross_cap > Decimal::ZERO,
            "daily_gross_cap must be positive"
        );
        anyhow::ensure!(
            self.sizing.max_trades_per_day > 0,
            "max_trades_per_day must be at least 1"
        );
        anyhow::ensure!(
            self.exit.stop_loss > Decimal::ZERO && self.exit.stop_loss < Decimal::ONE,
            "stop_loss must be in (0, 1)"
        );
        anyhow::ensure!(
            self.exit.take_profit > Decimal::ZERO,
            "take_profit must be positive"
        );
        anyhow::ensure!(
            self.exit.trailing_stop >= Decimal::ZERO && self.exit.trailing_stop < Decimal::ONE,
            "trailing_stop must be in [0, 1)"
        );
        anyhow::ensure!(self.exit.holding_days > 0, "holding_days must be at least 1");
        anyhow::ensure!(
            self.risk.max_leverage >= Decimal::ONE,
            "max_leverage must be at least 1.0"
        );
        anyhow::ensure!(self.risk.min_shares >= 1, "min_shares must be at least 1");
        anyhow::ensure!(
            self.costs.slippage >= Decimal::ZERO && self.costs.slippage < Decimal::ONE,
            "slippage must be in [0, 1)"
        );

        self.source_tz()
            .with_context(|| format!("invalid source_timezone {}", self.source_timezone))?;
        self.exit_time().context("invalid exit.exit_time_eastern")?;
        self.reconciliation_time()
            .context("invalid reconciliation.time_eastern")?;
        self.close_buffer_time()
            .context("invalid entry.close_buffer")?;
        self.entry_windows().context("invalid entry.time_windows")?;

        Ok(())
    }

    pub fn source_tz(&self) -> Result<Tz> {
        self.source_timezone
            .parse::<Tz>()
            .map_err(|e| anyhow::anyhow!("{e}"))
    }

    pub fn exit_time(&self) -> Result<NaiveTime> {
        parse_time(&self.exit.exit_time_eastern)
    }

    pub fn reconciliation_time(&self) -> Result<NaiveTime> {
        parse_time(&self.reconciliation.time_eastern)
    }

    pub fn close_buffer_time(&self) -> Result<NaiveTime> {
        parse_time(&self.entry.close_buffer)
    }

    /// Parsed entry windows as `(open, close)` pairs.
    pub fn entry_windows(&self) -> Result<Vec<(NaiveTime, NaiveTime)>> {
        self.entry
            .time_windows
            .iter()
            .map(|[open, close]| Ok((parse_time(open)?, parse_time(close)?)))
            .collect()
    }
}

fn parse_time(s: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .with_context(|| format!("invalid time of day: {s}"))
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Backtest,
            source_timezone: default_source_timezone(),
            system: SystemConfig::default(),
            entry: EntryConfig::default(),
            sizing: SizingConfig::default(),
            risk: RiskConfig::default(),
            exit: ExitConfig::default(),
            blacklist_days: default_blacklist_days(),
            costs: CostsConfig::default(),
            reconciliation: ReconciliationConfig::default(),
            strategy: StrategyConfig::default(),
            gateway: GatewayConfig::default(),
            backtest: BacktestSettings::default(),
        }
    }
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            check_interval_seconds: default_check_interval(),
            gateway_timeout_seconds: default_gateway_timeout(),
            shutdown_grace_seconds: default_shutdown_grace(),
            signal_buffer_capacity: default_buffer_capacity(),
            db_path: default_db_path(),
        }
    }
}

impl Default for EntryConfig {
    fn default() -> Self {
        Self {
            time_windows: default_time_windows(),
            close_buffer: default_close_buffer(),
            min_premium_usd: default_min_premium(),
            premium_max_usd: None,
            historical: HistoricalFilterConfig::default(),
            entry_delay_minutes: default_entry_delay(),
            bar_fallback: default_bar_fallback(),
            macd: None,
            earnings: None,
            trend: None,
        }
    }
}

impl Default for HistoricalFilterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            multiplier: default_historical_multiplier(),
            lookback_days: default_historical_lookback(),
        }
    }
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            per_trade_cap: default_per_trade_cap(),
            daily_gross_cap: default_daily_gross_cap(),
            max_trades_per_day: default_max_trades(),
            premium_divisor: None,
        }
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_leverage: default_max_leverage(),
            min_cash_ratio: default_min_cash_ratio(),
            min_shares: default_min_shares(),
        }
    }
}

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            stop_loss: default_stop_loss(),
            take_profit: default_take_profit(),
            trailing_stop: default_trailing_stop(),
            holding_days: default_holding_days(),
            exit_time_eastern: default_exit_time(),
        }
    }
}

impl Default for CostsConfig {
    fn default() -> Self {
        Self {
            slippage: default_slippage(),
            fee_per_share: default_fee_per_share(),
            fee_min: default_fee_min(),
        }
    }
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            time_eastern: default_recon_time(),
            auto_fix: default_auto_fix(),
        }
    }
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            variant: default_strategy_variant(),
        }
    }
}

impl Default for LiveGatewayConfig {
    fn default() -> Self {
        Self {
            base_url: default_live_base_url(),
            account_id: String::new(),
        }
    }
}

impl Default for BacktestSettings {
    fn default() -> Self {
        Self {
            signal_dir: default_signal_dir(),
            bar_dir: default_bar_dir(),
            initial_cash: default_initial_cash(),
            calendar_overrides: None,
            bar_base_url: None,
            bar_api_key: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_entry_windows_parse() {
        let config = AppConfig::default();
        let windows = config.entry_windows().unwrap();
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].0, NaiveTime::from_hms_opt(10, 0, 0).unwrap());
    }

    #[test]
    fn test_invalid_stop_loss_rejected() {
        let mut config = AppConfig::default();
        config.exit.stop_loss = Decimal::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_timezone_rejected() {
        let mut config = AppConfig::default();
        config.source_timezone = "Mars/Olympus".to_string();
        assert!(config.validate().is_err());
    }
}
