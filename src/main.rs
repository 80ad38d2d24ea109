use anyhow::{Context, Result};
use clap::Parser;
use option_flow_trader::backtest::BacktestEngine;
use option_flow_trader::calendar::{LiveClock, TradingCalendar};
use option_flow_trader::config::Mode;
use option_flow_trader::engine::TradingEngine;
use option_flow_trader::gateway::LiveGateway;
use option_flow_trader::persistence::TradeStore;
use option_flow_trader::signal::signal_channel;
use option_flow_trader::strategy::build_strategy;
use option_flow_trader::AppConfig;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "option-flow-trader", about = "Options-flow driven equity trading engine")]
struct Cli {
    /// Config file path (defaults to ./config.{toml,yaml})
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    info!("Starting Option Flow Trader v{}", env!("CARGO_PKG_VERSION"));

    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref())?;
    config.validate().context("configuration invalid")?;
    let config = Arc::new(config);
    info!(
        mode = ?config.mode,
        strategy = %config.strategy.variant,
        check_interval = config.system.check_interval_seconds,
        "configuration loaded"
    );

    match config.mode {
        Mode::Backtest => run_backtest(config).await,
        Mode::Live => run_live(config).await,
    }
}

async fn run_backtest(config: Arc<AppConfig>) -> Result<()> {
    let mut engine = BacktestEngine::new(config)?;
    let result = engine.run().await?;
    println!("{}", result.metrics.summary());
    Ok(())
}

async fn run_live(config: Arc<AppConfig>) -> Result<()> {
    let calendar = Arc::new(TradingCalendar::builtin());
    let clock = Arc::new(LiveClock);
    let store = Arc::new(TradeStore::open(&config.system.db_path)?);
    let gateway = Arc::new(
        LiveGateway::new(
            &config.gateway.live.base_url,
            &config.gateway.live.account_id,
            calendar.clone(),
            Duration::from_secs(config.system.gateway_timeout_seconds),
        )
        .map_err(|e| anyhow::anyhow!("gateway setup failed: {e}"))?,
    );
    let strategy = build_strategy(&config)?;

    // The external watcher feeds this channel; it stays open for the
    // lifetime of the process.
    let (signal_tx, signal_rx) = signal_channel(config.system.signal_buffer_capacity);
    // Keep the producer side alive for the watcher to clone.
    let _producer = signal_tx;

    let engine = TradingEngine::new(
        config,
        store,
        gateway,
        calendar,
        clock,
        strategy,
    );
    engine.run(signal_rx).await
}
