//! Backtesting: replay historical option-flow records through the same
//! strategy, persistence and gateway contract the live engine uses.
//!
//! # Example
//!
//! ```rust,ignore
//! use option_flow_trader::backtest::BacktestEngine;
//!
//! let mut engine = BacktestEngine::new(config)?;
//! let result = engine.run().await?;
//! println!("{}", result.metrics.summary());
//! ```

mod data;
mod engine;
mod metrics;

pub use data::{assemble_signals, load_flow_dir, FlowRecord};
pub use engine::{BacktestEngine, BacktestResult};
pub use metrics::{BacktestMetrics, EquityPoint};
