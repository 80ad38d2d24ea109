//! # Option Flow Trader
//!
//! An event-driven trading engine for U.S. equities triggered by
//! unusual-options-flow signals. One strategy contract runs in two modes:
//! live against a brokerage daemon and backtest against replayed minute
//! bars with simulated slippage and fees.
//!
//! ## Architecture
//!
//! - `config`: configuration loading and validation
//! - `calendar`: injected clock, Eastern conversion, trading-day math
//! - `signal`: flow-signal model and the bounded ingestion buffer
//! - `gateway`: market gateway contract with live and simulated backends
//! - `persistence`: SQLite book with idempotent signal and capacity
//!   primitives
//! - `strategy`: pure entry/exit decision functions, variants by tag
//! - `engine`: concurrent trading loops, reconciliation, shutdown
//! - `backtest`: historical replay and performance metrics
//! - `utils`: decimal helpers and idempotency fingerprints

pub mod backtest;
pub mod calendar;
pub mod config;
pub mod engine;
pub mod gateway;
pub mod persistence;
pub mod signal;
pub mod strategy;
pub mod utils;

pub use config::AppConfig;
