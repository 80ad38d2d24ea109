//! Option-flow record loading for backtests.
//!
//! Implements the producer contract: CSV rows in the watcher's record
//! shape, converted once to Eastern and assembled into signals carrying
//! their per-symbol premium history for the lookback window.

use crate::calendar::to_eastern;
use crate::signal::{FlowSide, HistoryRow, OptionType, Signal};
use anyhow::{Context, Result};
use chrono::{Duration, NaiveDate, NaiveTime};
use chrono_tz::Tz;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

/// One row of the external watcher's output.
#[derive(Debug, Clone)]
pub struct FlowRecord {
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub symbol: String,
    pub side: FlowSide,
    pub contract: String,
    pub strike_price: Decimal,
    pub option_type: OptionType,
    pub expiry_date: NaiveDate,
    pub dte: i64,
    pub stock_price: Decimal,
    pub premium: Decimal,
    pub size: i64,
    pub volume: i64,
    pub oi: i64,
    pub source_file: String,
}

impl FlowRecord {
    fn parse(line: &str, source_file: &str) -> Result<Self> {
        let parts: Vec<&str> = line.split(',').collect();
        anyhow::ensure!(parts.len() >= 14, "expected 14 columns, got {}", parts.len());

        let side = match parts[3].trim().to_ascii_uppercase().as_str() {
            "BID" => FlowSide::Bid,
            "ASK" => FlowSide::Ask,
            other => anyhow::bail!("invalid side: {other}"),
        };
        let option_type = match parts[6].trim().to_ascii_lowercase().as_str() {
            "call" => OptionType::Call,
            "put" => OptionType::Put,
            other => anyhow::bail!("invalid option_type: {other}"),
        };

        Ok(Self {
            date: parts[0].trim().parse().context("invalid date")?,
            time: NaiveTime::parse_from_str(parts[1].trim(), "%H:%M:%S")
                .context("invalid time")?,
            symbol: parts[2].trim().to_string(),
            side,
            contract: parts[4].trim().to_string(),
            strike_price: parts[5].trim().parse().context("invalid strike_price")?,
            option_type,
            expiry_date: parts[7].trim().parse().context("invalid expiry_date")?,
            dte: parts[8].trim().parse().context("invalid dte")?,
            stock_price: parts[9].trim().parse().context("invalid stock_price")?,
            premium: parts[10].trim().parse().context("invalid premium")?,
            size: parts[11].trim().parse().context("invalid size")?,
            volume: parts[12].trim().parse().context("invalid volume")?,
            oi: parts[13].trim().parse().context("invalid oi")?,
            source_file: source_file.to_string(),
        })
    }
}

/// Load every flow CSV under `dir`, in time order, and assemble signals.
///
/// Malformed rows are dropped with a log line, matching the engine's
/// input-rejection policy; they never reach persistence.
pub fn load_flow_dir<P: AsRef<Path>>(
    dir: P,
    source_tz: Tz,
    lookback_days: u32,
) -> Result<Vec<Signal>> {
    let mut files: Vec<_> = std::fs::read_dir(dir.as_ref())
        .with_context(|| format!("failed to read {}", dir.as_ref().display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "csv" || ext == "txt"))
        .collect();
    files.sort();

    let mut records = Vec::new();
    let mut dropped = 0usize;
    for path in &files {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        for (line_num, line) in content.lines().enumerate() {
            if line_num == 0 && line.starts_with("date") {
                continue;
            }
            if line.trim().is_empty() {
                continue;
            }
            match FlowRecord::parse(line, &name) {
                Ok(record) => records.push(record),
                Err(e) => {
                    dropped += 1;
                    info!(file = %name, line = line_num + 1, error = %e, "malformed flow row dropped");
                }
            }
        }
    }
    records.sort_by_key(|r| (r.date, r.time));
    info!(
        files = files.len(),
        records = records.len(),
        dropped,
        "flow records loaded"
    );

    Ok(assemble_signals(records, source_tz, lookback_days))
}

/// Convert records to signals, attaching each one's history: earlier
/// prints for the same symbol within the lookback window.
pub fn assemble_signals(
    records: Vec<FlowRecord>,
    source_tz: Tz,
    lookback_days: u32,
) -> Vec<Signal> {
    let mut history: HashMap<String, Vec<HistoryRow>> = HashMap::new();
    let mut signals = Vec::with_capacity(records.len());

    for record in records {
        let source_naive = record.date.and_time(record.time);
        let eastern = to_eastern(source_naive, source_tz);
        let earliest = eastern.date_naive() - Duration::days(i64::from(lookback_days));

        let symbol_history = history.entry(record.symbol.clone()).or_default();
        symbol_history.retain(|h| h.time_eastern.date_naive() >= earliest);

        signals.push(Signal {
            signal_id: Signal::compute_id(
                &record.symbol,
                eastern,
                record.premium,
                None,
                Some(&record.contract),
            ),
            symbol: record.symbol.clone(),
            premium_usd: record.premium,
            ask: None,
            contract_id: Some(record.contract.clone()),
            signal_time_source: source_naive,
            signal_time_eastern: eastern,
            side: record.side,
            stock_price: Some(record.stock_price),
            strike: Some(record.strike_price),
            option_type: Some(record.option_type),
            expiry: Some(record.expiry_date),
            dte: Some(record.dte),
            history: symbol_history.clone(),
        });

        symbol_history.push(HistoryRow {
            time_eastern: eastern,
            premium: record.premium,
            side: record.side,
            option_type: record.option_type,
        });
    }
    signals
}
