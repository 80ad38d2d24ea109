//! Minute-bar storage for the simulated gateway and backtests.
//!
//! Bars come from per-day CSV files or a remote aggregates endpoint and
//! are cached per (symbol, date). A missing day is a data gap, not an
//! error; lookups forward-fill across gaps.

use crate::calendar::EtDateTime;
use crate::gateway::types::MinuteBar;
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Timelike};
use chrono_tz::US::Eastern;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// How far back a forward-fill lookup will walk for a prior close.
const FORWARD_FILL_LOOKBACK_DAYS: i64 = 5;

enum BarSource {
    /// `{dir}/{SYMBOL}_{YYYY-MM-DD}.csv` with `time,open,high,low,close` rows.
    CsvDir(PathBuf),
    /// Aggregates endpoint returning `{"results": [{t,o,h,l,c}, ..]}`.
    Remote {
        base_url: String,
        api_key: String,
        http: reqwest::Client,
    },
}

pub struct BarStore {
    source: BarSource,
    cache: RwLock<HashMap<(String, NaiveDate), Arc<Vec<MinuteBar>>>>,
}

impl BarStore {
    pub fn csv_dir<P: Into<PathBuf>>(dir: P) -> Self {
        Self {
            source: BarSource::CsvDir(dir.into()),
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn remote(base_url: &str, api_key: &str) -> Self {
        Self {
            source: BarSource::Remote {
                base_url: base_url.trim_end_matches('/').to_string(),
                api_key: api_key.to_string(),
                http: reqwest::Client::new(),
            },
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// All bars for one symbol-day, cached. Empty when no data exists.
    pub async fn day_bars(&self, symbol: &str, date: NaiveDate) -> Result<Arc<Vec<MinuteBar>>> {
        let key = (symbol.to_string(), date);
        if let Some(bars) = self.cache.read().await.get(&key) {
            return Ok(bars.clone());
        }

        let bars = Arc::new(self.load_day(symbol, date).await?);
        debug!(%symbol, %date, bars = bars.len(), "loaded minute bars");
        self.cache.write().await.insert(key, bars.clone());
        Ok(bars)
    }

    /// Ordered bars in `[from, to]`, spanning days as needed.
    pub async fn bars_between(
        &self,
        symbol: &str,
        from: EtDateTime,
        to: EtDateTime,
    ) -> Result<Vec<MinuteBar>> {
        let mut out = Vec::new();
        if to < from {
            return Ok(out);
        }

        let mut date = from.date_naive();
        while date <= to.date_naive() {
            let day = self.day_bars(symbol, date).await?;
            out.extend(
                day.iter()
                    .filter(|b| b.timestamp >= from && b.timestamp <= to)
                    .copied(),
            );
            date += Duration::days(1);
        }
        Ok(out)
    }

    /// The bar whose minute contains `t`, if one exists.
    pub async fn bar_containing(&self, symbol: &str, t: EtDateTime) -> Result<Option<MinuteBar>> {
        let minute = floor_to_minute(t);
        let day = self.day_bars(symbol, t.date_naive()).await?;
        Ok(day.iter().find(|b| b.timestamp == minute).copied())
    }

    /// First bar at or after `t`, scanning up to `horizon` forward.
    pub async fn bar_at_or_after(
        &self,
        symbol: &str,
        t: EtDateTime,
        horizon: Duration,
    ) -> Result<Option<MinuteBar>> {
        let end = t + horizon;
        let bars = self.bars_between(symbol, t, end).await?;
        Ok(bars.first().copied())
    }

    /// Last bar at or before `t`, forward-filling across day gaps.
    pub async fn bar_at_or_before(&self, symbol: &str, t: EtDateTime) -> Result<Option<MinuteBar>> {
        let mut date = t.date_naive();
        let earliest = date - Duration::days(FORWARD_FILL_LOOKBACK_DAYS);

        while date >= earliest {
            let day = self.day_bars(symbol, date).await?;
            if let Some(bar) = day.iter().rev().find(|b| b.timestamp <= t) {
                return Ok(Some(*bar));
            }
            date -= Duration::days(1);
        }
        Ok(None)
    }

    async fn load_day(&self, symbol: &str, date: NaiveDate) -> Result<Vec<MinuteBar>> {
        match &self.source {
            BarSource::CsvDir(dir) => {
                let path = dir.join(format!("{symbol}_{date}.csv"));
                if !path.exists() {
                    return Ok(Vec::new());
                }
                let content = std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                parse_day_csv(&content, date)
                    .with_context(|| format!("malformed bar file {}", path.display()))
            }
            BarSource::Remote {
                base_url,
                api_key,
                http,
            } => {
                let url = format!(
                    "{base_url}/v2/aggs/ticker/{symbol}/range/1/minute/{date}/{date}\
                     ?adjusted=true&sort=asc&limit=50000&apiKey={api_key}"
                );
                let response = http
                    .get(&url)
                    .send()
                    .await
                    .context("bar fetch failed")?
                    .error_for_status()
                    .context("bar fetch returned error status")?;
                let body: AggregatesResponse =
                    response.json().await.context("invalid aggregates body")?;

                if body.results.is_empty() {
                    warn!(%symbol, %date, "no minute data (weekend, holiday or halt)");
                }

                let mut bars: Vec<MinuteBar> = body
                    .results
                    .into_iter()
                    .map(|r| MinuteBar {
                        timestamp: epoch_ms_to_eastern(r.t),
                        open: r.o,
                        high: r.h,
                        low: r.l,
                        close: r.c,
                    })
                    .collect();
                bars.sort_by_key(|b| b.timestamp);
                Ok(bars)
            }
        }
    }
}

fn floor_to_minute(t: EtDateTime) -> EtDateTime {
    t - Duration::seconds(i64::from(t.time().second()))
        - Duration::nanoseconds(i64::from(t.time().nanosecond()))
}

fn epoch_ms_to_eastern(ms: i64) -> EtDateTime {
    DateTime::from_timestamp_millis(ms)
        .unwrap_or_default()
        .with_timezone(&Eastern)
}

fn parse_day_csv(content: &str, date: NaiveDate) -> Result<Vec<MinuteBar>> {
    let mut bars = Vec::new();

    for (line_num, line) in content.lines().enumerate() {
        if line_num == 0 && line.starts_with("time") {
            continue;
        }
        if line.trim().is_empty() {
            continue;
        }

        let parts: Vec<&str> = line.split(',').collect();
        anyhow::ensure!(
            parts.len() >= 5,
            "expected 5 columns (time,open,high,low,close) on line {}",
            line_num + 1
        );

        let time = NaiveTime::parse_from_str(parts[0].trim(), "%H:%M:%S")
            .or_else(|_| NaiveTime::parse_from_str(parts[0].trim(), "%H:%M"))
            .with_context(|| format!("invalid time on line {}", line_num + 1))?;

        let parse = |s: &str, field: &str| -> Result<Decimal> {
            s.trim()
                .parse()
                .with_context(|| format!("invalid {field} on line {}", line_num + 1))
        };

        bars.push(MinuteBar {
            timestamp: crate::calendar::at_eastern(date, time),
            open: parse(parts[1], "open")?,
            high: parse(parts[2], "high")?,
            low: parse(parts[3], "low")?,
            close: parse(parts[4], "close")?,
        });
    }

    bars.sort_by_key(|b| b.timestamp);
    Ok(bars)
}

#[derive(Debug, Deserialize)]
struct AggregatesResponse {
    #[serde(default)]
    results: Vec<AggregateRow>,
}

#[derive(Debug, Deserialize)]
struct AggregateRow {
    t: i64,
    o: Decimal,
    h: Decimal,
    l: Decimal,
    c: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::at_eastern;
    use chrono::Timelike;
    use rust_decimal_macros::dec;
    use std::io::Write;

    const DAY_CSV: &str = "time,open,high,low,close\n\
        15:35:00,100.0,100.5,99.8,100.2\n\
        15:36:00,100.2,101.0,100.1,100.9\n\
        15:38:00,100.9,101.2,100.7,101.1\n";

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn store_with_day(symbol: &str, date: NaiveDate, csv: &str) -> (tempfile::TempDir, BarStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(format!("{symbol}_{date}.csv"));
        let mut file = std::fs::File::create(path).unwrap();
        file.write_all(csv.as_bytes()).unwrap();
        let store = BarStore::csv_dir(dir.path());
        (dir, store)
    }

    #[tokio::test]
    async fn test_day_csv_parses_in_order() {
        let (_dir, store) = store_with_day("XYZ", d(2024, 6, 3), DAY_CSV);
        let bars = store.day_bars("XYZ", d(2024, 6, 3)).await.unwrap();
        assert_eq!(bars.len(), 3);
        assert_eq!(bars[0].close, dec!(100.2));
        assert!(bars.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }

    #[tokio::test]
    async fn test_missing_day_is_a_gap_not_an_error() {
        let (_dir, store) = store_with_day("XYZ", d(2024, 6, 3), DAY_CSV);
        let bars = store.day_bars("XYZ", d(2024, 6, 4)).await.unwrap();
        assert!(bars.is_empty());
    }

    #[tokio::test]
    async fn test_bar_containing_and_gap() {
        let (_dir, store) = store_with_day("XYZ", d(2024, 6, 3), DAY_CSV);

        let t = at_eastern(d(2024, 6, 3), NaiveTime::from_hms_opt(15, 36, 45).unwrap());
        let bar = store.bar_containing("XYZ", t).await.unwrap().unwrap();
        assert_eq!(bar.close, dec!(100.9));

        // 15:37 is missing from the data.
        let gap = at_eastern(d(2024, 6, 3), NaiveTime::from_hms_opt(15, 37, 0).unwrap());
        assert!(store.bar_containing("XYZ", gap).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_next_bar_after_gap() {
        let (_dir, store) = store_with_day("XYZ", d(2024, 6, 3), DAY_CSV);
        let gap = at_eastern(d(2024, 6, 3), NaiveTime::from_hms_opt(15, 37, 0).unwrap());
        let bar = store
            .bar_at_or_after("XYZ", gap, Duration::minutes(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bar.timestamp.minute(), 38);
    }

    #[tokio::test]
    async fn test_forward_fill_at_or_before() {
        let (_dir, store) = store_with_day("XYZ", d(2024, 6, 3), DAY_CSV);
        // Next day morning forward-fills Monday's last close.
        let t = at_eastern(d(2024, 6, 4), NaiveTime::from_hms_opt(9, 30, 0).unwrap());
        let bar = store.bar_at_or_before("XYZ", t).await.unwrap().unwrap();
        assert_eq!(bar.close, dec!(101.1));
    }
}
