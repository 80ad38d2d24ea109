//! Option-flow signals and the bounded buffer between ingestion and the
//! strategy loop.

use crate::calendar::EtDateTime;
use crate::utils::fingerprint::fingerprint;
use chrono::NaiveDate;
use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Which side of the book the option trade printed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FlowSide {
    Bid,
    Ask,
}

impl FlowSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowSide::Bid => "BID",
            FlowSide::Ask => "ASK",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionType {
    Call,
    Put,
}

impl OptionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OptionType::Call => "call",
            OptionType::Put => "put",
        }
    }
}

/// A prior flow print for the same symbol, shipped with the record by the
/// producer and consumed by the historical-premium filter.
#[derive(Debug, Clone)]
pub struct HistoryRow {
    pub time_eastern: EtDateTime,
    pub premium: Decimal,
    pub side: FlowSide,
    pub option_type: OptionType,
}

/// One options-flow record, immutable after ingestion.
///
/// Both timestamps are kept: the producer's stamp and the Eastern
/// conversion done once at the boundary.
#[derive(Debug, Clone)]
pub struct Signal {
    pub signal_id: String,
    pub symbol: String,
    pub premium_usd: Decimal,
    pub ask: Option<Decimal>,
    pub contract_id: Option<String>,
    pub signal_time_source: NaiveDateTime,
    pub signal_time_eastern: EtDateTime,
    pub side: FlowSide,
    /// Underlying price as reported in the flow record.
    pub stock_price: Option<Decimal>,
    pub strike: Option<Decimal>,
    pub option_type: Option<OptionType>,
    pub expiry: Option<NaiveDate>,
    pub dte: Option<i64>,
    pub history: Vec<HistoryRow>,
}

impl Signal {
    /// Deterministic identity: collisions within a day are duplicates and
    /// get dropped at the persistence boundary.
    pub fn compute_id(
        symbol: &str,
        signal_time_eastern: EtDateTime,
        premium_usd: Decimal,
        ask: Option<Decimal>,
        contract_id: Option<&str>,
    ) -> String {
        fingerprint(&[
            symbol,
            &signal_time_eastern.to_rfc3339(),
            &premium_usd.to_string(),
            &ask.map(|a| a.to_string()).unwrap_or_default(),
            contract_id.unwrap_or_default(),
        ])
    }
}

/// Create the bounded FIFO channel decoupling ingestion from the strategy.
pub fn signal_channel(capacity: usize) -> (SignalSender, SignalReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (SignalSender { tx }, SignalReceiver { rx })
}

#[derive(Clone)]
pub struct SignalSender {
    tx: mpsc::Sender<Signal>,
}

impl SignalSender {
    /// Blocks when the buffer is full, preserving insertion order.
    pub async fn send(&self, signal: Signal) -> Result<(), mpsc::error::SendError<Signal>> {
        self.tx.send(signal).await
    }
}

pub struct SignalReceiver {
    rx: mpsc::Receiver<Signal>,
}

impl SignalReceiver {
    /// `None` once every sender is dropped and the buffer drained.
    pub async fn recv(&mut self) -> Option<Signal> {
        self.rx.recv().await
    }

    /// Stop accepting new signals while allowing the drain to finish.
    pub fn close(&mut self) {
        self.rx.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::at_eastern;
    use chrono::NaiveTime;
    use rust_decimal_macros::dec;

    fn ts(h: u32, m: u32) -> EtDateTime {
        at_eastern(
            NaiveDate::from_ymd_opt(2024, 6, 3).unwrap(),
            NaiveTime::from_hms_opt(h, m, 0).unwrap(),
        )
    }

    #[test]
    fn test_signal_id_is_deterministic() {
        let a = Signal::compute_id("XYZ", ts(15, 35), dec!(150000), None, Some("XYZ240621C100"));
        let b = Signal::compute_id("XYZ", ts(15, 35), dec!(150000), None, Some("XYZ240621C100"));
        assert_eq!(a, b);
    }

    #[test]
    fn test_signal_id_distinguishes_fields() {
        let base = Signal::compute_id("XYZ", ts(15, 35), dec!(150000), None, None);
        assert_ne!(
            base,
            Signal::compute_id("XYZ", ts(15, 36), dec!(150000), None, None)
        );
        assert_ne!(
            base,
            Signal::compute_id("XYZ", ts(15, 35), dec!(150001), None, None)
        );
        assert_ne!(
            base,
            Signal::compute_id("XYZ", ts(15, 35), dec!(150000), Some(dec!(1.2)), None)
        );
    }

    #[tokio::test]
    async fn test_buffer_preserves_fifo_order() {
        let (tx, mut rx) = signal_channel(8);
        for premium in [1, 2, 3] {
            let t = ts(15, 35);
            let signal = Signal {
                signal_id: Signal::compute_id("XYZ", t, Decimal::from(premium), None, None),
                symbol: "XYZ".to_string(),
                premium_usd: Decimal::from(premium),
                ask: None,
                contract_id: None,
                signal_time_source: t.naive_local(),
                signal_time_eastern: t,
                side: FlowSide::Ask,
                stock_price: None,
                strike: None,
                option_type: None,
                expiry: None,
                dte: None,
                history: Vec::new(),
            };
            tx.send(signal).await.unwrap();
        }
        drop(tx);

        let mut seen = Vec::new();
        while let Some(signal) = rx.recv().await {
            seen.push(signal.premium_usd);
        }
        assert_eq!(seen, vec![dec!(1), dec!(2), dec!(3)]);
    }
}
