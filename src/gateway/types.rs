//! Wire types shared by the live and simulated gateways.

use crate::calendar::EtDateTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order lifecycle state. Filled, Rejected and Cancelled are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Partial,
    Filled,
    Rejected,
    Cancelled,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Rejected | OrderStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Partial => "PARTIAL",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Rejected => "REJECTED",
            OrderStatus::Cancelled => "CANCELLED",
        }
    }
}

/// One minute of price history.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MinuteBar {
    pub timestamp: EtDateTime,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
}

/// Account state as reported by the venue or simulator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AccountSnapshot {
    pub equity: Decimal,
    pub cash: Decimal,
    pub buying_power: Decimal,
}

/// A position as the venue sees it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BrokerPosition {
    pub symbol: String,
    pub shares: i64,
    pub avg_cost: Decimal,
}

/// Order placement request; `client_id` is the idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderRequest {
    pub client_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub shares: i64,
    pub limit_price: Decimal,
}

impl OrderRequest {
    /// Canonical digest of the argument payload, used to detect a retry
    /// with the same client id but different arguments.
    pub fn args_digest(&self) -> String {
        crate::utils::fingerprint::fingerprint(&[
            &self.symbol,
            self.side.as_str(),
            &self.shares.to_string(),
            &self.limit_price.to_string(),
        ])
    }
}

/// Result of an order placement or status query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderResult {
    pub client_id: String,
    pub broker_id: Option<String>,
    pub symbol: String,
    pub side: OrderSide,
    pub shares: i64,
    pub limit_price: Decimal,
    pub status: OrderStatus,
    pub filled_shares: i64,
    pub avg_price: Option<Decimal>,
    pub fees: Decimal,
    pub created_eastern: EtDateTime,
    pub updated_eastern: EtDateTime,
}

impl OrderResult {
    /// Per-share cost of a fill including fees; falls back to the limit
    /// price when the venue reported no average price.
    pub fn net_fill_price(&self) -> Decimal {
        let avg = self.avg_price.unwrap_or(self.limit_price);
        if self.filled_shares <= 0 {
            return avg;
        }
        let shares = Decimal::from(self.filled_shares);
        match self.side {
            OrderSide::Buy => (avg * shares + self.fees) / shares,
            OrderSide::Sell => (avg * shares - self.fees) / shares,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::at_eastern;
    use chrono::{NaiveDate, NaiveTime};
    use rust_decimal_macros::dec;

    fn ts() -> EtDateTime {
        at_eastern(
            NaiveDate::from_ymd_opt(2024, 6, 3).unwrap(),
            NaiveTime::from_hms_opt(15, 37, 0).unwrap(),
        )
    }

    #[test]
    fn test_terminal_states() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Rejected.is_terminal());
        assert!(OrderStatus::Cancelled.is_terminal());
        assert!(!OrderStatus::Pending.is_terminal());
        assert!(!OrderStatus::Partial.is_terminal());
    }

    #[test]
    fn test_args_digest_changes_with_payload() {
        let base = OrderRequest {
            client_id: "abc".to_string(),
            symbol: "AAPL".to_string(),
            side: OrderSide::Buy,
            shares: 100,
            limit_price: dec!(190.50),
        };
        let mut changed = base.clone();
        changed.shares = 101;
        assert_ne!(base.args_digest(), changed.args_digest());

        let same = base.clone();
        assert_eq!(base.args_digest(), same.args_digest());
    }

    #[test]
    fn test_net_fill_price_includes_fees() {
        let result = OrderResult {
            client_id: "abc".to_string(),
            broker_id: None,
            symbol: "AAPL".to_string(),
            side: OrderSide::Buy,
            shares: 100,
            limit_price: dec!(100),
            status: OrderStatus::Filled,
            filled_shares: 100,
            avg_price: Some(dec!(100)),
            fees: dec!(1),
            created_eastern: ts(),
            updated_eastern: ts(),
        };
        assert_eq!(result.net_fill_price(), dec!(100.01));
    }
}
