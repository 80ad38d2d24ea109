//! Live gateway: HTTP client for the brokerage daemon.
//!
//! The daemon exposes a small JSON API on localhost; every call carries
//! the configured per-request timeout. Timestamps cross the wire as
//! RFC3339 strings and are converted to Eastern at the boundary.

use super::traits::{GatewayError, MarketGateway};
use super::types::{
    AccountSnapshot, BrokerPosition, MinuteBar, OrderRequest, OrderResult, OrderSide, OrderStatus,
};
use crate::calendar::{EtDateTime, TradingCalendar};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate};
use chrono_tz::US::Eastern;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub struct LiveGateway {
    http: reqwest::Client,
    base_url: String,
    account_id: String,
    calendar: Arc<TradingCalendar>,
    timeout: Duration,
}

impl LiveGateway {
    pub fn new(
        base_url: &str,
        account_id: &str,
        calendar: Arc<TradingCalendar>,
        timeout: Duration,
    ) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Network(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            account_id: account_id.to_string(),
            calendar,
            timeout,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn map_err(&self, err: reqwest::Error) -> GatewayError {
        if err.is_timeout() {
            GatewayError::Timeout(self.timeout)
        } else {
            GatewayError::Network(err.to_string())
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<T, GatewayError> {
        let response = self
            .http
            .get(self.url(path))
            .query(&[("account_id", self.account_id.as_str())])
            .send()
            .await
            .map_err(|e| self.map_err(e))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(GatewayError::NotFound(path.to_string()));
        }
        let response = response
            .error_for_status()
            .map_err(|e| self.map_err(e))?;
        response.json().await.map_err(|e| self.map_err(e))
    }
}

#[async_trait]
impl MarketGateway for LiveGateway {
    async fn connect(&self) -> Result<(), GatewayError> {
        let health: HealthResponse = self.get_json("/health").await?;
        if !health.ok {
            return Err(GatewayError::Network("daemon reported unhealthy".into()));
        }
        info!(base_url = %self.base_url, account = %self.account_id, "live gateway connected");
        Ok(())
    }

    async fn disconnect(&self) {
        info!("live gateway disconnected");
    }

    async fn get_quote(&self, symbol: &str) -> Result<Decimal, GatewayError> {
        let quote: QuoteResponse = self.get_json(&format!("/quote/{symbol}")).await?;
        if quote.stale {
            return Err(GatewayError::Stale(symbol.to_string()));
        }
        match quote.last_price {
            Some(price) if price > Decimal::ZERO => Ok(price),
            _ => Err(GatewayError::SymbolUnknown(symbol.to_string())),
        }
    }

    async fn get_minute_bars(
        &self,
        symbol: &str,
        from: EtDateTime,
        to: EtDateTime,
    ) -> Result<Vec<MinuteBar>, GatewayError> {
        let path = format!(
            "/bars/{symbol}?from={}&to={}",
            urlencode(&from.to_rfc3339()),
            urlencode(&to.to_rfc3339())
        );
        let body: BarsResponse = self.get_json(&path).await?;
        let mut bars = Vec::with_capacity(body.bars.len());
        for bar in body.bars {
            bars.push(MinuteBar {
                timestamp: parse_eastern(&bar.timestamp)?,
                open: bar.open,
                high: bar.high,
                low: bar.low,
                close: bar.close,
            });
        }
        bars.sort_by_key(|b| b.timestamp);
        Ok(bars)
    }

    async fn get_account(&self) -> Result<AccountSnapshot, GatewayError> {
        let body: AccountResponse = self.get_json("/account").await?;
        Ok(AccountSnapshot {
            equity: body.equity,
            cash: body.cash,
            buying_power: body.buying_power,
        })
    }

    async fn get_positions(&self) -> Result<Vec<BrokerPosition>, GatewayError> {
        let body: PositionsResponse = self.get_json("/positions").await?;
        Ok(body
            .positions
            .into_iter()
            .map(|p| BrokerPosition {
                symbol: p.symbol,
                shares: p.shares,
                avg_cost: p.avg_cost,
            })
            .collect())
    }

    async fn place_order(&self, req: OrderRequest) -> Result<OrderResult, GatewayError> {
        let payload = PlaceOrderBody {
            account_id: &self.account_id,
            client_id: &req.client_id,
            symbol: &req.symbol,
            side: req.side,
            shares: req.shares,
            limit_price: req.limit_price,
        };
        let response = self
            .http
            .post(self.url("/orders"))
            .json(&payload)
            .send()
            .await
            .map_err(|e| self.map_err(e))?;

        if response.status() == reqwest::StatusCode::CONFLICT {
            return Err(GatewayError::IdempotencyConflict(req.client_id));
        }
        let response = response
            .error_for_status()
            .map_err(|e| self.map_err(e))?;
        let body: OrderWire = response.json().await.map_err(|e| self.map_err(e))?;
        body.into_result()
    }

    async fn get_order(&self, client_id: &str) -> Result<Option<OrderResult>, GatewayError> {
        match self.get_json::<OrderWire>(&format!("/orders/{client_id}")).await {
            Ok(body) => Ok(Some(body.into_result()?)),
            Err(GatewayError::NotFound(_)) => Ok(None),
            Err(e) => {
                warn!(%client_id, error = %e, "order status query failed");
                Err(e)
            }
        }
    }

    fn count_trading_days_between(&self, from: NaiveDate, to: NaiveDate) -> u32 {
        self.calendar.count_trading_days_between(from, to)
    }
}

fn parse_eastern(s: &str) -> Result<EtDateTime, GatewayError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Eastern))
        .map_err(|e| GatewayError::Network(format!("bad timestamp {s}: {e}")))
}

fn urlencode(s: &str) -> String {
    s.replace('+', "%2B").replace(':', "%3A")
}

#[derive(Debug, Deserialize)]
struct HealthResponse {
    ok: bool,
}

#[derive(Debug, Deserialize)]
struct QuoteResponse {
    last_price: Option<Decimal>,
    #[serde(default)]
    stale: bool,
}

#[derive(Debug, Deserialize)]
struct BarsResponse {
    #[serde(default)]
    bars: Vec<BarWire>,
}

#[derive(Debug, Deserialize)]
struct BarWire {
    timestamp: String,
    open: Decimal,
    high: Decimal,
    low: Decimal,
    close: Decimal,
}

#[derive(Debug, Deserialize)]
struct AccountResponse {
    equity: Decimal,
    cash: Decimal,
    buying_power: Decimal,
}

#[derive(Debug, Deserialize)]
struct PositionsResponse {
    #[serde(default)]
    positions: Vec<PositionWire>,
}

#[derive(Debug, Deserialize)]
struct PositionWire {
    symbol: String,
    shares: i64,
    avg_cost: Decimal,
}

#[derive(Debug, Serialize)]
struct PlaceOrderBody<'a> {
    account_id: &'a str,
    client_id: &'a str,
    symbol: &'a str,
    side: OrderSide,
    shares: i64,
    limit_price: Decimal,
}

#[derive(Debug, Deserialize)]
struct OrderWire {
    client_id: String,
    broker_id: Option<String>,
    symbol: String,
    side: OrderSide,
    shares: i64,
    limit_price: Decimal,
    status: OrderStatus,
    filled_shares: i64,
    avg_price: Option<Decimal>,
    #[serde(default)]
    fees: Decimal,
    created: String,
    updated: String,
}

impl OrderWire {
    fn into_result(self) -> Result<OrderResult, GatewayError> {
        Ok(OrderResult {
            created_eastern: parse_eastern(&self.created)?,
            updated_eastern: parse_eastern(&self.updated)?,
            client_id: self.client_id,
            broker_id: self.broker_id,
            symbol: self.symbol,
            side: self.side,
            shares: self.shares,
            limit_price: self.limit_price,
            status: self.status,
            filled_shares: self.filled_shares,
            avg_price: self.avg_price,
            fees: self.fees,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_wire_maps_timestamps() {
        let wire = OrderWire {
            client_id: "c1".to_string(),
            broker_id: Some("B9".to_string()),
            symbol: "AAPL".to_string(),
            side: OrderSide::Buy,
            shares: 10,
            limit_price: Decimal::new(1905, 1),
            status: OrderStatus::Filled,
            filled_shares: 10,
            avg_price: Some(Decimal::new(19051, 2)),
            fees: Decimal::ONE,
            created: "2024-06-03T15:37:00-04:00".to_string(),
            updated: "2024-06-03T15:37:02-04:00".to_string(),
        };
        let result = wire.into_result().unwrap();
        assert_eq!(result.status, OrderStatus::Filled);
        assert_eq!(result.created_eastern.to_rfc3339(), "2024-06-03T15:37:00-04:00");
    }

    #[test]
    fn test_bad_timestamp_is_a_network_error() {
        assert!(matches!(
            parse_eastern("not-a-time"),
            Err(GatewayError::Network(_))
        ));
    }
}
