//! The market-gateway contract honored identically by the live and
//! simulated implementations.

use super::types::{
    AccountSnapshot, BrokerPosition, MinuteBar, OrderRequest, OrderResult,
};
use crate::calendar::EtDateTime;
use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::time::Duration;
use thiserror::Error;

/// Gateway failure taxonomy. Workers branch on these kinds: transient
/// errors are retried with backoff, idempotency conflicts abort the
/// decision and surface to reconciliation.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("unknown symbol {0}")]
    SymbolUnknown(String),
    #[error("stale market data for {0}")]
    Stale(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("gateway call timed out after {0:?}")]
    Timeout(Duration),
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),
    #[error("idempotency conflict for client id {0}")]
    IdempotencyConflict(String),
    #[error("order {0} not found")]
    NotFound(String),
}

impl GatewayError {
    /// Retryable with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GatewayError::Network(_) | GatewayError::Timeout(_) | GatewayError::Stale(_)
        )
    }
}

/// Uniform interface for quotes, account state and order placement.
#[async_trait]
pub trait MarketGateway: Send + Sync {
    async fn connect(&self) -> Result<(), GatewayError>;

    async fn disconnect(&self);

    /// Latest trade price for the symbol.
    async fn get_quote(&self, symbol: &str) -> Result<Decimal, GatewayError>;

    /// Ordered minute bars covering `[from, to]`. Gaps are permitted;
    /// callers forward-fill the last known close.
    async fn get_minute_bars(
        &self,
        symbol: &str,
        from: EtDateTime,
        to: EtDateTime,
    ) -> Result<Vec<MinuteBar>, GatewayError>;

    async fn get_account(&self) -> Result<AccountSnapshot, GatewayError>;

    async fn get_positions(&self) -> Result<Vec<BrokerPosition>, GatewayError>;

    /// Idempotent on `client_id`: a retry with identical arguments returns
    /// the stored terminal state; a retry with differing arguments fails
    /// with [`GatewayError::IdempotencyConflict`].
    async fn place_order(&self, req: OrderRequest) -> Result<OrderResult, GatewayError>;

    async fn get_order(&self, client_id: &str) -> Result<Option<OrderResult>, GatewayError>;

    /// Trading days in `(from, to]` per the venue calendar.
    fn count_trading_days_between(&self, from: NaiveDate, to: NaiveDate) -> u32;
}
