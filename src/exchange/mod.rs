//! Exchange collaborator
//!
//! The controller only talks to the market through [`Exchange`]. Two
//! implementations ship with the crate:
//!
//! - [`BitgetSpot`]: Bitget v2 spot REST binding (live trading)
//! - [`PaperExchange`]: in-memory simulation (paper trading and tests)

pub mod bitget;
pub mod paper;

pub use bitget::{BitgetSpot, ClientConfig, Credentials};
pub use paper::{PaperAction, PaperExchange};

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

use crate::{Balance, Candle, ExchangeOrder, Side, Symbol, Ticker};

#[derive(Debug, Error)]
pub enum ExchangeError {
    /// Transport failure, timeout, 5xx or open circuit breaker
    #[error("exchange unavailable: {0}")]
    Unavailable(String),

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("order not found: {0}")]
    OrderNotFound(String),

    /// The exchange answered and refused the request
    #[error("request rejected ({code}): {message}")]
    Rejected { code: String, message: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("failed to parse exchange response: {0}")]
    Parse(String),
}

impl ExchangeError {
    /// Errors worth retrying for read-only calls
    pub fn is_transient(&self) -> bool {
        matches!(self, ExchangeError::Unavailable(_) | ExchangeError::RateLimited)
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Unavailable(format!("timeout: {}", err))
        } else if err.is_decode() {
            Self::Parse(err.to_string())
        } else {
            Self::Unavailable(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ExchangeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

pub type ExchangeResult<T> = Result<T, ExchangeError>;

/// Spot exchange operations used by the strategy.
///
/// Amounts are in base currency, prices in quote currency. Every placement
/// returns the exchange-assigned order id.
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Most recent `limit` candles, oldest first. The last one may still be forming.
    async fn fetch_ohlcv(
        &self,
        symbol: &Symbol,
        timeframe: &str,
        limit: usize,
    ) -> ExchangeResult<Vec<Candle>>;

    /// Resting orders, including untriggered trigger orders
    async fn fetch_open_orders(&self, symbol: &Symbol) -> ExchangeResult<Vec<ExchangeOrder>>;

    /// Executed orders, oldest first (the most recent fill is last).
    /// Canceled orders are not included.
    async fn fetch_closed_orders(&self, symbol: &Symbol) -> ExchangeResult<Vec<ExchangeOrder>>;

    /// Cancel an order; an order that no longer exists is not an error
    async fn cancel_order(&self, id: &str, symbol: &Symbol) -> ExchangeResult<()>;

    async fn place_limit_order(
        &self,
        symbol: &Symbol,
        side: Side,
        amount: f64,
        price: f64,
    ) -> ExchangeResult<String>;

    /// Limit order that only becomes active once `trigger_price` trades
    async fn place_trigger_limit_order(
        &self,
        symbol: &Symbol,
        side: Side,
        amount: f64,
        trigger_price: f64,
        price: f64,
    ) -> ExchangeResult<String>;

    async fn place_trigger_market_order(
        &self,
        symbol: &Symbol,
        side: Side,
        amount: f64,
        trigger_price: f64,
    ) -> ExchangeResult<String>;

    async fn place_market_order(
        &self,
        symbol: &Symbol,
        side: Side,
        amount: f64,
    ) -> ExchangeResult<String>;

    /// Smallest order size accepted for `symbol`, in base currency
    async fn fetch_min_amount_tradable(&self, symbol: &Symbol) -> ExchangeResult<f64>;

    /// Balances keyed by currency code
    async fn fetch_balance(&self) -> ExchangeResult<HashMap<String, Balance>>;

    async fn fetch_ticker(&self, symbol: &Symbol) -> ExchangeResult<Ticker>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        assert!(ExchangeError::Unavailable("timeout".into()).is_transient());
        assert!(ExchangeError::RateLimited.is_transient());
        assert!(!ExchangeError::Auth("bad key".into()).is_transient());
        assert!(!ExchangeError::Rejected {
            code: "43012".into(),
            message: "insufficient balance".into()
        }
        .is_transient());
    }
}
