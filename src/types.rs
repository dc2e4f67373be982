//! Core data types used across the trading system

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

/// Validation errors for candle data
#[derive(Debug, Error, PartialEq)]
pub enum CandleValidationError {
    #[error("high ({high}) must be >= low ({low})")]
    HighLessThanLow { high: f64, low: f64 },

    #[error("volume ({0}) must be >= 0")]
    NegativeVolume(f64),

    #[error("close ({close}) must be between low ({low}) and high ({high})")]
    CloseOutOfRange { close: f64, low: f64, high: f64 },

    #[error("prices must be positive: open={open}, high={high}, low={low}, close={close}")]
    NonPositivePrice {
        open: f64,
        high: f64,
        low: f64,
        close: f64,
    },
}

/// OHLCV candlestick data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub datetime: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn validate(&self) -> Result<(), CandleValidationError> {
        if self.open <= 0.0 || self.high <= 0.0 || self.low <= 0.0 || self.close <= 0.0 {
            return Err(CandleValidationError::NonPositivePrice {
                open: self.open,
                high: self.high,
                low: self.low,
                close: self.close,
            });
        }

        if self.high < self.low {
            return Err(CandleValidationError::HighLessThanLow {
                high: self.high,
                low: self.low,
            });
        }

        if self.volume < 0.0 {
            return Err(CandleValidationError::NegativeVolume(self.volume));
        }

        if self.close < self.low || self.close > self.high {
            return Err(CandleValidationError::CloseOutOfRange {
                close: self.close,
                low: self.low,
                high: self.high,
            });
        }

        Ok(())
    }
}

/// Spot trading pair in `BASE/QUOTE` notation, e.g. `BTC/USDT`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(String);

impl Symbol {
    pub fn new(s: impl Into<String>) -> Self {
        Symbol(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Base currency (`BTC` for `BTC/USDT`)
    pub fn base(&self) -> &str {
        self.split().0
    }

    /// Quote currency (`USDT` for `BTC/USDT`); this is the currency entries are paid in
    pub fn quote(&self) -> &str {
        self.split().1
    }

    /// Exchange market id with separators removed (`BTCUSDT`)
    pub fn market_id(&self) -> String {
        self.0
            .split(|c| c == '/' || c == ':')
            .take(2)
            .collect::<Vec<_>>()
            .concat()
            .to_uppercase()
    }

    /// Filesystem-safe key (`BTC-USDT`): `/` and `:` become `-`
    pub fn file_key(&self) -> String {
        self.0.replace(['/', ':'], "-")
    }

    fn split(&self) -> (&str, &str) {
        let pair = self.0.split(':').next().unwrap_or(&self.0);
        match pair.split_once('/') {
            Some((base, quote)) => (base, quote),
            None => (pair, ""),
        }
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Order / position direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "buy" => Ok(Side::Buy),
            "sell" => Ok(Side::Sell),
            other => Err(format!("unknown side: {}", other)),
        }
    }
}

/// Order lifecycle status as reported by the exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Open,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
}

impl OrderStatus {
    pub fn is_open(self) -> bool {
        matches!(self, OrderStatus::Open | OrderStatus::PartiallyFilled)
    }
}

/// How an order executes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderKind {
    Limit,
    Market,
    TriggerLimit,
    TriggerMarket,
}

/// Order as reported by the exchange (open or closed)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeOrder {
    pub id: String,
    pub side: Side,
    pub kind: OrderKind,
    /// Limit price; the execution price for filled market orders
    pub price: f64,
    pub trigger_price: Option<f64>,
    pub amount: f64,
    pub status: OrderStatus,
}

/// Last trade and top of book
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    pub last: f64,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
}

/// Per-currency account balance
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub total: f64,
    pub free: f64,
    pub used: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_parts() {
        let symbol = Symbol::new("BTC/USDT");
        assert_eq!(symbol.base(), "BTC");
        assert_eq!(symbol.quote(), "USDT");
        assert_eq!(symbol.market_id(), "BTCUSDT");
        assert_eq!(symbol.file_key(), "BTC-USDT");
    }

    #[test]
    fn test_symbol_with_settlement_suffix() {
        let symbol = Symbol::new("ETH/USDT:USDT");
        assert_eq!(symbol.quote(), "USDT");
        assert_eq!(symbol.market_id(), "ETHUSDT");
        assert_eq!(symbol.file_key(), "ETH-USDT-USDT");
    }

    #[test]
    fn test_side_parse_and_display() {
        assert_eq!("BUY".parse::<Side>().unwrap(), Side::Buy);
        assert_eq!(Side::Sell.to_string(), "sell");
        assert_eq!(Side::Buy.opposite(), Side::Sell);
        assert!("hold".parse::<Side>().is_err());
    }

    #[test]
    fn test_candle_validation() {
        let candle = Candle {
            datetime: Utc::now(),
            open: 100.0,
            high: 90.0,
            low: 95.0,
            close: 92.0,
            volume: 1.0,
        };
        assert!(matches!(
            candle.validate(),
            Err(CandleValidationError::HighLessThanLow { .. })
        ));
    }
}
