//! Bitget v2 spot wire types and their conversion into crate types

use chrono::{TimeZone, Utc};
use rust_decimal::prelude::*;
use serde::{Deserialize, Deserializer};

use crate::exchange::{ExchangeError, ExchangeResult};
use crate::{Balance, Candle, ExchangeOrder, OrderKind, OrderStatus, Side, Ticker};

/// Success code of every Bitget response envelope
pub const SUCCESS_CODE: &str = "00000";

/// Every response is wrapped as `{"code": "...", "msg": "...", "data": ...}`
#[derive(Debug, Deserialize)]
pub struct ApiEnvelope {
    pub code: String,
    #[serde(default)]
    pub msg: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Map a non-success envelope to an error
pub fn classify_error(code: &str, msg: &str) -> ExchangeError {
    let lower = msg.to_lowercase();
    match code {
        "40006" | "40009" | "40011" | "40012" | "40037" => ExchangeError::Auth(msg.to_string()),
        "429" | "40429" => ExchangeError::RateLimited,
        "43001" | "43025" | "40768" => ExchangeError::OrderNotFound(msg.to_string()),
        _ if lower.contains("not exist") || lower.contains("does not exist") => {
            ExchangeError::OrderNotFound(msg.to_string())
        }
        _ => ExchangeError::Rejected {
            code: code.to_string(),
            message: msg.to_string(),
        },
    }
}

fn num(s: &str, field: &str) -> ExchangeResult<f64> {
    s.trim()
        .parse::<f64>()
        .map_err(|_| ExchangeError::Parse(format!("bad {} '{}'", field, s)))
}

fn opt_num(s: &Option<String>) -> Option<f64> {
    s.as_deref()
        .filter(|v| !v.is_empty())
        .and_then(|v| v.parse::<f64>().ok())
}

fn string_or_number<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Str(String),
        Num(u32),
    }
    match Raw::deserialize(deserializer)? {
        Raw::Num(n) => Ok(n),
        Raw::Str(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

fn parse_side(s: &str) -> ExchangeResult<Side> {
    s.parse::<Side>().map_err(ExchangeError::Parse)
}

// ==================== MARKET DATA ====================

/// Candle rows arrive as `[ts, open, high, low, close, baseVol, quoteVol, usdtVol]`
pub fn parse_candles(rows: Vec<Vec<String>>) -> ExchangeResult<Vec<Candle>> {
    let mut candles = rows
        .into_iter()
        .map(|row| {
            if row.len() < 6 {
                return Err(ExchangeError::Parse(format!(
                    "candle row has {} fields",
                    row.len()
                )));
            }
            let ts: i64 = row[0]
                .parse()
                .map_err(|_| ExchangeError::Parse(format!("bad candle timestamp '{}'", row[0])))?;
            let datetime = Utc
                .timestamp_millis_opt(ts)
                .single()
                .ok_or_else(|| ExchangeError::Parse(format!("candle timestamp out of range: {}", ts)))?;
            Ok(Candle {
                datetime,
                open: num(&row[1], "open")?,
                high: num(&row[2], "high")?,
                low: num(&row[3], "low")?,
                close: num(&row[4], "close")?,
                volume: num(&row[5], "volume")?,
            })
        })
        .collect::<ExchangeResult<Vec<_>>>()?;

    candles.sort_by_key(|c| c.datetime);
    Ok(candles)
}

/// Convert a Bitget granularity from the usual timeframe notation
pub fn granularity(timeframe: &str) -> ExchangeResult<&'static str> {
    Ok(match timeframe {
        "1m" => "1min",
        "3m" => "3min",
        "5m" => "5min",
        "15m" => "15min",
        "30m" => "30min",
        "1h" => "1h",
        "4h" => "4h",
        "6h" => "6h",
        "12h" => "12h",
        "1d" => "1day",
        "3d" => "3day",
        "1w" => "1week",
        "1M" => "1M",
        other => {
            return Err(ExchangeError::InvalidRequest(format!(
                "unsupported timeframe '{}'",
                other
            )))
        }
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TickerData {
    pub symbol: String,
    pub last_pr: String,
    pub bid_pr: Option<String>,
    pub ask_pr: Option<String>,
}

impl TickerData {
    pub fn to_ticker(&self) -> ExchangeResult<Ticker> {
        Ok(Ticker {
            last: num(&self.last_pr, "lastPr")?,
            bid: opt_num(&self.bid_pr),
            ask: opt_num(&self.ask_pr),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolInfo {
    pub symbol: String,
    pub min_trade_amount: String,
    #[serde(deserialize_with = "string_or_number")]
    pub quantity_precision: u32,
    #[serde(deserialize_with = "string_or_number")]
    pub price_precision: u32,
}

impl SymbolInfo {
    /// Smallest accepted size: the stated minimum, but never below one quantity step
    pub fn min_amount(&self) -> f64 {
        let stated = self.min_trade_amount.parse::<f64>().unwrap_or(0.0);
        let step = 10f64.powi(-(self.quantity_precision as i32));
        stated.max(step)
    }

    pub fn format_amount(&self, amount: f64) -> ExchangeResult<String> {
        round_down(amount, self.quantity_precision)
    }

    pub fn format_price(&self, price: f64) -> ExchangeResult<String> {
        round_nearest(price, self.price_precision)
    }
}

fn to_decimal(value: f64) -> ExchangeResult<Decimal> {
    Decimal::from_f64(value)
        .ok_or_else(|| ExchangeError::InvalidRequest(format!("not a representable number: {}", value)))
}

/// Truncate toward zero so an order never exceeds the intended size
pub fn round_down(value: f64, places: u32) -> ExchangeResult<String> {
    Ok(to_decimal(value)?
        .round_dp_with_strategy(places, RoundingStrategy::ToZero)
        .normalize()
        .to_string())
}

pub fn round_nearest(value: f64, places: u32) -> ExchangeResult<String> {
    Ok(to_decimal(value)?
        .round_dp_with_strategy(places, RoundingStrategy::MidpointAwayFromZero)
        .normalize()
        .to_string())
}

// ==================== ACCOUNT ====================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetData {
    pub coin: String,
    pub available: String,
    #[serde(default)]
    pub frozen: Option<String>,
    #[serde(default)]
    pub locked: Option<String>,
}

impl AssetData {
    pub fn to_balance(&self) -> ExchangeResult<Balance> {
        let free = num(&self.available, "available")?;
        let used = opt_num(&self.frozen).unwrap_or(0.0) + opt_num(&self.locked).unwrap_or(0.0);
        Ok(Balance {
            total: free + used,
            free,
            used,
        })
    }
}

// ==================== ORDERS ====================

fn order_status(s: &str) -> OrderStatus {
    match s {
        "live" | "new" | "init" | "not_trigger" => OrderStatus::Open,
        "partially_filled" | "partial_fill" => OrderStatus::PartiallyFilled,
        "filled" | "full_fill" | "executed" | "triggered" => OrderStatus::Filled,
        "cancelled" | "canceled" => OrderStatus::Canceled,
        _ => OrderStatus::Rejected,
    }
}

/// Regular order from `unfilled-orders` / `history-orders`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderData {
    pub order_id: String,
    pub side: String,
    pub order_type: String,
    #[serde(default)]
    pub price: Option<String>,
    #[serde(default)]
    pub price_avg: Option<String>,
    pub size: String,
    #[serde(default)]
    pub base_volume: Option<String>,
    pub status: String,
    #[serde(default)]
    pub c_time: Option<String>,
    #[serde(default)]
    pub u_time: Option<String>,
}

impl OrderData {
    pub fn timestamp(&self) -> i64 {
        self.u_time
            .as_deref()
            .or(self.c_time.as_deref())
            .and_then(|t| t.parse().ok())
            .unwrap_or(0)
    }

    pub fn to_order(&self) -> ExchangeResult<ExchangeOrder> {
        let status = order_status(&self.status);
        let kind = if self.order_type == "market" {
            OrderKind::Market
        } else {
            OrderKind::Limit
        };
        // filled orders report their average execution price
        let price = match status {
            OrderStatus::Filled | OrderStatus::PartiallyFilled => {
                opt_num(&self.price_avg).or_else(|| opt_num(&self.price))
            }
            _ => opt_num(&self.price),
        }
        .unwrap_or(0.0);
        let amount = match status {
            OrderStatus::Filled => opt_num(&self.base_volume).unwrap_or(num(&self.size, "size")?),
            _ => num(&self.size, "size")?,
        };

        Ok(ExchangeOrder {
            id: self.order_id.clone(),
            side: parse_side(&self.side)?,
            kind,
            price,
            trigger_price: None,
            amount,
            status,
        })
    }
}

/// Trigger (plan) order from `current-plan-order` / `history-plan-order`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanOrderData {
    pub order_id: String,
    pub side: String,
    pub order_type: String,
    pub trigger_price: String,
    #[serde(default)]
    pub execute_price: Option<String>,
    pub size: String,
    pub status: String,
    #[serde(default)]
    pub c_time: Option<String>,
    #[serde(default)]
    pub u_time: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanOrderPage {
    #[serde(default)]
    pub order_list: Option<Vec<PlanOrderData>>,
}

impl PlanOrderData {
    pub fn timestamp(&self) -> i64 {
        self.u_time
            .as_deref()
            .or(self.c_time.as_deref())
            .and_then(|t| t.parse().ok())
            .unwrap_or(0)
    }

    pub fn to_order(&self) -> ExchangeResult<ExchangeOrder> {
        let trigger_price = num(&self.trigger_price, "triggerPrice")?;
        let (kind, price) = if self.order_type == "market" {
            (OrderKind::TriggerMarket, trigger_price)
        } else {
            (
                OrderKind::TriggerLimit,
                opt_num(&self.execute_price).unwrap_or(trigger_price),
            )
        };
        Ok(ExchangeOrder {
            id: self.order_id.clone(),
            side: parse_side(&self.side)?,
            kind,
            price,
            trigger_price: Some(trigger_price),
            amount: num(&self.size, "size")?,
            status: order_status(&self.status),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlacedOrder {
    pub order_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_envelope_error_classification() {
        assert!(matches!(
            classify_error("43001", "The order does not exist"),
            ExchangeError::OrderNotFound(_)
        ));
        assert!(matches!(
            classify_error("40099", "plan order not exist"),
            ExchangeError::OrderNotFound(_)
        ));
        assert!(matches!(
            classify_error("40009", "sign signature error"),
            ExchangeError::Auth(_)
        ));
        assert!(matches!(
            classify_error("43012", "Insufficient balance"),
            ExchangeError::Rejected { .. }
        ));
    }

    #[test]
    fn test_parse_candles_sorted_oldest_first() {
        let rows: Vec<Vec<String>> = vec![
            vec!["1700003600000", "101", "103", "100", "102", "5", "510", "510"],
            vec!["1700000000000", "100", "102", "99", "101", "4", "404", "404"],
        ]
        .into_iter()
        .map(|r| r.into_iter().map(String::from).collect::<Vec<String>>())
        .collect();

        let candles = parse_candles(rows).unwrap();
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].close, 101.0);
        assert_eq!(candles[1].close, 102.0);
    }

    #[test]
    fn test_granularity() {
        assert_eq!(granularity("1h").unwrap(), "1h");
        assert_eq!(granularity("1d").unwrap(), "1day");
        assert!(granularity("7h").is_err());
    }

    #[test]
    fn test_symbol_info_rounding() {
        let info: SymbolInfo = serde_json::from_str(
            r#"{"symbol":"BTCUSDT","minTradeAmount":"0","quantityPrecision":"6","pricePrecision":2}"#,
        )
        .unwrap();
        assert_relative_eq!(info.min_amount(), 0.000001);
        assert_eq!(info.format_amount(0.123456789).unwrap(), "0.123456");
        assert_eq!(info.format_price(93.4651).unwrap(), "93.47");
        assert_eq!(info.format_price(86.0).unwrap(), "86");
    }

    #[test]
    fn test_filled_order_uses_average_price() {
        let data: OrderData = serde_json::from_str(
            r#"{"orderId":"1","side":"sell","orderType":"market","price":"0",
                "priceAvg":"120.5","size":"60.25","baseVolume":"0.5",
                "status":"filled","cTime":"1700000000000"}"#,
        )
        .unwrap();
        let order = data.to_order().unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.kind, OrderKind::Market);
        assert_relative_eq!(order.price, 120.5);
        assert_relative_eq!(order.amount, 0.5);
    }

    #[test]
    fn test_plan_order_conversion() {
        let data: PlanOrderData = serde_json::from_str(
            r#"{"orderId":"sl-1","side":"sell","orderType":"limit","triggerPrice":"60",
                "executePrice":"59.7","size":"1.5","status":"live","cTime":"1700000000000"}"#,
        )
        .unwrap();
        let order = data.to_order().unwrap();
        assert_eq!(order.kind, OrderKind::TriggerLimit);
        assert_eq!(order.trigger_price, Some(60.0));
        assert_relative_eq!(order.price, 59.7);
        assert!(order.status.is_open());
    }

    #[test]
    fn test_asset_balance() {
        let data: AssetData = serde_json::from_str(
            r#"{"coin":"USDT","available":"900","frozen":"100","locked":"0"}"#,
        )
        .unwrap();
        let balance = data.to_balance().unwrap();
        assert_relative_eq!(balance.free, 900.0);
        assert_relative_eq!(balance.used, 100.0);
        assert_relative_eq!(balance.total, 1000.0);
    }
}
