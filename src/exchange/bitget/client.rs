//! Bitget v2 spot REST client
//!
//! - Signed requests (see [`super::auth`])
//! - Rate limiting and a circuit breaker shared by all calls
//! - Retry with exponential backoff for read-only calls; order placement and
//!   cancellation are sent exactly once
//! - Sizes and prices rounded to the market's precision before sending

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, warn};

use super::auth::{prehash, Credentials};
use super::types::*;
use crate::common::{CircuitBreaker, CircuitBreakerConfig, RateLimiter};
use crate::exchange::{Exchange, ExchangeError, ExchangeResult};
use crate::{Balance, Candle, ExchangeOrder, OrderStatus, Side, Symbol, Ticker};

pub const API_BASE_URL: &str = "https://api.bitget.com";

/// Window searched for executed trigger orders
const PLAN_HISTORY_WINDOW_MS: i64 = 7 * 24 * 60 * 60 * 1000;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    /// Retries for read-only calls
    pub max_retries: u32,
    pub timeout: Duration,
    pub requests_per_second: u32,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: API_BASE_URL.to_string(),
            max_retries: 3,
            timeout: Duration::from_secs(30),
            requests_per_second: 10,
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_rate_limit(mut self, requests_per_second: u32) -> Self {
        self.requests_per_second = requests_per_second;
        self
    }

    pub fn with_circuit_breaker_threshold(mut self, threshold: u32) -> Self {
        self.circuit_breaker = self.circuit_breaker.with_failure_threshold(threshold);
        self
    }
}

/// Whether a failed call may be repeated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Idempotency {
    Read,
    Write,
}

/// Turn an HTTP status and body into the decoded `data` payload
pub(crate) fn decode_response<T: DeserializeOwned>(status: StatusCode, text: &str) -> ExchangeResult<T> {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(ExchangeError::RateLimited);
    }
    if status.is_server_error() {
        return Err(ExchangeError::Unavailable(format!("HTTP {}: {}", status, text)));
    }

    let envelope: ApiEnvelope = serde_json::from_str(text)
        .map_err(|e| ExchangeError::Parse(format!("HTTP {}: {} ({})", status, e, text)))?;
    if envelope.code != SUCCESS_CODE {
        return Err(classify_error(&envelope.code, &envelope.msg));
    }
    serde_json::from_value(envelope.data).map_err(ExchangeError::from)
}

/// Bitget spot market client
pub struct BitgetSpot {
    credentials: Credentials,
    http_client: Client,
    base_url: String,
    circuit_breaker: Arc<Mutex<CircuitBreaker>>,
    rate_limiter: RateLimiter,
    max_retries: u32,
    symbols: Mutex<HashMap<String, SymbolInfo>>,
}

impl BitgetSpot {
    pub fn new(credentials: Credentials, config: ClientConfig) -> ExchangeResult<Self> {
        let http_client = Client::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| ExchangeError::Unavailable(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            credentials,
            http_client,
            base_url: config.base_url,
            circuit_breaker: Arc::new(Mutex::new(CircuitBreaker::new(config.circuit_breaker))),
            rate_limiter: RateLimiter::new(config.requests_per_second),
            max_retries: config.max_retries,
            symbols: Mutex::new(HashMap::new()),
        })
    }

    /// Run a request through the circuit breaker and rate limiter, retrying
    /// transient failures of read-only calls with exponential backoff
    async fn execute<F, Fut, T>(&self, idempotency: Idempotency, operation: F) -> ExchangeResult<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = ExchangeResult<T>>,
    {
        {
            let cb = self.circuit_breaker.lock().await;
            if !cb.can_attempt() {
                return Err(ExchangeError::Unavailable(format!(
                    "circuit breaker open, retry in {:?}",
                    cb.retry_after().unwrap_or_default()
                )));
            }
        }

        let attempts = match idempotency {
            Idempotency::Read => self.max_retries + 1,
            Idempotency::Write => 1,
        };

        let mut last_error = None;
        for attempt in 0..attempts {
            if attempt > 0 {
                // 1s, 2s, 4s...
                let delay = Duration::from_secs(2u64.pow(attempt - 1));
                debug!("Retrying after {}ms", delay.as_millis());
                sleep(delay).await;
            }

            self.rate_limiter.acquire().await;
            match operation().await {
                Ok(result) => {
                    self.circuit_breaker.lock().await.record_success();
                    return Ok(result);
                }
                Err(e) if e.is_transient() => {
                    warn!("Request failed (attempt {}/{}): {}", attempt + 1, attempts, e);
                    last_error = Some(e);
                }
                Err(e) => {
                    // the exchange answered, so it is reachable
                    self.circuit_breaker.lock().await.record_success();
                    return Err(e);
                }
            }
        }

        self.circuit_breaker.lock().await.record_failure();
        Err(last_error.unwrap_or_else(|| ExchangeError::Unavailable("request failed".to_string())))
    }

    async fn send<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&serde_json::Value>,
        signed: bool,
    ) -> ExchangeResult<T> {
        let query_string = query
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");
        let request_path = if query_string.is_empty() {
            path.to_string()
        } else {
            format!("{}?{}", path, query_string)
        };
        let body = body.map(|b| b.to_string()).unwrap_or_default();

        let mut request = self
            .http_client
            .request(method.clone(), format!("{}{}", self.base_url, request_path))
            .header("Content-Type", "application/json")
            .header("locale", "en-US");

        if signed {
            let timestamp = chrono::Utc::now().timestamp_millis().to_string();
            let signature = self
                .credentials
                .sign(&prehash(&timestamp, method.as_str(), &request_path, &body))?;
            request = request
                .header("ACCESS-KEY", self.credentials.api_key())
                .header("ACCESS-SIGN", signature)
                .header("ACCESS-TIMESTAMP", timestamp)
                .header("ACCESS-PASSPHRASE", self.credentials.passphrase());
        }
        if !body.is_empty() {
            request = request.body(body);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        decode_response(status, &text)
    }

    async fn public_get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: Vec<(&str, String)>,
    ) -> ExchangeResult<T> {
        self.execute(Idempotency::Read, || {
            self.send(Method::GET, path, &query, None, false)
        })
        .await
    }

    async fn signed_get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: Vec<(&str, String)>,
    ) -> ExchangeResult<T> {
        self.execute(Idempotency::Read, || {
            self.send(Method::GET, path, &query, None, true)
        })
        .await
    }

    async fn signed_post<T: DeserializeOwned>(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> ExchangeResult<T> {
        self.execute(Idempotency::Write, || {
            self.send(Method::POST, path, &[], Some(&body), true)
        })
        .await
    }

    /// Market rules for `symbol`, fetched once and cached
    async fn symbol_info(&self, symbol: &Symbol) -> ExchangeResult<SymbolInfo> {
        let market = symbol.market_id();
        if let Some(info) = self.symbols.lock().await.get(&market) {
            return Ok(info.clone());
        }

        let mut infos: Vec<SymbolInfo> = self
            .public_get("/api/v2/spot/public/symbols", vec![("symbol", market.clone())])
            .await?;
        let info = infos
            .drain(..)
            .find(|i| i.symbol == market)
            .ok_or_else(|| ExchangeError::InvalidRequest(format!("unknown market {}", market)))?;

        self.symbols.lock().await.insert(market, info.clone());
        Ok(info)
    }

    async fn place_order(
        &self,
        symbol: &Symbol,
        side: Side,
        order_type: &str,
        size: String,
        price: Option<String>,
    ) -> ExchangeResult<String> {
        let mut body = json!({
            "symbol": symbol.market_id(),
            "side": side.as_str(),
            "orderType": order_type,
            "force": "gtc",
            "size": size,
        });
        if let Some(price) = price {
            body["price"] = json!(price);
        }

        let placed: PlacedOrder = self
            .signed_post("/api/v2/spot/trade/place-order", body)
            .await?;
        Ok(placed.order_id)
    }

    async fn place_plan_order(
        &self,
        symbol: &Symbol,
        side: Side,
        amount: f64,
        trigger_price: f64,
        execute_price: Option<f64>,
    ) -> ExchangeResult<String> {
        let info = self.symbol_info(symbol).await?;
        let mut body = json!({
            "symbol": symbol.market_id(),
            "side": side.as_str(),
            "triggerPrice": info.format_price(trigger_price)?,
            "orderType": if execute_price.is_some() { "limit" } else { "market" },
            "size": info.format_amount(amount)?,
            "triggerType": "fill_price",
            "planType": "amount",
            "force": "gtc",
        });
        if let Some(price) = execute_price {
            body["executePrice"] = json!(info.format_price(price)?);
        }

        let placed: PlacedOrder = self
            .signed_post("/api/v2/spot/trade/place-plan-order", body)
            .await?;
        Ok(placed.order_id)
    }
}

#[async_trait]
impl Exchange for BitgetSpot {
    async fn fetch_ohlcv(
        &self,
        symbol: &Symbol,
        timeframe: &str,
        limit: usize,
    ) -> ExchangeResult<Vec<Candle>> {
        let rows: Vec<Vec<String>> = self
            .public_get(
                "/api/v2/spot/market/candles",
                vec![
                    ("symbol", symbol.market_id()),
                    ("granularity", granularity(timeframe)?.to_string()),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;
        parse_candles(rows)
    }

    async fn fetch_open_orders(&self, symbol: &Symbol) -> ExchangeResult<Vec<ExchangeOrder>> {
        let query = vec![("symbol", symbol.market_id())];

        let mut regular: Vec<OrderData> = self
            .signed_get("/api/v2/spot/trade/unfilled-orders", query.clone())
            .await?;
        regular.sort_by_key(OrderData::timestamp);

        let page: PlanOrderPage = self
            .signed_get("/api/v2/spot/trade/current-plan-order", query)
            .await?;
        let mut plans = page.order_list.unwrap_or_default();
        plans.sort_by_key(PlanOrderData::timestamp);

        let mut orders = regular
            .iter()
            .map(OrderData::to_order)
            .collect::<ExchangeResult<Vec<_>>>()?;
        for plan in &plans {
            orders.push(plan.to_order()?);
        }
        orders.retain(|o| o.status.is_open());
        Ok(orders)
    }

    async fn fetch_closed_orders(&self, symbol: &Symbol) -> ExchangeResult<Vec<ExchangeOrder>> {
        let regular: Vec<OrderData> = self
            .signed_get(
                "/api/v2/spot/trade/history-orders",
                vec![("symbol", symbol.market_id())],
            )
            .await?;

        let now = chrono::Utc::now().timestamp_millis();
        let page: PlanOrderPage = self
            .signed_get(
                "/api/v2/spot/trade/history-plan-order",
                vec![
                    ("symbol", symbol.market_id()),
                    ("startTime", (now - PLAN_HISTORY_WINDOW_MS).to_string()),
                    ("endTime", now.to_string()),
                ],
            )
            .await?;

        let mut timed = Vec::new();
        for data in &regular {
            timed.push((data.timestamp(), data.to_order()?));
        }
        for data in page.order_list.unwrap_or_default() {
            timed.push((data.timestamp(), data.to_order()?));
        }
        timed.retain(|(_, order)| order.status == OrderStatus::Filled);
        timed.sort_by_key(|(ts, _)| *ts);

        Ok(timed.into_iter().map(|(_, order)| order).collect())
    }

    async fn cancel_order(&self, id: &str, symbol: &Symbol) -> ExchangeResult<()> {
        let regular: ExchangeResult<serde_json::Value> = self
            .signed_post(
                "/api/v2/spot/trade/cancel-order",
                json!({ "symbol": symbol.market_id(), "orderId": id }),
            )
            .await;

        match regular {
            Ok(_) => Ok(()),
            Err(ExchangeError::OrderNotFound(_)) => {
                // not a regular order: try the trigger order book
                let plan: ExchangeResult<serde_json::Value> = self
                    .signed_post(
                        "/api/v2/spot/trade/cancel-plan-order",
                        json!({ "orderId": id }),
                    )
                    .await;
                match plan {
                    Ok(_) => Ok(()),
                    Err(ExchangeError::OrderNotFound(msg)) => {
                        debug!("Order {} already gone: {}", id, msg);
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn place_limit_order(
        &self,
        symbol: &Symbol,
        side: Side,
        amount: f64,
        price: f64,
    ) -> ExchangeResult<String> {
        let info = self.symbol_info(symbol).await?;
        self.place_order(
            symbol,
            side,
            "limit",
            info.format_amount(amount)?,
            Some(info.format_price(price)?),
        )
        .await
    }

    async fn place_trigger_limit_order(
        &self,
        symbol: &Symbol,
        side: Side,
        amount: f64,
        trigger_price: f64,
        price: f64,
    ) -> ExchangeResult<String> {
        self.place_plan_order(symbol, side, amount, trigger_price, Some(price))
            .await
    }

    async fn place_trigger_market_order(
        &self,
        symbol: &Symbol,
        side: Side,
        amount: f64,
        trigger_price: f64,
    ) -> ExchangeResult<String> {
        self.place_plan_order(symbol, side, amount, trigger_price, None)
            .await
    }

    async fn place_market_order(
        &self,
        symbol: &Symbol,
        side: Side,
        amount: f64,
    ) -> ExchangeResult<String> {
        let info = self.symbol_info(symbol).await?;
        // market buys are sized in quote currency
        let size = match side {
            Side::Buy => {
                let last = self.fetch_ticker(symbol).await?.last;
                round_down(amount * last, info.price_precision)?
            }
            Side::Sell => info.format_amount(amount)?,
        };
        self.place_order(symbol, side, "market", size, None).await
    }

    async fn fetch_min_amount_tradable(&self, symbol: &Symbol) -> ExchangeResult<f64> {
        Ok(self.symbol_info(symbol).await?.min_amount())
    }

    async fn fetch_balance(&self) -> ExchangeResult<HashMap<String, Balance>> {
        let assets: Vec<AssetData> = self
            .signed_get("/api/v2/spot/account/assets", Vec::new())
            .await?;
        assets
            .iter()
            .map(|a| Ok((a.coin.to_uppercase(), a.to_balance()?)))
            .collect()
    }

    async fn fetch_ticker(&self, symbol: &Symbol) -> ExchangeResult<Ticker> {
        let market = symbol.market_id();
        let tickers: Vec<TickerData> = self
            .public_get("/api/v2/spot/market/tickers", vec![("symbol", market.clone())])
            .await?;
        tickers
            .iter()
            .find(|t| t.symbol == market)
            .ok_or_else(|| ExchangeError::Parse(format!("no ticker for {}", market)))?
            .to_ticker()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_success() {
        let data: Vec<PlacedOrder> = decode_response(
            StatusCode::OK,
            r#"{"code":"00000","msg":"success","data":[{"orderId":"123"}]}"#,
        )
        .unwrap();
        assert_eq!(data[0].order_id, "123");
    }

    #[test]
    fn test_decode_api_error() {
        let result: ExchangeResult<serde_json::Value> = decode_response(
            StatusCode::BAD_REQUEST,
            r#"{"code":"43001","msg":"The order does not exist","data":null}"#,
        );
        assert!(matches!(result, Err(ExchangeError::OrderNotFound(_))));
    }

    #[test]
    fn test_decode_transport_errors() {
        let limited: ExchangeResult<serde_json::Value> =
            decode_response(StatusCode::TOO_MANY_REQUESTS, "");
        assert!(matches!(limited, Err(ExchangeError::RateLimited)));

        let down: ExchangeResult<serde_json::Value> =
            decode_response(StatusCode::BAD_GATEWAY, "<html>");
        assert!(matches!(down, Err(ExchangeError::Unavailable(_))));

        let garbage: ExchangeResult<serde_json::Value> = decode_response(StatusCode::OK, "nope");
        assert!(matches!(garbage, Err(ExchangeError::Parse(_))));
    }

    #[test]
    fn test_config_builder() {
        let config = ClientConfig::default()
            .with_base_url("http://localhost:8080/")
            .with_max_retries(5)
            .with_timeout(Duration::from_secs(10))
            .with_rate_limit(20)
            .with_circuit_breaker_threshold(2);

        assert_eq!(config.base_url, "http://localhost:8080");
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.timeout, Duration::from_secs(10));
        assert_eq!(config.requests_per_second, 20);
        assert_eq!(config.circuit_breaker.failure_threshold, 2);
    }

    #[tokio::test]
    async fn test_unreachable_host_opens_breaker() {
        let config = ClientConfig::default()
            .with_base_url("http://127.0.0.1:9")
            .with_max_retries(0)
            .with_timeout(Duration::from_millis(200))
            .with_circuit_breaker_threshold(1);
        let client = BitgetSpot::new(Credentials::new("k", "s", "p"), config).unwrap();
        let symbol = Symbol::new("BTC/USDT");

        assert!(matches!(
            client.fetch_ticker(&symbol).await,
            Err(ExchangeError::Unavailable(_))
        ));
        // second call fails fast on the open breaker
        match client.fetch_ticker(&symbol).await {
            Err(ExchangeError::Unavailable(msg)) => assert!(msg.contains("circuit breaker")),
            other => panic!("expected open breaker, got {:?}", other.map(|t| t.last)),
        }
    }
}
