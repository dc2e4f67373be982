//! Paper exchange
//!
//! In-memory stand-in for a spot exchange. Orders rest in a book until they
//! are canceled or filled, either explicitly with [`PaperExchange::fill_order`]
//! or by moving the price with [`PaperExchange::trigger_at_price`]. Every
//! call that changes the book is appended to an action log.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use super::{Exchange, ExchangeError, ExchangeResult};
use crate::data::load_candles_csv;
use crate::{Balance, Candle, ExchangeOrder, OrderKind, OrderStatus, Side, Symbol, Ticker};

/// Book-changing event recorded by the paper exchange
#[derive(Debug, Clone, PartialEq)]
pub enum PaperAction {
    Placed(ExchangeOrder),
    Canceled { id: String },
    Filled { id: String, price: f64 },
}

#[derive(Debug, Default)]
struct PaperBook {
    candles: Vec<Candle>,
    open: Vec<ExchangeOrder>,
    /// Filled orders, oldest first
    closed: Vec<ExchangeOrder>,
    canceled: Vec<ExchangeOrder>,
    balances: HashMap<String, Balance>,
    min_amount: f64,
    last_price: Option<f64>,
    actions: Vec<PaperAction>,
    reject_placements: usize,
    /// Orders whose cancellation is refused
    pinned: HashSet<String>,
    unavailable: bool,
}

impl PaperBook {
    fn last_price(&self) -> Option<f64> {
        self.last_price.or_else(|| self.candles.last().map(|c| c.close))
    }

    fn check_available(&self) -> ExchangeResult<()> {
        if self.unavailable {
            Err(ExchangeError::Unavailable("paper exchange offline".to_string()))
        } else {
            Ok(())
        }
    }

    fn adjust(&mut self, currency: &str, delta: f64) {
        let balance = self.balances.entry(currency.to_string()).or_default();
        balance.free += delta;
        balance.total = balance.free + balance.used;
    }

    fn settle(&mut self, symbol: &Symbol, side: Side, amount: f64, price: f64) {
        let notional = amount * price;
        match side {
            Side::Buy => {
                self.adjust(symbol.quote(), -notional);
                self.adjust(symbol.base(), amount);
            }
            Side::Sell => {
                self.adjust(symbol.base(), -amount);
                self.adjust(symbol.quote(), notional);
            }
        }
    }

    fn place(
        &mut self,
        side: Side,
        kind: OrderKind,
        amount: f64,
        price: f64,
        trigger_price: Option<f64>,
    ) -> ExchangeResult<String> {
        self.check_available()?;
        if self.reject_placements > 0 {
            self.reject_placements -= 1;
            return Err(ExchangeError::Rejected {
                code: "paper".to_string(),
                message: "placement rejected by simulation".to_string(),
            });
        }
        if !(amount > 0.0) {
            return Err(ExchangeError::InvalidRequest(format!(
                "amount must be positive, got {}",
                amount
            )));
        }

        let order = ExchangeOrder {
            id: format!("paper-{}", uuid::Uuid::new_v4().simple()),
            side,
            kind,
            price,
            trigger_price,
            amount,
            status: OrderStatus::Open,
        };
        debug!(
            "Paper order placed: {} {:?} {} @ {} (trigger {:?})",
            order.id, kind, side, price, trigger_price
        );
        let id = order.id.clone();
        self.actions.push(PaperAction::Placed(order.clone()));
        self.open.push(order);
        Ok(id)
    }

    fn fill_at(&mut self, symbol: &Symbol, idx: usize, price: f64) -> ExchangeOrder {
        let mut order = self.open.remove(idx);
        order.status = OrderStatus::Filled;
        if order.kind == OrderKind::Market || order.kind == OrderKind::TriggerMarket {
            order.price = price;
        }
        self.settle(symbol, order.side, order.amount, order.price);
        self.actions.push(PaperAction::Filled {
            id: order.id.clone(),
            price: order.price,
        });
        self.closed.push(order.clone());
        order
    }
}

/// Whether a resting order executes with the market at `price`
fn executes_at(order: &ExchangeOrder, price: f64) -> bool {
    let triggered = match (order.kind, order.trigger_price) {
        (OrderKind::TriggerLimit | OrderKind::TriggerMarket, Some(trigger)) => price <= trigger,
        (OrderKind::TriggerLimit | OrderKind::TriggerMarket, None) => false,
        _ => true,
    };
    if !triggered {
        return false;
    }

    match (order.kind, order.side) {
        (OrderKind::Market | OrderKind::TriggerMarket, _) => true,
        (_, Side::Buy) => price <= order.price,
        (_, Side::Sell) => price >= order.price,
    }
}

/// Simulated single-symbol spot exchange
#[derive(Debug)]
pub struct PaperExchange {
    symbol: Symbol,
    book: Mutex<PaperBook>,
}

impl PaperExchange {
    pub fn new(symbol: Symbol) -> Self {
        Self {
            symbol,
            book: Mutex::new(PaperBook::default()),
        }
    }

    pub fn with_candles(symbol: Symbol, candles: Vec<Candle>) -> Self {
        let exchange = Self::new(symbol);
        exchange.book().candles = candles;
        exchange
    }

    /// Load candles from a `datetime,open,high,low,close,volume` CSV file
    pub fn from_csv(symbol: Symbol, path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let candles = load_candles_csv(path)?;
        info!("Paper exchange loaded {} candles for {}", candles.len(), symbol);
        Ok(Self::with_candles(symbol, candles))
    }

    fn book(&self) -> MutexGuard<'_, PaperBook> {
        self.book.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_symbol(&self, symbol: &Symbol) -> ExchangeResult<()> {
        if symbol == &self.symbol {
            Ok(())
        } else {
            Err(ExchangeError::InvalidRequest(format!(
                "paper exchange trades {} only, got {}",
                self.symbol, symbol
            )))
        }
    }

    // ==================== SIMULATION CONTROLS ====================

    pub fn set_balance(&self, currency: &str, free: f64) {
        self.book().balances.insert(
            currency.to_string(),
            Balance {
                total: free,
                free,
                used: 0.0,
            },
        );
    }

    pub fn set_min_amount(&self, min_amount: f64) {
        self.book().min_amount = min_amount;
    }

    pub fn set_last_price(&self, price: f64) {
        self.book().last_price = Some(price);
    }

    pub fn push_candle(&self, candle: Candle) {
        self.book().candles.push(candle);
    }

    /// Put an order straight into the book without logging a placement
    pub fn seed_open_order(&self, order: ExchangeOrder) {
        self.book().open.push(order);
    }

    /// Record a historical fill
    pub fn seed_closed_order(&self, mut order: ExchangeOrder) {
        order.status = OrderStatus::Filled;
        self.book().closed.push(order);
    }

    /// Refuse cancellation of `id`, as for an order the exchange is already
    /// executing
    pub fn pin_order(&self, id: &str) {
        self.book().pinned.insert(id.to_string());
    }

    /// Reject the next `n` placements
    pub fn reject_next_placements(&self, n: usize) {
        self.book().reject_placements = n;
    }

    /// Make every call fail as if the exchange were down
    pub fn set_unavailable(&self, unavailable: bool) {
        self.book().unavailable = unavailable;
    }

    /// Fill a resting order at its limit price (market orders at the last price)
    pub fn fill_order(&self, id: &str) -> Option<ExchangeOrder> {
        let mut book = self.book();
        let idx = book.open.iter().position(|o| o.id == id)?;
        let price = book
            .last_price()
            .unwrap_or(book.open[idx].price);
        Some(book.fill_at(&self.symbol, idx, price))
    }

    /// Move the market to `price` and fill every order that executes there
    pub fn trigger_at_price(&self, price: f64) -> Vec<ExchangeOrder> {
        let mut book = self.book();
        book.last_price = Some(price);

        let mut filled = Vec::new();
        let mut idx = 0;
        while idx < book.open.len() {
            if executes_at(&book.open[idx], price) {
                filled.push(book.fill_at(&self.symbol, idx, price));
            } else {
                idx += 1;
            }
        }
        filled
    }

    // ==================== INSPECTION ====================

    pub fn actions(&self) -> Vec<PaperAction> {
        self.book().actions.clone()
    }

    pub fn clear_actions(&self) {
        self.book().actions.clear();
    }

    /// Orders placed since the action log was last cleared
    pub fn placed_orders(&self) -> Vec<ExchangeOrder> {
        self.book()
            .actions
            .iter()
            .filter_map(|a| match a {
                PaperAction::Placed(order) => Some(order.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn open_orders(&self) -> Vec<ExchangeOrder> {
        self.book().open.clone()
    }

    pub fn canceled_orders(&self) -> Vec<ExchangeOrder> {
        self.book().canceled.clone()
    }

    pub fn balance(&self, currency: &str) -> Balance {
        self.book().balances.get(currency).copied().unwrap_or_default()
    }
}

#[async_trait]
impl Exchange for PaperExchange {
    async fn fetch_ohlcv(
        &self,
        symbol: &Symbol,
        _timeframe: &str,
        limit: usize,
    ) -> ExchangeResult<Vec<Candle>> {
        self.check_symbol(symbol)?;
        let book = self.book();
        book.check_available()?;
        let start = book.candles.len().saturating_sub(limit);
        Ok(book.candles[start..].to_vec())
    }

    async fn fetch_open_orders(&self, symbol: &Symbol) -> ExchangeResult<Vec<ExchangeOrder>> {
        self.check_symbol(symbol)?;
        let book = self.book();
        book.check_available()?;
        Ok(book.open.clone())
    }

    async fn fetch_closed_orders(&self, symbol: &Symbol) -> ExchangeResult<Vec<ExchangeOrder>> {
        self.check_symbol(symbol)?;
        let book = self.book();
        book.check_available()?;
        Ok(book.closed.clone())
    }

    async fn cancel_order(&self, id: &str, symbol: &Symbol) -> ExchangeResult<()> {
        self.check_symbol(symbol)?;
        let mut book = self.book();
        book.check_available()?;
        if book.pinned.contains(id) {
            return Err(ExchangeError::Rejected {
                code: "paper".to_string(),
                message: format!("order {} cannot be cancelled", id),
            });
        }

        match book.open.iter().position(|o| o.id == id) {
            Some(idx) => {
                let mut order = book.open.remove(idx);
                order.status = OrderStatus::Canceled;
                book.actions.push(PaperAction::Canceled { id: id.to_string() });
                book.canceled.push(order);
                debug!("Paper order canceled: {}", id);
            }
            None => debug!("Paper order {} already gone", id),
        }
        Ok(())
    }

    async fn place_limit_order(
        &self,
        symbol: &Symbol,
        side: Side,
        amount: f64,
        price: f64,
    ) -> ExchangeResult<String> {
        self.check_symbol(symbol)?;
        self.book().place(side, OrderKind::Limit, amount, price, None)
    }

    async fn place_trigger_limit_order(
        &self,
        symbol: &Symbol,
        side: Side,
        amount: f64,
        trigger_price: f64,
        price: f64,
    ) -> ExchangeResult<String> {
        self.check_symbol(symbol)?;
        self.book()
            .place(side, OrderKind::TriggerLimit, amount, price, Some(trigger_price))
    }

    async fn place_trigger_market_order(
        &self,
        symbol: &Symbol,
        side: Side,
        amount: f64,
        trigger_price: f64,
    ) -> ExchangeResult<String> {
        self.check_symbol(symbol)?;
        self.book().place(
            side,
            OrderKind::TriggerMarket,
            amount,
            trigger_price,
            Some(trigger_price),
        )
    }

    async fn place_market_order(
        &self,
        symbol: &Symbol,
        side: Side,
        amount: f64,
    ) -> ExchangeResult<String> {
        self.check_symbol(symbol)?;
        let mut book = self.book();
        let price = book
            .last_price()
            .ok_or_else(|| ExchangeError::InvalidRequest("no market price yet".to_string()))?;
        let id = book.place(side, OrderKind::Market, amount, price, None)?;
        let idx = book.open.len() - 1;
        book.fill_at(&self.symbol, idx, price);
        Ok(id)
    }

    async fn fetch_min_amount_tradable(&self, symbol: &Symbol) -> ExchangeResult<f64> {
        self.check_symbol(symbol)?;
        let book = self.book();
        book.check_available()?;
        Ok(book.min_amount)
    }

    async fn fetch_balance(&self) -> ExchangeResult<HashMap<String, Balance>> {
        let book = self.book();
        book.check_available()?;
        Ok(book.balances.clone())
    }

    async fn fetch_ticker(&self, symbol: &Symbol) -> ExchangeResult<Ticker> {
        self.check_symbol(symbol)?;
        let book = self.book();
        book.check_available()?;
        let last = book
            .last_price()
            .ok_or_else(|| ExchangeError::InvalidRequest("no market price yet".to_string()))?;
        Ok(Ticker {
            last,
            bid: None,
            ask: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn symbol() -> Symbol {
        Symbol::new("BTC/USDT")
    }

    #[tokio::test]
    async fn test_place_cancel_and_vanished_cancel() {
        let ex = PaperExchange::new(symbol());
        let id = ex
            .place_trigger_limit_order(&symbol(), Side::Buy, 1.0, 93.465, 93.0)
            .await
            .unwrap();
        assert_eq!(ex.fetch_open_orders(&symbol()).await.unwrap().len(), 1);

        ex.cancel_order(&id, &symbol()).await.unwrap();
        assert!(ex.fetch_open_orders(&symbol()).await.unwrap().is_empty());
        // second cancel of the same id is a no-op
        ex.cancel_order(&id, &symbol()).await.unwrap();

        // canceled orders never show up as closed
        assert!(ex.fetch_closed_orders(&symbol()).await.unwrap().is_empty());
        assert_eq!(ex.canceled_orders().len(), 1);
    }

    #[tokio::test]
    async fn test_trigger_limit_buy_fills_when_band_touched() {
        let ex = PaperExchange::new(symbol());
        ex.set_balance("USDT", 1000.0);
        ex.place_trigger_limit_order(&symbol(), Side::Buy, 2.0, 93.465, 93.0)
            .await
            .unwrap();

        // above trigger: nothing
        assert!(ex.trigger_at_price(95.0).is_empty());
        // triggered but limit not reached
        assert!(ex.trigger_at_price(93.2).is_empty());

        let filled = ex.trigger_at_price(92.9);
        assert_eq!(filled.len(), 1);
        assert_eq!(filled[0].status, OrderStatus::Filled);
        assert_eq!(ex.balance("BTC").free, 2.0);
        assert_eq!(ex.balance("USDT").free, 1000.0 - 186.0);
    }

    #[tokio::test]
    async fn test_stop_loss_sell_fills_on_drop() {
        let ex = PaperExchange::new(symbol());
        let tp = ex
            .place_limit_order(&symbol(), Side::Sell, 1.0, 110.0)
            .await
            .unwrap();
        let sl = ex
            .place_trigger_limit_order(&symbol(), Side::Sell, 1.0, 60.0, 59.7)
            .await
            .unwrap();

        let filled = ex.trigger_at_price(59.9);
        assert_eq!(filled.len(), 1);
        assert_eq!(filled[0].id, sl);

        let closed = ex.fetch_closed_orders(&symbol()).await.unwrap();
        assert_eq!(closed.last().unwrap().id, sl);
        assert_eq!(ex.open_orders()[0].id, tp);
    }

    #[tokio::test]
    async fn test_market_order_fills_at_last_price() {
        let ex = PaperExchange::new(symbol());
        ex.set_last_price(120.0);
        let id = ex
            .place_market_order(&symbol(), Side::Sell, 0.5)
            .await
            .unwrap();

        let closed = ex.fetch_closed_orders(&symbol()).await.unwrap();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].id, id);
        assert_eq!(closed[0].price, 120.0);
        assert_eq!(ex.balance("USDT").free, 60.0);
    }

    #[tokio::test]
    async fn test_rejections_and_outage() {
        let ex = PaperExchange::new(symbol());
        ex.reject_next_placements(1);
        assert!(matches!(
            ex.place_limit_order(&symbol(), Side::Buy, 1.0, 90.0).await,
            Err(ExchangeError::Rejected { .. })
        ));
        assert!(ex.place_limit_order(&symbol(), Side::Buy, 1.0, 90.0).await.is_ok());

        ex.set_unavailable(true);
        assert!(matches!(
            ex.fetch_open_orders(&symbol()).await,
            Err(ExchangeError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_wrong_symbol_is_rejected() {
        let ex = PaperExchange::new(symbol());
        assert!(matches!(
            ex.fetch_open_orders(&Symbol::new("ETH/USDT")).await,
            Err(ExchangeError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_pinned_order_survives_cancel() {
        let ex = PaperExchange::new(symbol());
        let id = ex
            .place_limit_order(&symbol(), Side::Buy, 1.0, 100.0)
            .await
            .unwrap();
        ex.pin_order(&id);

        assert!(matches!(
            ex.cancel_order(&id, &symbol()).await,
            Err(ExchangeError::Rejected { .. })
        ));
        assert_eq!(ex.open_orders().len(), 1);
        assert!(ex.canceled_orders().is_empty());
    }
}
