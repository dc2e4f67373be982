//! Envelope strategy controller
//!
//! One cycle, in order:
//!
//! 1. Cancel every open order on the symbol
//! 2. Compute the band ladder from closed candles (data errors abort here)
//! 3. Reconcile against the orders still resting after the cancel: persist a
//!    freshly detected stop-loss trigger, infer the position
//! 4. Gate on the tracker status, resuming when price allows it
//! 5. Place staged trigger-limit buys on the bands not yet consumed
//! 6. Place exits for an open position (take-profit and stop-loss for a long,
//!    price-jump close for a short)
//! 7. Persist the tracker
//!
//! Order placements and cancellations never abort the cycle: each outcome is
//! logged with its context and collected in the [`CycleReport`].

use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::bands::{AverageMethod, Band, BandCalculator, BandError, BandSet};
use crate::config::StrategyConfig;
use crate::exchange::{Exchange, ExchangeError, ExchangeResult};
use crate::reconciler::{self, Gate, Position, Reconciliation};
use crate::tracker::{TrackerError, TrackerState, TrackerStatus, TrackerStore};
use crate::{Side, Symbol};

#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Bands(#[from] BandError),

    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error("exchange error while {stage}: {source}")]
    Exchange {
        stage: &'static str,
        #[source]
        source: ExchangeError,
    },
}

impl CycleError {
    /// Bad market data or strategy parameters, as opposed to an operational failure
    pub fn is_data_error(&self) -> bool {
        matches!(self, CycleError::Bands(_))
    }
}

trait StageContext<T> {
    fn stage(self, stage: &'static str) -> Result<T, CycleError>;
}

impl<T> StageContext<T> for ExchangeResult<T> {
    fn stage(self, stage: &'static str) -> Result<T, CycleError> {
        self.map_err(|source| CycleError::Exchange { stage, source })
    }
}

// ============================================================================
// Cycle report
// ============================================================================

/// An order action the controller decided on
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum OrderIntent {
    Cancel {
        order_id: String,
    },
    /// Staged buy on band `band` (1-based)
    Entry {
        band: usize,
        amount: f64,
        trigger_price: f64,
        price: f64,
    },
    TakeProfit {
        side: Side,
        amount: f64,
        price: f64,
    },
    StopLoss {
        side: Side,
        amount: f64,
        trigger_price: f64,
        price: f64,
    },
    /// Market close after a price jump
    ForceClose {
        side: Side,
        amount: f64,
    },
}

impl std::fmt::Display for OrderIntent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderIntent::Cancel { order_id } => write!(f, "cancel {}", order_id),
            OrderIntent::Entry {
                band,
                amount,
                trigger_price,
                price,
            } => write!(
                f,
                "entry band {}: buy {} trigger {} price {}",
                band, amount, trigger_price, price
            ),
            OrderIntent::TakeProfit {
                side,
                amount,
                price,
            } => write!(f, "take-profit: {} {} price {}", side, amount, price),
            OrderIntent::StopLoss {
                side,
                amount,
                trigger_price,
                price,
            } => write!(
                f,
                "stop-loss: {} {} stop {} limit {}",
                side, amount, trigger_price, price
            ),
            OrderIntent::ForceClose { side, amount } => {
                write!(f, "force close: {} {} at market", side, amount)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ActionStatus {
    /// Accepted; placements carry the new order id
    Done { order_id: Option<String> },
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderAction {
    pub intent: OrderIntent,
    pub status: ActionStatus,
}

impl OrderAction {
    pub fn succeeded(&self) -> bool {
        matches!(self.status, ActionStatus::Done { .. })
    }

    pub fn order_id(&self) -> Option<&str> {
        match &self.status {
            ActionStatus::Done { order_id } => order_id.as_deref(),
            ActionStatus::Failed { .. } => None,
        }
    }
}

/// Entry left out because it is below the exchange minimum
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedEntry {
    pub band: usize,
    pub amount: f64,
    pub min_amount: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleOutcome {
    /// Gate open; entries and exits were (re)placed
    Traded,
    /// Trading disabled after a stop-loss; nothing placed
    Gated,
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub symbol: Symbol,
    pub outcome: CycleOutcome,
    pub reference_price: f64,
    pub band_prices: Vec<f64>,
    pub reconciliation: Reconciliation,
    pub actions: Vec<OrderAction>,
    pub skipped: Vec<SkippedEntry>,
    /// Tracker as persisted at the end of the cycle
    pub tracker: TrackerState,
}

impl CycleReport {
    pub fn intents(&self) -> Vec<&OrderIntent> {
        self.actions.iter().map(|a| &a.intent).collect()
    }

    pub fn failures(&self) -> impl Iterator<Item = &OrderAction> {
        self.actions.iter().filter(|a| !a.succeeded())
    }

    pub fn entries(&self) -> impl Iterator<Item = &OrderAction> {
        self.actions
            .iter()
            .filter(|a| matches!(a.intent, OrderIntent::Entry { .. }))
    }
}

// ============================================================================
// Monitor events
// ============================================================================

/// Outcome of one lightweight poll between full cycles
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MonitorEvent {
    /// Position still open, nothing to do
    Holding { position: Position },
    /// A tracked protective order executed
    StopLossFilled { side: Side },
    /// No open order left on the symbol
    PositionClosed,
    /// Price moved against the position beyond the threshold and it was closed
    PriceJumpClosed {
        side: Side,
        last_price: f64,
        closed: bool,
    },
}

impl MonitorEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, MonitorEvent::Holding { .. })
    }
}

// ============================================================================
// Controller
// ============================================================================

/// Bands still to be (re)placed: all of them when flat, the furthest
/// `open_buy_orders` for a long, none for a short
pub fn entry_bands<'a>(
    bands: &'a BandSet,
    position: Option<&Position>,
    open_buy_orders: usize,
) -> &'a [Band] {
    match position {
        None => &bands.bands,
        Some(p) if p.side == Side::Buy => {
            let keep = open_buy_orders.min(bands.len());
            &bands.bands[bands.len() - keep..]
        }
        Some(_) => &[],
    }
}

pub struct EnvelopeController {
    exchange: Arc<dyn Exchange>,
    store: Box<dyn TrackerStore>,
    strategy: StrategyConfig,
}

impl EnvelopeController {
    pub fn new(
        exchange: Arc<dyn Exchange>,
        store: Box<dyn TrackerStore>,
        strategy: StrategyConfig,
    ) -> Self {
        Self {
            exchange,
            store,
            strategy,
        }
    }

    pub fn symbol(&self) -> &Symbol {
        &self.strategy.symbol
    }

    pub fn strategy(&self) -> &StrategyConfig {
        &self.strategy
    }

    pub fn store(&self) -> &dyn TrackerStore {
        self.store.as_ref()
    }

    fn calculator(&self) -> Result<BandCalculator, BandError> {
        let method = self.strategy.average_type.parse::<AverageMethod>()?;
        Ok(BandCalculator::new(
            method,
            self.strategy.average_period,
            self.strategy.band_mode(),
        ))
    }

    async fn execute(&self, intent: &OrderIntent) -> ExchangeResult<Option<String>> {
        let symbol = self.symbol();
        let ex = &self.exchange;
        match intent {
            OrderIntent::Cancel { order_id } => {
                ex.cancel_order(order_id, symbol).await?;
                Ok(None)
            }
            OrderIntent::Entry {
                amount,
                trigger_price,
                price,
                ..
            } => ex
                .place_trigger_limit_order(symbol, Side::Buy, *amount, *trigger_price, *price)
                .await
                .map(Some),
            OrderIntent::TakeProfit {
                side,
                amount,
                price,
            } => ex
                .place_limit_order(symbol, *side, *amount, *price)
                .await
                .map(Some),
            OrderIntent::StopLoss {
                side,
                amount,
                trigger_price,
                price,
            } => ex
                .place_trigger_limit_order(symbol, *side, *amount, *trigger_price, *price)
                .await
                .map(Some),
            OrderIntent::ForceClose { side, amount } => ex
                .place_market_order(symbol, *side, *amount)
                .await
                .map(Some),
        }
    }

    /// Run one order action; failures are logged and recorded, never raised
    async fn act(&self, actions: &mut Vec<OrderAction>, intent: OrderIntent) -> Option<String> {
        let status = match self.execute(&intent).await {
            Ok(order_id) => {
                info!("{}: {}", self.symbol(), intent);
                ActionStatus::Done { order_id }
            }
            Err(e) => {
                error!("{}: order action failed ({}): {}", self.symbol(), intent, e);
                ActionStatus::Failed {
                    reason: e.to_string(),
                }
            }
        };
        let order_id = match &status {
            ActionStatus::Done { order_id } => order_id.clone(),
            ActionStatus::Failed { .. } => None,
        };
        actions.push(OrderAction { intent, status });
        order_id
    }

    /// Run one full cycle under the tracker lock
    pub async fn run_cycle(&self) -> Result<CycleReport, CycleError> {
        let _lock = self.store.lock()?;
        let symbol = self.symbol().clone();
        info!(">>> starting execution for {}", symbol);

        // 1. cancel everything resting
        let stale_orders = self
            .exchange
            .fetch_open_orders(&symbol)
            .await
            .stage("fetching open orders")?;
        let mut actions = Vec::new();
        for order in &stale_orders {
            self.act(
                &mut actions,
                OrderIntent::Cancel {
                    order_id: order.id.clone(),
                },
            )
            .await;
        }
        info!("{} open orders cancelled", stale_orders.len());

        // 2. bands
        let calculator = self.calculator()?;
        let candles = self
            .exchange
            .fetch_ohlcv(&symbol, &self.strategy.timeframe, self.strategy.ohlcv_limit)
            .await
            .stage("fetching ohlcv")?;
        let bands = calculator.compute(&candles)?;
        info!(
            "ohlcv data fetched: average {:.4}, bands {:?}",
            bands.reference_price,
            bands.prices()
        );

        // 3. reconcile
        let mut tracker = self.store.read()?;
        let closed_orders = self
            .exchange
            .fetch_closed_orders(&symbol)
            .await
            .stage("fetching closed orders")?;
        // whatever survived the cancel is the position
        let open_orders = self
            .exchange
            .fetch_open_orders(&symbol)
            .await
            .stage("re-fetching open orders")?;
        let rec = reconciler::reconcile(
            &tracker,
            &open_orders,
            &closed_orders,
            bands.last_close,
            bands.reference_price,
        );

        if let Some(side) = rec.stop_loss_hit {
            tracker = TrackerState::stop_loss_triggered(side);
            self.store.write(&tracker)?;
            warn!("/!\\ stop loss was triggered ({} side)", side);
        }
        if let Some(position) = &rec.position {
            info!(
                "{} position is open: entry {} amount {}",
                position.side, position.entry_price, position.amount
            );
        }

        // 4. gate
        info!("okay to trade check, status was {}", tracker.status);
        match rec.gate {
            Gate::Hold => {
                info!(
                    "<<< status is still {} (last close {}, average {:.4})",
                    tracker.status, bands.last_close, bands.reference_price
                );
                return Ok(self.report(
                    CycleOutcome::Gated,
                    &bands,
                    rec,
                    actions,
                    Vec::new(),
                    tracker,
                ));
            }
            Gate::Resume => {
                tracker = tracker.resumed();
                self.store.write(&tracker)?;
                info!("status is now {}", TrackerStatus::OkToTrade);
            }
            Gate::Open => {}
        }

        // 5. entries
        let mut skipped = Vec::new();
        let to_place = entry_bands(&bands, rec.position.as_ref(), rec.open_buy_orders);
        if !to_place.is_empty() {
            let min_amount = self
                .exchange
                .fetch_min_amount_tradable(&symbol)
                .await
                .stage("fetching minimum amount")?;
            let balances = self
                .exchange
                .fetch_balance()
                .await
                .stage("fetching balance")?;
            let available = balances.get(symbol.quote()).map(|b| b.free).unwrap_or(0.0);
            let per_band = self.strategy.balance_fraction * available / bands.len() as f64;

            for band in to_place {
                let amount = per_band / band.price;
                if amount < min_amount {
                    warn!(
                        "/!\\ long order not placed for envelope {}, amount {} smaller than minimum requirement {}",
                        band.index, amount, min_amount
                    );
                    skipped.push(SkippedEntry {
                        band: band.index,
                        amount,
                        min_amount,
                    });
                    continue;
                }
                self.act(
                    &mut actions,
                    OrderIntent::Entry {
                        band: band.index,
                        amount,
                        trigger_price: band.trigger_price(self.strategy.trigger_price_delta),
                        price: band.price,
                    },
                )
                .await;
            }
        }

        // 6. exits
        let mut last_side = tracker.last_side;
        let mut stop_loss_ids = BTreeSet::new();
        if let Some(position) = &rec.position {
            last_side = Some(position.side);
            match position.side {
                Side::Buy => {
                    let close_side = position.closing_side();
                    self.act(
                        &mut actions,
                        OrderIntent::TakeProfit {
                            side: close_side,
                            amount: position.amount,
                            price: bands.reference_price,
                        },
                    )
                    .await;

                    let stop = position.entry_price * (1.0 - self.strategy.stop_loss_pct);
                    let sl_id = self
                        .act(
                            &mut actions,
                            OrderIntent::StopLoss {
                                side: close_side,
                                amount: position.amount,
                                trigger_price: stop,
                                price: stop * (1.0 - self.strategy.stop_limit_margin),
                            },
                        )
                        .await;
                    stop_loss_ids.extend(sl_id);
                }
                Side::Sell => {
                    if let Some(jump_pct) = self.strategy.price_jump_pct {
                        let last = self
                            .exchange
                            .fetch_ticker(&symbol)
                            .await
                            .stage("fetching ticker")?
                            .last;
                        if reconciler::price_jumped(position, last, jump_pct) {
                            warn!(
                                "/!\\ price jump: {} against {} position entered at {}",
                                last, position.side, position.entry_price
                            );
                            let close_side = position.closing_side();
                            let closed = self
                                .act(
                                    &mut actions,
                                    OrderIntent::ForceClose {
                                        side: close_side,
                                        amount: position.amount,
                                    },
                                )
                                .await;
                            if closed.is_some() {
                                last_side = Some(close_side);
                            }
                        }
                    }
                }
            }
        }

        // 7. persist
        tracker = TrackerState {
            status: TrackerStatus::OkToTrade,
            last_side,
            stop_loss_ids,
        };
        self.store.write(&tracker)?;

        let report = self.report(CycleOutcome::Traded, &bands, rec, actions, skipped, tracker);
        let failed = report.failures().count();
        if failed > 0 {
            warn!("<<< done with {} failed order action(s)", failed);
        } else {
            info!("<<< all done");
        }
        Ok(report)
    }

    fn report(
        &self,
        outcome: CycleOutcome,
        bands: &BandSet,
        reconciliation: Reconciliation,
        actions: Vec<OrderAction>,
        skipped: Vec<SkippedEntry>,
        tracker: TrackerState,
    ) -> CycleReport {
        CycleReport {
            symbol: self.symbol().clone(),
            outcome,
            reference_price: bands.reference_price,
            band_prices: bands.prices(),
            reconciliation,
            actions,
            skipped,
            tracker,
        }
    }

    /// Poll exit conditions only: stop-loss fill, position gone, price jump
    pub async fn monitor_tick(&self) -> Result<MonitorEvent, CycleError> {
        let _lock = self.store.lock()?;
        let symbol = self.symbol().clone();
        let tracker = self.store.read()?;

        let closed_orders = self
            .exchange
            .fetch_closed_orders(&symbol)
            .await
            .stage("fetching closed orders")?;
        if let Some(side) = reconciler::detect_stop_loss(&closed_orders, &tracker) {
            self.store.write(&TrackerState::stop_loss_triggered(side))?;
            warn!("/!\\ stop loss was triggered ({} side)", side);
            return Ok(MonitorEvent::StopLossFilled { side });
        }

        let open_orders = self
            .exchange
            .fetch_open_orders(&symbol)
            .await
            .stage("fetching open orders")?;
        let Some(position) = Position::from_open_orders(&open_orders) else {
            info!("No open order left on {}", symbol);
            return Ok(MonitorEvent::PositionClosed);
        };

        if let Some(jump_pct) = self.strategy.price_jump_pct {
            let last = self
                .exchange
                .fetch_ticker(&symbol)
                .await
                .stage("fetching ticker")?
                .last;
            if reconciler::price_jumped(&position, last, jump_pct) {
                warn!(
                    "/!\\ price jump: {} against {} position entered at {}",
                    last, position.side, position.entry_price
                );
                let mut actions = Vec::new();
                for order in &open_orders {
                    self.act(
                        &mut actions,
                        OrderIntent::Cancel {
                            order_id: order.id.clone(),
                        },
                    )
                    .await;
                }
                let close_side = position.closing_side();
                let closed = self
                    .act(
                        &mut actions,
                        OrderIntent::ForceClose {
                            side: close_side,
                            amount: position.amount,
                        },
                    )
                    .await
                    .is_some();
                if closed {
                    self.store.write(&TrackerState {
                        status: TrackerStatus::OkToTrade,
                        last_side: Some(close_side),
                        stop_loss_ids: BTreeSet::new(),
                    })?;
                }
                return Ok(MonitorEvent::PriceJumpClosed {
                    side: close_side,
                    last_price: last,
                    closed,
                });
            }
        }

        Ok(MonitorEvent::Holding { position })
    }
}
