//! Order reconciliation
//!
//! Pure interpretation of exchange state against the persisted tracker:
//! was a protective order executed, is a position open, may trading resume,
//! has price jumped against the position. Nothing here performs I/O.

use serde::Serialize;

use crate::tracker::TrackerState;
use crate::{ExchangeOrder, OrderKind, Side};

/// Position inferred from the open-order list.
///
/// A spot account has no position entity; an open order on the symbol is taken
/// as evidence of one and the first open order describes it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Position {
    pub side: Side,
    pub entry_price: f64,
    pub amount: f64,
    pub order_id: String,
}

impl Position {
    pub fn from_open_orders(open_orders: &[ExchangeOrder]) -> Option<Position> {
        open_orders.first().map(|order| Position {
            side: order.side,
            entry_price: entry_price(order),
            amount: order.amount,
            order_id: order.id.clone(),
        })
    }

    /// Side of the order that closes this position
    pub fn closing_side(&self) -> Side {
        self.side.opposite()
    }
}

fn entry_price(order: &ExchangeOrder) -> f64 {
    match (order.kind, order.trigger_price) {
        (OrderKind::TriggerMarket, Some(trigger)) => trigger,
        _ => order.price,
    }
}

/// Whether new entries may be placed this cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Gate {
    /// Tracker already allows trading
    Open,
    /// Tracker was gated and the resume condition holds now
    Resume,
    /// Trading stays disabled this cycle
    Hold,
}

impl Gate {
    pub fn allows_trading(self) -> bool {
        !matches!(self, Gate::Hold)
    }
}

/// Facts derived once per cycle
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reconciliation {
    /// Side of a protective order seen executed since the last cycle
    pub stop_loss_hit: Option<Side>,
    pub position: Option<Position>,
    pub open_buy_orders: usize,
    pub gate: Gate,
}

/// The most recent executed order is one of ours: report its side
pub fn detect_stop_loss(closed_orders: &[ExchangeOrder], tracker: &TrackerState) -> Option<Side> {
    closed_orders
        .last()
        .filter(|order| tracker.stop_loss_ids.contains(&order.id))
        .map(|order| order.side)
}

/// After a stop-loss, trading resumes once price is back on the far side of
/// the reference average. Without a recorded side it never resumes on its own.
pub fn resume_allowed(last_side: Option<Side>, last_price: f64, reference_price: f64) -> bool {
    match last_side {
        Some(Side::Buy) => last_price >= reference_price,
        Some(Side::Sell) => last_price <= reference_price,
        None => false,
    }
}

/// Price moved against the position by more than `jump_pct` of the entry
pub fn price_jumped(position: &Position, last_price: f64, jump_pct: f64) -> bool {
    match position.side {
        Side::Buy => last_price < position.entry_price * (1.0 - jump_pct),
        Side::Sell => last_price > position.entry_price * (1.0 + jump_pct),
    }
}

/// Interpret one cycle's exchange snapshot.
///
/// `resume_price` is the close of the latest completed bar and
/// `reference_price` the band anchor computed from the same history.
pub fn reconcile(
    tracker: &TrackerState,
    open_orders: &[ExchangeOrder],
    closed_orders: &[ExchangeOrder],
    resume_price: f64,
    reference_price: f64,
) -> Reconciliation {
    let stop_loss_hit = detect_stop_loss(closed_orders, tracker);
    let position = Position::from_open_orders(open_orders);
    let open_buy_orders = open_orders.iter().filter(|o| o.side == Side::Buy).count();

    let gate = if stop_loss_hit.is_some() {
        // a fresh trigger never resumes in the cycle that saw it
        Gate::Hold
    } else if tracker.is_ok_to_trade() {
        Gate::Open
    } else if resume_allowed(tracker.last_side, resume_price, reference_price) {
        Gate::Resume
    } else {
        Gate::Hold
    };

    Reconciliation {
        stop_loss_hit,
        position,
        open_buy_orders,
        gate,
    }
}
