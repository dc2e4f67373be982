//! Envelope Trading Bot
//!
//! Mean-reversion "envelope" strategy for a single spot symbol. Each cycle
//! computes a ladder of entry bands below a moving average, stages trigger
//! buys on the bands not yet consumed, protects an open position with
//! take-profit and stop-loss orders, and keeps a small per-symbol tracker so
//! that a stop-loss disables new entries until price recovers.
//!
//! # Layout
//!
//! - [`bands`]: reference average and band ladder (fixed or ATR-adaptive)
//! - [`tracker`]: persisted gate state (JSON file or SQLite row)
//! - [`reconciler`]: pure interpretation of exchange state
//! - [`controller`]: the per-cycle state machine
//! - [`driver`]: single-shot and monitor loops
//! - [`exchange`]: exchange trait, Bitget binding and paper exchange
//!
//! ## Paper Example
//! ```no_run
//! use std::sync::Arc;
//! use envelope_bot::config::StrategyConfig;
//! use envelope_bot::controller::EnvelopeController;
//! use envelope_bot::exchange::PaperExchange;
//! use envelope_bot::tracker::create_tracker_store;
//! use envelope_bot::Symbol;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let symbol = Symbol::new("BTC/USDT");
//!     let exchange = PaperExchange::from_csv(symbol.clone(), "data/BTCUSDT_1h.csv")?;
//!     exchange.set_balance("USDT", 1000.0);
//!
//!     let store = create_tracker_store("state", "json", &symbol)?;
//!     let controller = EnvelopeController::new(Arc::new(exchange), store, StrategyConfig::default());
//!     let report = controller.run_cycle().await?;
//!     println!("{} actions", report.actions.len());
//!     Ok(())
//! }
//! ```

pub mod bands;
pub mod common;
pub mod config;
pub mod controller;
pub mod data;
pub mod driver;
pub mod exchange;
pub mod indicators;
pub mod reconciler;
pub mod tracker;
pub mod types;

pub use types::*;
