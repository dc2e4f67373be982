//! Subcommand implementations

pub mod monitor;
pub mod reset_gate;
pub mod run;
pub mod status;

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

use envelope_bot::config::Config;
use envelope_bot::controller::EnvelopeController;
use envelope_bot::exchange::{BitgetSpot, Credentials, Exchange, PaperExchange};
use envelope_bot::tracker::{create_tracker_store, TrackerStore};

/// Load and validate the configuration; `None` means it was rejected
pub fn load_config(path: &Path) -> Result<Option<Config>> {
    let config = Config::from_file(path)
        .with_context(|| format!("Failed to load config {}", path.display()))?;
    if let Err(e) = config.validate() {
        error!("Invalid configuration {}: {:#}", path.display(), e);
        return Ok(None);
    }
    info!(
        "Loaded config {} for {} ({})",
        path.display(),
        config.strategy.symbol,
        config.strategy.timeframe
    );
    Ok(Some(config))
}

pub fn open_store(config: &Config, state_dir: &Path) -> Result<Box<dyn TrackerStore>> {
    let store = create_tracker_store(state_dir, &config.state.backend, &config.strategy.symbol)?;
    info!("Tracker store: {}", store.location());
    Ok(store)
}

pub fn live_exchange(config: &Config) -> Result<Arc<dyn Exchange>> {
    let credentials = Credentials::load(&config.exchange.secret_path, &config.exchange.key_name)?;
    let client = BitgetSpot::new(credentials, config.exchange.client_config())?;
    Ok(Arc::new(client))
}

pub fn paper_exchange(config: &Config, csv: &Path, balance: f64) -> Result<Arc<dyn Exchange>> {
    let symbol = config.strategy.symbol.clone();
    let exchange = PaperExchange::from_csv(symbol.clone(), csv)?;
    exchange.set_balance(symbol.quote(), balance);
    info!("Paper account: {} {}", balance, symbol.quote());
    Ok(Arc::new(exchange))
}

/// Paper runs keep their trackers apart from live ones
pub fn paper_state_dir(config: &Config) -> PathBuf {
    config.state.dir.join("paper")
}

pub fn build_controller(
    config: &Config,
    exchange: Arc<dyn Exchange>,
    state_dir: &Path,
) -> Result<EnvelopeController> {
    let store = open_store(config, state_dir)?;
    Ok(EnvelopeController::new(exchange, store, config.strategy.clone()))
}

pub fn print_banner(title: &str) {
    println!("\n{}", "=".repeat(60));
    println!("{}", title);
    println!("{}", "=".repeat(60));
}
