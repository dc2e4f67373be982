//! Reset-gate command - operator override after a stop-loss

use anyhow::Result;
use std::path::PathBuf;
use tracing::{info, warn};

use envelope_bot::driver::{EXIT_DATA_ERROR, EXIT_TRADED};

use super::{load_config, open_store};

pub fn run(config_path: PathBuf) -> Result<i32> {
    let Some(config) = load_config(&config_path)? else {
        return Ok(EXIT_DATA_ERROR);
    };
    let store = open_store(&config, &config.state.dir)?;
    let _lock = store.lock()?;

    let state = store.read()?;
    if state.is_ok_to_trade() {
        info!("{} is already {}, nothing to reset", config.strategy.symbol, state.status);
        return Ok(EXIT_TRADED);
    }

    let resumed = state.resumed();
    store.write(&resumed)?;
    warn!(
        "Gate for {} reset by operator: {} -> {} (last side {:?})",
        config.strategy.symbol, state.status, resumed.status, resumed.last_side
    );
    Ok(EXIT_TRADED)
}
