//! Status command - print the tracker record

use anyhow::Result;
use std::path::PathBuf;

use envelope_bot::driver::{EXIT_DATA_ERROR, EXIT_TRADED};

use super::{load_config, open_store, print_banner};

pub fn run(config_path: PathBuf) -> Result<i32> {
    let Some(config) = load_config(&config_path)? else {
        return Ok(EXIT_DATA_ERROR);
    };
    let store = open_store(&config, &config.state.dir)?;
    let state = store.read()?;

    print_banner(&format!("TRACKER: {}", config.strategy.symbol));
    println!("  Location:       {}", store.location());
    println!("  Status:         {}", state.status);
    println!(
        "  Last side:      {}",
        state.last_side.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string())
    );
    println!("  Stop-loss ids:  {:?}", state.stop_loss_ids);
    println!("{}\n", "=".repeat(60));

    Ok(EXIT_TRADED)
}
