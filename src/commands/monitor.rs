//! Monitor command - one cycle, then poll exit conditions until the position ends

use anyhow::Result;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use envelope_bot::driver::{
    cancel_on_ctrl_c, run_monitor, MonitorExit, EXIT_DATA_ERROR, EXIT_FATAL, EXIT_TRADED,
};

use super::{build_controller, live_exchange, load_config};

pub fn run(config_path: PathBuf, interval: Option<u64>) -> Result<i32> {
    let Some(config) = load_config(&config_path)? else {
        return Ok(EXIT_DATA_ERROR);
    };
    let interval_secs = interval.unwrap_or(config.monitor.interval_secs).max(1);

    let controller = build_controller(&config, live_exchange(&config)?, &config.state.dir)?;

    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(async {
        let cancel = CancellationToken::new();
        cancel_on_ctrl_c(cancel.clone());
        run_monitor(&controller, Duration::from_secs(interval_secs), cancel).await
    });

    match result {
        Ok(MonitorExit::Cancelled) => {
            info!("Monitor session ended by operator");
            Ok(EXIT_TRADED)
        }
        Ok(MonitorExit::Event(event)) => {
            info!("Monitor session ended: {:?}", event);
            Ok(EXIT_TRADED)
        }
        Err(e) if e.is_data_error() => {
            error!("Monitor aborted: {}", e);
            Ok(EXIT_DATA_ERROR)
        }
        Err(e) => {
            error!("Monitor failed: {}", e);
            Ok(EXIT_FATAL)
        }
    }
}
