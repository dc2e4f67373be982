//! Cycle driver
//!
//! Single-shot mode runs one controller cycle and maps the outcome to a
//! process exit code. Monitor mode runs one full cycle, then polls exit
//! conditions on a fixed interval until one of them ends the position or the
//! cancellation token fires.

use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::controller::{CycleError, CycleOutcome, CycleReport, EnvelopeController, MonitorEvent};

/// Cycle completed; a gated cycle counts as completed unless a distinct code
/// was asked for
pub const EXIT_TRADED: i32 = 0;
/// Unexpected failure (exchange, tracker, lock)
pub const EXIT_FATAL: i32 = 1;
/// Aborted on market data or strategy parameters
pub const EXIT_DATA_ERROR: i32 = 2;
/// Entries still disabled after a stop-loss, only with `distinct_gated`
pub const EXIT_GATED: i32 = 10;

/// Process exit code for a cycle result. A gated cycle is a success.
pub fn exit_code(result: &Result<CycleReport, CycleError>) -> i32 {
    exit_code_with(result, false)
}

/// Like [`exit_code`], reporting a gated cycle as [`EXIT_GATED`] when
/// `distinct_gated` is set
pub fn exit_code_with(result: &Result<CycleReport, CycleError>, distinct_gated: bool) -> i32 {
    match result {
        Ok(report) => match report.outcome {
            CycleOutcome::Traded => EXIT_TRADED,
            CycleOutcome::Gated if distinct_gated => EXIT_GATED,
            CycleOutcome::Gated => EXIT_TRADED,
        },
        Err(e) if e.is_data_error() => EXIT_DATA_ERROR,
        Err(_) => EXIT_FATAL,
    }
}

/// Run exactly one cycle
pub async fn run_once(controller: &EnvelopeController) -> Result<CycleReport, CycleError> {
    match controller.run_cycle().await {
        Ok(report) => {
            info!(
                "Cycle finished for {}: {:?}, {} action(s), {} failed, {} skipped",
                report.symbol,
                report.outcome,
                report.actions.len(),
                report.failures().count(),
                report.skipped.len()
            );
            Ok(report)
        }
        Err(e) => {
            error!("Cycle aborted for {}: {}", controller.symbol(), e);
            Err(e)
        }
    }
}

/// Why the monitor stopped
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorExit {
    Event(MonitorEvent),
    Cancelled,
}

/// Full cycle, then poll every `poll_interval` until a terminal event.
///
/// Cancellation is observed only between polls, so an order call in flight is
/// never interrupted. Orders already placed are left on the exchange.
pub async fn run_monitor(
    controller: &EnvelopeController,
    poll_interval: Duration,
    cancel: CancellationToken,
) -> Result<MonitorExit, CycleError> {
    run_once(controller).await?;

    let mut ticker = interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately
    ticker.tick().await;

    info!(
        "Monitoring {} every {}s",
        controller.symbol(),
        poll_interval.as_secs_f64()
    );

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("Monitor cancelled, leaving orders in place");
                return Ok(MonitorExit::Cancelled);
            }
            _ = ticker.tick() => {}
        }

        match controller.monitor_tick().await {
            Ok(event) if event.is_terminal() => {
                info!("Monitor stopping: {:?}", event);
                return Ok(MonitorExit::Event(event));
            }
            Ok(_) => {}
            // transient exchange trouble: try again on the next poll
            Err(CycleError::Exchange { stage, source }) if source.is_transient() => {
                warn!("Poll failed while {}: {}", stage, source);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Cancel `token` on Ctrl+C
pub fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown signal received");
                token.cancel();
            }
            Err(e) => warn!("Failed to listen for Ctrl+C: {}", e),
        }
    });
}
