//! Run command - one strategy cycle, exit code reports the outcome

use anyhow::Result;
use std::path::PathBuf;

use envelope_bot::controller::{ActionStatus, CycleReport};
use envelope_bot::driver::{exit_code_with, run_once, EXIT_DATA_ERROR};

use super::{
    build_controller, live_exchange, load_config, paper_exchange, paper_state_dir, print_banner,
};

pub fn run(
    config_path: PathBuf,
    paper: Option<PathBuf>,
    paper_balance: f64,
    distinct_gated_exit: bool,
) -> Result<i32> {
    let Some(config) = load_config(&config_path)? else {
        return Ok(EXIT_DATA_ERROR);
    };

    let (exchange, state_dir) = match &paper {
        Some(csv) => (
            paper_exchange(&config, csv, paper_balance)?,
            paper_state_dir(&config),
        ),
        None => (live_exchange(&config)?, config.state.dir.clone()),
    };
    let controller = build_controller(&config, exchange, &state_dir)?;

    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(run_once(&controller));

    if let Ok(report) = &result {
        print_report(report);
    }
    Ok(exit_code_with(&result, distinct_gated_exit))
}

fn print_report(report: &CycleReport) {
    print_banner(&format!("CYCLE REPORT: {}", report.symbol));
    println!("  Outcome:    {:?}", report.outcome);
    println!("  Average:    {:.4}", report.reference_price);
    println!("  Bands:      {:?}", report.band_prices);
    println!("  Gate:       {:?}", report.reconciliation.gate);
    if let Some(position) = &report.reconciliation.position {
        println!(
            "  Position:   {} {} @ {}",
            position.side, position.amount, position.entry_price
        );
    }
    println!(
        "  Tracker:    {} (last side {:?})",
        report.tracker.status, report.tracker.last_side
    );

    for action in &report.actions {
        match &action.status {
            ActionStatus::Done { order_id } => println!(
                "  ✓ {}{}",
                action.intent,
                order_id
                    .as_deref()
                    .map(|id| format!(" [{}]", id))
                    .unwrap_or_default()
            ),
            ActionStatus::Failed { reason } => println!("  ✗ {}: {}", action.intent, reason),
        }
    }
    for skipped in &report.skipped {
        println!(
            "  - band {} skipped: amount {} below minimum {}",
            skipped.band, skipped.amount, skipped.min_amount
        );
    }
    println!("{}\n", "=".repeat(60));
}
