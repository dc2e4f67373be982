//! Envelope bot - main entry point
//!
//! This binary provides four subcommands:
//! - run: one strategy cycle (cron style), live or against a CSV paper market
//! - monitor: one cycle, then poll exit conditions until the position ends
//! - status: print the tracker record
//! - reset-gate: operator override re-enabling entries after a stop-loss

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;

#[derive(Parser, Debug)]
#[command(name = "envelope-bot")]
#[command(about = "Mean-reversion envelope strategy for spot markets", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "configs/envelope_btc_usdt.json")]
    config: PathBuf,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one strategy cycle
    Run {
        /// Trade against a simulated exchange fed from this candle CSV
        #[arg(long)]
        paper: Option<PathBuf>,

        /// Quote balance of the paper account
        #[arg(long, default_value = "1000")]
        paper_balance: f64,

        /// Exit with 10 instead of 0 when entries stay disabled after a stop-loss
        #[arg(long)]
        distinct_gated_exit: bool,
    },

    /// Run one cycle, then poll exit conditions until the position ends
    Monitor {
        /// Poll interval in seconds (overrides config)
        #[arg(long)]
        interval: Option<u64>,
    },

    /// Print the tracker record for the configured symbol
    Status,

    /// Re-enable entries after a stop-loss, keeping the recorded side
    ResetGate,
}

fn setup_logging(verbose: bool, command_name: &str) -> Result<()> {
    std::fs::create_dir_all("logs")?;

    // {command}_{date}.log
    let log_filename = format!(
        "{}_{}.log",
        command_name,
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    );
    let log_path = PathBuf::from("logs").join(&log_filename);

    let level = if verbose { "debug" } else { "info" };
    let filter_str = format!(
        "{},hyper=warn,hyper_util=warn,reqwest=warn,rustls=warn,h2=warn",
        level
    );
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    let file_appender = tracing_appender::rolling::never("logs", &log_filename);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(true);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_appender)
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    info!("Log file: {}", log_path.display());
    Ok(())
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let command_name = match &cli.command {
        Commands::Run { .. } => "run",
        Commands::Monitor { .. } => "monitor",
        Commands::Status => "status",
        Commands::ResetGate => "reset_gate",
    };
    setup_logging(cli.verbose, command_name)?;

    let code = match cli.command {
        Commands::Run {
            paper,
            paper_balance,
            distinct_gated_exit,
        } => commands::run::run(cli.config, paper, paper_balance, distinct_gated_exit)?,
        Commands::Monitor { interval } => commands::monitor::run(cli.config, interval)?,
        Commands::Status => commands::status::run(cli.config)?,
        Commands::ResetGate => commands::reset_gate::run(cli.config)?,
    };

    std::process::exit(code);
}
