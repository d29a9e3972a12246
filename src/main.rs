//! Strategy optimizer - main entry point
//!
//! This binary provides three subcommands:
//! - optimize: Grid-search a strategy's parameters with train/test validation
//! - runs: List stored optimization runs
//! - show: Print the leaderboard of a stored run

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;

#[derive(Parser, Debug)]
#[command(name = "strategy-optimizer")]
#[command(about = "Parameter optimization and robustness validation for trading strategies", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Optimize strategy parameters against the evaluation service
    Optimize(commands::optimize::OptimizeArgs),

    /// List stored optimization runs
    Runs {
        /// Path to configuration file
        #[arg(short, long, default_value = "configs/optimizer.json")]
        config: String,

        /// Number of runs to list
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Show the leaderboard of a stored run
    Show {
        /// Run identifier (as printed by `runs`)
        run_id: String,

        /// Path to configuration file
        #[arg(short, long, default_value = "configs/optimizer.json")]
        config: String,

        /// Also list every combination's stored outcome
        #[arg(long)]
        all: bool,
    },
}

fn setup_logging(verbose: bool, command_name: &str, file_only: bool) -> Result<()> {
    std::fs::create_dir_all("logs")?;

    // {command}_{date}.log
    let log_filename = format!(
        "{}_{}.log",
        command_name,
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    );
    let log_path = PathBuf::from("logs").join(&log_filename);

    // Keep HTTP client internals quiet
    let level = if verbose { "debug" } else { "info" };
    let filter_str = format!(
        "{},hyper=warn,hyper_util=warn,reqwest=warn,rustls=warn,h2=warn",
        level
    );
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    let file_appender = tracing_appender::rolling::never("logs", &log_filename);
    // Built per-branch: the layer's subscriber type differs between the two stacks
    macro_rules! file_layer {
        () => {
            tracing_subscriber::fmt::layer()
                .with_writer(file_appender)
                .with_target(true)
                .with_line_number(true)
                .with_file(true)
                .with_ansi(false)
        };
    }

    if file_only {
        // The progress bar owns the console
        tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer!())
            .init();
    } else {
        let console_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_line_number(true)
            .with_file(true)
            .with_ansi(true);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .with(file_layer!())
            .init();
    }

    info!("Logging initialized");
    info!("Log file: {}", log_path.display());
    Ok(())
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let (command_name, file_only) = match &cli.command {
        Commands::Optimize(_) => ("optimize", true),
        Commands::Runs { .. } => ("runs", false),
        Commands::Show { .. } => ("show", false),
    };

    setup_logging(cli.verbose, command_name, file_only)?;

    match cli.command {
        Commands::Optimize(args) => commands::optimize::run(args),
        Commands::Runs { config, limit } => commands::runs::list(config, limit),
        Commands::Show {
            run_id,
            config,
            all,
        } => commands::runs::show(config, run_id, all),
    }
}
