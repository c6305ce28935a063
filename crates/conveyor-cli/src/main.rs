//! Conveyor CLI tool.

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "conveyor")]
#[command(about = "Conveyor job queue and dispatch CLI", long_about = None)]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a dispatch configuration
    Validate {
        /// Path to the configuration file
        #[arg(default_value = "conveyor.kdl")]
        path: String,
    },
    /// Print the effective configuration as JSON
    Config {
        /// Path to the configuration file
        #[arg(default_value = "conveyor.kdl")]
        path: String,
    },
    /// Run an in-memory dispatch simulation
    Simulate {
        /// Configuration file; defaults apply when omitted
        #[arg(long, env = "CONVEYOR_CONFIG")]
        config: Option<String>,
        /// Number of workers to register
        #[arg(long, default_value = "4")]
        workers: usize,
        /// Concurrent jobs per worker
        #[arg(long, default_value = "2")]
        capacity: u32,
        /// Number of jobs to enqueue
        #[arg(long, default_value = "20")]
        jobs: usize,
        /// Tag carried by every worker and job (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,
        /// Maximum sweep rounds before giving up
        #[arg(long, default_value = "100")]
        rounds: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    match cli.command {
        Commands::Validate { path } => {
            commands::validate(&path)?;
        }
        Commands::Config { path } => {
            commands::show_config(&path)?;
        }
        Commands::Simulate {
            config,
            workers,
            capacity,
            jobs,
            tags,
            rounds,
        } => {
            let options = commands::simulate::SimulateOptions {
                workers,
                capacity,
                jobs,
                tags,
                rounds,
            };
            commands::simulate::run(config.as_deref(), options).await?;
        }
    }

    Ok(())
}
