//! Conveyor CLI tool.

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "conveyor")]
#[command(about = "Conveyor CI pipeline runner", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a pipeline definition locally
    Run {
        /// Path to the pipeline definition
        #[arg(default_value = "conveyor.kdl")]
        path: String,
        /// Number of workers
        #[arg(long, default_value = "1")]
        workers: usize,
        /// Extra environment variables (KEY=VALUE)
        #[arg(long = "env", value_name = "KEY=VALUE")]
        env: Vec<String>,
    },
    /// Validate a pipeline definition
    Validate {
        /// Path to the pipeline definition
        #[arg(default_value = "conveyor.kdl")]
        path: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { path, workers, env } => {
            commands::run::run_local(&path, workers, env).await?;
        }
        Commands::Validate { path } => {
            commands::validate(&path)?;
        }
    }

    Ok(())
}
