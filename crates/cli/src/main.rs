//! Kōhai CLI — the main entry point.
//!
//! Commands:
//! - `serve`  — Start the HTTP inference server
//! - `doctor` — Diagnose configuration and environment

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

#[derive(Parser)]
#[command(
    name = "kohai",
    about = "Kōhai — bilingual LoRA-routed chat inference service",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP inference server
    Serve {
        /// Override the port
        #[arg(short, long)]
        port: Option<u16>,

        /// Load configuration from a specific file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Diagnose configuration and environment
    Doctor,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    match cli.command {
        Commands::Serve { port, config } => commands::serve::run(port, config).await?,
        Commands::Doctor => commands::doctor::run().await?,
    }

    Ok(())
}
