//! Cadence - In-process Job Scheduler
//!
//! CLI entry point: loads declared triggers and jobs and runs them.

#![forbid(unsafe_code)]

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod cli;
mod config;
mod jobs;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    let cli = cli::Cli::parse();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cadence=info,cadence_core=info".into()),
        )
        .with(cli.json.then(|| fmt::layer().json()))
        .with((!cli.json).then(fmt::layer))
        .init();

    cli::run(cli).await
}
