//! enricher: website-driven company enrichment.
//!
//! Serves the task intake over HTTP, imports source lists, and runs batches
//! locally through the discovery, extraction, and synthesis phases.

mod commands;
mod engine;
mod server;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
