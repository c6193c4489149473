//! Genie CLI: infer field→selector mappings from sample pages.
//!
//! Fetches a handful of pages from one site, asks a proposer for a field
//! mapping, and validates and repairs the selectors it returns.

mod commands;

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
