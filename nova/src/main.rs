//! nova - Tiered Memory CLI
//!
//! Local front end for the nova-memory engine: store and search memories,
//! inspect the constitutional policy and audit chain, and run the scheduled
//! reflection and distillation tasks.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod cli;
mod commands;
mod config;

use cli::{Cli, Commands};
use commands::Output;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so command output stays pipeable
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("nova=info,nova_memory=info"));
    let registry = tracing_subscriber::registry().with(filter);
    if cli.json {
        registry.with(fmt::layer().json().with_writer(std::io::stderr)).init();
    } else {
        registry.with(fmt::layer().with_writer(std::io::stderr)).init();
    }

    // Load configuration
    let config = config::Config::load()?.with_overrides(cli.db, cli.owner)?;
    let output = if cli.json { Output::Json } else { Output::Human };

    // Execute command
    match cli.command {
        Commands::Memory(cmd) => commands::memory::execute(cmd, &config, output).await,
        Commands::Policy(cmd) => commands::policy::execute(cmd, &config, output).await,
        Commands::Audit(cmd) => commands::audit::execute(cmd, &config, output).await,
        Commands::Task(cmd) => commands::task::execute(cmd, &config, output).await,
        Commands::Config(cmd) => commands::config::execute(cmd, &config, output),
        Commands::Version => {
            println!("nova {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}
