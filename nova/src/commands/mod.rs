//! Command implementations for the nova CLI.
//!
//! Each submodule implements the logic for a command group.

pub mod audit;
pub mod config;
pub mod memory;
pub mod policy;
pub mod task;

use anyhow::{Context, Result, bail};
use nova_memory::{MemoryEngine, MemoryKind, MemoryTier, Outcome};
use serde::Serialize;

use crate::config::Config;

/// How command results are printed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Output {
    Human,
    Json,
}

impl Output {
    pub fn is_json(self) -> bool {
        self == Output::Json
    }
}

/// Open the engine on the configured database, creating its directory.
pub async fn open_engine(config: &Config) -> Result<MemoryEngine> {
    config.ensure_dirs()?;
    tracing::debug!(path = %config.engine.database_path.display(), owner = %config.owner, "opening memory engine");
    MemoryEngine::open(config.engine.clone())
        .await
        .with_context(|| format!("Failed to open memory database {}", config.engine.database_path.display()))
}

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("Failed to serialize output")?);
    Ok(())
}

/// First eight characters of an ID
pub fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

pub fn parse_tier(tier: &str) -> Result<MemoryTier> {
    match MemoryTier::from_str(&tier.to_lowercase()) {
        Some(tier) => Ok(tier),
        None => bail!("Invalid tier: {}. Use: stm, itm, or ltm", tier),
    }
}

pub fn parse_kind(kind: &str) -> Result<MemoryKind> {
    match MemoryKind::from_str(&kind.to_lowercase()) {
        Some(kind) => Ok(kind),
        None => bail!(
            "Invalid kind: {}. Use: lesson, task, conversation, error, reflection, or achievement",
            kind
        ),
    }
}

pub fn parse_outcome(outcome: &str) -> Result<Outcome> {
    match Outcome::from_str(&outcome.to_lowercase()) {
        Some(outcome) => Ok(outcome),
        None => bail!("Invalid outcome: {}. Use: success, failure, or neutral", outcome),
    }
}
