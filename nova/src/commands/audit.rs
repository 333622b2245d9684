//! Audit log commands.

use anyhow::{Context, Result};
use colored::Colorize;

use super::{Output, open_engine, print_json, short_id};
use crate::cli::{AuditAction, AuditCommand};
use crate::config::Config;

/// Execute audit command.
pub async fn execute(cmd: AuditCommand, config: &Config, output: Output) -> Result<()> {
    let engine = open_engine(config).await?;

    match cmd.action {
        AuditAction::List { lineage, limit } => {
            let lineage = lineage.unwrap_or_else(|| config.engine.policy.lineage.clone());
            let entries = engine
                .audit()
                .list(&lineage, Some(limit))
                .await
                .with_context(|| format!("Failed to list audit entries for {}", lineage))?;
            if output.is_json() {
                return print_json(&entries);
            }

            if entries.is_empty() {
                println!("{} No audit entries in {}", "⚠".yellow(), lineage);
                return Ok(());
            }
            println!("{} {}", "Audit log".cyan().bold(), lineage);
            println!("{}", "─".repeat(60));
            for entry in &entries {
                println!(
                    "  #{:<5} {} {:<20} {} {}",
                    entry.seq,
                    entry.created_at.format("%Y-%m-%d %H:%M:%S"),
                    entry.event_kind,
                    entry.actor_id.as_deref().unwrap_or("-").dimmed(),
                    short_id(&entry.entry_hash).cyan()
                );
            }
            Ok(())
        }

        AuditAction::Verify { lineage } => {
            let lineages = match lineage {
                Some(lineage) => vec![lineage],
                None => engine.audit().lineages().await.context("Failed to list lineages")?,
            };

            let mut results = Vec::with_capacity(lineages.len());
            for lineage in &lineages {
                results.push(
                    engine
                        .audit()
                        .verify(lineage)
                        .await
                        .with_context(|| format!("Failed to verify {}", lineage))?,
                );
            }

            if output.is_json() {
                print_json(&results)?;
            } else {
                for result in &results {
                    match &result.first_broken {
                        None => println!(
                            "{} {}: {} entries intact",
                            "✓".green(),
                            result.lineage,
                            result.entries
                        ),
                        Some(broken) => println!(
                            "{} {}: broken at #{} ({}), {} of {} verified",
                            "✗".red(),
                            result.lineage,
                            broken.seq,
                            broken.reason,
                            result.verified,
                            result.entries
                        ),
                    }
                }
            }

            if results.iter().any(|r| !r.is_intact()) {
                anyhow::bail!("audit chain verification failed");
            }
            Ok(())
        }
    }
}
