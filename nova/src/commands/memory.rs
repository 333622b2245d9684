//! Memory commands for the tiered memory engine.
//!
//! Memory tiers:
//! - STM: Session context, expires after an hour, capped per session
//! - ITM: Promoted context, expires after a week, capped per owner
//! - LTM: Validated, persistent knowledge; content never changes

use anyhow::{Context, Result};
use colored::Colorize;
use nova_memory::{
    MatchKind, MemoryEngine, MemoryPatch, MemoryRecord, MemoryStats, MemoryTier, PromotionOutcome, ScoredMemory,
    SearchQuery, StoreMemoryInput,
};

use super::{Output, open_engine, parse_kind, parse_outcome, parse_tier, print_json, short_id};
use crate::cli::{MemoryAction, MemoryCommand};
use crate::config::Config;

/// Execute memory command.
pub async fn execute(cmd: MemoryCommand, config: &Config, output: Output) -> Result<()> {
    let engine = open_engine(config).await?;
    let owner = config.owner.as_str();

    match cmd.action {
        MemoryAction::Store {
            text,
            kind,
            tier,
            session,
            tags,
            emotional_weight,
            confidence,
            outcome,
        } => {
            let mut input = StoreMemoryInput::new(owner, text, parse_kind(&kind)?)
                .with_tags(tags)
                .with_outcome(parse_outcome(&outcome)?);
            if let Some(tier) = tier {
                input = input.with_tier(parse_tier(&tier)?);
            }
            if let Some(session) = session {
                input = input.with_session(session);
            }
            if let Some(weight) = emotional_weight {
                input = input.with_emotional_weight(weight);
            }
            if let Some(confidence) = confidence {
                input = input.with_confidence(confidence);
            }
            store(&engine, input, output).await
        }

        MemoryAction::Get { id } => {
            let record = engine
                .retrieve(owner, &id)
                .await
                .with_context(|| format!("Failed to retrieve memory {}", id))?;
            if output.is_json() {
                return print_json(&record);
            }
            print_record(&record);
            Ok(())
        }

        MemoryAction::List { tier, limit, offset } => {
            let tier = tier.as_deref().map(parse_tier).transpose()?;
            let records = engine
                .list(owner, tier, limit, offset)
                .await
                .context("Failed to list memories")?;
            if output.is_json() {
                return print_json(&records);
            }
            list(&records);
            Ok(())
        }

        MemoryAction::Search {
            query,
            tier,
            min_confidence,
            limit,
        } => {
            let mut search = SearchQuery::new(owner, query);
            search.tier_filter = tier.as_deref().map(parse_tier).transpose()?;
            search.min_confidence = min_confidence;
            search.limit = limit;

            let hits = engine.search(&search).await.context("Search failed")?;
            if output.is_json() {
                return print_json(&hits);
            }
            print_hits(&search.query_text, &hits);
            Ok(())
        }

        MemoryAction::Update {
            id,
            outcome,
            emotional_weight,
            confidence,
            tags,
            tier,
        } => {
            let patch = MemoryPatch {
                outcome: outcome.as_deref().map(parse_outcome).transpose()?,
                emotional_weight,
                confidence_score: confidence,
                tags: if tags.is_empty() { None } else { Some(tags) },
                tier: tier.as_deref().map(parse_tier).transpose()?,
            };
            let record = engine
                .update(owner, &id, patch)
                .await
                .with_context(|| format!("Failed to update memory {}", id))?;
            if output.is_json() {
                return print_json(&record);
            }
            println!("{} Updated {} ({})", "✓".green(), short_id(&record.id).cyan(), record.tier);
            Ok(())
        }

        MemoryAction::Delete { id } => {
            engine
                .delete(owner, &id)
                .await
                .with_context(|| format!("Failed to delete memory {}", id))?;
            if output.is_json() {
                return print_json(&serde_json::json!({ "deleted": id }));
            }
            println!("{} Deleted {}", "✓".green(), short_id(&id).cyan());
            Ok(())
        }

        MemoryAction::Promote { id, tier } => {
            let outcome = match tier {
                Some(tier) => engine.promote(owner, &id, parse_tier(&tier)?).await,
                None => engine.evaluate_promotion(owner, &id).await,
            }
            .with_context(|| format!("Failed to promote memory {}", id))?;
            if output.is_json() {
                return print_json(&outcome);
            }
            print_outcome(&outcome);
            Ok(())
        }

        MemoryAction::Stats => {
            let stats = engine.stats(owner).await.context("Failed to read stats")?;
            if output.is_json() {
                return print_json(&stats);
            }
            print_stats(owner, &stats);
            Ok(())
        }
    }
}

async fn store(engine: &MemoryEngine, input: StoreMemoryInput, output: Output) -> Result<()> {
    let requested = input.tier_hint;
    let record = engine.store(input).await.context("Failed to store memory")?;
    if output.is_json() {
        return print_json(&record);
    }

    println!("{} Stored in {}", "✓".green(), record.tier.to_string().cyan());
    println!("  ID: {}", record.id);
    if requested.is_some_and(|tier| tier != record.tier) {
        println!(
            "  {} Requested tier was not granted; stored in {}",
            "⚠".yellow(),
            record.tier
        );
    }
    if !record.constitutional_valid {
        println!("  {} Flagged by the constitutional policy; it will not be promoted", "⚠".yellow());
    }
    if record.embedding.is_none() {
        println!("  {} No embedding; reachable by keyword search only", "⚠".yellow());
    }
    Ok(())
}

fn list(records: &[MemoryRecord]) {
    if records.is_empty() {
        println!("{}", "No memories".yellow());
        return;
    }

    println!("{}", "Memories".cyan().bold());
    println!("{}", "─".repeat(60));
    for record in records {
        println!(
            "  {} [{}] {} {}",
            short_id(&record.id).cyan(),
            tier_label(record.tier),
            record.kind.to_string().dimmed(),
            truncate(&record.text, 60)
        );
    }
    println!();
    println!("{} memories", records.len());
}

fn print_record(record: &MemoryRecord) {
    println!("{} {}", "Memory".cyan().bold(), record.id);
    println!("{}", "─".repeat(60));
    println!("  Tier:       {}", tier_label(record.tier));
    println!("  Kind:       {}", record.kind);
    if let Some(session) = &record.session_id {
        println!("  Session:    {}", session);
    }
    println!("  Text:       {}", record.text);
    if !record.tags.is_empty() {
        let tags: Vec<&str> = record.tags.iter().map(String::as_str).collect();
        println!("  Tags:       {}", tags.join(", "));
    }
    println!("  Emotion:    {:.2}", record.emotional_weight);
    println!("  Confidence: {:.2}", record.confidence_score);
    println!("  Accesses:   {}", record.access_count);
    println!(
        "  Outcome:    {} (success rate {:.0}%)",
        record.outcome.as_str(),
        record.success_rate() * 100.0
    );
    println!(
        "  Valid:      {}",
        if record.constitutional_valid { "yes".green() } else { "no".red() }
    );
    println!("  Size:       {} bytes", record.size_bytes);
    println!("  Created:    {}", record.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
    if let Some(expires) = record.expires_at {
        println!("  Expires:    {}", expires.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    if let Some(deleted) = record.deleted_at {
        println!("  Deleted:    {}", deleted.format("%Y-%m-%d %H:%M:%S UTC").to_string().red());
    }
}

fn print_hits(query: &str, hits: &[ScoredMemory]) {
    if hits.is_empty() {
        println!("{} No memories match '{}'", "⚠".yellow(), query);
        return;
    }

    println!("{} {}", "Results for".cyan().bold(), query);
    println!("{}", "─".repeat(60));
    for hit in hits {
        let how = match hit.matched_by {
            MatchKind::Vector => "vec",
            MatchKind::Keyword => "kw",
        };
        println!(
            "  {:>5.2} {} {} [{}] {}",
            hit.score,
            how.dimmed(),
            short_id(&hit.record.id).cyan(),
            tier_label(hit.record.tier),
            truncate(&hit.record.text, 50)
        );
    }
}

fn print_outcome(outcome: &PromotionOutcome) {
    match outcome {
        PromotionOutcome::Promoted { record, from } => {
            println!(
                "{} Promoted {} from {} to {}",
                "✓".green(),
                short_id(&record.id).cyan(),
                from,
                tier_label(record.tier)
            );
        }
        PromotionOutcome::AlreadyPromoted { record } => {
            println!("{} {} is already in LTM", "✓".green(), short_id(&record.id).cyan());
        }
        PromotionOutcome::Deferred { id, reason } => {
            println!("{} Deferred {}: {}", "⚠".yellow(), short_id(id).cyan(), reason);
        }
        PromotionOutcome::Blocked { id, violations } => {
            println!(
                "{} Blocked {}: {}",
                "✗".red(),
                short_id(id).cyan(),
                violations.join(", ")
            );
        }
        PromotionOutcome::NotEligible { id, failed } => {
            println!("{} {} is not eligible", "⚠".yellow(), short_id(id).cyan());
            for reason in failed {
                println!("  - {}", reason);
            }
        }
    }
}

fn print_stats(owner: &str, stats: &MemoryStats) {
    println!("{} {}", "Memory Statistics for".cyan().bold(), owner);
    println!("{}", "─".repeat(40));
    for (tier, count) in &stats.count_by_tier {
        println!("  {:<4} {}", tier_label(*tier), count);
    }
    println!("  {:<4} {}", "all", stats.total());
    println!("  Stored:       {} bytes", stats.storage_size_bytes);
    if stats.soft_deleted > 0 {
        println!("  Soft-deleted: {}", stats.soft_deleted);
    }
}

fn tier_label(tier: MemoryTier) -> colored::ColoredString {
    match tier {
        MemoryTier::Stm => "stm".normal(),
        MemoryTier::Itm => "itm".yellow(),
        MemoryTier::Ltm => "ltm".green(),
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    let single_line = text.replace('\n', " ");
    if single_line.chars().count() <= max_chars {
        return single_line;
    }
    let cut: String = single_line.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{}...", cut)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_counts_chars() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("line one\nline two", 40), "line one line two");
        assert_eq!(truncate("ééééééééééé", 6), "ééé...");
    }
}
