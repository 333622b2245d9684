//! Scheduled task entry points.
//!
//! A cron job or queue worker calls `nova task reflect <id>` after each
//! interaction and `nova task distill --all` on a cadence; `nova task sweep`
//! clears expired cache rows between runs. All are safe to redeliver; a
//! non-zero exit tells the scheduler to retry.

use anyhow::{Context, Result, bail};
use colored::Colorize;
use nova_memory::{DistillationReport, DistillationStatus, ReflectionRecord};

use super::{Output, open_engine, print_json, short_id};
use crate::cli::{TaskAction, TaskCommand};
use crate::config::Config;

/// Execute task command.
pub async fn execute(cmd: TaskCommand, config: &Config, output: Output) -> Result<()> {
    let engine = open_engine(config).await?;

    match cmd.action {
        TaskAction::Distill { all } => {
            let scope = if all { None } else { Some(config.owner.as_str()) };
            let report = engine.distillation_run(scope).await.context("Distillation failed")?;
            if output.is_json() {
                print_json(&report)?;
            } else {
                print_report(&report);
            }

            if report.status == DistillationStatus::Partial {
                bail!("distillation finished with {} error(s)", report.errors.len());
            }
            Ok(())
        }

        TaskAction::Reflect { memory_id } => {
            let reflection = engine
                .reflection_task(&memory_id)
                .await
                .with_context(|| format!("Reflection on {} failed", memory_id))?;
            if output.is_json() {
                return print_json(&reflection);
            }
            print_reflection(&reflection);
            Ok(())
        }

        TaskAction::Sweep => {
            let expired = engine.expire_sweep().await.context("Expiry sweep failed")?;
            if output.is_json() {
                return print_json(&serde_json::json!({ "expired": expired }));
            }
            println!("{} Swept {} expired cached memories", "✓".green(), expired);
            Ok(())
        }
    }
}

fn print_report(report: &DistillationReport) {
    let status = match report.status {
        DistillationStatus::Completed => "completed".green(),
        DistillationStatus::Partial => "partial".yellow(),
        DistillationStatus::Skipped => "skipped".dimmed(),
    };
    println!("{} {} ({})", "Distillation".cyan().bold(), status, short_id(&report.run_id));
    println!("{}", "─".repeat(40));
    println!("  Scope:        {}", report.scope);
    if let (Some(start), Some(end)) = (report.window_start, report.window_end) {
        println!(
            "  Window:       {} .. {}",
            start.format("%Y-%m-%d %H:%M:%S"),
            end.format("%Y-%m-%d %H:%M:%S")
        );
    }
    println!("  Reflections:  {}", report.reflections_scanned);
    println!(
        "  Groups:       {} ({} below minimum)",
        report.groups, report.groups_below_minimum
    );
    println!("  Distilled:    {}", report.distilled_created);
    println!(
        "  Contradicted: {}, refined: {}",
        report.contradicted, report.refined
    );
    println!(
        "  Promoted:     {} of {} attempted",
        report.promoted, report.promotions_attempted
    );
    println!("  Aged to ITM:  {}", report.aged_promoted);
    println!("  Expired:      {}", report.expired);
    for error in &report.errors {
        println!("  {} {}", "✗".red(), error);
    }
}

fn print_reflection(reflection: &ReflectionRecord) {
    let verdict = if reflection.aligned { "aligned".green() } else { "not aligned".red() };
    println!(
        "{} Reflection {} on {}",
        "✓".green(),
        short_id(&reflection.id).cyan(),
        short_id(&reflection.source_memory_id)
    );
    println!("  Topic:   {}", reflection.topic_key);
    println!("  Score:   {:.2} ({})", reflection.alignment_score, verdict);
    println!("  Outcome: {}", reflection.outcome.as_str());
    if let Some(improvement) = reflection.improvement() {
        println!("  Improve: {}", improvement);
    }
}
