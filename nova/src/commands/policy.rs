//! Constitutional policy commands.

use anyhow::{Context, Result, bail};
use colored::Colorize;
use nova_memory::ValidationContext;
use nova_memory::policy::{PolicyRecord, Principle};

use super::{Output, open_engine, print_json, short_id};
use crate::cli::{PolicyAction, PolicyCommand};
use crate::config::Config;

/// Execute policy command.
pub async fn execute(cmd: PolicyCommand, config: &Config, output: Output) -> Result<()> {
    let engine = open_engine(config).await?;

    match cmd.action {
        PolicyAction::Validate { text, memory } => {
            let mut context = ValidationContext::for_actor(&config.owner);
            if let Some(memory_id) = memory {
                context = context.with_memory(memory_id);
            }
            let result = engine.validate(&text, &context).await.context("Validation failed")?;
            if output.is_json() {
                return print_json(&result);
            }

            if result.valid {
                println!("{} Valid (score {:.2}, policy v{})", "✓".green(), result.score, result.policy_version);
            } else {
                println!("{} Invalid (score {:.2}, policy v{})", "✗".red(), result.score, result.policy_version);
            }
            for violation in &result.violations {
                let marker = if result.blocking.contains(violation) { "blocking".red() } else { "flagged".yellow() };
                println!("  - {} ({})", violation, marker);
            }
            for warning in &result.warnings {
                println!("  {} {}", "⚠".yellow(), warning);
            }
            for (principle, score) in result.principle_scores.iter().filter(|(_, s)| **s < 1.0) {
                println!("  {:<16} {:.2}", principle, score);
            }
            Ok(())
        }

        PolicyAction::Show { version, all } => {
            let records = match (version, all) {
                (_, true) => engine.policies().list().await.context("Failed to list policies")?,
                (Some(version), false) => vec![
                    engine
                        .policies()
                        .get(version)
                        .await
                        .with_context(|| format!("Policy v{} not found", version))?,
                ],
                (None, false) => vec![engine.active_policy().clone()],
            };
            if output.is_json() {
                return print_json(&records);
            }
            for record in &records {
                print_policy(record)?;
            }
            Ok(())
        }

        PolicyAction::Publish { principles } => {
            let principles = principles
                .iter()
                .map(|raw| parse_principle(raw))
                .collect::<Result<Vec<_>>>()?;
            let record = engine
                .policies()
                .publish(principles)
                .await
                .context("Failed to publish policy")?;
            if output.is_json() {
                return print_json(&record);
            }
            println!("{} Published policy v{}", "✓".green(), record.version);
            println!("  ID: {}", record.id);
            println!("  Active from the next engine start");
            Ok(())
        }
    }
}

/// Parse `name=weight`
fn parse_principle(raw: &str) -> Result<Principle> {
    let Some((name, weight)) = raw.split_once('=') else {
        bail!("Invalid principle '{}'. Use name=weight", raw);
    };
    let weight: f32 = weight
        .trim()
        .parse()
        .with_context(|| format!("Invalid weight in '{}'", raw))?;
    Ok(Principle::new(name.trim().to_lowercase(), weight))
}

fn print_policy(record: &PolicyRecord) -> Result<()> {
    let signature = if record.verify_signature()? { "verified".green() } else { "MISMATCH".red() };
    println!("{} v{} ({})", "Policy".cyan().bold(), record.version, short_id(&record.id));
    println!("{}", "─".repeat(40));
    println!("  Created:   {}", record.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("  Signature: {} {}", short_id(&record.signature), signature);
    for principle in &record.principles {
        println!("  {:<16} {:.2}", principle.name, principle.weight);
    }
    println!();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_principle() {
        let principle = parse_principle(" Truth = 1.5").unwrap();
        assert_eq!(principle.name, "truth");
        assert_eq!(principle.weight, 1.5);

        assert!(parse_principle("truth").is_err());
        assert!(parse_principle("truth=heavy").is_err());
    }
}
