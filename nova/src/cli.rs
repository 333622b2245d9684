//! CLI argument definitions using clap derive macros.
//!
//! Command structure mirrors the engine's operations plus the two task
//! contracts a scheduler invokes.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Nova memory CLI
///
/// Tiered memory with constitutional validation, promotion and distillation.
#[derive(Parser, Debug)]
#[command(name = "nova")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Database file (overrides the config file)
    #[arg(long, global = true, env = "NOVA_DB")]
    pub db: Option<PathBuf>,

    /// Owner the command acts for (overrides the config file)
    #[arg(long, global = true, env = "NOVA_OWNER")]
    pub owner: Option<String>,

    /// JSON output and JSON logs
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Tiered memory (store, get, list, search, update, delete, promote, stats)
    Memory(MemoryCommand),

    /// Constitutional policy (validate, show, publish)
    Policy(PolicyCommand),

    /// Hash-chained audit log (list, verify)
    Audit(AuditCommand),

    /// Scheduled task entry points (distill, reflect)
    Task(TaskCommand),

    /// Configuration (show, path)
    Config(ConfigCommand),

    /// Show version
    Version,
}

// ─────────────────────────────────────────────────────────────────────────────
// Memory Commands
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Args, Debug)]
pub struct MemoryCommand {
    #[command(subcommand)]
    pub action: MemoryAction,
}

#[derive(Subcommand, Debug)]
pub enum MemoryAction {
    /// Store a new memory
    Store {
        /// Memory text
        text: String,

        /// Kind: lesson, task, conversation, error, reflection, achievement
        #[arg(short, long, default_value = "conversation")]
        kind: String,

        /// Target tier: stm, itm or ltm (default: stm)
        #[arg(short, long)]
        tier: Option<String>,

        /// Session the memory belongs to
        #[arg(short, long)]
        session: Option<String>,

        /// Tags for categorization
        #[arg(short = 'T', long = "tag", action = clap::ArgAction::Append)]
        tags: Vec<String>,

        /// Emotional weight in [-1, 1]
        #[arg(long, allow_hyphen_values = true)]
        emotional_weight: Option<f32>,

        /// Confidence in [0, 1]
        #[arg(long)]
        confidence: Option<f32>,

        /// Outcome: success, failure or neutral
        #[arg(long, default_value = "neutral")]
        outcome: String,
    },

    /// Fetch a memory (counts as an access)
    Get {
        /// Memory ID
        id: String,
    },

    /// List memories in creation order
    List {
        /// Only this tier
        #[arg(short, long)]
        tier: Option<String>,

        /// Maximum results
        #[arg(short, long, default_value = "20")]
        limit: usize,

        /// Results to skip
        #[arg(long, default_value = "0")]
        offset: usize,
    },

    /// Similarity search
    Search {
        /// Query text
        query: String,

        /// Only this tier
        #[arg(short, long)]
        tier: Option<String>,

        /// Minimum confidence
        #[arg(long)]
        min_confidence: Option<f32>,

        /// Maximum results
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Patch a cached memory or move it to another tier
    Update {
        /// Memory ID
        id: String,

        /// Record an outcome: success, failure or neutral
        #[arg(long)]
        outcome: Option<String>,

        /// New emotional weight
        #[arg(long, allow_hyphen_values = true)]
        emotional_weight: Option<f32>,

        /// New confidence
        #[arg(long)]
        confidence: Option<f32>,

        /// Replace tags
        #[arg(short = 'T', long = "tag", action = clap::ArgAction::Append)]
        tags: Vec<String>,

        /// Move to tier
        #[arg(short, long)]
        tier: Option<String>,
    },

    /// Delete a memory (long-term memories are soft-deleted)
    Delete {
        /// Memory ID
        id: String,
    },

    /// Promote a memory; without a target, promote wherever it qualifies
    Promote {
        /// Memory ID
        id: String,

        /// Target tier: itm or ltm
        #[arg(short, long)]
        tier: Option<String>,
    },

    /// Counts per tier and stored bytes
    Stats,
}

// ─────────────────────────────────────────────────────────────────────────────
// Policy Commands
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Args, Debug)]
pub struct PolicyCommand {
    #[command(subcommand)]
    pub action: PolicyAction,
}

#[derive(Subcommand, Debug)]
pub enum PolicyAction {
    /// Validate text against the active policy
    Validate {
        /// Text to validate
        text: String,

        /// Memory the text belongs to (flags it when invalid)
        #[arg(short, long)]
        memory: Option<String>,
    },

    /// Show the active policy, or a specific version
    Show {
        /// Policy version
        #[arg(short, long)]
        version: Option<u32>,

        /// List every version
        #[arg(long)]
        all: bool,
    },

    /// Publish a new policy version
    Publish {
        /// Principle as name=weight (repeatable)
        #[arg(short, long = "principle", required = true, action = clap::ArgAction::Append)]
        principles: Vec<String>,
    },
}

// ─────────────────────────────────────────────────────────────────────────────
// Audit Commands
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Args, Debug)]
pub struct AuditCommand {
    #[command(subcommand)]
    pub action: AuditAction,
}

#[derive(Subcommand, Debug)]
pub enum AuditAction {
    /// List audit entries of a lineage
    List {
        /// Lineage (default: configured policy lineage)
        #[arg(long)]
        lineage: Option<String>,

        /// Most recent N entries
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Verify hash chains from genesis
    Verify {
        /// Only this lineage (default: every lineage)
        #[arg(long)]
        lineage: Option<String>,
    },
}

// ─────────────────────────────────────────────────────────────────────────────
// Task Commands
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Args, Debug)]
pub struct TaskCommand {
    #[command(subcommand)]
    pub action: TaskAction,
}

#[derive(Subcommand, Debug)]
pub enum TaskAction {
    /// Run distillation for one owner, or all owners with --all
    Distill {
        /// Every owner instead of --owner
        #[arg(long)]
        all: bool,
    },

    /// Reflect on a memory (idempotent)
    Reflect {
        /// Memory ID
        memory_id: String,
    },

    /// Promote aged short-term memories, then drop expired cached ones
    Sweep,
}

// ─────────────────────────────────────────────────────────────────────────────
// Config Commands
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Args, Debug)]
pub struct ConfigCommand {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,

    /// Print the config file path
    Path,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_store_with_negative_weight() {
        let cli = Cli::parse_from([
            "nova", "--owner", "alice", "memory", "store", "bad day", "--emotional-weight", "-0.4", "-T", "mood",
        ]);
        assert_eq!(cli.owner.as_deref(), Some("alice"));
        match cli.command {
            Commands::Memory(MemoryCommand {
                action: MemoryAction::Store { emotional_weight, tags, kind, .. },
            }) => {
                assert_eq!(emotional_weight, Some(-0.4));
                assert_eq!(tags, vec!["mood"]);
                assert_eq!(kind, "conversation");
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::parse_from(["nova", "task", "distill", "--all", "--json"]);
        assert!(cli.json);
        assert!(matches!(
            cli.command,
            Commands::Task(TaskCommand {
                action: TaskAction::Distill { all: true }
            })
        ));

        let cli = Cli::parse_from(["nova", "task", "sweep"]);
        assert!(matches!(cli.command, Commands::Task(TaskCommand { action: TaskAction::Sweep })));
    }
}
