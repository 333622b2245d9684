//! Configuration commands.

use anyhow::Result;

use super::{Output, print_json};
use crate::cli::{ConfigAction, ConfigCommand};
use crate::config::Config;

/// Execute config command.
pub fn execute(cmd: ConfigCommand, config: &Config, output: Output) -> Result<()> {
    match cmd.action {
        ConfigAction::Show => {
            if output.is_json() {
                return print_json(config);
            }
            print!("{}", config.to_toml()?);
            Ok(())
        }
        ConfigAction::Path => {
            let path = Config::config_path();
            if output.is_json() {
                return print_json(&serde_json::json!({
                    "config": path,
                    "exists": path.exists(),
                    "database": config.engine.database_path,
                }));
            }
            println!("{}", path.display());
            Ok(())
        }
    }
}
