//! Configuration view and validation commands: `waypoint config`.

use anyhow::Result;
use waypoint::config::{WaypointConfig, WaypointToml};

use super::super::ConfigCommands;

pub fn cmd_config(config: &WaypointConfig, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = config.config_path();

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Waypoint Configuration");
            println!("======================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No waypoint.toml found at {}", config_path.display());
                println!("Using default configuration.");
            }
            println!();

            print!("{}", toml::to_string_pretty(&config.toml)?);
            println!();

            println!("Storage:");
            println!("  home        = {}", config.home.display());
            println!("  state       = {}", config.state_dir().display());
            println!("  escalations = {}", config.escalations_dir().display());
            println!("  decisions   = {}", config.decisions_dir().display());
            println!();

            if !config_path.exists() {
                println!("Run 'waypoint config init' to create a waypoint.toml file.");
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No waypoint.toml found. Using defaults (valid).");
                return Ok(());
            }

            let warnings = config.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("{}", console::style("Configuration warnings:").yellow());
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("waypoint.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            WaypointToml::default().save(&config_path)?;

            println!("Created waypoint.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [retry] per-handler retry budgets and backoff");
            println!("  - [decisions] escalation_threshold and [decisions.answers]");
            println!("  - [reviews] pass_threshold, min_sub_score, confidence_mode");
            println!();
        }
    }

    Ok(())
}
