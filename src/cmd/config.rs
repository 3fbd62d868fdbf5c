//! Configuration view and validation commands for `phasegate config`.

use anyhow::Result;
use phasegate::config::{PhasegateConfig, PhasegateToml};

use super::super::ConfigCommands;

pub fn cmd_config(config: &PhasegateConfig, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = config.config_file();

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Phasegate Configuration");
            println!("=======================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No phasegate.toml found at {}", config_path.display());
                println!("Using default configuration.");
            }
            println!();

            let toml = &config.toml;
            println!("[breaker]");
            println!("  max_retries = {}", toml.breaker.max_retries);
            println!(
                "  max_retries_per_state = {}",
                toml.breaker.max_retries_per_state
            );
            println!(
                "  circuit_reset_timeout_ms = {}",
                toml.breaker.circuit_reset_timeout_ms
            );
            println!("  max_backoff_ms = {}", toml.breaker.max_backoff_ms);
            println!();
            println!("[gate]");
            println!(
                "  min_architecture_score = {}",
                toml.gate.min_architecture_score
            );
            println!("  security_timeout_secs = {}", toml.gate.security_timeout_secs);
            println!();
            println!("[logging]");
            println!("  level = \"{}\"", toml.logging.level);
            println!("  json = {}", toml.logging.json);
            println!();

            println!("Effective values (with env/CLI overrides):");
            println!("  state_dir = \"{}\"", config.state_dir()?.display());
            match config.security_command() {
                Some(cmd) => println!("  security_command = \"{}\"", cmd),
                None => println!("  security_command = (none, check skipped)"),
            }
            println!("  log_level = \"{}\"", config.log_level());
            println!();

            if !config_path.exists() {
                println!("Run 'phasegate config init' to create a phasegate.toml file.");
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No phasegate.toml found. Using defaults (valid).");
                return Ok(());
            }

            let warnings = config.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("phasegate.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            PhasegateToml::default().save(&config_path)?;

            println!("Created phasegate.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [state] dir");
            println!("  - [breaker] retry limits and backoff");
            println!("  - [gate] min_architecture_score, security_command");
            println!("  - [logging] level, json");
            println!();
        }
    }

    Ok(())
}
