//! Decisions, errors and context.

use anyhow::Result;
use console::style;
use phasegate::config::PhasegateConfig;

use super::super::{Cli, ContextCommands, ErrorCommands};
use super::print_json;
use super::session::Session;

pub fn cmd_decide(
    config: &PhasegateConfig,
    cli: &Cli,
    description: &str,
    rationale: Option<&str>,
) -> Result<()> {
    let mut session = Session::write(config)?;
    let decision = session.machine.add_decision(description, rationale)?;
    if cli.json {
        return print_json(&decision);
    }
    println!(
        "{} Decision {} recorded in {}",
        style("✓").green().bold(),
        style(&decision.id).dim(),
        decision.phase
    );
    Ok(())
}

pub fn cmd_error(config: &PhasegateConfig, cli: &Cli, command: &ErrorCommands) -> Result<()> {
    let mut session = Session::write(config)?;
    match command {
        ErrorCommands::Add { message, code } => {
            let record = session.machine.add_error(message, code.as_deref())?;
            if cli.json {
                return print_json(&record);
            }
            println!(
                "{} Error {} recorded in {}",
                style("✓").green().bold(),
                record.id,
                record.phase
            );
        }
        ErrorCommands::Resolve { id } => {
            session.machine.resolve_error(id)?;
            println!("{} Error {} resolved", style("✓").green().bold(), id);
        }
    }
    Ok(())
}

pub fn cmd_context(config: &PhasegateConfig, cli: &Cli, command: &ContextCommands) -> Result<()> {
    match command {
        ContextCommands::Set { key, value } => {
            let mut session = Session::write(config)?;
            let value = parse_value(value);
            session.machine.update_context(key, value.clone())?;
            if cli.json {
                return print_json(&serde_json::json!({ "key": key, "value": value }));
            }
            println!("{} {} = {}", style("✓").green().bold(), key, value);
        }
        ContextCommands::Show => {
            let mut session = Session::read(config)?;
            let context = session.machine.get_state()?.context.clone();
            if cli.json {
                return print_json(&context);
            }
            if context.is_empty() {
                println!("Context is empty.");
            }
            for (key, value) in &context {
                println!("{} = {}", style(key).bold(), value);
            }
        }
    }
    Ok(())
}

/// JSON when it parses, otherwise the raw string.
fn parse_value(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}
