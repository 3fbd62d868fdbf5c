//! Project lifecycle commands: init, status, reset.

use anyhow::Result;
use console::style;
use phasegate::StateMachineError;
use phasegate::config::PhasegateConfig;

use super::super::Cli;
use super::print_json;
use super::session::Session;

pub fn cmd_init(
    config: &PhasegateConfig,
    cli: &Cli,
    name: Option<&str>,
    force: bool,
) -> Result<()> {
    let mut session = Session::write(config)?;
    let store = session.machine.store();
    if store.exists() && !force {
        anyhow::bail!(
            "Project already initialized at {}. Use --force to replace it.",
            store.paths().state_file.display()
        );
    }

    let default_name = config
        .project_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let state = session.machine.initialize(name.unwrap_or(&default_name))?;

    if cli.json {
        return print_json(&state);
    }
    println!();
    println!(
        "{} Initialized project '{}'",
        style("✓").green().bold(),
        state.project_name
    );
    println!(
        "  State: {}",
        session.machine.store().paths().state_file.display()
    );
    println!("  Phase: {} {}", state.phase, state.step_label());
    println!();
    Ok(())
}

pub fn cmd_status(config: &PhasegateConfig, cli: &Cli) -> Result<()> {
    let mut session = Session::read(config)?;
    let breaker_state = session.machine.detector().breaker().state();
    let pending = session.machine.detector().breaker().pending_interventions().len();

    let state = match session.machine.get_state() {
        Ok(state) => state.clone(),
        Err(StateMachineError::NotInitialized { .. }) => {
            println!();
            println!("Project: Not initialized");
            println!();
            println!("Run 'phasegate init' to initialize the project.");
            println!();
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };
    let progress = state.progress();

    if cli.json {
        return print_json(&serde_json::json!({
            "projectName": state.project_name,
            "phase": state.phase,
            "currentStep": state.current_step,
            "totalSteps": state.total_steps,
            "progress": progress,
            "lastUpdated": state.last_updated,
            "decisions": state.decisions.len(),
            "unresolvedErrors": state.unresolved_errors().count(),
            "auditEntries": state.audit_log.len(),
            "circuitBreaker": breaker_state,
            "pendingInterventions": pending,
        }));
    }

    println!();
    println!("Phasegate Project Status");
    println!("========================");
    println!();
    println!("Project:  {}", style(&state.project_name).bold());
    println!(
        "Phase:    {} (step {})",
        style(state.phase).cyan().bold(),
        state.step_label()
    );
    println!(
        "Progress: {}/{} steps ({}%)",
        progress.current, progress.total, progress.percentage
    );
    println!("Updated:  {}", state.last_updated.format("%Y-%m-%d %H:%M:%S UTC"));
    println!();
    println!("Decisions:         {}", state.decisions.len());
    println!("Unresolved errors: {}", state.unresolved_errors().count());
    println!("Audit entries:     {}", state.audit_log.len());
    println!("Circuit breaker:   {}", breaker_state);
    if pending > 0 {
        println!(
            "{}",
            style(format!(
                "{} intervention request(s) pending. See 'phasegate breaker status'.",
                pending
            ))
            .yellow()
        );
    }
    if let Some(last) = state.audit_log.last() {
        let outcome = if last.success {
            style("ok".to_string()).green()
        } else {
            style(last.error_code.clone().unwrap_or_else(|| "failed".to_string())).red()
        };
        println!(
            "Last transition:   {} {} → {} ({})",
            last.action, last.from, last.to, outcome
        );
    }
    println!();
    Ok(())
}

pub fn cmd_reset(config: &PhasegateConfig, force: bool) -> Result<()> {
    if !force {
        println!();
        println!("This deletes the project state, its WAL and the circuit breaker snapshot.");
        println!("Re-run with --force to confirm.");
        println!();
        return Ok(());
    }
    let mut session = Session::write(config)?;
    session.machine.reset()?;
    println!("{} Project state removed", style("✓").green().bold());
    Ok(())
}
