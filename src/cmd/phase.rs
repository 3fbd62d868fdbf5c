//! Transition commands and the standalone quality gate.

use anyhow::Result;
use console::style;
use phasegate::config::PhasegateConfig;
use phasegate::gates::{CheckSeverity, GateStatus, QualityGateResult};
use phasegate::{StateMachineError, TransitionAction, TransitionOutcome};

use super::super::Cli;
use super::print_json;
use super::session::Session;

pub async fn cmd_transition(
    config: &PhasegateConfig,
    cli: &Cli,
    action: TransitionAction,
) -> Result<()> {
    let mut session = Session::write(config)?;
    let outcome = match session.machine.transition(action).await {
        Ok(outcome) => outcome,
        Err(StateMachineError::CircuitOpen { retry_after, reason }) => {
            let reason = reason.map(|r| r.to_string()).unwrap_or_else(|| "unknown".to_string());
            anyhow::bail!(
                "Circuit breaker is open ({}). Retry in {}s or run 'phasegate breaker reset' after review.",
                reason,
                retry_after.as_secs().max(1)
            );
        }
        Err(e) => return Err(e.into()),
    };

    match outcome {
        TransitionOutcome::Transitioned { entry, gate } => {
            if cli.json {
                return print_json(&serde_json::json!({ "entry": entry, "gate": gate }));
            }
            if let Some(gate) = &gate {
                print_gate(gate);
            }
            let state = session.machine.get_state()?;
            println!(
                "{} {} {} → {} (step {})",
                style("✓").green().bold(),
                entry.action,
                entry.from,
                style(entry.to).cyan().bold(),
                state.step_label()
            );
            Ok(())
        }
        TransitionOutcome::Blocked(gate) => {
            if cli.json {
                print_json(&serde_json::json!({ "blocked": true, "gate": gate }))?;
            } else {
                print_gate(&gate);
            }
            anyhow::bail!("{}", gate.failure_summary())
        }
    }
}

pub async fn cmd_gate(config: &PhasegateConfig, cli: &Cli) -> Result<()> {
    let mut session = Session::read(config)?;
    let result = session.machine.evaluate_gate().await?;
    if cli.json {
        return print_json(&result);
    }
    print_gate(&result);
    Ok(())
}

fn print_gate(result: &QualityGateResult) {
    let status = match result.status {
        GateStatus::Passed => style("PASSED").green().bold(),
        GateStatus::Warning => style("WARNING").yellow().bold(),
        GateStatus::Failed => style("FAILED").red().bold(),
    };
    println!();
    println!("Quality gate: {}", status);
    for check in &result.checks {
        let mark = match (check.passed, check.severity) {
            (true, _) => style("✓").green(),
            (false, CheckSeverity::Error) => style("✗").red(),
            (false, CheckSeverity::Warning) => style("!").yellow(),
            (false, CheckSeverity::Info) => style("i").dim(),
        };
        println!("  {} {:<16} {}", mark, check.name, check.details);
    }
    if !result.refinements.is_empty() {
        println!();
        println!("Suggested refinements:");
        for action in &result.refinements {
            println!("  - {}", action.description);
            for step in &action.suggested_steps {
                println!("      {}", style(step).dim());
            }
        }
    }
    println!();
}
