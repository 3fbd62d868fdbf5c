//! Drift, checksum and circuit breaker commands.

use anyhow::{Context, Result};
use console::style;
use phasegate::config::PhasegateConfig;
use phasegate::drift::{CircuitState, DriftReport};
use uuid::Uuid;

use super::super::{BreakerCommands, ChecksumCommands, Cli, DriftCommands};
use super::print_json;
use super::session::Session;

pub fn cmd_drift(config: &PhasegateConfig, cli: &Cli, command: &DriftCommands) -> Result<()> {
    match command {
        DriftCommands::Check => {
            let session = Session::read(config)?;
            let report = session.machine.detector().detect_drift()?;
            if cli.json {
                return print_json(&report);
            }
            print_report(&report);
        }
        DriftCommands::Reconcile => {
            let mut session = Session::write(config)?;
            let report = session.machine.reconcile_drift()?;
            if cli.json {
                return print_json(&report);
            }
            print_report(&report);
            println!(
                "{} Drift annotations saved to project context",
                style("✓").green().bold()
            );
        }
        DriftCommands::Baseline => {
            let mut session = Session::write(config)?;
            let baseline = session.machine.save_directory_baseline()?;
            if cli.json {
                return print_json(&baseline);
            }
            println!(
                "{} Baseline saved ({} files, {})",
                style("✓").green().bold(),
                baseline.file_count,
                &baseline.hash[..12.min(baseline.hash.len())]
            );
        }
        DriftCommands::Dir => {
            let mut session = Session::read(config)?;
            let drift = session.machine.check_directory_drift()?;
            if cli.json {
                return print_json(&drift);
            }
            if drift.drift {
                println!("{}", style(&drift.message).yellow());
                for file in &drift.changed {
                    println!("  changed  {}", file);
                }
                for file in &drift.added {
                    println!("  added    {}", file);
                }
                for file in &drift.deleted {
                    println!("  deleted  {}", file);
                }
                if let Some(suggestion) = &drift.suggestion {
                    println!();
                    println!("{}", suggestion);
                }
            } else {
                println!("{}", drift.message);
            }
        }
    }
    Ok(())
}

fn print_report(report: &DriftReport) {
    if !report.is_detected() {
        println!("{} No drift detected", style("✓").green().bold());
        return;
    }
    println!();
    println!(
        "{} ({} finding(s))",
        style("Drift detected").red().bold(),
        report.findings.len()
    );
    for finding in &report.findings {
        println!("  {:<28} {}", finding.path, finding.message);
    }
    println!();
    println!("Recovery options:");
    for option in &report.recovery_options {
        println!(
            "  - {:<18} risk: {}",
            option.label(),
            format!("{:?}", option.risk()).to_lowercase()
        );
    }
    println!();
}

pub fn cmd_checksums(
    config: &PhasegateConfig,
    cli: &Cli,
    command: &ChecksumCommands,
) -> Result<()> {
    match command {
        ChecksumCommands::Record { paths } => {
            let mut session = Session::write(config)?;
            let targets: Vec<String> = if paths.is_empty() {
                let phase = session.machine.get_current_phase()?;
                phase
                    .required_artifacts()
                    .iter()
                    .copied()
                    .filter(|rel| {
                        let exists = config.project_dir.join(rel).exists();
                        if !exists {
                            tracing::warn!(path = *rel, "artifact missing, not recorded");
                        }
                        exists
                    })
                    .map(|rel| rel.to_string())
                    .collect()
            } else {
                paths.clone()
            };
            let refs: Vec<&str> = targets.iter().map(String::as_str).collect();
            let checksums = session.machine.detector().record_checksums(&refs)?;
            if cli.json {
                return print_json(&checksums);
            }
            println!(
                "{} Recorded {} checksum(s) ({} tracked)",
                style("✓").green().bold(),
                refs.len(),
                checksums.len()
            );
        }
        ChecksumCommands::Show => {
            let session = Session::read(config)?;
            let checksums = session.machine.detector().load_checksums()?;
            if cli.json {
                return print_json(&checksums);
            }
            if checksums.is_empty() {
                println!("No checksums recorded.");
            }
            for (path, checksum) in &checksums {
                println!("{:<40} {}", path, style(checksum).dim());
            }
        }
    }
    Ok(())
}

pub fn cmd_breaker(config: &PhasegateConfig, cli: &Cli, command: &BreakerCommands) -> Result<()> {
    match command {
        BreakerCommands::Status => {
            let session = Session::read(config)?;
            let breaker = session.machine.detector().breaker();
            if cli.json {
                return print_json(&serde_json::json!({
                    "context": breaker.context(),
                    "retryAfterMs": breaker.retry_after().map(|d| d.as_millis() as u64),
                    "interventions": breaker.interventions(),
                }));
            }

            let state = match breaker.state() {
                CircuitState::Closed => style("CLOSED").green().bold(),
                CircuitState::HalfOpen => style("HALF_OPEN").yellow().bold(),
                CircuitState::Open => style("OPEN").red().bold(),
            };
            let ctx = breaker.context();
            println!();
            println!("Circuit breaker: {}", state);
            println!("  Consecutive failures: {}", ctx.consecutive_failures);
            println!("  Transactions:         {}", ctx.transaction_count);
            if let Some(reason) = ctx.triggered_by {
                println!("  Triggered by:         {}", reason);
            }
            if let Some(retry_after) = breaker.retry_after() {
                println!("  Retry after:          {}s", retry_after.as_secs());
            }
            let pending = breaker.pending_interventions();
            if !pending.is_empty() {
                println!();
                println!("Pending intervention requests:");
                for request in pending {
                    println!(
                        "  {} {} at {} ({} retries)",
                        style(request.id).bold(),
                        request.reason,
                        request.current_state,
                        request.retry_count
                    );
                }
            }
            println!();
        }
        BreakerCommands::Reset => {
            let mut session = Session::write(config)?;
            session.machine.detector_mut().breaker_mut().reset();
            session.machine.detector().persist_breaker()?;
            println!("{} Circuit breaker closed", style("✓").green().bold());
        }
        BreakerCommands::Resolve { id } => {
            let id = Uuid::parse_str(id)
                .with_context(|| format!("Invalid intervention id '{}'", id))?;
            let mut session = Session::write(config)?;
            session
                .machine
                .detector_mut()
                .breaker_mut()
                .resolve_intervention(id)?;
            session.machine.detector().persist_breaker()?;
            println!("{} Intervention {} resolved", style("✓").green().bold(), id);
        }
    }
    Ok(())
}
