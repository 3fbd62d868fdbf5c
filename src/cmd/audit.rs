//! Audit trail commands.

use anyhow::Result;
use console::style;
use phasegate::Phase;
use phasegate::audit::{AuditExporter, AuditSummary};
use phasegate::config::PhasegateConfig;

use super::super::{AuditCommands, Cli};
use super::print_json;
use super::session::Session;

pub fn cmd_audit(config: &PhasegateConfig, cli: &Cli, command: &AuditCommands) -> Result<()> {
    match command {
        AuditCommands::Show { failed, phase } => {
            let phase: Option<Phase> = phase.as_deref().map(str::parse).transpose()?;
            let mut session = Session::read(config)?;
            let entries: Vec<_> = session
                .machine
                .get_audit_log()?
                .iter()
                .filter(|e| !*failed || !e.success)
                .filter(|e| phase.is_none_or(|p| e.from == p || e.to == p))
                .cloned()
                .collect();

            if cli.json {
                return print_json(&entries);
            }
            if entries.is_empty() {
                println!("No audit entries.");
                return Ok(());
            }

            println!();
            println!(
                "{:<20} {:<9} {:<15} {:<15} Result",
                "Timestamp", "Action", "From", "To"
            );
            println!(
                "{:<20} {:<9} {:<15} {:<15} ------",
                "-------------------", "--------", "--------------", "--------------"
            );
            for entry in &entries {
                let result = if entry.success {
                    style("ok".to_string()).green()
                } else {
                    style(format!(
                        "{}: {}",
                        entry.error_code.as_deref().unwrap_or("FAILED"),
                        entry.error_message.as_deref().unwrap_or_default()
                    ))
                    .red()
                };
                println!(
                    "{:<20} {:<9} {:<15} {:<15} {}",
                    entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    entry.action.as_str(),
                    entry.from.as_str(),
                    entry.to.as_str(),
                    result
                );
            }

            let summary = AuditSummary::from_entries(&entries);
            println!();
            println!(
                "{} entries ({} succeeded, {} failed)",
                summary.total, summary.succeeded, summary.failed
            );
            println!();
        }
        AuditCommands::Export => {
            let mut session = Session::write(config)?;
            let path = session.machine.export_audit_log()?;
            if cli.json {
                return print_json(&serde_json::json!({ "path": path }));
            }
            println!("{} Audit log exported to {}", style("✓").green().bold(), path.display());
        }
        AuditCommands::Exports => {
            let exporter = AuditExporter::new(&config.state_paths()?.audit_dir);
            let mut listed = Vec::new();
            for path in exporter.list_exports()? {
                match exporter.load_export(&path) {
                    Ok(export) => listed.push((path, export)),
                    Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping unreadable audit export"),
                }
            }

            if cli.json {
                let rows: Vec<_> = listed
                    .iter()
                    .map(|(path, export)| {
                        serde_json::json!({
                            "path": path,
                            "exportId": export.export_id,
                            "exportedAt": export.exported_at,
                            "summary": export.summary,
                        })
                    })
                    .collect();
                return print_json(&rows);
            }
            if listed.is_empty() {
                println!("No audit exports. Run 'phasegate audit export' to create one.");
                return Ok(());
            }
            println!();
            for (path, export) in &listed {
                println!(
                    "{}  {} entries ({} failed)  {}",
                    export.exported_at.format("%Y-%m-%d %H:%M:%S"),
                    export.summary.total,
                    export.summary.failed,
                    style(path.display()).dim()
                );
            }
            println!();
        }
        AuditCommands::Wal => {
            let session = Session::read(config)?;
            let entries = session.machine.wal_entries()?;
            if cli.json {
                return print_json(&entries);
            }
            if entries.is_empty() {
                println!("Write-ahead log is empty.");
                return Ok(());
            }
            for (i, entry) in entries.iter().enumerate() {
                println!(
                    "{:>4}  {}  {} {} ({} audit entries)",
                    i + 1,
                    entry.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
                    entry.state.phase,
                    entry.state.step_label(),
                    entry.state.audit_log.len()
                );
            }
        }
    }
    Ok(())
}
