use super::{AuditSummary, TransitionAuditEntry};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// A point-in-time copy of a project's audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditExport {
    pub export_id: Uuid,
    pub project_name: String,
    pub exported_at: DateTime<Utc>,
    pub summary: AuditSummary,
    pub entries: Vec<TransitionAuditEntry>,
}

/// Writes audit trail exports into `<state dir>/audit/`.
pub struct AuditExporter {
    audit_dir: PathBuf,
}

impl AuditExporter {
    pub fn new(audit_dir: &Path) -> Self {
        Self {
            audit_dir: audit_dir.to_path_buf(),
        }
    }

    /// Export the given entries. Returns the path of the written file.
    pub fn export(&self, project_name: &str, entries: &[TransitionAuditEntry]) -> Result<PathBuf> {
        fs::create_dir_all(&self.audit_dir).context("Failed to create audit directory")?;

        let export = AuditExport {
            export_id: Uuid::new_v4(),
            project_name: project_name.to_string(),
            exported_at: Utc::now(),
            summary: AuditSummary::from_entries(entries),
            entries: entries.to_vec(),
        };

        let filename = format!(
            "{}_{}.json",
            export.exported_at.format("%Y-%m-%dT%H-%M-%S"),
            &export.export_id.to_string()[..8]
        );
        let export_file = self.audit_dir.join(&filename);

        let json =
            serde_json::to_string_pretty(&export).context("Failed to serialize audit export")?;
        fs::write(&export_file, json).context("Failed to write audit export file")?;

        tracing::info!(
            path = %export_file.display(),
            entries = entries.len(),
            "audit trail exported"
        );
        Ok(export_file)
    }

    /// Exports on disk, most recent first.
    pub fn list_exports(&self) -> Result<Vec<PathBuf>> {
        if !self.audit_dir.exists() {
            return Ok(Vec::new());
        }

        let mut exports: Vec<PathBuf> = fs::read_dir(&self.audit_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map(|e| e == "json").unwrap_or(false))
            .collect();

        exports.sort();
        exports.reverse();
        Ok(exports)
    }

    pub fn load_export(&self, path: &Path) -> Result<AuditExport> {
        let content = fs::read_to_string(path).context("Failed to read audit export file")?;
        let export: AuditExport =
            serde_json::from_str(&content).context("Failed to parse audit export file")?;
        Ok(export)
    }
}
