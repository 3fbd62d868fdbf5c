//! Drift detection between persisted project state and the filesystem.
//!
//! Two independent checks:
//! - `detect_drift` reads the state file, then verifies the current phase's
//!   required artifacts and any recorded checksums.
//! - `check_directory_drift` compares a hash of the state directory against a
//!   saved baseline.
//!
//! Neither check touches files. `reconcile` only annotates `ProjectState`.

pub mod circuit;
pub mod hash;

pub use circuit::{
    BreakerConfig, BreakerDecision, CircuitBreaker, CircuitState, ErrorSignature,
    HumanInterventionRequest, RetryContext, TripReason,
};
pub use hash::{DirectoryDrift, DirectoryHash};

use crate::orchestrator::state::{StatePaths, write_json_atomic};
use crate::phase::Phase;
use crate::project::{ProjectState, context_keys};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DriftStatus {
    Consistent,
    Detected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftFindingKind {
    StateUnreadable,
    MissingArtifact,
    ChecksumMismatch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftFinding {
    pub kind: DriftFindingKind,
    pub path: String,
    pub message: String,
}

impl DriftFinding {
    fn new(kind: DriftFindingKind, path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// Recovery paths offered with every detected drift, in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecoveryOption {
    AutoReconcile,
    ManualCorrection,
    Rollback,
}

impl RecoveryOption {
    pub const ALL: [RecoveryOption; 3] = [
        RecoveryOption::AutoReconcile,
        RecoveryOption::ManualCorrection,
        RecoveryOption::Rollback,
    ];

    pub fn label(self) -> &'static str {
        match self {
            RecoveryOption::AutoReconcile => "auto-reconcile",
            RecoveryOption::ManualCorrection => "manual-correction",
            RecoveryOption::Rollback => "rollback",
        }
    }

    pub fn risk(self) -> RiskLevel {
        match self {
            RecoveryOption::AutoReconcile => RiskLevel::Low,
            RecoveryOption::ManualCorrection => RiskLevel::Medium,
            RecoveryOption::Rollback => RiskLevel::High,
        }
    }
}

impl fmt::Display for RecoveryOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriftReport {
    pub status: DriftStatus,
    /// Phase read from the state file, if it could be read.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    pub findings: Vec<DriftFinding>,
    /// Empty when consistent.
    pub recovery_options: Vec<RecoveryOption>,
    pub checked_at: DateTime<Utc>,
}

impl DriftReport {
    fn from_findings(phase: Option<Phase>, findings: Vec<DriftFinding>) -> Self {
        let (status, recovery_options) = if findings.is_empty() {
            (DriftStatus::Consistent, Vec::new())
        } else {
            (DriftStatus::Detected, RecoveryOption::ALL.to_vec())
        };
        Self {
            status,
            phase,
            findings,
            recovery_options,
            checked_at: Utc::now(),
        }
    }

    pub fn is_detected(&self) -> bool {
        self.status == DriftStatus::Detected
    }

    /// One line per finding, for check details and CLI output.
    pub fn summary(&self) -> String {
        if !self.is_detected() {
            return "No drift detected".to_string();
        }
        self.findings
            .iter()
            .map(|f| format!("{}: {}", f.path, f.message))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

pub struct StateDriftDetector {
    project_root: PathBuf,
    paths: StatePaths,
    breaker: CircuitBreaker,
}

impl StateDriftDetector {
    pub fn new(project_root: &Path, paths: StatePaths, breaker_config: BreakerConfig) -> Self {
        Self {
            project_root: project_root.to_path_buf(),
            paths,
            breaker: CircuitBreaker::new(breaker_config),
        }
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    pub fn paths(&self) -> &StatePaths {
        &self.paths
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn breaker_mut(&mut self) -> &mut CircuitBreaker {
        &mut self.breaker
    }

    /// Compare the persisted state with the filesystem.
    pub fn detect_drift(&self) -> Result<DriftReport> {
        let state_file = &self.paths.state_file;
        if !state_file.exists() {
            tracing::debug!(path = %state_file.display(), "no persisted state, treating as consistent");
            return Ok(DriftReport::from_findings(None, Vec::new()));
        }

        let state_name = state_file.display().to_string();
        let state: ProjectState = match std::fs::read_to_string(state_file)
            .map_err(anyhow::Error::from)
            .and_then(|s| serde_json::from_str(&s).map_err(anyhow::Error::from))
        {
            Ok(state) => state,
            Err(e) => {
                let finding = DriftFinding::new(
                    DriftFindingKind::StateUnreadable,
                    state_name,
                    format!("State file could not be parsed: {}", e),
                );
                tracing::warn!(error = %e, "state file unreadable during drift check");
                return Ok(DriftReport::from_findings(None, vec![finding]));
            }
        };

        let mut findings = Vec::new();

        for artifact in state.phase.required_artifacts() {
            if !self.project_root.join(artifact).exists() {
                findings.push(DriftFinding::new(
                    DriftFindingKind::MissingArtifact,
                    *artifact,
                    format!("Required for {} but missing", state.phase),
                ));
            }
        }

        match self.load_checksums() {
            Ok(checksums) => {
                for (rel, expected) in &checksums {
                    let path = self.project_root.join(rel);
                    if !path.exists() {
                        findings.push(DriftFinding::new(
                            DriftFindingKind::ChecksumMismatch,
                            rel,
                            "Recorded file no longer exists",
                        ));
                        continue;
                    }
                    let actual = hash::file_checksum(&path)?;
                    if &actual != expected {
                        findings.push(DriftFinding::new(
                            DriftFindingKind::ChecksumMismatch,
                            rel,
                            "Content changed since checksum was recorded",
                        ));
                    }
                }
            }
            Err(e) => findings.push(DriftFinding::new(
                DriftFindingKind::StateUnreadable,
                self.paths.checksums_file.display().to_string(),
                format!("Checksum file could not be parsed: {:#}", e),
            )),
        }

        let report = DriftReport::from_findings(Some(state.phase), findings);
        if report.is_detected() {
            tracing::warn!(
                phase = %state.phase,
                findings = report.findings.len(),
                "state drift detected"
            );
        }
        Ok(report)
    }

    /// Annotate `state` with the report. Progress fields are never touched.
    /// Returns whether drift was recorded.
    pub fn reconcile(&self, state: &mut ProjectState, report: &DriftReport) -> Result<bool> {
        let detected = report.is_detected();
        state.context.insert(
            context_keys::DRIFT_DETECTED.to_string(),
            serde_json::Value::Bool(detected),
        );
        state.context.insert(
            context_keys::DRIFT_FINDINGS.to_string(),
            serde_json::to_value(&report.findings).context("Failed to serialize drift findings")?,
        );
        state.context.insert(
            context_keys::DRIFT_RECONCILED_AT.to_string(),
            serde_json::Value::String(Utc::now().to_rfc3339()),
        );
        tracing::info!(detected, findings = report.findings.len(), "drift reconciled into state");
        Ok(detected)
    }

    /// Recorded checksums, keyed by path relative to the project root.
    pub fn load_checksums(&self) -> Result<BTreeMap<String, String>> {
        let path = &self.paths.checksums_file;
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Hash `rel_paths` (relative to the project root) into the checksum file,
    /// keeping entries for other paths.
    pub fn record_checksums(&self, rel_paths: &[&str]) -> Result<BTreeMap<String, String>> {
        let mut checksums = self.load_checksums()?;
        for rel in rel_paths {
            let checksum = hash::file_checksum(&self.project_root.join(rel))?;
            checksums.insert(rel.to_string(), checksum);
        }
        write_json_atomic(&self.paths.checksums_file, &checksums)?;
        tracing::info!(files = rel_paths.len(), "checksums recorded");
        Ok(checksums)
    }

    /// Snapshot of the state directory without the kernel's bookkeeping files.
    pub fn directory_snapshot(&self) -> Result<DirectoryHash> {
        DirectoryHash::compute(&self.paths.dir, &StatePaths::BOOKKEEPING_FILES)
    }

    pub fn check_directory_drift(&self, baseline: Option<&DirectoryHash>) -> Result<DirectoryDrift> {
        let Some(baseline) = baseline else {
            return Ok(DirectoryDrift::no_baseline());
        };
        let current = self.directory_snapshot()?;
        let drift = baseline.diff(&current);
        if drift.drift {
            tracing::warn!(
                changed = drift.changed.len(),
                added = drift.added.len(),
                deleted = drift.deleted.len(),
                "state directory drifted from baseline"
            );
        }
        Ok(drift)
    }

    pub fn persist_breaker(&self) -> Result<()> {
        self.breaker.persist_state(&self.paths.breaker_file)
    }

    pub fn restore_breaker(&mut self) -> Result<bool> {
        self.breaker.restore_state(&self.paths.breaker_file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::state::StateStore;
    use crate::phase::{ANALYSIS_DOC, PRD_DOC};
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        root: PathBuf,
        store: StateStore,
        detector: StateDriftDetector,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("project");
        fs::create_dir_all(root.join("docs")).unwrap();
        let paths = StatePaths::new(&dir.path().join("state"));
        let store = StateStore::new(paths.clone());
        let detector = StateDriftDetector::new(&root, paths, BreakerConfig::default());
        Fixture {
            _dir: dir,
            root,
            store,
            detector,
        }
    }

    fn save_at(store: &StateStore, phase: Phase) -> ProjectState {
        let mut state = ProjectState::new("demo");
        state.phase = phase;
        state.total_steps = phase.total_steps();
        store.save(&state).unwrap();
        state
    }

    #[test]
    fn test_no_state_is_consistent() {
        let fx = fixture();
        let report = fx.detector.detect_drift().unwrap();
        assert_eq!(report.status, DriftStatus::Consistent);
        assert!(report.recovery_options.is_empty());
        assert_eq!(report.phase, None);
    }

    #[test]
    fn test_unparseable_state_is_drift() {
        let fx = fixture();
        fs::create_dir_all(&fx.detector.paths().dir).unwrap();
        fs::write(&fx.detector.paths().state_file, "{ not json").unwrap();

        let report = fx.detector.detect_drift().unwrap();
        assert!(report.is_detected());
        assert_eq!(report.findings[0].kind, DriftFindingKind::StateUnreadable);
    }

    #[test]
    fn test_missing_artifacts_reported_with_fixed_options() {
        let fx = fixture();
        save_at(&fx.store, Phase::Solutioning);
        fs::write(fx.root.join(ANALYSIS_DOC), "# Analysis").unwrap();

        let report = fx.detector.detect_drift().unwrap();
        assert!(report.is_detected());
        assert_eq!(report.findings.len(), 1);
        assert_eq!(report.findings[0].path, PRD_DOC);
        assert_eq!(report.findings[0].kind, DriftFindingKind::MissingArtifact);

        let labels: Vec<_> = report.recovery_options.iter().map(|o| o.label()).collect();
        assert_eq!(labels, vec!["auto-reconcile", "manual-correction", "rollback"]);
        let risks: Vec<_> = report.recovery_options.iter().map(|o| o.risk()).collect();
        assert_eq!(risks, vec![RiskLevel::Low, RiskLevel::Medium, RiskLevel::High]);
    }

    #[test]
    fn test_checksum_mismatch_and_missing_recorded_file() {
        let fx = fixture();
        save_at(&fx.store, Phase::Analysis);
        fs::write(fx.root.join("docs/notes.md"), "v1").unwrap();
        fs::write(fx.root.join("docs/extra.md"), "v1").unwrap();
        fx.detector
            .record_checksums(&["docs/notes.md", "docs/extra.md"])
            .unwrap();
        assert!(!fx.detector.detect_drift().unwrap().is_detected());

        fs::write(fx.root.join("docs/notes.md"), "v2").unwrap();
        fs::remove_file(fx.root.join("docs/extra.md")).unwrap();

        let report = fx.detector.detect_drift().unwrap();
        assert_eq!(report.findings.len(), 2);
        assert!(
            report
                .findings
                .iter()
                .all(|f| f.kind == DriftFindingKind::ChecksumMismatch)
        );
    }

    #[test]
    fn test_reconcile_annotates_without_touching_progress() {
        let fx = fixture();
        let mut state = save_at(&fx.store, Phase::Planning);
        state.current_step = 3;

        let report = fx.detector.detect_drift().unwrap();
        assert!(fx.detector.reconcile(&mut state, &report).unwrap());
        assert!(state.context_flag(context_keys::DRIFT_DETECTED));
        assert_eq!(state.phase, Phase::Planning);
        assert_eq!(state.current_step, 3);
        assert!(state.context.contains_key(context_keys::DRIFT_RECONCILED_AT));
        // Files are never created by reconciliation.
        assert!(!fx.root.join(ANALYSIS_DOC).exists());
    }

    #[test]
    fn test_directory_drift_lifecycle() {
        let fx = fixture();
        save_at(&fx.store, Phase::New);
        let drift = fx.detector.check_directory_drift(None).unwrap();
        assert!(!drift.drift);
        assert!(!drift.has_baseline());

        fs::write(fx.detector.paths().dir.join("notes.txt"), "one").unwrap();
        let baseline = fx.detector.directory_snapshot().unwrap();
        assert!(!baseline.files.contains_key("state.json"));

        // Rewriting the state file is not drift.
        save_at(&fx.store, Phase::Analysis);
        assert!(!fx.detector.check_directory_drift(Some(&baseline)).unwrap().drift);

        fs::write(fx.detector.paths().dir.join("notes.txt"), "two").unwrap();
        let drift = fx.detector.check_directory_drift(Some(&baseline)).unwrap();
        assert!(drift.drift);
        assert_eq!(drift.changed, vec!["notes.txt"]);
    }
}
