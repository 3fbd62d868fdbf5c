//! Project state: the single persisted record the state machine owns.

use crate::audit::TransitionAuditEntry;
use crate::phase::{self, Phase};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Maximum accepted project name length, in characters.
pub const MAX_PROJECT_NAME_LEN: usize = 255;

/// Well-known keys the kernel writes into `ProjectState::context`.
pub mod context_keys {
    /// Saved `DirectoryHash` baseline for the state directory.
    pub const DIRECTORY_BASELINE: &str = "directoryBaseline";
    /// Set to `true` by drift reconciliation.
    pub const DRIFT_DETECTED: &str = "driftDetected";
    /// Findings recorded by the last reconciliation.
    pub const DRIFT_FINDINGS: &str = "driftFindings";
    /// Timestamp of the last reconciliation.
    pub const DRIFT_RECONCILED_AT: &str = "driftReconciledAt";
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectState {
    pub project_name: String,
    pub phase: Phase,
    pub current_step: u32,
    pub total_steps: u32,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub decisions: Vec<Decision>,
    #[serde(default)]
    pub errors: Vec<ErrorRecord>,
    #[serde(default)]
    pub context: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub audit_log: Vec<TransitionAuditEntry>,
}

impl ProjectState {
    /// Fresh state at NEW, step 1.
    pub fn new(project_name: impl Into<String>) -> Self {
        Self {
            project_name: project_name.into(),
            phase: Phase::New,
            current_step: 1,
            total_steps: Phase::New.total_steps(),
            last_updated: Utc::now(),
            decisions: Vec::new(),
            errors: Vec::new(),
            context: BTreeMap::new(),
            audit_log: Vec::new(),
        }
    }

    /// Position in the phase, e.g. `3/5`.
    pub fn step_label(&self) -> String {
        format!("{}/{}", self.current_step, self.total_steps)
    }

    /// Logical state label used by the circuit breaker, e.g. `IMPLEMENTATION:10/10`.
    pub fn breaker_label(&self) -> String {
        format!("{}:{}", self.phase, self.step_label())
    }

    /// Whether the project sits on the last step of its current phase.
    pub fn at_last_step(&self) -> bool {
        self.current_step >= self.total_steps
    }

    /// Completed steps across the whole lifecycle.
    pub fn progress(&self) -> Progress {
        let total = phase::lifecycle_total_steps();
        let current = if self.phase.is_terminal() {
            total
        } else {
            phase::steps_before(self.phase) + self.current_step.saturating_sub(1)
        };
        Progress::new(current, total)
    }

    pub fn unresolved_errors(&self) -> impl Iterator<Item = &ErrorRecord> {
        self.errors.iter().filter(|e| !e.resolved)
    }

    pub fn context_flag(&self, key: &str) -> bool {
        self.context
            .get(key)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

/// Lifecycle progress summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub current: u32,
    pub total: u32,
    pub percentage: u32,
}

impl Progress {
    pub fn new(current: u32, total: u32) -> Self {
        let percentage = if total == 0 {
            100
        } else {
            ((current as f64 / total as f64) * 100.0).round() as u32
        };
        Self {
            current,
            total,
            percentage,
        }
    }
}

/// A recorded project decision. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub id: String,
    pub phase: Phase,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Decision {
    pub fn new(phase: Phase, description: &str, rationale: Option<&str>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            phase,
            description: description.to_string(),
            rationale: rationale.map(str::to_string),
            timestamp: Utc::now(),
        }
    }
}

/// A recorded project error. Never removed; may be marked resolved.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    pub id: String,
    pub phase: Phase,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub resolved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ErrorRecord {
    pub fn new(phase: Phase, message: &str, code: Option<&str>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            phase,
            message: message.to_string(),
            code: code.map(str::to_string),
            timestamp: Utc::now(),
            resolved: false,
            resolved_at: None,
        }
    }

    pub fn resolve(&mut self) {
        if !self.resolved {
            self.resolved = true;
            self.resolved_at = Some(Utc::now());
        }
    }
}
