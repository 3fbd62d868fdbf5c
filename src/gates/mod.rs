//! Quality gate guarding the IMPLEMENTATION → WRAP_UP transition.
//!
//! Checks run in a fixed order:
//!
//! | Check             | Fails as | Source                               |
//! |-------------------|----------|--------------------------------------|
//! | `state-drift`     | error    | `StateDriftDetector::detect_drift`   |
//! | `directory-drift` | warning  | saved directory baseline             |
//! | `architecture`    | error    | `DocumentArchitectureGuard`          |
//! | `security`        | error    | `CommandSecurityGuard`               |
//!
//! Any error-severity failure blocks the transition. Warnings alone let it
//! through. The gate has no bypass.

pub mod architecture;
pub mod refiner;
pub mod security;

pub use architecture::DocumentArchitectureGuard;
pub use refiner::{ActionType, RefinementAction, RefinerManager};
pub use security::CommandSecurityGuard;

use crate::drift::{DirectoryHash, StateDriftDetector};
use crate::project::{ProjectState, context_keys};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

pub const CHECK_STATE_DRIFT: &str = "state-drift";
pub const CHECK_DIRECTORY_DRIFT: &str = "directory-drift";
pub const CHECK_ARCHITECTURE: &str = "architecture";
pub const CHECK_SECURITY: &str = "security";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckSeverity {
    Error,
    Warning,
    Info,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityCheck {
    pub name: String,
    pub passed: bool,
    pub details: String,
    pub severity: CheckSeverity,
}

impl QualityCheck {
    pub fn pass(name: &str, details: impl Into<String>, severity: CheckSeverity) -> Self {
        Self {
            name: name.to_string(),
            passed: true,
            details: details.into(),
            severity,
        }
    }

    pub fn fail(name: &str, details: impl Into<String>, severity: CheckSeverity) -> Self {
        Self {
            name: name.to_string(),
            passed: false,
            details: details.into(),
            severity,
        }
    }

    pub fn is_blocking(&self) -> bool {
        !self.passed && self.severity == CheckSeverity::Error
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GateStatus {
    Passed,
    Warning,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityGateResult {
    pub status: GateStatus,
    pub can_transition: bool,
    pub checks: Vec<QualityCheck>,
    pub refinements: Vec<RefinementAction>,
    pub evaluated_at: DateTime<Utc>,
}

impl QualityGateResult {
    fn from_checks(checks: Vec<QualityCheck>, refinements: Vec<RefinementAction>) -> Self {
        let status = classify(&checks);
        Self {
            status,
            can_transition: status != GateStatus::Failed,
            checks,
            refinements,
            evaluated_at: Utc::now(),
        }
    }

    pub fn failed_checks(&self) -> impl Iterator<Item = &QualityCheck> {
        self.checks.iter().filter(|c| !c.passed)
    }

    /// Failing check names joined for audit messages.
    pub fn failure_summary(&self) -> String {
        let names: Vec<_> = self
            .checks
            .iter()
            .filter(|c| c.is_blocking())
            .map(|c| c.name.as_str())
            .collect();
        format!("Quality gate failed: {}", names.join(", "))
    }
}

fn classify(checks: &[QualityCheck]) -> GateStatus {
    if checks.iter().any(QualityCheck::is_blocking) {
        GateStatus::Failed
    } else if checks
        .iter()
        .any(|c| !c.passed && c.severity == CheckSeverity::Warning)
    {
        GateStatus::Warning
    } else {
        GateStatus::Passed
    }
}

/// What a guard sees when it runs.
pub struct GuardContext<'a> {
    pub project_root: &'a Path,
    pub state: &'a ProjectState,
}

/// Report returned by a guard. External guards may send `valid` instead of `passed`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GuardReport {
    #[serde(alias = "valid")]
    pub passed: bool,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl GuardReport {
    pub fn from_findings(errors: Vec<String>, warnings: Vec<String>) -> Self {
        Self {
            passed: errors.is_empty(),
            errors,
            warnings,
            summary: None,
        }
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    /// Map onto a gate check: errors fail as error, warnings fail as warning.
    fn into_check(self, name: &str) -> QualityCheck {
        let mut parts: Vec<String> = self.summary.into_iter().collect();
        parts.extend(self.errors.iter().cloned());
        parts.extend(self.warnings.iter().cloned());
        let details = if parts.is_empty() {
            "No issues reported".to_string()
        } else {
            parts.join("; ")
        };

        if !self.passed || !self.errors.is_empty() {
            QualityCheck::fail(name, details, CheckSeverity::Error)
        } else if !self.warnings.is_empty() {
            QualityCheck::fail(name, details, CheckSeverity::Warning)
        } else {
            QualityCheck::pass(name, details, CheckSeverity::Info)
        }
    }
}

#[async_trait]
pub trait Guard: Send + Sync {
    async fn validate(&self, ctx: &GuardContext<'_>) -> Result<GuardReport>;
}

pub struct QualityGateInterceptor {
    architecture: Arc<dyn Guard>,
    security: Arc<dyn Guard>,
    refiner: RefinerManager,
}

impl QualityGateInterceptor {
    pub fn new(architecture: Arc<dyn Guard>, security: Arc<dyn Guard>) -> Self {
        Self {
            architecture,
            security,
            refiner: RefinerManager::new(),
        }
    }

    /// The gate cannot be configured away.
    pub fn can_bypass(&self) -> bool {
        false
    }

    pub async fn verify_quality_gate(
        &self,
        state: &ProjectState,
        detector: &StateDriftDetector,
    ) -> QualityGateResult {
        let ctx = GuardContext {
            project_root: detector.project_root(),
            state,
        };

        let checks = vec![
            state_drift_check(detector),
            directory_drift_check(state, detector),
            run_guard(CHECK_ARCHITECTURE, self.architecture.as_ref(), &ctx).await,
            run_guard(CHECK_SECURITY, self.security.as_ref(), &ctx).await,
        ];

        let refinements = self.refiner.generate(&checks);
        let result = QualityGateResult::from_checks(checks, refinements);

        tracing::info!(
            status = ?result.status,
            can_transition = result.can_transition,
            failed = result.failed_checks().count(),
            "quality gate evaluated"
        );
        result
    }
}

fn state_drift_check(detector: &StateDriftDetector) -> QualityCheck {
    match detector.detect_drift() {
        Ok(report) if report.is_detected() => {
            QualityCheck::fail(CHECK_STATE_DRIFT, report.summary(), CheckSeverity::Error)
        }
        Ok(report) => QualityCheck::pass(CHECK_STATE_DRIFT, report.summary(), CheckSeverity::Error),
        Err(e) => QualityCheck::fail(
            CHECK_STATE_DRIFT,
            format!("Drift detection failed: {:#}", e),
            CheckSeverity::Error,
        ),
    }
}

fn directory_drift_check(state: &ProjectState, detector: &StateDriftDetector) -> QualityCheck {
    let baseline = match state
        .context
        .get(context_keys::DIRECTORY_BASELINE)
        .cloned()
        .map(serde_json::from_value::<DirectoryHash>)
        .transpose()
    {
        Ok(baseline) => baseline,
        Err(e) => {
            return QualityCheck::fail(
                CHECK_DIRECTORY_DRIFT,
                format!("Stored directory baseline is unreadable: {}", e),
                CheckSeverity::Warning,
            );
        }
    };

    match detector.check_directory_drift(baseline.as_ref()) {
        Ok(drift) if !drift.has_baseline() => {
            QualityCheck::pass(CHECK_DIRECTORY_DRIFT, drift.message, CheckSeverity::Info)
        }
        Ok(drift) if drift.drift => {
            let files: Vec<_> = drift.affected_files().map(String::as_str).collect();
            QualityCheck::fail(
                CHECK_DIRECTORY_DRIFT,
                format!("{} ({})", drift.message, files.join(", ")),
                CheckSeverity::Warning,
            )
        }
        Ok(drift) => QualityCheck::pass(CHECK_DIRECTORY_DRIFT, drift.message, CheckSeverity::Warning),
        Err(e) => QualityCheck::fail(
            CHECK_DIRECTORY_DRIFT,
            format!("Directory hash failed: {:#}", e),
            CheckSeverity::Warning,
        ),
    }
}

async fn run_guard(name: &str, guard: &dyn Guard, ctx: &GuardContext<'_>) -> QualityCheck {
    match guard.validate(ctx).await {
        Ok(report) => report.into_check(name),
        Err(e) => {
            tracing::warn!(check = name, error = %e, "guard failed to run");
            QualityCheck::fail(name, format!("Guard failed: {:#}", e), CheckSeverity::Error)
        }
    }
}
