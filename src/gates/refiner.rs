use super::{CHECK_ARCHITECTURE, CHECK_SECURITY, CHECK_STATE_DRIFT, CheckSeverity, QualityCheck};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    Reconcile,
    Refine,
}

/// Advisory remediation for one failing check. Never applied automatically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefinementAction {
    pub id: String,
    pub check_name: String,
    pub action_type: ActionType,
    pub description: String,
    pub suggested_steps: Vec<String>,
    pub severity: CheckSeverity,
}

#[derive(Debug, Default)]
pub struct RefinerManager;

impl RefinerManager {
    pub fn new() -> Self {
        Self
    }

    /// One action per error-severity failure, in check order.
    pub fn generate(&self, checks: &[QualityCheck]) -> Vec<RefinementAction> {
        checks
            .iter()
            .filter(|c| c.is_blocking())
            .map(|check| RefinementAction {
                id: Uuid::new_v4().to_string(),
                check_name: check.name.clone(),
                action_type: if check.name.contains("drift") {
                    ActionType::Reconcile
                } else {
                    ActionType::Refine
                },
                description: format!("Resolve failing '{}' check: {}", check.name, check.details),
                suggested_steps: suggested_steps(&check.name),
                severity: check.severity,
            })
            .collect()
    }
}

fn suggested_steps(check_name: &str) -> Vec<String> {
    let steps: &[&str] = match check_name {
        CHECK_STATE_DRIFT => &[
            "Run `phasegate drift check` to list the findings",
            "Restore or create the missing artifacts, or record fresh checksums",
            "Run `phasegate drift reconcile` once the workspace matches the state",
        ],
        CHECK_ARCHITECTURE => &[
            "Complete docs/architecture.md and docs/tech-spec.md",
            "Add Overview, Technology and Security sections to the architecture document",
            "Replace TODO, FIXME and placeholder markers with real content",
        ],
        CHECK_SECURITY => &[
            "Review the findings reported by the security command",
            "Fix or explicitly accept each finding, then re-run the gate",
        ],
        _ => &[
            "Review the check details",
            "Address the failure, then re-run the gate",
        ],
    };
    steps.iter().map(|s| s.to_string()).collect()
}
