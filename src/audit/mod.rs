use crate::phase::{Phase, TransitionAction};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// One attempted transition. Entries are appended to `ProjectState::audit_log`
/// and never edited or removed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransitionAuditEntry {
    pub id: Uuid,
    pub from: Phase,
    pub to: Phase,
    pub action: TransitionAction,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: Uuid,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl TransitionAuditEntry {
    pub fn succeeded(
        from: Phase,
        to: Phase,
        action: TransitionAction,
        correlation_id: Uuid,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            from,
            to,
            action,
            timestamp: Utc::now(),
            correlation_id,
            success: true,
            error_code: None,
            error_message: None,
        }
    }

    /// A rejected attempt. `to` equals `from` since nothing moved.
    pub fn failed(
        from: Phase,
        action: TransitionAction,
        correlation_id: Uuid,
        error_code: &str,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            from,
            to: from,
            action,
            timestamp: Utc::now(),
            correlation_id,
            success: false,
            error_code: Some(error_code.to_string()),
            error_message: Some(error_message.into()),
        }
    }
}

/// Aggregate counts over an audit trail.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuditSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Failure count per error code.
    pub failures_by_code: BTreeMap<String, usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_at: Option<DateTime<Utc>>,
}

impl AuditSummary {
    pub fn from_entries(entries: &[TransitionAuditEntry]) -> Self {
        let mut summary = AuditSummary {
            total: entries.len(),
            ..Default::default()
        };
        for entry in entries {
            if entry.success {
                summary.succeeded += 1;
            } else {
                summary.failed += 1;
                let code = entry.error_code.clone().unwrap_or_else(|| "UNKNOWN".into());
                *summary.failures_by_code.entry(code).or_insert(0) += 1;
            }
        }
        summary.last_transition_at = entries.last().map(|e| e.timestamp);
        summary
    }
}

pub mod logger;
pub use logger::{AuditExport, AuditExporter};
