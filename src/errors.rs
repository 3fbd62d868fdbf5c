//! Typed error hierarchy for the phasegate kernel.
//!
//! Two enums cover the caller-facing surfaces:
//! - `StateMachineError`: validation, transition, circuit and persistence failures
//! - `LockError`: workspace lock conflicts and misattributed releases
//!
//! Quality-gate verdicts are not errors; see `gates::QualityGateResult`.

use crate::drift::TripReason;
use crate::locks::LockType;
use crate::phase::{Phase, TransitionAction};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors from the state machine and its persistence layer.
#[derive(Debug, Error)]
pub enum StateMachineError {
    #[error("Invalid {field}: {message}")]
    Validation { field: &'static str, message: String },

    #[error("Cannot {action} from {from}. Valid actions: {}", format_actions(.valid_actions))]
    InvalidTransition {
        from: Phase,
        action: TransitionAction,
        valid_actions: Vec<TransitionAction>,
    },

    #[error("Circuit breaker is open; retry after {}ms", .retry_after.as_millis())]
    CircuitOpen {
        retry_after: Duration,
        reason: Option<TripReason>,
    },

    #[error("No project state at {path}. Run initialize first")]
    NotInitialized { path: PathBuf },

    #[error("Error record {id} not found")]
    ErrorNotFound { id: String },

    #[error("Failed to persist state to {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read state file at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("State file at {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to serialize project state: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StateMachineError {
    /// Short machine-readable code recorded on failed audit entries.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::CircuitOpen { .. } => "CIRCUIT_OPEN",
            Self::NotInitialized { .. } => "NOT_INITIALIZED",
            Self::ErrorNotFound { .. } => "ERROR_NOT_FOUND",
            Self::Persist { .. } | Self::Read { .. } => "PERSISTENCE_ERROR",
            Self::Corrupt { .. } | Self::Serialize(_) => "STATE_CORRUPT",
            Self::Other(_) => "INTERNAL_ERROR",
        }
    }
}

fn format_actions(actions: &[TransitionAction]) -> String {
    if actions.is_empty() {
        return "none".to_string();
    }
    actions
        .iter()
        .map(|a| a.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Errors from the workspace lock manager.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("Cannot acquire {requested} lock on {path}: {held} lock held by {holder}")]
    Conflict {
        path: String,
        holder: String,
        held: LockType,
        requested: LockType,
    },

    #[error("Agent {agent_id} holds no lock on {path}")]
    NotHeld { path: String, agent_id: String },

    #[error("Bypass token {token} is not registered for {path}")]
    UnknownBypassToken { path: String, token: String },

    #[error("Lock table poisoned")]
    Poisoned,
}
