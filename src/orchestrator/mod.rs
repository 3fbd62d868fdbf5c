pub mod machine;
pub mod state;

pub use machine::{QUALITY_GATE_FAILED, StateMachine, TransitionOutcome};
pub use state::{StatePaths, StateStore, WalEntry, default_state_dir, write_json_atomic};

use crate::config::PhasegateConfig;
use crate::drift::StateDriftDetector;
use crate::gates::QualityGateInterceptor;
use crate::gates::architecture::DocumentArchitectureGuard;
use crate::gates::security::CommandSecurityGuard;
use crate::telemetry::TracingTelemetry;
use anyhow::Result;
use std::sync::Arc;

/// Wire a state machine from layered configuration.
///
/// The persisted circuit breaker is restored when present. A breaker file
/// that cannot be read is logged and replaced by a closed breaker.
pub fn build_state_machine(config: &PhasegateConfig) -> Result<StateMachine> {
    let paths = config.state_paths()?;
    tracing::debug!(state_dir = %paths.dir.display(), "building state machine");

    let mut detector =
        StateDriftDetector::new(&config.project_dir, paths.clone(), config.breaker());
    match detector.restore_breaker() {
        Ok(true) => tracing::debug!("restored circuit breaker state"),
        Ok(false) => {}
        Err(e) => tracing::warn!(error = %e, "ignoring unreadable circuit breaker state"),
    }

    let gate = QualityGateInterceptor::new(
        Arc::new(DocumentArchitectureGuard::new(
            config.toml.gate.min_architecture_score,
        )),
        Arc::new(CommandSecurityGuard::new(
            config.security_command(),
            config.security_timeout(),
        )),
    );

    Ok(StateMachine::new(
        StateStore::new(paths),
        detector,
        gate,
        Arc::new(TracingTelemetry::new()),
    ))
}
