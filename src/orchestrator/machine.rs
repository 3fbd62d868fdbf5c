use super::state::{StateStore, WalEntry};
use crate::audit::{AuditExporter, TransitionAuditEntry};
use crate::drift::{
    BreakerDecision, CircuitBreaker, CircuitState, DirectoryDrift, DirectoryHash, DriftReport,
    ErrorSignature, StateDriftDetector,
};
use crate::errors::StateMachineError;
use crate::gates::{QualityGateInterceptor, QualityGateResult};
use crate::phase::{Phase, TransitionAction};
use crate::project::{
    Decision, ErrorRecord, MAX_PROJECT_NAME_LEN, ProjectState, Progress, context_keys,
};
use crate::telemetry::{MetricAttrs, TelemetryCollector};
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

type SmResult<T> = Result<T, StateMachineError>;

/// Audit code for a transition blocked by the quality gate.
pub const QUALITY_GATE_FAILED: &str = "QUALITY_GATE_FAILED";

const TRANSITION_METRIC: &str = "phasegate.transition";

/// Result of a transition attempt that did not raise an error.
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    /// The step or phase moved. `gate` is set when the quality gate ran.
    Transitioned {
        entry: TransitionAuditEntry,
        gate: Option<QualityGateResult>,
    },
    /// The quality gate refused to let IMPLEMENTATION finish.
    Blocked(QualityGateResult),
}

impl TransitionOutcome {
    pub fn is_transitioned(&self) -> bool {
        matches!(self, TransitionOutcome::Transitioned { .. })
    }
}

/// Owns the project state and every change made to it.
pub struct StateMachine {
    store: StateStore,
    state: Option<ProjectState>,
    detector: StateDriftDetector,
    gate: QualityGateInterceptor,
    telemetry: Arc<dyn TelemetryCollector>,
}

impl StateMachine {
    pub fn new(
        store: StateStore,
        detector: StateDriftDetector,
        gate: QualityGateInterceptor,
        telemetry: Arc<dyn TelemetryCollector>,
    ) -> Self {
        Self {
            store,
            state: None,
            detector,
            gate,
            telemetry,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn detector(&self) -> &StateDriftDetector {
        &self.detector
    }

    pub fn detector_mut(&mut self) -> &mut StateDriftDetector {
        &mut self.detector
    }

    /// Create a fresh project at NEW, step 1, replacing any existing state.
    pub fn initialize(&mut self, project_name: &str) -> SmResult<ProjectState> {
        let name = project_name.trim();
        if name.is_empty() {
            return Err(StateMachineError::Validation {
                field: "project name",
                message: "must not be empty".to_string(),
            });
        }
        let len = name.chars().count();
        if len > MAX_PROJECT_NAME_LEN {
            return Err(StateMachineError::Validation {
                field: "project name",
                message: format!(
                    "must be at most {} characters, got {}",
                    MAX_PROJECT_NAME_LEN, len
                ),
            });
        }

        if self.store.exists() {
            tracing::warn!(path = %self.store.paths().state_file.display(), "replacing existing project state");
        }
        let state = ProjectState::new(name);
        self.commit(state.clone())?;
        tracing::info!(project = name, "project initialized");
        Ok(state)
    }

    fn loaded(&mut self) -> SmResult<&ProjectState> {
        if self.state.is_none() {
            let state = self
                .store
                .load()?
                .ok_or_else(|| StateMachineError::NotInitialized {
                    path: self.store.paths().state_file.clone(),
                })?;
            self.state = Some(state);
        }
        self.state
            .as_ref()
            .ok_or_else(|| StateMachineError::NotInitialized {
                path: self.store.paths().state_file.clone(),
            })
    }

    /// Persist `next` and make it current. The cached state is untouched on failure.
    fn commit(&mut self, next: ProjectState) -> SmResult<()> {
        self.store.save(&next)?;
        self.state = Some(next);
        Ok(())
    }

    /// Apply `edit` to a copy of the state and commit it.
    fn update<T>(&mut self, edit: impl FnOnce(&mut ProjectState) -> SmResult<T>) -> SmResult<T> {
        let mut next = self.loaded()?.clone();
        let value = edit(&mut next)?;
        next.last_updated = Utc::now();
        self.commit(next)?;
        Ok(value)
    }

    pub fn get_state(&mut self) -> SmResult<&ProjectState> {
        self.loaded()
    }

    pub fn get_current_phase(&mut self) -> SmResult<Phase> {
        Ok(self.loaded()?.phase)
    }

    pub fn get_progress(&mut self) -> SmResult<Progress> {
        Ok(self.loaded()?.progress())
    }

    pub fn get_audit_log(&mut self) -> SmResult<&[TransitionAuditEntry]> {
        Ok(&self.loaded()?.audit_log)
    }

    pub fn can_advance(&mut self) -> SmResult<bool> {
        Ok(!self.loaded()?.phase.is_terminal())
    }

    pub async fn advance(&mut self) -> SmResult<TransitionOutcome> {
        self.transition(TransitionAction::Advance).await
    }

    pub async fn rollback(&mut self) -> SmResult<TransitionOutcome> {
        self.transition(TransitionAction::Rollback).await
    }

    /// Attempt `action`. Every call appends exactly one audit entry.
    pub async fn transition(&mut self, action: TransitionAction) -> SmResult<TransitionOutcome> {
        let current = self.loaded()?.clone();
        let correlation_id = Uuid::new_v4();
        let cid = correlation_id.to_string();
        self.telemetry.start_timer(&cid);

        let result = self.apply(action, correlation_id, current.clone()).await;

        let mut attrs = MetricAttrs::new();
        attrs.insert("action".into(), action.to_string());
        attrs.insert("from".into(), current.phase.to_string());
        if let Ok(state) = self.loaded() {
            attrs.insert("to".into(), state.phase.to_string());
        }
        let outcome = match &result {
            Ok(TransitionOutcome::Transitioned { .. }) => "transitioned",
            Ok(TransitionOutcome::Blocked(_)) => "blocked",
            Err(e) => e.code(),
        };
        attrs.insert("outcome".into(), outcome.to_string());
        self.telemetry.record_metric(
            TRANSITION_METRIC,
            &cid,
            result.as_ref().is_ok_and(TransitionOutcome::is_transitioned),
            &attrs,
        );
        result
    }

    async fn apply(
        &mut self,
        action: TransitionAction,
        correlation_id: Uuid,
        current: ProjectState,
    ) -> SmResult<TransitionOutcome> {
        let from = current.phase;

        let valid_actions = from.valid_actions();
        if !valid_actions.contains(&action) {
            let err = StateMachineError::InvalidTransition {
                from,
                action,
                valid_actions,
            };
            tracing::warn!(%correlation_id, %from, %action, "invalid transition rejected");
            self.record_failure(current, action, correlation_id, &err.to_string(), err.code())?;
            return Err(err);
        }

        let leaves_implementation = action == TransitionAction::Advance
            && from == Phase::Implementation
            && current.at_last_step();

        let mut gate = None;
        if leaves_implementation {
            let result = self.run_gate(&current, action, correlation_id).await?;
            if !result.can_transition {
                let message = result.failure_summary();
                tracing::warn!(%correlation_id, %message, "transition blocked by quality gate");
                self.record_failure(current, action, correlation_id, &message, QUALITY_GATE_FAILED)?;
                return Ok(TransitionOutcome::Blocked(result));
            }
            gate = Some(result);
        }

        let mut next = current;
        match action {
            TransitionAction::Advance if next.current_step < next.total_steps => {
                next.current_step += 1;
            }
            TransitionAction::Advance => {
                next.phase = from.next();
                next.total_steps = next.phase.total_steps();
                next.current_step = if next.phase.is_terminal() { 0 } else { 1 };
            }
            TransitionAction::Rollback => {
                next.phase = from.previous().unwrap_or(Phase::New);
                next.total_steps = next.phase.total_steps();
                next.current_step = 1;
            }
            TransitionAction::Skip | TransitionAction::Override => {
                unreachable!("rejected by valid_actions")
            }
        }

        let entry = TransitionAuditEntry::succeeded(from, next.phase, action, correlation_id);
        next.audit_log.push(entry.clone());
        next.last_updated = Utc::now();
        let (to, step) = (next.phase, next.step_label());
        self.commit(next)?;

        tracing::info!(%correlation_id, %from, %to, %action, step = %step, "transition applied");
        Ok(TransitionOutcome::Transitioned { entry, gate })
    }

    /// Dry-run the quality gate. Nothing is recorded.
    pub async fn evaluate_gate(&mut self) -> SmResult<QualityGateResult> {
        let current = self.loaded()?.clone();
        Ok(self.gate.verify_quality_gate(&current, &self.detector).await)
    }

    /// Consult the breaker, run the gate and record the outcome.
    async fn run_gate(
        &mut self,
        current: &ProjectState,
        action: TransitionAction,
        correlation_id: Uuid,
    ) -> SmResult<QualityGateResult> {
        let label = current.breaker_label();

        if self.detector.breaker().state() == CircuitState::Open {
            let decision = self.detector.breaker_mut().check_and_record(&label, None);
            if let BreakerDecision::Rejected { retry_after } = decision {
                self.persist_breaker();
                let err = StateMachineError::CircuitOpen {
                    retry_after,
                    reason: self.detector.breaker().context().triggered_by,
                };
                tracing::warn!(%correlation_id, retry_after_ms = retry_after.as_millis() as u64, "circuit open, transition rejected");
                self.record_failure(
                    current.clone(),
                    action,
                    correlation_id,
                    &err.to_string(),
                    err.code(),
                )?;
                return Err(err);
            }
        }

        let result = self.gate.verify_quality_gate(current, &self.detector).await;
        let error = (!result.can_transition).then(|| ErrorSignature::new(result.failure_summary()));
        let decision = self.detector.breaker_mut().check_and_record(&label, error);
        tracing::debug!(?decision, "gate outcome recorded by circuit breaker");
        self.persist_breaker();
        Ok(result)
    }

    fn persist_breaker(&self) {
        if let Err(e) = self.detector.persist_breaker() {
            tracing::warn!(error = %e, "failed to persist circuit breaker state");
        }
    }

    /// Append a failed audit entry without touching progress.
    fn record_failure(
        &mut self,
        current: ProjectState,
        action: TransitionAction,
        correlation_id: Uuid,
        message: &str,
        code: &str,
    ) -> SmResult<()> {
        let mut next = current;
        next.audit_log.push(TransitionAuditEntry::failed(
            next.phase,
            action,
            correlation_id,
            code,
            message,
        ));
        self.commit(next)
    }

    pub fn add_decision(&mut self, description: &str, rationale: Option<&str>) -> SmResult<Decision> {
        if description.trim().is_empty() {
            return Err(StateMachineError::Validation {
                field: "decision",
                message: "description must not be empty".to_string(),
            });
        }
        self.update(|state| {
            let decision = Decision::new(state.phase, description.trim(), rationale);
            state.decisions.push(decision.clone());
            Ok(decision)
        })
    }

    pub fn add_error(&mut self, message: &str, code: Option<&str>) -> SmResult<ErrorRecord> {
        if message.trim().is_empty() {
            return Err(StateMachineError::Validation {
                field: "error",
                message: "message must not be empty".to_string(),
            });
        }
        self.update(|state| {
            let record = ErrorRecord::new(state.phase, message.trim(), code);
            state.errors.push(record.clone());
            Ok(record)
        })
    }

    pub fn resolve_error(&mut self, id: &str) -> SmResult<()> {
        self.update(|state| {
            let record = state
                .errors
                .iter_mut()
                .find(|e| e.id == id)
                .ok_or_else(|| StateMachineError::ErrorNotFound { id: id.to_string() })?;
            record.resolve();
            Ok(())
        })
    }

    pub fn update_context(&mut self, key: &str, value: serde_json::Value) -> SmResult<()> {
        if key.trim().is_empty() {
            return Err(StateMachineError::Validation {
                field: "context key",
                message: "must not be empty".to_string(),
            });
        }
        self.update(|state| {
            state.context.insert(key.to_string(), value);
            Ok(())
        })
    }

    /// Detect drift and persist the annotations.
    pub fn reconcile_drift(&mut self) -> SmResult<DriftReport> {
        let mut next = self.loaded()?.clone();
        let report = self.detector.detect_drift()?;
        self.detector.reconcile(&mut next, &report)?;
        next.last_updated = Utc::now();
        self.commit(next)?;
        Ok(report)
    }

    pub fn save_directory_baseline(&mut self) -> SmResult<DirectoryHash> {
        self.loaded()?;
        let snapshot = self.detector.directory_snapshot()?;
        let value = serde_json::to_value(&snapshot).map_err(StateMachineError::Serialize)?;
        self.update(|state| {
            state
                .context
                .insert(context_keys::DIRECTORY_BASELINE.to_string(), value);
            Ok(())
        })?;
        tracing::info!(files = snapshot.file_count, "directory baseline saved");
        Ok(snapshot)
    }

    pub fn check_directory_drift(&mut self) -> SmResult<DirectoryDrift> {
        let baseline = self
            .loaded()?
            .context
            .get(context_keys::DIRECTORY_BASELINE)
            .cloned()
            .map(serde_json::from_value::<DirectoryHash>)
            .transpose()
            .map_err(StateMachineError::Serialize)?;
        Ok(self.detector.check_directory_drift(baseline.as_ref())?)
    }

    /// Forensic view of the write-ahead log. Never replayed.
    pub fn wal_entries(&self) -> SmResult<Vec<WalEntry>> {
        Ok(self.store.wal_entries()?)
    }

    /// Write the audit trail into the `audit/` directory.
    pub fn export_audit_log(&mut self) -> SmResult<PathBuf> {
        let exporter = AuditExporter::new(&self.store.paths().audit_dir);
        let state = self.loaded()?;
        Ok(exporter.export(&state.project_name, &state.audit_log)?)
    }

    /// Forget all persisted state. Test harnesses only.
    pub fn reset(&mut self) -> SmResult<()> {
        self.store.clear()?;
        self.state = None;
        let config = *self.detector.breaker().config();
        *self.detector.breaker_mut() = CircuitBreaker::new(config);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drift::{BreakerConfig, TripReason};
    use crate::gates::{Guard, GuardContext, GuardReport, GateStatus};
    use crate::orchestrator::state::StatePaths;
    use crate::telemetry::MemoryTelemetry;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    /// Guard whose verdict can be flipped during a test.
    #[derive(Default)]
    struct SwitchGuard {
        fail: AtomicBool,
    }

    #[async_trait]
    impl Guard for SwitchGuard {
        async fn validate(&self, _ctx: &GuardContext<'_>) -> anyhow::Result<GuardReport> {
            if self.fail.load(Ordering::SeqCst) {
                Ok(GuardReport::from_findings(vec!["architecture incomplete".into()], vec![]))
            } else {
                Ok(GuardReport::from_findings(vec![], vec![]))
            }
        }
    }

    struct Harness {
        _dir: TempDir,
        root: PathBuf,
        guard: Arc<SwitchGuard>,
        telemetry: Arc<MemoryTelemetry>,
        machine: StateMachine,
    }

    fn harness_with(config: BreakerConfig) -> Harness {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("project");
        std::fs::create_dir_all(root.join("docs")).unwrap();
        let paths = StatePaths::new(&dir.path().join("state"));
        let guard = Arc::new(SwitchGuard::default());
        let telemetry = Arc::new(MemoryTelemetry::new());
        let machine = StateMachine::new(
            StateStore::new(paths.clone()),
            StateDriftDetector::new(&root, paths, config),
            QualityGateInterceptor::new(guard.clone(), Arc::new(SwitchGuard::default())),
            telemetry.clone(),
        );
        Harness {
            _dir: dir,
            root,
            guard,
            telemetry,
            machine,
        }
    }

    fn harness() -> Harness {
        harness_with(BreakerConfig::default())
    }

    fn write_artifacts(root: &Path, phase: Phase) {
        for doc in phase.required_artifacts() {
            std::fs::write(root.join(doc), "# Doc\n").unwrap();
        }
    }

    async fn advance_times(machine: &mut StateMachine, n: usize) {
        for _ in 0..n {
            assert!(machine.advance().await.unwrap().is_transitioned());
        }
    }

    /// Walk to IMPLEMENTATION 10/10 with artifacts in place.
    async fn to_last_implementation_step(h: &mut Harness) {
        write_artifacts(&h.root, Phase::Implementation);
        h.machine.initialize("demo").unwrap();
        advance_times(&mut h.machine, 1 + 5 + 4 + 4 + 9).await;
        let state = h.machine.get_state().unwrap();
        assert_eq!((state.phase, state.current_step), (Phase::Implementation, 10));
    }

    #[test]
    fn test_initialize_validates_name() {
        let mut h = harness();
        assert!(matches!(
            h.machine.initialize("   "),
            Err(StateMachineError::Validation { .. })
        ));
        let long = "x".repeat(MAX_PROJECT_NAME_LEN + 1);
        assert!(matches!(
            h.machine.initialize(&long),
            Err(StateMachineError::Validation { .. })
        ));
        assert!(h.machine.initialize(&"x".repeat(MAX_PROJECT_NAME_LEN)).is_ok());
    }

    #[test]
    fn test_get_state_requires_initialize() {
        let mut h = harness();
        assert!(matches!(
            h.machine.get_state(),
            Err(StateMachineError::NotInitialized { .. })
        ));
    }

    #[tokio::test]
    async fn test_end_to_end_walk() {
        let mut h = harness();
        let state = h.machine.initialize("demo").unwrap();
        assert_eq!((state.phase, state.step_label()), (Phase::New, "1/1".to_string()));

        h.machine.advance().await.unwrap();
        let s = h.machine.get_state().unwrap();
        assert_eq!((s.phase, s.step_label()), (Phase::Analysis, "1/5".to_string()));

        advance_times(&mut h.machine, 4).await;
        assert_eq!(h.machine.get_state().unwrap().step_label(), "5/5");

        h.machine.advance().await.unwrap();
        let s = h.machine.get_state().unwrap();
        assert_eq!((s.phase, s.step_label()), (Phase::Planning, "1/4".to_string()));
    }

    #[tokio::test]
    async fn test_skip_and_override_always_rejected() {
        let mut h = harness();
        h.machine.initialize("demo").unwrap();
        for action in [TransitionAction::Skip, TransitionAction::Override] {
            let err = h.machine.transition(action).await.unwrap_err();
            assert!(matches!(err, StateMachineError::InvalidTransition { .. }));
        }
        let state = h.machine.get_state().unwrap();
        assert_eq!(state.phase, Phase::New);
        assert_eq!(state.audit_log.len(), 2);
        assert!(state.audit_log.iter().all(|e| !e.success));
        assert_eq!(
            state.audit_log[0].error_code.as_deref(),
            Some("INVALID_TRANSITION")
        );
    }

    #[tokio::test]
    async fn test_rollback_from_new_fails_and_is_audited() {
        let mut h = harness();
        h.machine.initialize("demo").unwrap();
        let err = h.machine.rollback().await.unwrap_err();
        match err {
            StateMachineError::InvalidTransition { valid_actions, .. } => {
                assert_eq!(valid_actions, vec![TransitionAction::Advance]);
            }
            other => panic!("Expected InvalidTransition, got {other:?}"),
        }
        assert_eq!(h.machine.get_audit_log().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rollback_goes_to_previous_phase_step_one() {
        let mut h = harness();
        h.machine.initialize("demo").unwrap();
        advance_times(&mut h.machine, 3).await;
        assert_eq!(h.machine.get_state().unwrap().step_label(), "3/5");

        h.machine.rollback().await.unwrap();
        let s = h.machine.get_state().unwrap();
        assert_eq!((s.phase, s.current_step, s.total_steps), (Phase::New, 1, 1));
    }

    #[tokio::test]
    async fn test_every_call_appends_one_audit_entry_and_metric() {
        let mut h = harness();
        h.machine.initialize("demo").unwrap();
        h.machine.advance().await.unwrap();
        let _ = h.machine.transition(TransitionAction::Skip).await;
        h.machine.rollback().await.unwrap();
        let _ = h.machine.rollback().await;

        let log = h.machine.get_audit_log().unwrap();
        assert_eq!(log.len(), 4);
        assert_eq!(
            log.iter().map(|e| e.success).collect::<Vec<_>>(),
            vec![true, false, true, false]
        );
        let records = h.telemetry.records();
        assert_eq!(records.len(), 4);
        assert!(records.iter().all(|r| r.duration.is_some()));
        assert_eq!(records[1].attrs["outcome"], "INVALID_TRANSITION");
    }

    #[tokio::test]
    async fn test_uninitialized_transition_starts_no_timer() {
        let mut h = harness();
        assert!(matches!(
            h.machine.advance().await,
            Err(StateMachineError::NotInitialized { .. })
        ));
        assert_eq!(h.telemetry.open_timers(), 0);
        assert!(h.telemetry.records().is_empty());

        h.machine.initialize("demo").unwrap();
        h.machine.advance().await.unwrap();
        assert_eq!(h.telemetry.open_timers(), 0);
        assert_eq!(h.telemetry.records().len(), 1);
    }

    #[tokio::test]
    async fn test_gate_blocks_and_then_allows() {
        let mut h = harness();
        to_last_implementation_step(&mut h).await;
        h.guard.fail.store(true, Ordering::SeqCst);

        let outcome = h.machine.advance().await.unwrap();
        let TransitionOutcome::Blocked(result) = outcome else {
            panic!("Expected gate to block");
        };
        assert_eq!(result.status, GateStatus::Failed);
        assert!(!result.refinements.is_empty());
        let state = h.machine.get_state().unwrap();
        assert_eq!(state.phase, Phase::Implementation);
        let last = state.audit_log.last().unwrap();
        assert_eq!(last.error_code.as_deref(), Some(QUALITY_GATE_FAILED));

        h.guard.fail.store(false, Ordering::SeqCst);
        write_artifacts(&h.root, Phase::WrapUp);
        let outcome = h.machine.advance().await.unwrap();
        assert!(matches!(
            outcome,
            TransitionOutcome::Transitioned { gate: Some(_), .. }
        ));
        let s = h.machine.get_state().unwrap();
        assert_eq!((s.phase, s.step_label()), (Phase::WrapUp, "1/3".to_string()));
    }

    #[tokio::test]
    async fn test_evaluate_gate_records_nothing() {
        let mut h = harness();
        to_last_implementation_step(&mut h).await;
        h.guard.fail.store(true, Ordering::SeqCst);
        let audit_len = h.machine.get_audit_log().unwrap().len();

        let result = h.machine.evaluate_gate().await.unwrap();
        assert!(!result.can_transition);
        assert_eq!(h.machine.get_audit_log().unwrap().len(), audit_len);
        assert_eq!(h.machine.detector().breaker().context().transaction_count, 0);
    }

    #[tokio::test]
    async fn test_repeated_gate_failures_open_circuit() {
        let mut h = harness_with(BreakerConfig {
            circuit_reset_timeout_ms: 60_000,
            ..BreakerConfig::default()
        });
        to_last_implementation_step(&mut h).await;
        h.guard.fail.store(true, Ordering::SeqCst);

        for _ in 0..3 {
            assert!(!h.machine.advance().await.unwrap().is_transitioned());
        }
        let breaker = h.machine.detector().breaker();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.context().triggered_by, Some(TripReason::SameStateStuck));
        assert_eq!(breaker.pending_interventions().len(), 1);
        assert!(h.machine.store().paths().breaker_file.exists());

        let err = h.machine.advance().await.unwrap_err();
        assert!(matches!(err, StateMachineError::CircuitOpen { .. }));
        let last = h.machine.get_audit_log().unwrap().last().unwrap().clone();
        assert_eq!(last.error_code.as_deref(), Some("CIRCUIT_OPEN"));
    }

    #[tokio::test]
    async fn test_complete_is_terminal() {
        let mut h = harness();
        to_last_implementation_step(&mut h).await;
        write_artifacts(&h.root, Phase::Complete);
        advance_times(&mut h.machine, 1 + 3).await;

        let s = h.machine.get_state().unwrap();
        assert_eq!((s.phase, s.current_step, s.total_steps), (Phase::Complete, 0, 0));
        assert!(!h.machine.can_advance().unwrap());
        assert_eq!(h.machine.get_progress().unwrap().percentage, 100);
        assert!(h.machine.advance().await.is_err());
    }

    #[tokio::test]
    async fn test_failed_persist_keeps_previous_state() {
        let mut h = harness();
        h.machine.initialize("demo").unwrap();
        let state_file = h.machine.store().paths().state_file.clone();
        std::fs::remove_file(&state_file).unwrap();
        std::fs::create_dir(&state_file).unwrap();

        let err = h.machine.advance().await.unwrap_err();
        assert!(matches!(err, StateMachineError::Persist { .. }));
        assert_eq!(h.machine.get_state().unwrap().phase, Phase::New);
        assert!(h.machine.get_state().unwrap().audit_log.is_empty());
    }

    #[test]
    fn test_decisions_errors_and_context() {
        let mut h = harness();
        h.machine.initialize("demo").unwrap();

        let decision = h.machine.add_decision("Use Postgres", Some("team knows it")).unwrap();
        assert_eq!(decision.phase, Phase::New);
        let record = h.machine.add_error("lint failed", Some("LINT")).unwrap();
        h.machine.resolve_error(&record.id).unwrap();
        assert!(matches!(
            h.machine.resolve_error("missing"),
            Err(StateMachineError::ErrorNotFound { .. })
        ));
        h.machine
            .update_context("owner", serde_json::json!("platform"))
            .unwrap();
        assert!(h.machine.add_decision(" ", None).is_err());

        let store = StateStore::new(h.machine.store().paths().clone());
        let persisted = store.load().unwrap().unwrap();
        assert_eq!(persisted.decisions.len(), 1);
        assert!(persisted.errors[0].resolved);
        assert_eq!(persisted.context["owner"], "platform");
    }

    #[test]
    fn test_directory_baseline_and_drift() {
        let mut h = harness();
        h.machine.initialize("demo").unwrap();
        let drift = h.machine.check_directory_drift().unwrap();
        assert!(!drift.has_baseline());

        let notes = h.machine.store().paths().dir.join("notes.md");
        std::fs::write(&notes, "v1").unwrap();
        h.machine.save_directory_baseline().unwrap();
        assert!(!h.machine.check_directory_drift().unwrap().drift);

        std::fs::write(&notes, "v2").unwrap();
        let drift = h.machine.check_directory_drift().unwrap();
        assert!(drift.drift);
        assert_eq!(drift.changed, vec!["notes.md"]);
    }

    #[tokio::test]
    async fn test_reconcile_drift_persists_annotation() {
        let mut h = harness();
        h.machine.initialize("demo").unwrap();
        advance_times(&mut h.machine, 6).await;

        let report = h.machine.reconcile_drift().unwrap();
        assert!(report.is_detected());
        let persisted = StateStore::new(h.machine.store().paths().clone())
            .load()
            .unwrap()
            .unwrap();
        assert!(persisted.context_flag(context_keys::DRIFT_DETECTED));
        assert_eq!(persisted.phase, Phase::Planning);
    }

    #[tokio::test]
    async fn test_wal_export_and_reset() {
        let mut h = harness();
        h.machine.initialize("demo").unwrap();
        h.machine.advance().await.unwrap();
        assert_eq!(h.machine.wal_entries().unwrap().len(), 2);

        let export = h.machine.export_audit_log().unwrap();
        assert!(export.starts_with(&h.machine.store().paths().audit_dir));

        h.machine.reset().unwrap();
        assert!(!h.machine.store().paths().breaker_file.exists());
        assert!(matches!(
            h.machine.get_state(),
            Err(StateMachineError::NotInitialized { .. })
        ));
    }
}
