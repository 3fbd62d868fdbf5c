//! Circuit breaker embedded in the drift detector.
//!
//! `check_and_record` is the only mutator. The breaker trips on too many
//! consecutive failures, on failures stuck in one logical state, or on a
//! repeated error string, and files a `HumanInterventionRequest` whenever it
//! opens. While open it rejects until an exponential backoff elapses, then
//! allows a single half-open probe.

use crate::orchestrator::state::write_json_atomic;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

/// How many recent errors feed pattern detection.
const ERROR_PATTERN_WINDOW: usize = 5;
/// Occurrences of one error within the window that trip the breaker.
const REPEATED_ERROR_THRESHOLD: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_max_retries_per_state")]
    pub max_retries_per_state: u32,
    /// Base of the exponential backoff.
    #[serde(default = "default_circuit_reset_timeout_ms")]
    pub circuit_reset_timeout_ms: u64,
    /// Cap of the exponential backoff.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_retries() -> u32 {
    5
}

fn default_max_retries_per_state() -> u32 {
    3
}

fn default_circuit_reset_timeout_ms() -> u64 {
    30_000
}

fn default_max_backoff_ms() -> u64 {
    300_000
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            max_retries_per_state: default_max_retries_per_state(),
            circuit_reset_timeout_ms: default_circuit_reset_timeout_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl BreakerConfig {
    /// Backoff after `failures` consecutive failures: base * 2^(failures-1), capped.
    pub fn backoff(&self, failures: u32) -> Duration {
        let factor = 2u64.saturating_pow(failures.saturating_sub(1));
        let ms = self
            .circuit_reset_timeout_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    #[default]
    Closed,
    HalfOpen,
    Open,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::HalfOpen => "HALF_OPEN",
            CircuitState::Open => "OPEN",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TripReason {
    MaxRetriesExceeded,
    SameStateStuck,
    RepeatedErrorPattern,
}

impl TripReason {
    pub fn as_str(self) -> &'static str {
        match self {
            TripReason::MaxRetriesExceeded => "MAX_RETRIES_EXCEEDED",
            TripReason::SameStateStuck => "SAME_STATE_STUCK",
            TripReason::RepeatedErrorPattern => "REPEATED_ERROR_PATTERN",
        }
    }
}

impl fmt::Display for TripReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error string compared by exact equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorSignature(String);

impl ErrorSignature {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ErrorSignature {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ErrorSignature {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for ErrorSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryContext {
    pub transaction_count: u64,
    pub consecutive_failures: u32,
    #[serde(default)]
    pub last_error: Option<ErrorSignature>,
    #[serde(default)]
    pub last_state: Option<String>,
    #[serde(default)]
    pub error_pattern: VecDeque<ErrorSignature>,
    pub circuit_breaker_state: CircuitState,
    #[serde(default)]
    pub triggered_by: Option<TripReason>,
    #[serde(default)]
    pub last_retry_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HumanInterventionRequest {
    pub id: Uuid,
    pub reason: TripReason,
    pub current_state: String,
    pub error_pattern: Vec<ErrorSignature>,
    pub retry_count: u32,
    pub requested_at: DateTime<Utc>,
    pub resolved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

/// What `check_and_record` decided.
#[derive(Debug, Clone, PartialEq)]
pub enum BreakerDecision {
    /// Success recorded; the circuit is closed.
    Proceed,
    /// Failure recorded below every threshold.
    Retry {
        consecutive_failures: u32,
        remaining: u32,
    },
    /// The circuit opened and a human intervention request was filed.
    Tripped {
        reason: TripReason,
        intervention_id: Uuid,
        retry_after: Duration,
    },
    /// Open and still backing off. Nothing was recorded.
    Rejected { retry_after: Duration },
    /// Backoff elapsed; the circuit is half-open and the next record is the probe.
    Probe,
}

/// On-disk shape of `circuit-breaker.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BreakerSnapshot {
    context: RetryContext,
    #[serde(default)]
    interventions: Vec<HumanInterventionRequest>,
}

#[derive(Debug, Clone, Default)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    context: RetryContext,
    interventions: Vec<HumanInterventionRequest>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            context: RetryContext::default(),
            interventions: Vec::new(),
        }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    pub fn context(&self) -> &RetryContext {
        &self.context
    }

    pub fn state(&self) -> CircuitState {
        self.context.circuit_breaker_state
    }

    /// Record the outcome of an attempt in logical state `state`.
    /// `error` is `None` on success.
    pub fn check_and_record(
        &mut self,
        state: &str,
        error: Option<ErrorSignature>,
    ) -> BreakerDecision {
        self.check_and_record_at(state, error, Utc::now())
    }

    pub(crate) fn check_and_record_at(
        &mut self,
        state: &str,
        error: Option<ErrorSignature>,
        now: DateTime<Utc>,
    ) -> BreakerDecision {
        self.context.transaction_count += 1;

        match self.context.circuit_breaker_state {
            CircuitState::Open => {
                let remaining = self.remaining_backoff(now);
                if !remaining.is_zero() {
                    return BreakerDecision::Rejected {
                        retry_after: remaining,
                    };
                }
                self.context.circuit_breaker_state = CircuitState::HalfOpen;
                tracing::info!(state, "circuit breaker half-open, allowing one probe");
                BreakerDecision::Probe
            }
            CircuitState::HalfOpen => match error {
                None => {
                    self.close();
                    self.context.last_state = Some(state.to_string());
                    tracing::info!(state, "probe succeeded, circuit breaker closed");
                    BreakerDecision::Proceed
                }
                Some(error) => {
                    self.record_failure(state, error);
                    let reason = self
                        .context
                        .triggered_by
                        .unwrap_or(TripReason::MaxRetriesExceeded);
                    tracing::warn!(state, "probe failed, circuit breaker re-opened");
                    self.trip(reason, state, now)
                }
            },
            CircuitState::Closed => match error {
                None => {
                    self.context.consecutive_failures = 0;
                    self.context.last_state = Some(state.to_string());
                    BreakerDecision::Proceed
                }
                Some(error) => {
                    let same_state = self.context.last_state.as_deref() == Some(state);
                    self.record_failure(state, error.clone());

                    match self.evaluate(same_state, &error) {
                        Some(reason) => self.trip(reason, state, now),
                        None => BreakerDecision::Retry {
                            consecutive_failures: self.context.consecutive_failures,
                            remaining: self
                                .config
                                .max_retries
                                .saturating_sub(self.context.consecutive_failures),
                        },
                    }
                }
            },
        }
    }

    fn record_failure(&mut self, state: &str, error: ErrorSignature) {
        self.context.consecutive_failures += 1;
        self.context.last_state = Some(state.to_string());
        self.context.error_pattern.push_back(error.clone());
        while self.context.error_pattern.len() > ERROR_PATTERN_WINDOW {
            self.context.error_pattern.pop_front();
        }
        self.context.last_error = Some(error);
    }

    /// Trip conditions, first match wins.
    fn evaluate(&self, same_state: bool, error: &ErrorSignature) -> Option<TripReason> {
        let failures = self.context.consecutive_failures;
        if failures >= self.config.max_retries {
            return Some(TripReason::MaxRetriesExceeded);
        }
        if same_state && failures >= self.config.max_retries_per_state {
            return Some(TripReason::SameStateStuck);
        }
        let repeats = self
            .context
            .error_pattern
            .iter()
            .filter(|e| *e == error)
            .count();
        if repeats >= REPEATED_ERROR_THRESHOLD {
            return Some(TripReason::RepeatedErrorPattern);
        }
        None
    }

    fn trip(&mut self, reason: TripReason, state: &str, now: DateTime<Utc>) -> BreakerDecision {
        self.context.circuit_breaker_state = CircuitState::Open;
        self.context.triggered_by = Some(reason);
        self.context.last_retry_at = Some(now);

        let request = HumanInterventionRequest {
            id: Uuid::new_v4(),
            reason,
            current_state: state.to_string(),
            error_pattern: self.context.error_pattern.iter().cloned().collect(),
            retry_count: self.context.consecutive_failures,
            requested_at: now,
            resolved: false,
            resolved_at: None,
        };
        let intervention_id = request.id;
        self.interventions.push(request);

        let retry_after = self.config.backoff(self.context.consecutive_failures);
        tracing::error!(
            state,
            reason = %reason,
            failures = self.context.consecutive_failures,
            retry_after_ms = retry_after.as_millis() as u64,
            %intervention_id,
            "circuit breaker opened, human intervention requested"
        );
        BreakerDecision::Tripped {
            reason,
            intervention_id,
            retry_after,
        }
    }

    fn close(&mut self) {
        self.context.circuit_breaker_state = CircuitState::Closed;
        self.context.consecutive_failures = 0;
        self.context.triggered_by = None;
    }

    fn remaining_backoff(&self, now: DateTime<Utc>) -> Duration {
        let Some(opened_at) = self.context.last_retry_at else {
            return Duration::ZERO;
        };
        let backoff = self.config.backoff(self.context.consecutive_failures);
        let elapsed = (now - opened_at).to_std().unwrap_or(Duration::ZERO);
        backoff.saturating_sub(elapsed)
    }

    /// Time left before an open circuit allows a probe. `None` unless open.
    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after_at(Utc::now())
    }

    pub(crate) fn retry_after_at(&self, now: DateTime<Utc>) -> Option<Duration> {
        (self.state() == CircuitState::Open).then(|| self.remaining_backoff(now))
    }

    pub fn interventions(&self) -> &[HumanInterventionRequest] {
        &self.interventions
    }

    pub fn pending_interventions(&self) -> Vec<&HumanInterventionRequest> {
        self.interventions.iter().filter(|r| !r.resolved).collect()
    }

    /// Mark an intervention request handled. Does not close the circuit.
    pub fn resolve_intervention(&mut self, id: Uuid) -> Result<()> {
        let request = self
            .interventions
            .iter_mut()
            .find(|r| r.id == id)
            .with_context(|| format!("No intervention request with id {}", id))?;
        if !request.resolved {
            request.resolved = true;
            request.resolved_at = Some(Utc::now());
            tracing::info!(%id, "intervention request resolved");
        }
        Ok(())
    }

    /// Manually close the circuit after human review. Intervention history is kept.
    pub fn reset(&mut self) {
        self.close();
        self.context.error_pattern.clear();
        self.context.last_error = None;
        self.context.last_retry_at = None;
        tracing::info!("circuit breaker reset");
    }

    pub fn persist_state(&self, path: &Path) -> Result<()> {
        let snapshot = BreakerSnapshot {
            context: self.context.clone(),
            interventions: self.interventions.clone(),
        };
        write_json_atomic(path, &snapshot)
            .with_context(|| format!("Failed to persist circuit breaker to {}", path.display()))
    }

    /// Load persisted breaker state. Returns `false` when no file exists.
    pub fn restore_state(&mut self, path: &Path) -> Result<bool> {
        if !path.exists() {
            return Ok(false);
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let snapshot: BreakerSnapshot = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        self.context = snapshot.context;
        self.interventions = snapshot.interventions;
        tracing::debug!(
            state = %self.context.circuit_breaker_state,
            interventions = self.interventions.len(),
            "circuit breaker restored"
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use tempfile::TempDir;

    fn fast_config() -> BreakerConfig {
        BreakerConfig {
            max_retries: 5,
            max_retries_per_state: 3,
            circuit_reset_timeout_ms: 100,
            max_backoff_ms: 1_000,
        }
    }

    /// Fail `n` times with distinct states and errors so only the retry limit applies.
    fn fail_distinct(cb: &mut CircuitBreaker, n: u32, now: DateTime<Utc>) -> BreakerDecision {
        let mut last = BreakerDecision::Proceed;
        for i in 0..n {
            last = cb.check_and_record_at(
                &format!("IMPLEMENTATION:{}/10", i + 1),
                Some(format!("error {i}").into()),
                now,
            );
        }
        last
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = fast_config();
        assert_eq!(config.backoff(1), Duration::from_millis(100));
        assert_eq!(config.backoff(2), Duration::from_millis(200));
        assert_eq!(config.backoff(4), Duration::from_millis(800));
        assert_eq!(config.backoff(5), Duration::from_millis(1_000));
        assert_eq!(config.backoff(200), Duration::from_millis(1_000));
    }

    #[test]
    fn test_opens_after_max_retries() {
        let mut cb = CircuitBreaker::new(fast_config());
        let now = Utc::now();

        let decision = fail_distinct(&mut cb, 4, now);
        assert_eq!(
            decision,
            BreakerDecision::Retry {
                consecutive_failures: 4,
                remaining: 1
            }
        );
        assert_eq!(cb.state(), CircuitState::Closed);

        let decision = fail_distinct(&mut cb, 1, now);
        assert!(matches!(
            decision,
            BreakerDecision::Tripped {
                reason: TripReason::MaxRetriesExceeded,
                ..
            }
        ));
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.pending_interventions().len(), 1);
        assert_eq!(cb.pending_interventions()[0].retry_count, 5);
    }

    #[test]
    fn test_same_state_stuck() {
        let mut cb = CircuitBreaker::new(fast_config());
        let now = Utc::now();
        for i in 0..2 {
            let d = cb.check_and_record_at("PLANNING:2/4", Some(format!("e{i}").into()), now);
            assert!(matches!(d, BreakerDecision::Retry { .. }));
        }
        let d = cb.check_and_record_at("PLANNING:2/4", Some("e2".into()), now);
        assert!(matches!(
            d,
            BreakerDecision::Tripped {
                reason: TripReason::SameStateStuck,
                ..
            }
        ));
    }

    #[test]
    fn test_repeated_error_pattern() {
        let mut cb = CircuitBreaker::new(fast_config());
        let now = Utc::now();
        cb.check_and_record_at("A", Some("lint failed".into()), now);
        cb.check_and_record_at("B", Some("lint failed".into()), now);
        let d = cb.check_and_record_at("C", Some("lint failed".into()), now);
        assert!(matches!(
            d,
            BreakerDecision::Tripped {
                reason: TripReason::RepeatedErrorPattern,
                ..
            }
        ));
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let mut cb = CircuitBreaker::new(fast_config());
        let now = Utc::now();
        fail_distinct(&mut cb, 4, now);
        assert_eq!(cb.check_and_record_at("X", None, now), BreakerDecision::Proceed);
        assert_eq!(cb.context().consecutive_failures, 0);
        assert_eq!(cb.context().error_pattern.len(), 4);
    }

    #[test]
    fn test_error_pattern_keeps_last_five() {
        let mut cb = CircuitBreaker::new(BreakerConfig {
            max_retries: 100,
            max_retries_per_state: 100,
            ..fast_config()
        });
        let now = Utc::now();
        fail_distinct(&mut cb, 8, now);
        let pattern: Vec<_> = cb.context().error_pattern.iter().map(|e| e.as_str()).collect();
        assert_eq!(pattern, vec!["error 3", "error 4", "error 5", "error 6", "error 7"]);
    }

    #[test]
    fn test_open_rejects_then_probe_success_closes() {
        let mut cb = CircuitBreaker::new(fast_config());
        let opened = Utc::now();
        fail_distinct(&mut cb, 5, opened);

        let early = opened + TimeDelta::milliseconds(10);
        let d = cb.check_and_record_at("IMPLEMENTATION:10/10", None, early);
        assert!(matches!(d, BreakerDecision::Rejected { retry_after } if retry_after > Duration::ZERO));
        assert_eq!(cb.state(), CircuitState::Open);

        let later = opened + TimeDelta::milliseconds(1_001);
        assert_eq!(
            cb.check_and_record_at("IMPLEMENTATION:10/10", None, later),
            BreakerDecision::Probe
        );
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        assert_eq!(
            cb.check_and_record_at("IMPLEMENTATION:10/10", None, later),
            BreakerDecision::Proceed
        );
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.context().consecutive_failures, 0);
    }

    #[test]
    fn test_probe_failure_reopens() {
        let mut cb = CircuitBreaker::new(fast_config());
        let opened = Utc::now();
        fail_distinct(&mut cb, 5, opened);

        let later = opened + TimeDelta::milliseconds(1_001);
        cb.check_and_record_at("S", None, later);
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        let d = cb.check_and_record_at("S", Some("still broken".into()), later);
        assert!(matches!(d, BreakerDecision::Tripped { .. }));
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.interventions().len(), 2);
        assert!(cb.retry_after_at(later).unwrap() > Duration::ZERO);
    }

    #[test]
    fn test_resolve_intervention_and_reset() {
        let mut cb = CircuitBreaker::new(fast_config());
        fail_distinct(&mut cb, 5, Utc::now());
        let id = cb.pending_interventions()[0].id;

        cb.resolve_intervention(id).unwrap();
        assert!(cb.pending_interventions().is_empty());
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.resolve_intervention(Uuid::new_v4()).is_err());

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.retry_after(), None);
        assert_eq!(cb.interventions().len(), 1);
    }

    #[test]
    fn test_persist_and_restore() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("circuit-breaker.json");

        let mut cb = CircuitBreaker::new(fast_config());
        assert!(!cb.restore_state(&path).unwrap());
        fail_distinct(&mut cb, 5, Utc::now());
        cb.persist_state(&path).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["context"]["circuitBreakerState"], "OPEN");
        assert_eq!(value["context"]["triggeredBy"], "MAX_RETRIES_EXCEEDED");
        assert_eq!(value["interventions"].as_array().unwrap().len(), 1);

        let mut restored = CircuitBreaker::new(fast_config());
        assert!(restored.restore_state(&path).unwrap());
        assert_eq!(restored.state(), CircuitState::Open);
        assert_eq!(restored.context(), cb.context());
        assert_eq!(restored.pending_interventions().len(), 1);
    }
}
