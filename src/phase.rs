//! Lifecycle phases and the fixed tables that drive them.
//!
//! This module provides:
//! - `Phase`, the seven lifecycle stages in advance order
//! - `TransitionAction`, the actions a caller may request
//! - Enum-indexed step budgets and required-artifact tables
//!
//! None of the tables are loaded from configuration. A project always walks
//! NEW → ANALYSIS → PLANNING → SOLUTIONING → IMPLEMENTATION → WRAP_UP → COMPLETE.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Analysis write-up produced during ANALYSIS.
pub const ANALYSIS_DOC: &str = "docs/analysis.md";
/// Product requirements produced during PLANNING.
pub const PRD_DOC: &str = "docs/prd.md";
/// Architecture document produced during SOLUTIONING.
pub const ARCHITECTURE_DOC: &str = "docs/architecture.md";
/// Technical specification produced during SOLUTIONING.
pub const TECH_SPEC_DOC: &str = "docs/tech-spec.md";
/// Implementation report produced during IMPLEMENTATION.
pub const IMPLEMENTATION_REPORT_DOC: &str = "docs/implementation-report.md";
/// Retrospective produced during WRAP_UP.
pub const RETROSPECTIVE_DOC: &str = "docs/retrospective.md";

/// A fixed lifecycle stage.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    #[default]
    New,
    Analysis,
    Planning,
    Solutioning,
    Implementation,
    WrapUp,
    Complete,
}

/// Steps per phase, indexed by `Phase as usize`.
const STEP_TABLE: [u32; 7] = [1, 5, 4, 4, 10, 3, 0];

/// Artifacts that must exist while a project sits in a phase, indexed by `Phase as usize`.
/// Each row contains every row before it.
const ARTIFACT_TABLE: [&[&str]; 7] = [
    &[],
    &[],
    &[ANALYSIS_DOC],
    &[ANALYSIS_DOC, PRD_DOC],
    &[ANALYSIS_DOC, PRD_DOC, ARCHITECTURE_DOC, TECH_SPEC_DOC],
    &[
        ANALYSIS_DOC,
        PRD_DOC,
        ARCHITECTURE_DOC,
        TECH_SPEC_DOC,
        IMPLEMENTATION_REPORT_DOC,
    ],
    &[
        ANALYSIS_DOC,
        PRD_DOC,
        ARCHITECTURE_DOC,
        TECH_SPEC_DOC,
        IMPLEMENTATION_REPORT_DOC,
        RETROSPECTIVE_DOC,
    ],
];

impl Phase {
    /// All phases in advance order.
    pub const ALL: [Phase; 7] = [
        Phase::New,
        Phase::Analysis,
        Phase::Planning,
        Phase::Solutioning,
        Phase::Implementation,
        Phase::WrapUp,
        Phase::Complete,
    ];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Number of steps a project spends in this phase.
    pub fn total_steps(self) -> u32 {
        STEP_TABLE[self.index()]
    }

    /// Successor along the advance order. COMPLETE maps to itself.
    pub fn next(self) -> Phase {
        Phase::ALL
            .get(self.index() + 1)
            .copied()
            .unwrap_or(Phase::Complete)
    }

    /// Predecessor along the advance order, `None` for NEW.
    pub fn previous(self) -> Option<Phase> {
        self.index().checked_sub(1).map(|i| Phase::ALL[i])
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Complete)
    }

    /// Artifacts (relative to the project root) that must exist while in this phase.
    pub fn required_artifacts(self) -> &'static [&'static str] {
        ARTIFACT_TABLE[self.index()]
    }

    /// The wire name used in state files and audit entries.
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::New => "NEW",
            Phase::Analysis => "ANALYSIS",
            Phase::Planning => "PLANNING",
            Phase::Solutioning => "SOLUTIONING",
            Phase::Implementation => "IMPLEMENTATION",
            Phase::WrapUp => "WRAP_UP",
            Phase::Complete => "COMPLETE",
        }
    }

    /// Actions that are legal from this phase.
    pub fn valid_actions(self) -> Vec<TransitionAction> {
        let mut actions = Vec::with_capacity(2);
        if !self.is_terminal() {
            actions.push(TransitionAction::Advance);
        }
        if self.previous().is_some() {
            actions.push(TransitionAction::Rollback);
        }
        actions
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_uppercase().replace('-', "_");
        Phase::ALL
            .into_iter()
            .find(|p| p.as_str() == normalized)
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "Invalid phase '{}'. Valid values: new, analysis, planning, solutioning, implementation, wrap_up, complete",
                    s
                )
            })
    }
}

/// Total steps across the whole lifecycle.
pub fn lifecycle_total_steps() -> u32 {
    STEP_TABLE.iter().sum()
}

/// Steps contained in all phases strictly before `phase`.
pub fn steps_before(phase: Phase) -> u32 {
    STEP_TABLE[..phase.index()].iter().sum()
}

/// An action a caller may request from the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransitionAction {
    Advance,
    Rollback,
    /// Never legal.
    Skip,
    /// Never legal.
    Override,
}

impl TransitionAction {
    pub fn as_str(self) -> &'static str {
        match self {
            TransitionAction::Advance => "ADVANCE",
            TransitionAction::Rollback => "ROLLBACK",
            TransitionAction::Skip => "SKIP",
            TransitionAction::Override => "OVERRIDE",
        }
    }
}

impl fmt::Display for TransitionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransitionAction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "advance" => Ok(TransitionAction::Advance),
            "rollback" => Ok(TransitionAction::Rollback),
            "skip" => Ok(TransitionAction::Skip),
            "override" => Ok(TransitionAction::Override),
            _ => anyhow::bail!(
                "Invalid action '{}'. Valid values: advance, rollback, skip, override",
                s
            ),
        }
    }
}
