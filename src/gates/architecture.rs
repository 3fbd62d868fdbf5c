//! Content heuristics for the architecture documents.
//!
//! Each document starts the project at 10 points and loses a fixed penalty
//! per defect. The score floors at 0.

use super::{Guard, GuardContext, GuardReport};
use crate::phase::{ARCHITECTURE_DOC, TECH_SPEC_DOC};
use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;

pub const MAX_SCORE: u32 = 10;
pub const MIN_CONTENT_CHARS: usize = 100;

const PENALTY_MISSING: u32 = 5;
const PENALTY_TOO_SHORT: u32 = 3;
const PENALTY_PLACEHOLDER: u32 = 2;
const PENALTY_NO_HEADING: u32 = 1;
const PENALTY_MISSING_SECTION: u32 = 1;

/// Documents the guard inspects.
pub const ARCHITECTURE_DOCUMENTS: [&str; 2] = [ARCHITECTURE_DOC, TECH_SPEC_DOC];

/// Section keywords expected in a heading of the architecture document.
const REQUIRED_SECTIONS: [(&str, &str); 3] = [
    ("overview", "Overview"),
    ("technolog", "Technology"),
    ("security", "Security"),
];

static PLACEHOLDER_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(TODO|FIXME|placeholder)\b").unwrap());

static HEADING_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^#{1,6}\s+(.+)$").unwrap());

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchitectureAssessment {
    pub score: u32,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Score the architecture documents under `project_root`.
pub fn assess(project_root: &Path, min_score: u32) -> Result<ArchitectureAssessment> {
    let mut penalty = 0u32;
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    for doc in ARCHITECTURE_DOCUMENTS {
        let path = project_root.join(doc);
        if !path.exists() {
            penalty += PENALTY_MISSING;
            errors.push(format!("Missing required artifact {}", doc));
            continue;
        }
        let content =
            std::fs::read_to_string(&path).with_context(|| format!("Failed to read {}", doc))?;

        let chars = content.trim().chars().count();
        if chars < MIN_CONTENT_CHARS {
            penalty += PENALTY_TOO_SHORT;
            warnings.push(format!(
                "{} is too short ({} characters, minimum {})",
                doc, chars, MIN_CONTENT_CHARS
            ));
        }

        if PLACEHOLDER_REGEX.is_match(&content) {
            penalty += PENALTY_PLACEHOLDER;
            warnings.push(format!("{} contains TODO/FIXME/placeholder markers", doc));
        }

        let headings: Vec<String> = HEADING_REGEX
            .captures_iter(&content)
            .map(|c| c[1].to_lowercase())
            .collect();
        if headings.is_empty() {
            penalty += PENALTY_NO_HEADING;
            warnings.push(format!("{} has no markdown heading", doc));
        }

        if doc == ARCHITECTURE_DOC {
            for (keyword, label) in REQUIRED_SECTIONS {
                if !headings.iter().any(|h| h.contains(keyword)) {
                    penalty += PENALTY_MISSING_SECTION;
                    warnings.push(format!("{} is missing a {} section", doc, label));
                }
            }
        }
    }

    let score = MAX_SCORE.saturating_sub(penalty);
    if score < min_score {
        errors.push(format!(
            "Architecture score {}/{} is below the minimum of {}",
            score, MAX_SCORE, min_score
        ));
    }

    Ok(ArchitectureAssessment {
        score,
        errors,
        warnings,
    })
}

pub struct DocumentArchitectureGuard {
    min_score: u32,
}

impl DocumentArchitectureGuard {
    pub fn new(min_score: u32) -> Self {
        Self { min_score }
    }
}

#[async_trait]
impl Guard for DocumentArchitectureGuard {
    async fn validate(&self, ctx: &GuardContext<'_>) -> Result<GuardReport> {
        let assessment = assess(ctx.project_root, self.min_score)?;
        tracing::debug!(score = assessment.score, "architecture documents scored");
        Ok(
            GuardReport::from_findings(assessment.errors, assessment.warnings)
                .with_summary(format!("Architecture score {}/{}", assessment.score, MAX_SCORE)),
        )
    }
}
