//! Content hashing for checksum and directory drift checks.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;

/// Prefix on every recorded checksum.
pub const CHECKSUM_PREFIX: &str = "sha256:";

/// Remediation text attached to every directory mismatch.
pub const DIRECTORY_DRIFT_SUGGESTION: &str = "Review the listed files; if the changes are intentional, save a new baseline, otherwise restore them from version control.";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// `sha256:<hex>` of a file's bytes.
pub fn file_checksum(path: &Path) -> Result<String> {
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(format!("{}{}", CHECKSUM_PREFIX, sha256_hex(&bytes)))
}

/// Snapshot of every file directly inside a directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryHash {
    /// Digest over the sorted `name:hash` pairs.
    pub hash: String,
    pub timestamp: DateTime<Utc>,
    pub file_count: usize,
    /// File name → content hash.
    pub files: BTreeMap<String, String>,
}

impl DirectoryHash {
    /// Hash the regular files directly in `dir`, skipping names in `excluded`.
    /// A missing directory yields an empty snapshot.
    pub fn compute(dir: &Path, excluded: &[&str]) -> Result<Self> {
        let mut files = BTreeMap::new();

        if dir.is_dir() {
            for entry in walkdir::WalkDir::new(dir)
                .min_depth(1)
                .max_depth(1)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
            {
                let name = entry.file_name().to_string_lossy().to_string();
                if excluded.contains(&name.as_str()) {
                    continue;
                }
                let bytes = std::fs::read(entry.path())
                    .with_context(|| format!("Failed to read {}", entry.path().display()))?;
                files.insert(name, sha256_hex(&bytes));
            }
        }

        let combined: String = files
            .iter()
            .map(|(name, hash)| format!("{}:{}\n", name, hash))
            .collect();

        Ok(Self {
            hash: sha256_hex(combined.as_bytes()),
            timestamp: Utc::now(),
            file_count: files.len(),
            files,
        })
    }

    /// Compare a fresh snapshot against this baseline.
    pub fn diff(&self, current: &DirectoryHash) -> DirectoryDrift {
        if self.hash == current.hash {
            return DirectoryDrift {
                drift: false,
                message: format!("Directory matches baseline ({} files)", current.file_count),
                changed: Vec::new(),
                added: Vec::new(),
                deleted: Vec::new(),
                suggestion: None,
                baseline_at: Some(self.timestamp),
            };
        }

        let mut changed = Vec::new();
        let mut deleted = Vec::new();
        for (name, hash) in &self.files {
            match current.files.get(name) {
                Some(now) if now != hash => changed.push(name.clone()),
                Some(_) => {}
                None => deleted.push(name.clone()),
            }
        }
        let added: Vec<String> = current
            .files
            .keys()
            .filter(|name| !self.files.contains_key(*name))
            .cloned()
            .collect();

        DirectoryDrift {
            drift: true,
            message: format!(
                "Directory drift detected: {} changed, {} added, {} deleted",
                changed.len(),
                added.len(),
                deleted.len()
            ),
            changed,
            added,
            deleted,
            suggestion: Some(DIRECTORY_DRIFT_SUGGESTION.to_string()),
            baseline_at: Some(self.timestamp),
        }
    }
}

/// Outcome of a directory drift check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryDrift {
    pub drift: bool,
    pub message: String,
    pub changed: Vec<String>,
    pub added: Vec<String>,
    pub deleted: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    /// `None` when no baseline has been saved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline_at: Option<DateTime<Utc>>,
}

impl DirectoryDrift {
    pub fn no_baseline() -> Self {
        Self {
            drift: false,
            message: "No directory baseline found; save a baseline to establish one".to_string(),
            changed: Vec::new(),
            added: Vec::new(),
            deleted: Vec::new(),
            suggestion: None,
            baseline_at: None,
        }
    }

    pub fn has_baseline(&self) -> bool {
        self.baseline_at.is_some()
    }

    /// Every file named in the drift, in changed/added/deleted order.
    pub fn affected_files(&self) -> impl Iterator<Item = &String> {
        self.changed
            .iter()
            .chain(self.added.iter())
            .chain(self.deleted.iter())
    }
}
