//! Crash-safe persistence for `ProjectState`.
//!
//! Every save appends the full state as one JSON line to a write-ahead log,
//! writes a temp file, fsyncs it and renames it over the canonical file. The
//! canonical file is never observed half-written. The WAL is forensic and is
//! never replayed.

use crate::drift::hash::sha256_hex;
use crate::errors::StateMachineError;
use crate::project::ProjectState;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const STATE_FILE: &str = "state.json";
pub const WAL_FILE: &str = "state.json.wal";
pub const TEMP_FILE: &str = "state.json.tmp";
pub const CHECKSUMS_FILE: &str = "checksums.json";
pub const BREAKER_FILE: &str = "circuit-breaker.json";
pub const LOCK_FILE: &str = ".lock";
pub const AUDIT_DIR: &str = "audit";
pub const LOGS_DIR: &str = "logs";

/// Every file the kernel keeps under one state directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePaths {
    pub dir: PathBuf,
    pub state_file: PathBuf,
    pub wal_file: PathBuf,
    pub temp_file: PathBuf,
    pub checksums_file: PathBuf,
    pub breaker_file: PathBuf,
    pub lock_file: PathBuf,
    pub audit_dir: PathBuf,
    pub logs_dir: PathBuf,
}

impl StatePaths {
    /// Files rewritten by the kernel itself; left out of directory hashes.
    pub const BOOKKEEPING_FILES: [&'static str; 5] =
        [STATE_FILE, WAL_FILE, TEMP_FILE, BREAKER_FILE, LOCK_FILE];

    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            state_file: dir.join(STATE_FILE),
            wal_file: dir.join(WAL_FILE),
            temp_file: dir.join(TEMP_FILE),
            checksums_file: dir.join(CHECKSUMS_FILE),
            breaker_file: dir.join(BREAKER_FILE),
            lock_file: dir.join(LOCK_FILE),
            audit_dir: dir.join(AUDIT_DIR),
            logs_dir: dir.join(LOGS_DIR),
        }
    }
}

/// `~/.phasegate/projects/<dir name>-<12 hex of sha256(canonical path)>`
pub fn default_state_dir(project_root: &Path) -> Result<PathBuf> {
    let canonical = project_root
        .canonicalize()
        .unwrap_or_else(|_| project_root.to_path_buf());
    let name = canonical
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "project".to_string());
    let digest = sha256_hex(canonical.to_string_lossy().as_bytes());
    let home = dirs::home_dir().context("Could not determine home directory")?;

    Ok(home
        .join(".phasegate")
        .join("projects")
        .join(format!("{}-{}", name, &digest[..12])))
}

/// One line of the write-ahead log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    pub timestamp: DateTime<Utc>,
    pub state: ProjectState,
}

/// Reads and writes the canonical state file.
#[derive(Debug, Clone)]
pub struct StateStore {
    paths: StatePaths,
}

impl StateStore {
    pub fn new(paths: StatePaths) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &StatePaths {
        &self.paths
    }

    pub fn exists(&self) -> bool {
        self.paths.state_file.exists()
    }

    /// Load the canonical state, `None` if it has never been saved.
    pub fn load(&self) -> Result<Option<ProjectState>, StateMachineError> {
        let path = &self.paths.state_file;
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path).map_err(|source| StateMachineError::Read {
            path: path.clone(),
            source,
        })?;
        let state = serde_json::from_str(&content).map_err(|source| StateMachineError::Corrupt {
            path: path.clone(),
            source,
        })?;
        Ok(Some(state))
    }

    /// WAL append, temp write, atomic promote. Only the WAL step may fail silently.
    pub fn save(&self, state: &ProjectState) -> Result<(), StateMachineError> {
        fs::create_dir_all(&self.paths.dir).map_err(|source| StateMachineError::Persist {
            path: self.paths.dir.clone(),
            source,
        })?;

        if let Err(e) = self.append_wal(state) {
            tracing::warn!(
                path = %self.paths.wal_file.display(),
                error = %e,
                "WAL append failed, continuing"
            );
        }
        self.write_temp(state)?;
        self.promote_temp()
    }

    pub fn append_wal(&self, state: &ProjectState) -> Result<()> {
        let entry = WalEntry {
            timestamp: Utc::now(),
            state: state.clone(),
        };
        let mut line = serde_json::to_string(&entry).context("Failed to serialize WAL entry")?;
        line.push('\n');

        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.paths.wal_file)
            .context("Failed to open WAL file")?
            .write_all(line.as_bytes())
            .context("Failed to append WAL entry")?;
        Ok(())
    }

    pub fn write_temp(&self, state: &ProjectState) -> Result<(), StateMachineError> {
        let json = serde_json::to_string_pretty(state).map_err(StateMachineError::Serialize)?;
        let temp = &self.paths.temp_file;
        let persist_err = |source| StateMachineError::Persist {
            path: temp.clone(),
            source,
        };

        let mut file = fs::File::create(temp).map_err(persist_err)?;
        file.write_all(json.as_bytes()).map_err(persist_err)?;
        file.sync_all().map_err(persist_err)?;
        Ok(())
    }

    /// Move the temp file over the canonical file.
    ///
    /// Falls back to copy+delete, then read+rewrite+delete when rename fails.
    /// Errors are swallowed only when removing the temp file afterwards.
    pub fn promote_temp(&self) -> Result<(), StateMachineError> {
        let temp = &self.paths.temp_file;
        let target = &self.paths.state_file;

        let rename_err = match fs::rename(temp, target) {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        tracing::warn!(error = %rename_err, "atomic rename failed, falling back to copy");

        if fs::copy(temp, target).is_ok() {
            self.discard_temp();
            return Ok(());
        }
        tracing::warn!("copy fallback failed, rewriting state file from temp contents");

        let result = fs::read(temp).and_then(|bytes| fs::write(target, bytes));
        self.discard_temp();
        result.map_err(|source| StateMachineError::Persist {
            path: target.clone(),
            source,
        })
    }

    fn discard_temp(&self) {
        if let Err(e) = fs::remove_file(&self.paths.temp_file) {
            tracing::debug!(error = %e, "could not remove temp state file");
        }
    }

    /// Every readable WAL line, oldest first. A torn last line is skipped.
    pub fn wal_entries(&self) -> Result<Vec<WalEntry>> {
        let path = &self.paths.wal_file;
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(path).context("Failed to read WAL file")?;

        let mut entries = Vec::new();
        for (lineno, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<WalEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => tracing::warn!(line = lineno + 1, error = %e, "skipping unreadable WAL line"),
            }
        }
        Ok(entries)
    }

    /// Remove the state file, its WAL, any temp file and the breaker snapshot.
    pub fn clear(&self) -> Result<()> {
        for path in [
            &self.paths.state_file,
            &self.paths.wal_file,
            &self.paths.temp_file,
            &self.paths.breaker_file,
        ] {
            if path.exists() {
                fs::remove_file(path)
                    .with_context(|| format!("Failed to remove {}", path.display()))?;
            }
        }
        Ok(())
    }
}

/// Write `value` as pretty JSON via temp file, fsync and rename.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let file_name = path
        .file_name()
        .context("Atomic write target has no file name")?
        .to_string_lossy();
    let temp = path.with_file_name(format!("{}.tmp", file_name));

    let json = serde_json::to_string_pretty(value).context("Failed to serialize JSON")?;
    let mut file = fs::File::create(&temp)
        .with_context(|| format!("Failed to create {}", temp.display()))?;
    file.write_all(json.as_bytes())
        .with_context(|| format!("Failed to write {}", temp.display()))?;
    file.sync_all()
        .with_context(|| format!("Failed to sync {}", temp.display()))?;
    fs::rename(&temp, path)
        .with_context(|| format!("Failed to move {} into place", temp.display()))?;
    Ok(())
}
