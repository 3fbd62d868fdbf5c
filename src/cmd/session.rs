//! Opening the state machine for one CLI invocation.
//!
//! Mutating commands hold an exclusive advisory lock on `<state dir>/.lock`
//! for their whole run, so two processes never interleave read-modify-write
//! cycles on `state.json`. Inside the process the state file is also
//! registered as write-locked in the process-wide `WorkspaceLockManager`.
//! The advisory file lock is what excludes other processes; the manager only
//! sees holders within this process.

use anyhow::{Context, Result};
use fs2::FileExt;
use phasegate::StateMachine;
use phasegate::config::PhasegateConfig;
use phasegate::locks::{LockType, WorkspaceLockManager};
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

const LOCK_TIMEOUT_SECS: u64 = 10;
const LOCK_RETRY_MS: u64 = 50;

static WORKSPACE_LOCKS: LazyLock<Arc<WorkspaceLockManager>> =
    LazyLock::new(|| Arc::new(WorkspaceLockManager::new()));

/// The lock manager shared by every session in this process.
pub fn workspace_locks() -> Arc<WorkspaceLockManager> {
    Arc::clone(&WORKSPACE_LOCKS)
}

/// Exclusive hold on a project's state directory. Released on drop.
pub struct StateDirLock {
    file: File,
    locks: Arc<WorkspaceLockManager>,
    state_path: String,
    agent_id: String,
}

impl StateDirLock {
    pub fn acquire(config: &PhasegateConfig, locks: Arc<WorkspaceLockManager>) -> Result<Self> {
        let paths = config.state_paths()?;
        std::fs::create_dir_all(&paths.dir)
            .with_context(|| format!("Failed to create state directory {}", paths.dir.display()))?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&paths.lock_file)
            .with_context(|| format!("Failed to open {}", paths.lock_file.display()))?;

        let start = Instant::now();
        loop {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => break,
                Err(err) => {
                    if err.kind() != ErrorKind::WouldBlock {
                        return Err(err).context("Failed to lock state directory");
                    }
                    if start.elapsed() >= Duration::from_secs(LOCK_TIMEOUT_SECS) {
                        anyhow::bail!(
                            "Timed out waiting for state lock ({}s). Is another phasegate command running?",
                            LOCK_TIMEOUT_SECS
                        );
                    }
                    std::thread::sleep(Duration::from_millis(LOCK_RETRY_MS));
                }
            }
        }

        let agent_id = format!("phasegate-cli-{}", std::process::id());
        let state_path = paths.state_file.to_string_lossy().to_string();
        locks.acquire_lock(&state_path, &agent_id, LockType::Write)?;
        tracing::debug!(path = %paths.lock_file.display(), agent_id, "state directory locked");

        Ok(Self {
            file,
            locks,
            state_path,
            agent_id,
        })
    }
}

impl Drop for StateDirLock {
    fn drop(&mut self) {
        if let Err(e) = self.locks.release_lock(&self.state_path, &self.agent_id) {
            tracing::warn!(error = %e, "failed to release state lock");
        }
        let _ = FileExt::unlock(&self.file);
    }
}

/// A state machine plus the lock guarding it, if any.
pub struct Session {
    pub machine: StateMachine,
    _lock: Option<StateDirLock>,
}

impl Session {
    /// Open for reading. No lock is taken.
    pub fn read(config: &PhasegateConfig) -> Result<Self> {
        Ok(Self {
            machine: phasegate::build_state_machine(config)?,
            _lock: None,
        })
    }

    /// Open for a mutating command. The lock is taken before state is read.
    pub fn write(config: &PhasegateConfig) -> Result<Self> {
        let lock = StateDirLock::acquire(config, workspace_locks())?;
        Ok(Self {
            machine: phasegate::build_state_machine(config)?,
            _lock: Some(lock),
        })
    }
}
