//! In-process read/write locks over workspace paths.
//!
//! Cooperating agent subtasks take a lock before mutating a shared file.
//! Readers share, writers are exclusive. When a writer blocks a read-only
//! maintenance flow, `try_acquire_read_with_bypass` hands out a bypass token
//! instead of failing.

use crate::errors::LockError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockType {
    Read,
    Write,
}

impl fmt::Display for LockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockType::Read => f.write_str("read"),
            LockType::Write => f.write_str("write"),
        }
    }
}

/// A held lock on one normalized path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockEntry {
    /// First holder still present.
    pub agent_id: String,
    pub acquired_at: DateTime<Utc>,
    pub lock_type: LockType,
    /// Number of concurrent readers; `None` for write locks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_count: Option<u32>,
    /// Every agent currently holding the lock.
    pub holders: BTreeSet<String>,
}

impl LockEntry {
    fn new(agent_id: &str, lock_type: LockType) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            acquired_at: Utc::now(),
            lock_type,
            read_count: (lock_type == LockType::Read).then_some(1),
            holders: BTreeSet::from([agent_id.to_string()]),
        }
    }

    fn held_by(&self, agent_id: &str) -> bool {
        self.holders.contains(agent_id)
    }

    fn sole_holder(&self, agent_id: &str) -> bool {
        self.holders.len() == 1 && self.held_by(agent_id)
    }

    fn sync_read_count(&mut self) {
        self.read_count = match self.lock_type {
            LockType::Read => Some(self.holders.len() as u32),
            LockType::Write => None,
        };
    }

    /// Holder to report in a conflict with `agent_id`.
    fn other_holder(&self, agent_id: &str) -> String {
        self.holders
            .iter()
            .find(|h| h.as_str() != agent_id)
            .cloned()
            .unwrap_or_else(|| self.agent_id.clone())
    }
}

/// A non-blocking read registered while a writer holds the path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BypassReadEntry {
    pub agent_id: String,
    pub token: String,
    pub acquired_at: DateTime<Utc>,
}

/// Result of `try_acquire_read_with_bypass`.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadAccess {
    Locked(LockEntry),
    Bypass(BypassReadEntry),
}

#[derive(Debug, Default)]
struct LockTable {
    locks: HashMap<String, LockEntry>,
    bypass: HashMap<String, Vec<BypassReadEntry>>,
}

impl LockTable {
    fn acquire(
        &mut self,
        key: &str,
        agent_id: &str,
        requested: LockType,
    ) -> Result<LockEntry, LockError> {
        let Some(entry) = self.locks.get_mut(key) else {
            let entry = LockEntry::new(agent_id, requested);
            self.locks.insert(key.to_string(), entry.clone());
            return Ok(entry);
        };

        match (entry.lock_type, requested) {
            // A writer already covers any access it asks for again.
            (LockType::Write, _) if entry.held_by(agent_id) => Ok(entry.clone()),
            (LockType::Read, LockType::Read) if entry.held_by(agent_id) => Ok(entry.clone()),
            (LockType::Read, LockType::Read) => {
                entry.holders.insert(agent_id.to_string());
                entry.sync_read_count();
                Ok(entry.clone())
            }
            (LockType::Read, LockType::Write) if entry.sole_holder(agent_id) => {
                entry.lock_type = LockType::Write;
                entry.sync_read_count();
                Ok(entry.clone())
            }
            (held, requested) => Err(LockError::Conflict {
                path: key.to_string(),
                holder: entry.other_holder(agent_id),
                held,
                requested,
            }),
        }
    }
}

/// Path-keyed lock table shared between cooperating tasks via `Arc`.
#[derive(Debug, Default)]
pub struct WorkspaceLockManager {
    table: Mutex<LockTable>,
}

/// Unify separators, strip trailing slashes and case-fold.
pub fn normalize_path(path: &str) -> String {
    let unified = path.trim().replace('\\', "/");
    let trimmed = unified.trim_end_matches('/');
    let key = if trimmed.is_empty() && unified.starts_with('/') {
        "/"
    } else {
        trimmed
    };
    key.to_lowercase()
}

impl WorkspaceLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> Result<MutexGuard<'_, LockTable>, LockError> {
        self.table.lock().map_err(|_| LockError::Poisoned)
    }

    pub fn acquire_lock(
        &self,
        path: &str,
        agent_id: &str,
        lock_type: LockType,
    ) -> Result<LockEntry, LockError> {
        let key = normalize_path(path);
        let result = self.table()?.acquire(&key, agent_id, lock_type);
        match &result {
            Ok(entry) => tracing::debug!(
                path = %key,
                agent = agent_id,
                lock_type = %entry.lock_type,
                holders = entry.holders.len(),
                "lock granted"
            ),
            Err(e) => tracing::warn!(path = %key, agent = agent_id, error = %e, "lock conflict"),
        }
        result
    }

    /// Drop `agent_id`'s hold on `path`. The entry disappears with its last holder.
    pub fn release_lock(&self, path: &str, agent_id: &str) -> Result<(), LockError> {
        let key = normalize_path(path);
        let mut table = self.table()?;

        let not_held = || LockError::NotHeld {
            path: key.clone(),
            agent_id: agent_id.to_string(),
        };
        let entry = table.locks.get_mut(&key).ok_or_else(not_held)?;
        if !entry.holders.remove(agent_id) {
            return Err(not_held());
        }

        if entry.holders.is_empty() {
            table.locks.remove(&key);
        } else {
            if entry.agent_id == agent_id
                && let Some(next) = entry.holders.iter().next()
            {
                entry.agent_id = next.clone();
            }
            entry.sync_read_count();
        }
        tracing::debug!(path = %key, agent = agent_id, "lock released");
        Ok(())
    }

    /// Take a read lock, or register a bypass read if a writer holds the path.
    pub fn try_acquire_read_with_bypass(
        &self,
        path: &str,
        agent_id: &str,
    ) -> Result<ReadAccess, LockError> {
        let key = normalize_path(path);
        let mut table = self.table()?;

        match table.acquire(&key, agent_id, LockType::Read) {
            Ok(entry) => Ok(ReadAccess::Locked(entry)),
            Err(LockError::Conflict {
                held: LockType::Write,
                holder,
                ..
            }) => {
                let bypass = BypassReadEntry {
                    agent_id: agent_id.to_string(),
                    token: Uuid::new_v4().to_string(),
                    acquired_at: Utc::now(),
                };
                table
                    .bypass
                    .entry(key.clone())
                    .or_default()
                    .push(bypass.clone());
                tracing::warn!(
                    path = %key,
                    agent = agent_id,
                    writer = %holder,
                    "bypass read granted under write lock"
                );
                Ok(ReadAccess::Bypass(bypass))
            }
            Err(e) => Err(e),
        }
    }

    pub fn release_bypass_read(&self, path: &str, token: &str) -> Result<(), LockError> {
        let key = normalize_path(path);
        let mut table = self.table()?;

        let unknown = || LockError::UnknownBypassToken {
            path: key.clone(),
            token: token.to_string(),
        };
        let entries = table.bypass.get_mut(&key).ok_or_else(unknown)?;
        let before = entries.len();
        entries.retain(|b| b.token != token);
        if entries.len() == before {
            return Err(unknown());
        }
        if entries.is_empty() {
            table.bypass.remove(&key);
        }
        Ok(())
    }

    /// Remove every lock and bypass record held by `agent_id`. Returns how many were removed.
    pub fn release_all_locks_by_agent(&self, agent_id: &str) -> Result<usize, LockError> {
        let mut table = self.table()?;
        let mut removed = 0;

        table.locks.retain(|_, entry| {
            if entry.holders.remove(agent_id) {
                removed += 1;
                if entry.agent_id == agent_id
                    && let Some(next) = entry.holders.iter().next()
                {
                    entry.agent_id = next.clone();
                }
                entry.sync_read_count();
            }
            !entry.holders.is_empty()
        });

        table.bypass.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|b| b.agent_id != agent_id);
            removed += before - entries.len();
            !entries.is_empty()
        });

        if removed > 0 {
            tracing::info!(agent = agent_id, removed, "released all locks for agent");
        }
        Ok(removed)
    }

    pub fn get_lock(&self, path: &str) -> Result<Option<LockEntry>, LockError> {
        Ok(self.table()?.locks.get(&normalize_path(path)).cloned())
    }

    pub fn is_locked(&self, path: &str) -> Result<bool, LockError> {
        Ok(self.table()?.locks.contains_key(&normalize_path(path)))
    }

    /// All held locks, sorted by normalized path.
    pub fn list_locks(&self) -> Result<Vec<(String, LockEntry)>, LockError> {
        let table = self.table()?;
        let mut locks: Vec<_> = table
            .locks
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        locks.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(locks)
    }

    pub fn bypass_reads(&self, path: &str) -> Result<Vec<BypassReadEntry>, LockError> {
        Ok(self
            .table()?
            .bypass
            .get(&normalize_path(path))
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("Src\\Lib.rs"), "src/lib.rs");
        assert_eq!(normalize_path("docs/"), "docs");
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path("  A/B//  "), "a/b");
    }

    #[test]
    fn test_two_readers_share_and_release_decrements() {
        let mgr = WorkspaceLockManager::new();
        mgr.acquire_lock("src/lib.rs", "a", LockType::Read).unwrap();
        let entry = mgr.acquire_lock("SRC/lib.rs", "b", LockType::Read).unwrap();
        assert_eq!(entry.lock_type, LockType::Read);
        assert_eq!(entry.read_count, Some(2));

        mgr.release_lock("src/lib.rs", "a").unwrap();
        let entry = mgr.get_lock("src/lib.rs").unwrap().unwrap();
        assert_eq!(entry.read_count, Some(1));
        assert_eq!(entry.agent_id, "b");

        mgr.release_lock("src/lib.rs", "b").unwrap();
        assert!(!mgr.is_locked("src/lib.rs").unwrap());
    }

    #[test]
    fn test_write_blocked_by_other_reader() {
        let mgr = WorkspaceLockManager::new();
        mgr.acquire_lock("a.txt", "reader", LockType::Read).unwrap();
        let err = mgr.acquire_lock("a.txt", "writer", LockType::Write).unwrap_err();
        match err {
            LockError::Conflict { holder, held, .. } => {
                assert_eq!(holder, "reader");
                assert_eq!(held, LockType::Read);
            }
            other => panic!("Expected Conflict, got {other:?}"),
        }
    }

    #[test]
    fn test_read_blocked_by_other_writer() {
        let mgr = WorkspaceLockManager::new();
        mgr.acquire_lock("a.txt", "writer", LockType::Write).unwrap();
        assert!(matches!(
            mgr.acquire_lock("a.txt", "reader", LockType::Read),
            Err(LockError::Conflict {
                held: LockType::Write,
                ..
            })
        ));
        assert!(mgr.acquire_lock("a.txt", "other", LockType::Write).is_err());
    }

    #[test]
    fn test_same_agent_reacquire_is_noop() {
        let mgr = WorkspaceLockManager::new();
        let first = mgr.acquire_lock("a.txt", "a", LockType::Read).unwrap();
        let second = mgr.acquire_lock("a.txt", "a", LockType::Read).unwrap();
        assert_eq!(first, second);
        assert_eq!(second.read_count, Some(1));
    }

    #[test]
    fn test_upgrade_keeps_acquisition_time() {
        let mgr = WorkspaceLockManager::new();
        let read = mgr.acquire_lock("a.txt", "a", LockType::Read).unwrap();
        let write = mgr.acquire_lock("a.txt", "a", LockType::Write).unwrap();
        assert_eq!(write.lock_type, LockType::Write);
        assert_eq!(write.acquired_at, read.acquired_at);
        assert_eq!(write.read_count, None);

        // A writer asking for a read keeps the write lock.
        let again = mgr.acquire_lock("a.txt", "a", LockType::Read).unwrap();
        assert_eq!(again.lock_type, LockType::Write);
    }

    #[test]
    fn test_upgrade_refused_with_second_reader() {
        let mgr = WorkspaceLockManager::new();
        mgr.acquire_lock("a.txt", "a", LockType::Read).unwrap();
        mgr.acquire_lock("a.txt", "b", LockType::Read).unwrap();
        let err = mgr.acquire_lock("a.txt", "a", LockType::Write).unwrap_err();
        assert!(matches!(err, LockError::Conflict { holder, .. } if holder == "b"));
    }

    #[test]
    fn test_release_unheld_or_misattributed_fails() {
        let mgr = WorkspaceLockManager::new();
        assert!(matches!(
            mgr.release_lock("a.txt", "a"),
            Err(LockError::NotHeld { .. })
        ));
        mgr.acquire_lock("a.txt", "a", LockType::Write).unwrap();
        assert!(matches!(
            mgr.release_lock("a.txt", "b"),
            Err(LockError::NotHeld { .. })
        ));
        assert!(mgr.is_locked("a.txt").unwrap());
    }

    #[test]
    fn test_bypass_read_under_write_lock() {
        let mgr = WorkspaceLockManager::new();
        mgr.acquire_lock("state.json", "writer", LockType::Write)
            .unwrap();

        let access = mgr
            .try_acquire_read_with_bypass("state.json", "maint")
            .unwrap();
        let ReadAccess::Bypass(bypass) = access else {
            panic!("Expected bypass read");
        };
        assert_eq!(mgr.bypass_reads("state.json").unwrap().len(), 1);
        // The write lock is untouched.
        assert_eq!(
            mgr.get_lock("state.json").unwrap().unwrap().lock_type,
            LockType::Write
        );

        mgr.release_bypass_read("state.json", &bypass.token).unwrap();
        assert!(mgr.bypass_reads("state.json").unwrap().is_empty());
        assert!(matches!(
            mgr.release_bypass_read("state.json", &bypass.token),
            Err(LockError::UnknownBypassToken { .. })
        ));
    }

    #[test]
    fn test_bypass_falls_back_to_normal_read() {
        let mgr = WorkspaceLockManager::new();
        let access = mgr.try_acquire_read_with_bypass("free.txt", "a").unwrap();
        assert!(matches!(access, ReadAccess::Locked(e) if e.lock_type == LockType::Read));
    }

    #[test]
    fn test_release_all_locks_by_agent() {
        let mgr = WorkspaceLockManager::new();
        mgr.acquire_lock("a.txt", "crashed", LockType::Write).unwrap();
        mgr.acquire_lock("b.txt", "crashed", LockType::Read).unwrap();
        mgr.acquire_lock("b.txt", "alive", LockType::Read).unwrap();
        mgr.acquire_lock("c.txt", "writer", LockType::Write).unwrap();
        mgr.try_acquire_read_with_bypass("c.txt", "crashed").unwrap();

        assert_eq!(mgr.release_all_locks_by_agent("crashed").unwrap(), 3);
        assert!(!mgr.is_locked("a.txt").unwrap());
        let b = mgr.get_lock("b.txt").unwrap().unwrap();
        assert_eq!(b.agent_id, "alive");
        assert_eq!(b.read_count, Some(1));
        assert!(mgr.bypass_reads("c.txt").unwrap().is_empty());
        assert_eq!(mgr.list_locks().unwrap().len(), 2);
    }

    #[test]
    fn test_shared_across_threads() {
        let mgr = Arc::new(WorkspaceLockManager::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let mgr = Arc::clone(&mgr);
                std::thread::spawn(move || {
                    mgr.acquire_lock("shared.md", &format!("agent-{i}"), LockType::Read)
                        .unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let entry = mgr.get_lock("shared.md").unwrap().unwrap();
        assert_eq!(entry.read_count, Some(8));
    }
}
