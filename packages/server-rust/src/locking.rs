//! Per-entity shared/exclusive locks with try-lock semantics.
//!
//! The lock manager arbitrates concurrent access to an entity's physical
//! storage. Acquisition either succeeds immediately or fails with
//! [`LockError::AlreadyLocked`]; there is no queueing, callers retry on
//! their own schedule (the queue drain retries on its next tick). Shared
//! locks are counted and coexist; an exclusive lock conflicts with every
//! other holder. Failure is side-effect free.

use std::collections::HashMap;
use std::sync::Arc;

use coldgate_core::{LockKind, LockStatusEntry};
use parking_lot::Mutex;

/// Lock acquisition failures.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("entity {0} is already locked")]
    AlreadyLocked(i64),
}

struct LockEntry {
    kind: LockKind,
    count: usize,
}

/// Arbiter of per-entity locks. Cheap to clone; clones share one table.
///
/// Shared between request handlers (shared locks around reads) and the
/// queue drain (shared locks for writes, exclusive for archive/restore).
#[derive(Clone)]
pub struct LockManager {
    entries: Arc<Mutex<HashMap<i64, LockEntry>>>,
}

impl LockManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Acquire a lock on a single entity id.
    ///
    /// # Errors
    ///
    /// Fails with [`LockError::AlreadyLocked`] if the entity holds an
    /// exclusive lock, or holds any lock when `kind` is exclusive.
    pub fn lock(&self, id: i64, kind: LockKind) -> Result<Lock, LockError> {
        {
            let mut entries = self.entries.lock();
            match entries.get_mut(&id) {
                None => {
                    entries.insert(id, LockEntry { kind, count: 1 });
                }
                Some(entry) => {
                    if kind == LockKind::Exclusive || entry.kind == LockKind::Exclusive {
                        return Err(LockError::AlreadyLocked(id));
                    }
                    entry.count += 1;
                }
            }
        }
        tracing::debug!(id, ?kind, "acquired lock");
        Ok(Lock {
            manager: self.clone(),
            ids: vec![id],
        })
    }

    /// Acquire locks on a collection of entity ids, all or nothing.
    ///
    /// # Errors
    ///
    /// On the first conflict every lock acquired so far is released and
    /// [`LockError::AlreadyLocked`] is returned.
    pub fn lock_all(
        &self,
        ids: impl IntoIterator<Item = i64>,
        kind: LockKind,
    ) -> Result<Lock, LockError> {
        let mut held = Vec::new();
        for id in ids {
            match self.lock(id, kind) {
                Ok(mut lock) => held.append(&mut lock.ids),
                Err(e) => {
                    // Drop of the partial Lock releases what we got so far.
                    drop(Lock {
                        manager: self.clone(),
                        ids: held,
                    });
                    return Err(e);
                }
            }
        }
        Ok(Lock {
            manager: self.clone(),
            ids: held,
        })
    }

    /// Snapshot of the lock table for the status report.
    #[must_use]
    pub fn lock_info(&self) -> Vec<LockStatusEntry> {
        let entries = self.entries.lock();
        let mut info: Vec<LockStatusEntry> = entries
            .iter()
            .map(|(id, entry)| LockStatusEntry {
                id: *id,
                kind: entry.kind,
                count: entry.count,
            })
            .collect();
        info.sort_by_key(|e| e.id);
        info
    }

    /// True if any lock is held on the given id.
    #[must_use]
    pub fn is_locked(&self, id: i64) -> bool {
        self.entries.lock().contains_key(&id)
    }

    fn release(&self, id: i64) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(&id) {
            entry.count -= 1;
            if entry.count == 0 {
                entries.remove(&id);
            }
            tracing::debug!(id, "released lock");
        }
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

/// A held lock over one or more entity ids, released on drop.
pub struct Lock {
    manager: LockManager,
    ids: Vec<i64>,
}

impl Lock {
    /// Release explicitly; equivalent to dropping.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for Lock {
    fn drop(&mut self) {
        for id in self.ids.drain(..) {
            self.manager.release(id);
        }
    }
}

impl std::fmt::Debug for Lock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lock").field("ids", &self.ids).finish()
    }
}
