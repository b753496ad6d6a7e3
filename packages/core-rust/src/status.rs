//! Structured service-status report.
//!
//! The shape mirrors what the operational status endpoint serves: the
//! deferred-operations queue (pending and in-flight entries), the lock
//! table, and the list of entity ids currently marked failed.

use serde::{Deserialize, Serialize};

use crate::ops::RequestedState;

/// Kind of lock held on an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LockKind {
    Shared,
    Exclusive,
}

/// One entry of the deferred-operations queue as reported by the status
/// endpoint. In-flight entries are reported with the state their worker was
/// dispatched with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpsQueueEntry {
    /// Human-readable identity of the entity.
    pub data: String,
    pub request: RequestedState,
}

/// One entry of the lock table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockStatusEntry {
    pub id: i64,
    pub kind: LockKind,
    /// Number of outstanding holders (shared locks are counted).
    pub count: usize,
}

/// Snapshot of the gateway's coordination state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub ops_queue: Vec<OpsQueueEntry>,
    pub lock_count: usize,
    pub locks: Vec<LockStatusEntry>,
    pub failures: Vec<i64>,
}
