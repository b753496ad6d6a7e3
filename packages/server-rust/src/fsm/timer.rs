//! Periodic queue drain.
//!
//! A steady ticker runs a drain pass every `process_queue_interval`. The
//! whole pass executes under the queue mutex so `queue()` never observes a
//! half-drained map; workers are spawned inside the critical section but
//! their bodies run outside it. A pass that dispatches nothing (lock
//! contention, deadlines not reached) leaves entries queued for the next
//! tick; the ticker itself never stops until shutdown is signalled.

use std::collections::HashMap;
use std::sync::Arc;

use coldgate_core::{DataInfo, DatafileInfo, LockKind, RequestedState, StorageUnit};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::locking::{Lock, LockError, LockManager};

use super::{QueueState, StateMachine};

impl StateMachine {
    /// Start the periodic drain task.
    ///
    /// Runs until `shutdown` flips; every tick performs one drain pass.
    pub fn start(fsm: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(fsm.process_queue_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // Skip the immediate first tick so a freshly started gateway
            // finishes its recovery scan before the first drain.
            interval.tick().await;
            tracing::info!(
                interval = ?fsm.process_queue_interval,
                unit = %fsm.storage_unit(),
                "queue drain started"
            );

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        Self::process_queue(&fsm);
                    }
                    _ = shutdown.changed() => break,
                }
            }
            tracing::info!("queue drain stopped");
        })
    }

    /// One drain pass over the deferred-operations queue.
    pub(crate) fn process_queue(fsm: &Arc<Self>) {
        let mut q = fsm.queue.lock();
        let now = Instant::now();
        match fsm.storage_unit() {
            StorageUnit::Dataset => Self::drain_datasets(fsm, &mut q, now),
            StorageUnit::Datafile => Self::drain_datafiles(fsm, &mut q, now),
        }
    }

    /// True if the entity's pending write may be dispatched yet. An entry
    /// without a recorded deadline dispatches immediately.
    fn past_deadline(q: &QueueState, info: &DataInfo, now: Instant) -> bool {
        q.write_deadlines
            .get(info)
            .is_none_or(|deadline| now > *deadline)
    }

    fn drain_datasets(fsm: &Arc<Self>, q: &mut QueueState, now: Instant) {
        use RequestedState as S;

        let snapshot: Vec<(DataInfo, S)> = q
            .deferred
            .iter()
            .filter(|(info, _)| !q.changing.contains_key(*info))
            .map(|(info, state)| (info.clone(), *state))
            .collect();
        // Re-enqueues staged during the pass; merged after iteration so the
        // map is never mutated mid-walk.
        let mut staged: Vec<(DataInfo, S)> = Vec::new();

        for (info, state) in snapshot {
            let Some(ds) = info.as_dataset().cloned() else {
                tracing::error!(entity = %info, "datafile entry in a dataset-level queue");
                continue;
            };
            match state {
                S::WriteRequested | S::WriteThenArchiveRequested => {
                    if !Self::past_deadline(q, &info, now) {
                        continue;
                    }
                    match fsm.locks.lock(ds.id, LockKind::Shared) {
                        Ok(lock) => {
                            tracing::debug!(entity = %info, %state, "dispatching write");
                            q.write_deadlines.remove(&info);
                            q.changing.insert(info.clone(), S::WriteRequested);
                            q.deferred.remove(&info);
                            if state == S::WriteThenArchiveRequested {
                                staged.push((info.clone(), S::ArchiveRequested));
                            }
                            Self::spawn_dataset_write(fsm, ds, lock);
                        }
                        Err(LockError::AlreadyLocked(id)) => {
                            tracing::debug!(id, %state, "entity locked, holding back");
                        }
                    }
                }
                S::ArchiveRequested => match fsm.locks.lock(ds.id, LockKind::Exclusive) {
                    Ok(lock) => {
                        tracing::debug!(entity = %info, %state, "dispatching archive");
                        q.changing.insert(info.clone(), state);
                        q.deferred.remove(&info);
                        Self::spawn_dataset_archive(fsm, ds, lock);
                    }
                    Err(LockError::AlreadyLocked(id)) => {
                        tracing::debug!(id, %state, "entity locked, holding back");
                    }
                },
                S::RestoreRequested => match fsm.locks.lock(ds.id, LockKind::Exclusive) {
                    Ok(lock) => {
                        tracing::debug!(entity = %info, %state, "dispatching restore");
                        q.changing.insert(info.clone(), state);
                        q.deferred.remove(&info);
                        Self::spawn_dataset_restore(fsm, ds, lock);
                    }
                    Err(LockError::AlreadyLocked(id)) => {
                        tracing::debug!(id, %state, "entity locked, holding back");
                    }
                },
                S::DeleteRequested => {
                    tracing::error!(entity = %info, "DELETE_REQUESTED in a dataset-level queue");
                }
            }
        }

        q.deferred.extend(staged);
    }

    fn drain_datafiles(fsm: &Arc<Self>, q: &mut QueueState, now: Instant) {
        use RequestedState as S;

        let snapshot: Vec<(DataInfo, S)> = q
            .deferred
            .iter()
            .filter(|(info, _)| !q.changing.contains_key(*info))
            .map(|(info, state)| (info.clone(), *state))
            .collect();
        let mut staged: Vec<(DataInfo, S)> = Vec::new();

        // Batches per transition kind, dispatched as one worker each. Locks
        // are taken on the owning dataset, once per dataset per kind, and
        // handed to the worker collectively.
        let mut writes: Vec<DatafileInfo> = Vec::new();
        let mut archives: Vec<DatafileInfo> = Vec::new();
        let mut restores: Vec<DatafileInfo> = Vec::new();
        let mut deletes: Vec<DatafileInfo> = Vec::new();
        let mut write_locks: HashMap<i64, Lock> = HashMap::new();
        let mut archive_locks: HashMap<i64, Lock> = HashMap::new();
        let mut restore_locks: HashMap<i64, Lock> = HashMap::new();
        let mut delete_locks: HashMap<i64, Lock> = HashMap::new();

        for (info, state) in snapshot {
            let Some(df) = info.as_datafile().cloned() else {
                tracing::error!(entity = %info, "dataset entry in a datafile-level queue");
                continue;
            };
            let ds_id = df.dataset_id;
            match state {
                S::WriteRequested | S::WriteThenArchiveRequested => {
                    if !Self::past_deadline(q, &info, now) {
                        continue;
                    }
                    if !Self::ensure_lock(&fsm.locks, &mut write_locks, ds_id, LockKind::Shared) {
                        continue;
                    }
                    q.write_deadlines.remove(&info);
                    q.changing.insert(info.clone(), S::WriteRequested);
                    q.deferred.remove(&info);
                    if state == S::WriteThenArchiveRequested {
                        staged.push((info.clone(), S::ArchiveRequested));
                    }
                    writes.push(df);
                }
                S::ArchiveRequested => {
                    if !Self::ensure_lock(
                        &fsm.locks,
                        &mut archive_locks,
                        ds_id,
                        LockKind::Exclusive,
                    ) {
                        continue;
                    }
                    q.changing.insert(info.clone(), state);
                    q.deferred.remove(&info);
                    archives.push(df);
                }
                S::RestoreRequested => {
                    if !Self::ensure_lock(
                        &fsm.locks,
                        &mut restore_locks,
                        ds_id,
                        LockKind::Exclusive,
                    ) {
                        continue;
                    }
                    q.changing.insert(info.clone(), state);
                    q.deferred.remove(&info);
                    restores.push(df);
                }
                S::DeleteRequested => {
                    if !Self::ensure_lock(
                        &fsm.locks,
                        &mut delete_locks,
                        ds_id,
                        LockKind::Exclusive,
                    ) {
                        continue;
                    }
                    q.changing.insert(info.clone(), state);
                    q.deferred.remove(&info);
                    deletes.push(df);
                }
            }
        }

        q.deferred.extend(staged);

        if !writes.is_empty() {
            tracing::debug!(count = writes.len(), "dispatching datafile writes");
            Self::spawn_datafile_writes(fsm, writes, write_locks.into_values().collect());
        }
        if !archives.is_empty() {
            tracing::debug!(count = archives.len(), "dispatching datafile archives");
            Self::spawn_datafile_archives(fsm, archives, archive_locks.into_values().collect());
        }
        if !restores.is_empty() {
            tracing::debug!(count = restores.len(), "dispatching datafile restores");
            Self::spawn_datafile_restores(fsm, restores, restore_locks.into_values().collect());
        }
        if !deletes.is_empty() {
            tracing::debug!(count = deletes.len(), "dispatching datafile deletes");
            Self::spawn_datafile_deletes(fsm, deletes, delete_locks.into_values().collect());
        }
    }

    /// Acquire a per-dataset lock for a batch unless already held for this
    /// batch. Returns false (entity stays queued) on contention.
    fn ensure_lock(
        manager: &LockManager,
        held: &mut HashMap<i64, Lock>,
        ds_id: i64,
        kind: LockKind,
    ) -> bool {
        if held.contains_key(&ds_id) {
            return true;
        }
        match manager.lock(ds_id, kind) {
            Ok(lock) => {
                held.insert(ds_id, lock);
                true
            }
            Err(LockError::AlreadyLocked(id)) => {
                tracing::debug!(id, "dataset locked, holding back datafile op");
                false
            }
        }
    }
}
