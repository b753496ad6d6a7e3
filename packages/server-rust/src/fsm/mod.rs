//! Deferred-operation state machine.
//!
//! The coordination core of the gateway: one [`StateMachine`] per process
//! tracks, for every dataset or datafile, which storage transition is
//! pending, in-flight, or failed. A single mutex guards the queue maps;
//! `queue()` applies the transition table under it, the periodic drain
//! (`timer` module) dispatches background workers (`workers` module) under
//! it, and workers re-acquire it only to clear their in-flight entry.
//!
//! The machine is constructed once at startup and shared by reference; it
//! exists only in two-level deployments (an archive storage is required).

mod failures;
mod timer;
mod workers;

pub use failures::FailureTracker;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use coldgate_core::{
    DataInfo, DeferredOp, OpsQueueEntry, RequestedState, ServiceStatus, StorageUnit,
};
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::catalog::Catalog;
use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::locking::LockManager;
use crate::storage::{ArchiveStorage, MainStorage};

/// Queue maps, all guarded by one mutex.
struct QueueState {
    /// Entity -> requested transition.
    deferred: HashMap<DataInfo, RequestedState>,
    /// Entities whose worker has been dispatched but not yet completed.
    /// Never re-dispatched by the drain while present here.
    changing: HashMap<DataInfo, RequestedState>,
    /// Entity -> earliest instant its pending write may be dispatched.
    write_deadlines: HashMap<DataInfo, Instant>,
}

/// The deferred-operation coordinator.
pub struct StateMachine {
    unit: StorageUnit,
    write_delay: Duration,
    process_queue_interval: Duration,
    marker_dir: PathBuf,
    queue: Mutex<QueueState>,
    failures: FailureTracker,
    locks: LockManager,
    main: Arc<dyn MainStorage>,
    archive: Arc<dyn ArchiveStorage>,
    catalog: Arc<dyn Catalog>,
    /// Cooperative stop flag handed to restore calls, raised at shutdown.
    stop_restoring: AtomicBool,
}

impl StateMachine {
    /// Build the coordinator, creating the marker directory.
    ///
    /// # Errors
    ///
    /// Fails if the marker directory cannot be created.
    pub fn new(
        config: &GatewayConfig,
        main: Arc<dyn MainStorage>,
        archive: Arc<dyn ArchiveStorage>,
        catalog: Arc<dyn Catalog>,
        locks: LockManager,
    ) -> Result<Arc<Self>> {
        let marker_dir = config.marker_dir();
        std::fs::create_dir_all(&marker_dir)
            .with_context(|| format!("creating marker directory {}", marker_dir.display()))?;
        Ok(Arc::new(Self {
            unit: config.storage_unit,
            write_delay: config.write_delay,
            process_queue_interval: config.process_queue_interval,
            marker_dir,
            queue: Mutex::new(QueueState {
                deferred: HashMap::new(),
                changing: HashMap::new(),
                write_deadlines: HashMap::new(),
            }),
            failures: FailureTracker::new(),
            locks,
            main,
            archive,
            catalog,
            stop_restoring: AtomicBool::new(false),
        }))
    }

    #[must_use]
    pub fn storage_unit(&self) -> StorageUnit {
        self.unit
    }

    // -----------------------------------------------------------------------
    // Requesting transitions
    // -----------------------------------------------------------------------

    /// Request a deferred operation for an entity.
    ///
    /// Applies the transition table under the queue mutex. The only I/O is
    /// creating or removing a marker file, both idempotent. Entities that
    /// are in flight are left untouched; the table only rewrites the
    /// pending entry.
    ///
    /// # Errors
    ///
    /// Fails if the entity's granularity does not match the configured
    /// storage unit, or if the op is not defined for the granularity
    /// (dataset-level DELETE); both are programming/config errors.
    pub fn queue(&self, info: &DataInfo, op: DeferredOp) -> Result<()> {
        if info.storage_unit() != self.unit {
            return Err(GatewayError::Internal(anyhow::anyhow!(
                "cannot queue a {} at {} granularity",
                info.storage_unit(),
                self.unit
            )));
        }
        tracing::info!(entity = %info, %op, "requesting deferred operation");

        let mut q = self.queue.lock();
        match self.unit {
            StorageUnit::Dataset => self.queue_dataset(&mut q, info, op),
            StorageUnit::Datafile => self.queue_datafile(&mut q, info, op),
        }
    }

    fn queue_dataset(&self, q: &mut QueueState, info: &DataInfo, op: DeferredOp) -> Result<()> {
        use DeferredOp as Op;
        use RequestedState as S;

        if op == Op::Delete {
            // The selection layer translates deletes at dataset granularity;
            // the table has no DELETE transitions.
            return Err(GatewayError::Internal(anyhow::anyhow!(
                "DELETE is not a dataset-level transition"
            )));
        }

        match (q.deferred.get(info).copied(), op) {
            (None, Op::Write) => self.request_write(q, info)?,
            (None, Op::Archive) => {
                q.deferred.insert(info.clone(), S::ArchiveRequested);
            }
            (None, Op::Restore) => {
                q.deferred.insert(info.clone(), S::RestoreRequested);
            }
            (Some(S::ArchiveRequested), Op::Write) => {
                self.request_write(q, info)?;
                q.deferred.insert(info.clone(), S::WriteThenArchiveRequested);
            }
            (Some(S::ArchiveRequested), Op::Restore) => {
                q.deferred.insert(info.clone(), S::RestoreRequested);
            }
            (Some(S::RestoreRequested), Op::Write) => self.request_write(q, info)?,
            (Some(S::RestoreRequested), Op::Archive) => {
                q.deferred.insert(info.clone(), S::ArchiveRequested);
            }
            (Some(S::WriteRequested), Op::Write) => self.set_delay(q, info),
            (Some(S::WriteRequested), Op::Archive) => {
                q.deferred.insert(info.clone(), S::WriteThenArchiveRequested);
            }
            (Some(S::WriteThenArchiveRequested), Op::Write) => self.set_delay(q, info),
            (Some(S::WriteThenArchiveRequested), Op::Restore) => {
                q.deferred.insert(info.clone(), S::WriteRequested);
            }
            // Everything else leaves the state unchanged.
            _ => {}
        }
        Ok(())
    }

    fn queue_datafile(&self, q: &mut QueueState, info: &DataInfo, op: DeferredOp) -> Result<()> {
        use DeferredOp as Op;
        use RequestedState as S;

        match (q.deferred.get(info).copied(), op) {
            (None, Op::Write) => self.request_write(q, info)?,
            (None, Op::Archive) => {
                q.deferred.insert(info.clone(), S::ArchiveRequested);
            }
            (None, Op::Restore) => {
                q.deferred.insert(info.clone(), S::RestoreRequested);
            }
            (None, Op::Delete) => {
                q.deferred.insert(info.clone(), S::DeleteRequested);
            }
            // A delete supersedes anything still pending.
            (Some(S::ArchiveRequested | S::RestoreRequested), Op::Delete) => {
                q.deferred.insert(info.clone(), S::DeleteRequested);
            }
            (Some(S::DeleteRequested), _) => {} // no way out
            (Some(S::ArchiveRequested), Op::Write) => {
                self.request_write(q, info)?;
                q.deferred.insert(info.clone(), S::WriteThenArchiveRequested);
            }
            (Some(S::ArchiveRequested), Op::Restore) => {
                // The file never left main storage; cancelling the archive
                // is all a restore needs.
                q.deferred.remove(info);
            }
            (Some(S::RestoreRequested), Op::Write) => self.request_write(q, info)?,
            (Some(S::RestoreRequested), Op::Archive) => {
                q.deferred.insert(info.clone(), S::ArchiveRequested);
            }
            (Some(S::WriteRequested), Op::Write) => self.set_delay(q, info),
            (Some(S::WriteRequested), Op::Archive) => {
                q.deferred.insert(info.clone(), S::WriteThenArchiveRequested);
            }
            (Some(S::WriteRequested | S::WriteThenArchiveRequested), Op::Delete) => {
                self.cancel_write(q, info);
            }
            (Some(S::WriteThenArchiveRequested), Op::Write) => self.set_delay(q, info),
            (Some(S::WriteThenArchiveRequested), Op::Restore) => {
                q.deferred.insert(info.clone(), S::WriteRequested);
            }
            _ => {}
        }
        Ok(())
    }

    /// WRITE transition: marker on disk, queue entry, fresh delay.
    fn request_write(&self, q: &mut QueueState, info: &DataInfo) -> Result<()> {
        self.create_marker(info.id())?;
        q.deferred.insert(info.clone(), RequestedState::WriteRequested);
        self.set_delay(q, info);
        Ok(())
    }

    /// Push the entity's write deadline to now + delay. Repeated write
    /// requests keep moving the deadline forward, coalescing a burst into
    /// one eventual write.
    fn set_delay(&self, q: &mut QueueState, info: &DataInfo) {
        let deadline = Instant::now() + self.write_delay;
        q.write_deadlines.insert(info.clone(), deadline);
        tracing::debug!(entity = %info, delay = ?self.write_delay, "delaying write");
    }

    /// Drop a pending write entirely (datafile delete superseding it).
    fn cancel_write(&self, q: &mut QueueState, info: &DataInfo) {
        q.deferred.remove(info);
        q.write_deadlines.remove(info);
        self.remove_marker(info.id());
    }

    // -----------------------------------------------------------------------
    // Marker files
    // -----------------------------------------------------------------------

    /// A marker on disk means: a write was requested and has not been
    /// confirmed complete. Scanned at startup to re-queue unfinished work.
    fn create_marker(&self, id: i64) -> Result<()> {
        let path = self.marker_dir.join(id.to_string());
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(_) => {
                tracing::debug!(id, "created marker");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(GatewayError::Internal(
                anyhow::Error::new(e).context(format!("creating marker {}", path.display())),
            )),
        }
    }

    pub(crate) fn remove_marker(&self, id: i64) {
        let path = self.marker_dir.join(id.to_string());
        match std::fs::remove_file(&path) {
            Ok(()) => tracing::debug!(id, "removed marker"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::error!(id, error = %e, "failed to remove marker"),
        }
    }

    pub(crate) fn marker_exists(&self, id: i64) -> bool {
        self.marker_dir.join(id.to_string()).exists()
    }

    // -----------------------------------------------------------------------
    // Snapshots
    // -----------------------------------------------------------------------

    /// Entities with a pending or in-flight transition other than a plain
    /// write. A pending write leaves the data physically present and
    /// readable; everything else is conservatively treated as possibly
    /// unavailable.
    #[must_use]
    pub fn maybe_offline(&self) -> HashSet<DataInfo> {
        self.snapshot_union()
            .into_iter()
            .filter(|(_, state)| *state != RequestedState::WriteRequested)
            .map(|(info, _)| info)
            .collect()
    }

    /// Entities queued for restoration or being restored.
    #[must_use]
    pub fn restoring(&self) -> HashSet<DataInfo> {
        self.snapshot_union()
            .into_iter()
            .filter(|(_, state)| *state == RequestedState::RestoreRequested)
            .map(|(info, _)| info)
            .collect()
    }

    /// Union of pending and in-flight entries; a pending entry wins over
    /// the in-flight one for the same entity (it is the newer request).
    fn snapshot_union(&self) -> HashMap<DataInfo, RequestedState> {
        let q = self.queue.lock();
        let mut union = q.changing.clone();
        union.extend(q.deferred.iter().map(|(k, v)| (k.clone(), *v)));
        union
    }

    /// Structured report of queue contents, lock table, and failures.
    #[must_use]
    pub fn service_status(&self) -> ServiceStatus {
        let mut ops_queue: Vec<OpsQueueEntry> = self
            .snapshot_union()
            .into_iter()
            .map(|(info, state)| OpsQueueEntry {
                data: info.to_string(),
                request: state,
            })
            .collect();
        ops_queue.sort_by(|a, b| a.data.cmp(&b.data));

        let locks = self.locks.lock_info();
        ServiceStatus {
            lock_count: locks.len(),
            locks,
            ops_queue,
            failures: self.failures.snapshot(),
        }
    }

    /// Requested (pending) state of an entity, if any.
    #[must_use]
    pub fn requested_state(&self, info: &DataInfo) -> Option<RequestedState> {
        self.queue.lock().deferred.get(info).copied()
    }

    // -----------------------------------------------------------------------
    // Worker bookkeeping and failure tracking
    // -----------------------------------------------------------------------

    pub(crate) fn remove_from_changing(&self, info: &DataInfo) {
        self.queue.lock().changing.remove(info);
    }

    pub fn record_success(&self, id: i64) {
        self.failures.record_success(id);
    }

    pub fn record_failure(&self, id: i64) {
        self.failures.record_failure(id);
    }

    /// Fail fast if the entity has a recorded failure.
    ///
    /// # Errors
    ///
    /// Propagates the failure as an internal fault.
    pub fn check_failure(&self, id: i64) -> Result<()> {
        self.failures.check(id)
    }

    /// Raise the cooperative stop flag; running restores abandon cleanly
    /// between items.
    pub fn stop_restores(&self) {
        self.stop_restoring.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use coldgate_core::{DatafileInfo, DatasetInfo};

    use crate::catalog::MemoryCatalog;
    use crate::storage::{MemoryArchiveStorage, MemoryMainStorage};

    pub struct Harness {
        pub fsm: Arc<StateMachine>,
        pub main: Arc<MemoryMainStorage>,
        pub archive: Arc<MemoryArchiveStorage>,
        pub catalog: Arc<MemoryCatalog>,
        pub locks: LockManager,
        // Dropped last; keeps the marker directory alive.
        pub cache: tempfile::TempDir,
    }

    pub fn dataset(id: i64) -> DatasetInfo {
        DatasetInfo {
            id,
            name: format!("ds-{id}"),
            location: format!("inv/ds-{id}"),
            facility_id: 1,
            facility_name: "fac".to_string(),
            investigation_id: 10,
            investigation_name: "inv".to_string(),
            visit_id: "v1".to_string(),
        }
    }

    pub fn datafile(id: i64, dataset_id: i64) -> DatafileInfo {
        DatafileInfo {
            id,
            name: format!("f-{id}"),
            location: format!("inv/ds-{dataset_id}/f-{id}"),
            create_id: "c".to_string(),
            mod_id: "m".to_string(),
            dataset_id,
        }
    }

    pub fn harness(unit: StorageUnit, write_delay: Duration) -> Harness {
        let cache = tempfile::tempdir().unwrap();
        let config = GatewayConfig {
            storage_unit: unit,
            cache_dir: cache.path().to_path_buf(),
            write_delay,
            process_queue_interval: Duration::from_millis(50),
        };
        let main = Arc::new(MemoryMainStorage::new());
        let archive = Arc::new(MemoryArchiveStorage::new());
        let catalog = Arc::new(MemoryCatalog::new());
        let locks = LockManager::new();
        let fsm = StateMachine::new(
            &config,
            main.clone(),
            archive.clone(),
            catalog.clone(),
            locks.clone(),
        )
        .unwrap();
        Harness {
            fsm,
            main,
            archive,
            catalog,
            locks,
            cache,
        }
    }
}
