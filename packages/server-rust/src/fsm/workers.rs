//! Background transition workers.
//!
//! Each worker runs as its own task, holds the lock acquired at dispatch
//! time for its whole duration, and on completion (success or failure) clears its
//! in-flight entries and updates the failure tracker before the lock
//! drops. Restore workers honor the machine's cooperative stop flag.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use coldgate_core::{DataInfo, DatafileInfo, DatasetInfo};

use crate::locking::Lock;

use super::StateMachine;

/// Outcome of a dataset restore attempt.
enum RestoreOutcome {
    /// Data already present in main storage; nothing recorded.
    AlreadyPresent,
    /// Every file delivered.
    Completed,
    /// The archive did not deliver some files.
    PartlyMissing,
    /// The stop flag was raised mid-restore; nothing recorded.
    Stopped,
}

impl StateMachine {
    // -----------------------------------------------------------------------
    // Dataset workers
    // -----------------------------------------------------------------------

    pub(crate) fn spawn_dataset_write(fsm: &Arc<Self>, ds: DatasetInfo, lock: Lock) {
        let fsm = Arc::clone(fsm);
        tokio::spawn(async move {
            match fsm.write_dataset_out(&ds).await {
                Ok(()) => tracing::debug!(dataset = %ds, "write completed"),
                Err(e) => tracing::error!(dataset = %ds, error = %e, "write failed"),
            }
            fsm.remove_from_changing(&DataInfo::Dataset(ds));
            drop(lock);
        });
    }

    /// Serialize the dataset's current main-storage content out to the
    /// archive; if the dataset no longer exists in main storage, delete
    /// the archive copy instead. The marker survives any failure so the
    /// write is rediscovered after a restart.
    async fn write_dataset_out(&self, ds: &DatasetInfo) -> anyhow::Result<()> {
        if self.main.exists_dataset(ds).await? {
            let files = self.catalog.datafiles_of(ds.id).await?;
            self.archive
                .write_dataset(self.main.as_ref(), ds, &files)
                .await?;
        } else {
            tracing::info!(dataset = %ds, "no content in main storage, deleting archive copy");
            self.archive.delete_dataset(ds).await?;
        }
        self.remove_marker(ds.id);
        Ok(())
    }

    pub(crate) fn spawn_dataset_archive(fsm: &Arc<Self>, ds: DatasetInfo, lock: Lock) {
        let fsm = Arc::clone(fsm);
        tokio::spawn(async move {
            if fsm.marker_exists(ds.id) {
                tracing::error!(
                    dataset = %ds,
                    "archive skipped: an earlier write to archive storage has not completed"
                );
            } else {
                match fsm.main.delete_dataset(&ds).await {
                    Ok(()) => tracing::debug!(dataset = %ds, "archive completed"),
                    Err(e) => tracing::error!(dataset = %ds, error = %e, "archive failed"),
                }
            }
            fsm.remove_from_changing(&DataInfo::Dataset(ds));
            drop(lock);
        });
    }

    pub(crate) fn spawn_dataset_restore(fsm: &Arc<Self>, ds: DatasetInfo, lock: Lock) {
        let fsm = Arc::clone(fsm);
        tokio::spawn(async move {
            match fsm.restore_dataset(&ds).await {
                Ok(RestoreOutcome::Completed) => {
                    fsm.record_success(ds.id);
                    tracing::debug!(dataset = %ds, "restore completed");
                }
                Ok(RestoreOutcome::AlreadyPresent | RestoreOutcome::Stopped) => {}
                Ok(RestoreOutcome::PartlyMissing) => {
                    fsm.record_failure(ds.id);
                    tracing::error!(dataset = %ds, "restore incomplete");
                }
                Err(e) => {
                    fsm.record_failure(ds.id);
                    tracing::error!(dataset = %ds, error = %e, "restore failed");
                }
            }
            fsm.remove_from_changing(&DataInfo::Dataset(ds));
            drop(lock);
        });
    }

    async fn restore_dataset(&self, ds: &DatasetInfo) -> anyhow::Result<RestoreOutcome> {
        // Pointless restores are normally filtered out earlier; this keeps
        // a late-arriving dispatch from clobbering fresh content.
        if self.main.exists_dataset(ds).await? {
            return Ok(RestoreOutcome::AlreadyPresent);
        }
        let files = self.catalog.datafiles_of(ds.id).await?;
        tracing::debug!(dataset = %ds, files = files.len(), "restoring dataset");
        let failed = self
            .archive
            .restore(self.main.as_ref(), &files, &self.stop_restoring)
            .await?;
        if self.stop_restoring.load(Ordering::Relaxed) {
            return Ok(RestoreOutcome::Stopped);
        }
        if failed.is_empty() {
            Ok(RestoreOutcome::Completed)
        } else {
            Ok(RestoreOutcome::PartlyMissing)
        }
    }

    // -----------------------------------------------------------------------
    // Datafile batch workers
    // -----------------------------------------------------------------------

    pub(crate) fn spawn_datafile_writes(
        fsm: &Arc<Self>,
        files: Vec<DatafileInfo>,
        locks: Vec<Lock>,
    ) {
        let fsm = Arc::clone(fsm);
        tokio::spawn(async move {
            for df in files {
                match fsm.archive.write_datafile(fsm.main.as_ref(), &df).await {
                    Ok(()) => {
                        fsm.remove_marker(df.id);
                        tracing::debug!(file = %df, "write completed");
                    }
                    // Marker stays: the write will be retried after restart.
                    Err(e) => tracing::error!(file = %df, error = %e, "write failed"),
                }
                fsm.remove_from_changing(&DataInfo::Datafile(df));
            }
            drop(locks);
        });
    }

    pub(crate) fn spawn_datafile_archives(
        fsm: &Arc<Self>,
        files: Vec<DatafileInfo>,
        locks: Vec<Lock>,
    ) {
        let fsm = Arc::clone(fsm);
        tokio::spawn(async move {
            let mut failures = 0usize;
            for df in files {
                if fsm.marker_exists(df.id) {
                    failures += 1;
                    tracing::error!(
                        file = %df,
                        "archive skipped: an earlier write to archive storage has not completed"
                    );
                } else if let Err(e) =
                    fsm.main.delete(&df.location, &df.create_id, &df.mod_id).await
                {
                    failures += 1;
                    tracing::error!(file = %df, error = %e, "archive failed");
                } else {
                    tracing::debug!(file = %df, "archive completed");
                }
                fsm.remove_from_changing(&DataInfo::Datafile(df));
            }
            if failures > 0 {
                tracing::warn!(failures, "archive batch completed partially");
            }
            drop(locks);
        });
    }

    pub(crate) fn spawn_datafile_restores(
        fsm: &Arc<Self>,
        files: Vec<DatafileInfo>,
        locks: Vec<Lock>,
    ) {
        let fsm = Arc::clone(fsm);
        tokio::spawn(async move {
            // Files that arrived in main storage since they were queued
            // need no restore.
            let mut pending: Vec<DatafileInfo> = Vec::with_capacity(files.len());
            for df in files {
                match fsm.main.exists(&df.location).await {
                    Ok(true) => fsm.remove_from_changing(&DataInfo::Datafile(df)),
                    Ok(false) => pending.push(df),
                    Err(e) => {
                        tracing::error!(file = %df, error = %e, "existence check failed");
                        pending.push(df);
                    }
                }
            }
            if pending.is_empty() {
                drop(locks);
                return;
            }

            match fsm
                .archive
                .restore(fsm.main.as_ref(), &pending, &fsm.stop_restoring)
                .await
            {
                Ok(failed) => {
                    let stopped = fsm.stop_restoring.load(Ordering::Relaxed);
                    for df in pending {
                        if failed.contains(&df.id) {
                            fsm.record_failure(df.id);
                            tracing::error!(file = %df, "restore failed");
                        } else if !stopped {
                            fsm.record_success(df.id);
                            tracing::debug!(file = %df, "restore completed");
                        }
                        fsm.remove_from_changing(&DataInfo::Datafile(df));
                    }
                }
                // Connection-level fault: everything not yet restored is
                // failed.
                Err(e) => {
                    tracing::error!(error = %e, "restore batch failed");
                    for df in pending {
                        fsm.record_failure(df.id);
                        fsm.remove_from_changing(&DataInfo::Datafile(df));
                    }
                }
            }
            tracing::debug!(
                remaining = fsm.archive.num_files_remaining(),
                "restore batch done"
            );
            drop(locks);
        });
    }

    pub(crate) fn spawn_datafile_deletes(
        fsm: &Arc<Self>,
        files: Vec<DatafileInfo>,
        locks: Vec<Lock>,
    ) {
        let fsm = Arc::clone(fsm);
        tokio::spawn(async move {
            for df in files {
                match fsm.archive.delete_datafile(&df).await {
                    Ok(()) => tracing::debug!(file = %df, "delete completed"),
                    Err(e) => tracing::error!(file = %df, error = %e, "delete failed"),
                }
                fsm.remove_from_changing(&DataInfo::Datafile(df));
            }
            drop(locks);
        });
    }
}
