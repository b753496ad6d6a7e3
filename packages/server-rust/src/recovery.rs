//! Startup recovery of unfinished writes.
//!
//! A marker file on disk means a write was requested but never confirmed
//! complete; the process died or the archive was down. At startup the
//! marker directory is scanned once and each surviving entity is queued
//! for WRITE again; markers for entities the catalog no longer knows are
//! dropped.

use std::path::Path;

use coldgate_core::{DataInfo, DeferredOp, StorageUnit};

use crate::catalog::{Catalog, CatalogError};
use crate::error::{GatewayError, Result};
use crate::fsm::StateMachine;

/// Re-queue writes for every marker in the marker directory.
///
/// # Errors
///
/// Fails on marker-directory I/O faults or catalog backend faults;
/// individual unknown entities are cleaned up, not errors.
pub async fn restart_unfinished_work(
    fsm: &StateMachine,
    catalog: &dyn Catalog,
    marker_dir: &Path,
) -> Result<()> {
    let mut entries = tokio::fs::read_dir(marker_dir)
        .await
        .map_err(|e| GatewayError::Internal(e.into()))?;
    let mut requeued = 0usize;

    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| GatewayError::Internal(e.into()))?
    {
        let name = entry.file_name();
        let Some(id) = name.to_str().and_then(|s| s.parse::<i64>().ok()) else {
            tracing::warn!(marker = ?name, "ignoring unparseable marker file");
            continue;
        };

        let info = match fsm.storage_unit() {
            StorageUnit::Dataset => catalog.dataset(id).await.map(DataInfo::Dataset),
            StorageUnit::Datafile => catalog.datafile(id).await.map(DataInfo::Datafile),
        };
        match info {
            Ok(info) => {
                fsm.queue(&info, DeferredOp::Write)?;
                requeued += 1;
                tracing::info!(
                    entity = %info,
                    "queued write for entity not written out before shutdown"
                );
            }
            Err(CatalogError::NotFound(_)) => {
                tracing::warn!(
                    id,
                    "entity was not written out and is no longer known to the catalog"
                );
                if let Err(e) = tokio::fs::remove_file(entry.path()).await {
                    tracing::error!(id, error = %e, "failed to remove stale marker");
                }
            }
            Err(CatalogError::Backend(e)) => return Err(GatewayError::Internal(e)),
        }
    }

    if requeued > 0 {
        tracing::info!(requeued, "recovered unfinished writes from markers");
    }
    Ok(())
}
