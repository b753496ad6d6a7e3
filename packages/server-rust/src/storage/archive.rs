//! Slow/archive storage seam.

use std::collections::HashSet;
use std::sync::atomic::AtomicBool;

use async_trait::async_trait;
use coldgate_core::{DatafileInfo, DatasetInfo};

use super::main::MainStorage;

/// Cold storage reached only through restore/write/archive transitions.
///
/// The restore interface is deliberately batch-shaped: implementations are
/// expected to recall as much as possible in one call, report per-item
/// failures without aborting siblings, and raise an error only for a
/// connection-level fault that dooms the remaining batch.
#[async_trait]
pub trait ArchiveStorage: Send + Sync {
    /// Copy every file of the dataset from main storage into the archive,
    /// replacing any previous archived representation.
    async fn write_dataset(
        &self,
        main: &dyn MainStorage,
        dataset: &DatasetInfo,
        files: &[DatafileInfo],
    ) -> anyhow::Result<()>;

    /// Copy a single datafile from main storage into the archive.
    async fn write_datafile(
        &self,
        main: &dyn MainStorage,
        file: &DatafileInfo,
    ) -> anyhow::Result<()>;

    /// Remove the archived representation of the dataset.
    async fn delete_dataset(&self, dataset: &DatasetInfo) -> anyhow::Result<()>;

    /// Remove a single archived datafile.
    async fn delete_datafile(&self, file: &DatafileInfo) -> anyhow::Result<()>;

    /// Copy the given files from the archive into main storage.
    ///
    /// Returns the ids of files that could not be restored (missing from
    /// the archive or failed individually). The stop flag is checked
    /// between items; when it is raised the remaining files are simply not
    /// restored and are NOT reported as failures.
    ///
    /// # Errors
    ///
    /// A connection-level fault aborts the batch; the caller treats every
    /// file not yet restored as failed.
    async fn restore(
        &self,
        main: &dyn MainStorage,
        files: &[DatafileInfo],
        stop: &AtomicBool,
    ) -> anyhow::Result<HashSet<i64>>;

    /// Number of files the current restore call has still to process.
    /// Used for progress reporting; 0 when no restore is running.
    fn num_files_remaining(&self) -> usize;
}
