//! In-memory implementations of both storage seams.
//!
//! Backed by [`DashMap`] for concurrent access without external locking.
//! Used by the test suites and by single-process demo deployments; the
//! archive variant can also simulate a broken archive connection, which
//! the restore-failure tests rely on.

use std::collections::HashSet;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use coldgate_core::{DatafileInfo, DatasetInfo};
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::archive::ArchiveStorage;
use super::main::{ByteReader, MainStorage};

async fn read_all(data: &mut (dyn AsyncRead + Send + Unpin)) -> anyhow::Result<Bytes> {
    let mut buf = Vec::new();
    data.read_to_end(&mut buf).await?;
    Ok(Bytes::from(buf))
}

// ---------------------------------------------------------------------------
// Main storage
// ---------------------------------------------------------------------------

/// Main storage holding file contents in memory, keyed by location.
#[derive(Default)]
pub struct MemoryMainStorage {
    files: DashMap<String, Bytes>,
}

impl MemoryMainStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of files currently stored.
    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[async_trait]
impl MainStorage for MemoryMainStorage {
    async fn exists(&self, location: &str) -> anyhow::Result<bool> {
        Ok(self.files.contains_key(location))
    }

    async fn exists_dataset(&self, dataset: &DatasetInfo) -> anyhow::Result<bool> {
        let prefix = format!("{}/", dataset.location);
        Ok(self.files.iter().any(|e| e.key().starts_with(&prefix)))
    }

    async fn get(
        &self,
        location: &str,
        _create_id: &str,
        _mod_id: &str,
    ) -> anyhow::Result<ByteReader> {
        let data = self
            .files
            .get(location)
            .map(|e| e.value().clone())
            .ok_or_else(|| anyhow::anyhow!("no such file: {location}"))?;
        Ok(Box::new(Cursor::new(data)))
    }

    async fn put(
        &self,
        data: &mut (dyn AsyncRead + Send + Unpin),
        location: &str,
    ) -> anyhow::Result<u64> {
        let bytes = read_all(data).await?;
        let len = bytes.len() as u64;
        self.files.insert(location.to_string(), bytes);
        Ok(len)
    }

    async fn delete(&self, location: &str, _create_id: &str, _mod_id: &str) -> anyhow::Result<()> {
        self.files.remove(location);
        Ok(())
    }

    async fn delete_dataset(&self, dataset: &DatasetInfo) -> anyhow::Result<()> {
        let prefix = format!("{}/", dataset.location);
        self.files.retain(|k, _| !k.starts_with(&prefix));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Archive storage
// ---------------------------------------------------------------------------

/// Archive storage holding file contents in memory, keyed by location.
///
/// `fail_connection` makes the next restore call raise a connection-level
/// fault, the way an unreachable tape frontend would.
#[derive(Default)]
pub struct MemoryArchiveStorage {
    files: DashMap<String, Bytes>,
    remaining: AtomicUsize,
    fail_connection: AtomicBool,
}

impl MemoryArchiveStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent restore calls fail with a connection-level fault.
    pub fn set_connection_failure(&self, fail: bool) {
        self.fail_connection.store(fail, Ordering::Relaxed);
    }

    /// Seed an archived file directly, bypassing the write path.
    pub fn insert(&self, location: &str, data: impl Into<Bytes>) {
        self.files.insert(location.to_string(), data.into());
    }

    /// True if the archive holds a file at the location.
    #[must_use]
    pub fn contains(&self, location: &str) -> bool {
        self.files.contains_key(location)
    }
}

#[async_trait]
impl ArchiveStorage for MemoryArchiveStorage {
    async fn write_dataset(
        &self,
        main: &dyn MainStorage,
        dataset: &DatasetInfo,
        files: &[DatafileInfo],
    ) -> anyhow::Result<()> {
        self.delete_dataset(dataset).await?;
        for file in files {
            self.write_datafile(main, file).await?;
        }
        Ok(())
    }

    async fn write_datafile(
        &self,
        main: &dyn MainStorage,
        file: &DatafileInfo,
    ) -> anyhow::Result<()> {
        let mut reader = main
            .get(&file.location, &file.create_id, &file.mod_id)
            .await?;
        let bytes = read_all(reader.as_mut()).await?;
        self.files.insert(file.location.clone(), bytes);
        Ok(())
    }

    async fn delete_dataset(&self, dataset: &DatasetInfo) -> anyhow::Result<()> {
        let prefix = format!("{}/", dataset.location);
        self.files.retain(|k, _| !k.starts_with(&prefix));
        Ok(())
    }

    async fn delete_datafile(&self, file: &DatafileInfo) -> anyhow::Result<()> {
        self.files.remove(&file.location);
        Ok(())
    }

    async fn restore(
        &self,
        main: &dyn MainStorage,
        files: &[DatafileInfo],
        stop: &AtomicBool,
    ) -> anyhow::Result<HashSet<i64>> {
        if self.fail_connection.load(Ordering::Relaxed) {
            anyhow::bail!("archive unreachable");
        }
        self.remaining.store(files.len(), Ordering::Relaxed);
        let mut failed = HashSet::new();
        for file in files {
            match self.files.get(&file.location).map(|e| e.value().clone()) {
                None => {
                    failed.insert(file.id);
                }
                Some(data) => {
                    let mut reader = Cursor::new(data);
                    if main.put(&mut reader, &file.location).await.is_err() {
                        failed.insert(file.id);
                    }
                }
            }
            self.remaining.fetch_sub(1, Ordering::Relaxed);
            if stop.load(Ordering::Relaxed) {
                return Ok(failed);
            }
        }
        Ok(failed)
    }

    fn num_files_remaining(&self) -> usize {
        self.remaining.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn datafile(id: i64, location: &str) -> DatafileInfo {
        DatafileInfo {
            id,
            name: format!("file-{id}"),
            location: location.to_string(),
            create_id: "c".to_string(),
            mod_id: "m".to_string(),
            dataset_id: 1,
        }
    }

    #[tokio::test]
    async fn partial_restore_reports_only_missing_ids() {
        let main = MemoryMainStorage::new();
        let archive = MemoryArchiveStorage::new();
        archive.insert("a/f1", "one");
        archive.insert("a/f3", "three");

        let files = vec![datafile(1, "a/f1"), datafile(2, "a/f2"), datafile(3, "a/f3")];
        let stop = AtomicBool::new(false);
        let failed = archive.restore(&main, &files, &stop).await.unwrap();

        assert_eq!(failed, HashSet::from([2]));
        assert!(main.exists("a/f1").await.unwrap());
        assert!(main.exists("a/f3").await.unwrap());
        assert!(!main.exists("a/f2").await.unwrap());
    }

    #[tokio::test]
    async fn connection_failure_aborts_batch() {
        let main = MemoryMainStorage::new();
        let archive = MemoryArchiveStorage::new();
        archive.insert("a/f1", "one");
        archive.set_connection_failure(true);

        let files = vec![datafile(1, "a/f1")];
        let stop = AtomicBool::new(false);
        assert!(archive.restore(&main, &files, &stop).await.is_err());
        assert!(!main.exists("a/f1").await.unwrap());
    }
}
