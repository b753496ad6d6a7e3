//! Local-filesystem implementations of both storage seams.
//!
//! Layout: each datafile lives at `<root>/<location>`; a dataset's files
//! all share the dataset's location as their path prefix, so dataset-level
//! operations act on the `<root>/<dataset location>` directory.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use anyhow::Context;
use async_trait::async_trait;
use coldgate_core::{DatafileInfo, DatasetInfo};
use tokio::io::AsyncRead;

use super::archive::ArchiveStorage;
use super::main::{ByteReader, MainStorage};

fn resolve(root: &Path, location: &str) -> anyhow::Result<PathBuf> {
    // Locations come from the catalog; refuse anything that could climb
    // out of the storage root.
    if location.is_empty()
        || Path::new(location).is_absolute()
        || Path::new(location)
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        anyhow::bail!("invalid storage location: {location}");
    }
    Ok(root.join(location))
}

async fn copy_into(
    data: &mut (dyn AsyncRead + Send + Unpin),
    path: &Path,
) -> anyhow::Result<u64> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let mut file = tokio::fs::File::create(path)
        .await
        .with_context(|| format!("creating {}", path.display()))?;
    let written = tokio::io::copy(data, &mut file).await?;
    Ok(written)
}

// ---------------------------------------------------------------------------
// Main storage
// ---------------------------------------------------------------------------

/// Main storage rooted at a local directory.
pub struct FsMainStorage {
    root: PathBuf,
}

impl FsMainStorage {
    /// Create the storage, making sure the root directory exists.
    pub fn new(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("creating main storage root {}", root.display()))?;
        Ok(Self { root })
    }
}

#[async_trait]
impl MainStorage for FsMainStorage {
    async fn exists(&self, location: &str) -> anyhow::Result<bool> {
        Ok(tokio::fs::try_exists(resolve(&self.root, location)?).await?)
    }

    async fn exists_dataset(&self, dataset: &DatasetInfo) -> anyhow::Result<bool> {
        Ok(tokio::fs::try_exists(resolve(&self.root, &dataset.location)?).await?)
    }

    async fn get(
        &self,
        location: &str,
        _create_id: &str,
        _mod_id: &str,
    ) -> anyhow::Result<ByteReader> {
        let path = resolve(&self.root, location)?;
        let file = tokio::fs::File::open(&path)
            .await
            .with_context(|| format!("opening {}", path.display()))?;
        Ok(Box::new(file))
    }

    async fn put(
        &self,
        data: &mut (dyn AsyncRead + Send + Unpin),
        location: &str,
    ) -> anyhow::Result<u64> {
        copy_into(data, &resolve(&self.root, location)?).await
    }

    async fn delete(&self, location: &str, _create_id: &str, _mod_id: &str) -> anyhow::Result<()> {
        let path = resolve(&self.root, location)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("deleting {}", path.display())),
        }
    }

    async fn delete_dataset(&self, dataset: &DatasetInfo) -> anyhow::Result<()> {
        let path = resolve(&self.root, &dataset.location)?;
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("deleting {}", path.display())),
        }
    }
}

// ---------------------------------------------------------------------------
// Archive storage
// ---------------------------------------------------------------------------

/// Archive storage rooted at a local directory.
///
/// Stands in for a tape system in small deployments and integration
/// environments; files are stored one-to-one under the archive root.
pub struct FsArchiveStorage {
    root: PathBuf,
    remaining: AtomicUsize,
}

impl FsArchiveStorage {
    /// Create the storage, making sure the root directory exists.
    pub fn new(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("creating archive storage root {}", root.display()))?;
        Ok(Self {
            root,
            remaining: AtomicUsize::new(0),
        })
    }

    async fn copy_from_main(
        &self,
        main: &dyn MainStorage,
        file: &DatafileInfo,
    ) -> anyhow::Result<()> {
        let mut reader = main
            .get(&file.location, &file.create_id, &file.mod_id)
            .await?;
        copy_into(reader.as_mut(), &resolve(&self.root, &file.location)?).await?;
        Ok(())
    }
}

#[async_trait]
impl ArchiveStorage for FsArchiveStorage {
    async fn write_dataset(
        &self,
        main: &dyn MainStorage,
        dataset: &DatasetInfo,
        files: &[DatafileInfo],
    ) -> anyhow::Result<()> {
        // Replace the previous archived representation wholesale so files
        // deleted from main storage do not linger in the archive.
        self.delete_dataset(dataset).await?;
        for file in files {
            self.copy_from_main(main, file)
                .await
                .with_context(|| format!("archiving {}", file.location))?;
        }
        Ok(())
    }

    async fn write_datafile(
        &self,
        main: &dyn MainStorage,
        file: &DatafileInfo,
    ) -> anyhow::Result<()> {
        self.copy_from_main(main, file).await
    }

    async fn delete_dataset(&self, dataset: &DatasetInfo) -> anyhow::Result<()> {
        let path = resolve(&self.root, &dataset.location)?;
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("deleting {}", path.display())),
        }
    }

    async fn delete_datafile(&self, file: &DatafileInfo) -> anyhow::Result<()> {
        let path = resolve(&self.root, &file.location)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("deleting {}", path.display())),
        }
    }

    async fn restore(
        &self,
        main: &dyn MainStorage,
        files: &[DatafileInfo],
        stop: &AtomicBool,
    ) -> anyhow::Result<HashSet<i64>> {
        self.remaining.store(files.len(), Ordering::Relaxed);
        let mut failed = HashSet::new();
        for file in files {
            let path = resolve(&self.root, &file.location)?;
            if !tokio::fs::try_exists(&path).await? {
                tracing::warn!(location = %file.location, "file missing from archive");
                failed.insert(file.id);
            } else {
                let mut reader: ByteReader = Box::new(tokio::fs::File::open(&path).await?);
                if let Err(e) = main.put(reader.as_mut(), &file.location).await {
                    tracing::error!(location = %file.location, error = %e, "restore failed");
                    failed.insert(file.id);
                }
            }
            self.remaining.fetch_sub(1, Ordering::Relaxed);
            if stop.load(Ordering::Relaxed) {
                tracing::info!(
                    remaining = self.num_files_remaining(),
                    "stopping restore on request"
                );
                return Ok(failed);
            }
        }
        Ok(failed)
    }

    fn num_files_remaining(&self) -> usize {
        self.remaining.load(Ordering::Relaxed)
    }
}
