//! Fast/main storage seam.

use async_trait::async_trait;
use coldgate_core::DatasetInfo;
use tokio::io::AsyncRead;

/// Boxed byte stream returned by [`MainStorage::get`].
pub type ByteReader = Box<dyn AsyncRead + Send + Unpin>;

/// Disk-resident storage serving live reads.
///
/// Locations are storage-relative path strings as recorded in the catalog.
/// `create_id`/`mod_id` are opaque provenance strings implementations may
/// use for access checks or auditing; the local filesystem implementation
/// ignores them.
#[async_trait]
pub trait MainStorage: Send + Sync {
    /// Check whether a datafile exists at the given location.
    async fn exists(&self, location: &str) -> anyhow::Result<bool>;

    /// Check whether any content exists for the dataset.
    async fn exists_dataset(&self, dataset: &DatasetInfo) -> anyhow::Result<bool>;

    /// Open a datafile for reading.
    async fn get(
        &self,
        location: &str,
        create_id: &str,
        mod_id: &str,
    ) -> anyhow::Result<ByteReader>;

    /// Store a datafile, creating parent directories as needed.
    ///
    /// Returns the number of bytes written.
    async fn put(
        &self,
        data: &mut (dyn AsyncRead + Send + Unpin),
        location: &str,
    ) -> anyhow::Result<u64>;

    /// Delete a single datafile.
    async fn delete(&self, location: &str, create_id: &str, mod_id: &str) -> anyhow::Result<()>;

    /// Delete everything the dataset holds in main storage.
    async fn delete_dataset(&self, dataset: &DatasetInfo) -> anyhow::Result<()>;
}
