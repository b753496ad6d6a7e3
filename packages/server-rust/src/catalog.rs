//! Metadata catalog seam.
//!
//! The gateway never owns metadata; datasets and datafiles are resolved
//! through this trait. [`MemoryCatalog`] backs tests and single-process
//! deployments; catalog-server clients plug in behind the same trait.

use async_trait::async_trait;
use coldgate_core::{DatafileInfo, DatasetInfo};
use dashmap::DashMap;

/// Catalog lookup failures.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("{0} not found in catalog")]
    NotFound(String),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl From<CatalogError> for crate::error::GatewayError {
    fn from(e: CatalogError) -> Self {
        match e {
            CatalogError::NotFound(what) => crate::error::GatewayError::NotFound(what),
            CatalogError::Backend(e) => crate::error::GatewayError::Internal(e),
        }
    }
}

/// Read access to dataset/datafile metadata, plus registration for
/// uploads. Lookups return descriptors with identity and location filled
/// in; the gateway keys all coordination state on those.
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn dataset(&self, id: i64) -> Result<DatasetInfo, CatalogError>;

    async fn datafile(&self, id: i64) -> Result<DatafileInfo, CatalogError>;

    /// All datafiles belonging to a dataset.
    async fn datafiles_of(&self, dataset_id: i64) -> Result<Vec<DatafileInfo>, CatalogError>;

    /// All datasets belonging to an investigation.
    async fn datasets_of(&self, investigation_id: i64) -> Result<Vec<DatasetInfo>, CatalogError>;

    /// Record a newly uploaded datafile, returning its assigned id.
    async fn register_datafile(
        &self,
        dataset_id: i64,
        name: &str,
        location: &str,
    ) -> Result<i64, CatalogError>;

    /// Drop a datafile from the catalog.
    async fn deregister_datafile(&self, id: i64) -> Result<(), CatalogError>;
}

/// In-memory catalog.
#[derive(Default)]
pub struct MemoryCatalog {
    datasets: DashMap<i64, DatasetInfo>,
    datafiles: DashMap<i64, DatafileInfo>,
    next_id: std::sync::atomic::AtomicI64,
}

impl MemoryCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self {
            datasets: DashMap::new(),
            datafiles: DashMap::new(),
            next_id: std::sync::atomic::AtomicI64::new(1_000_000),
        }
    }

    pub fn add_dataset(&self, dataset: DatasetInfo) {
        self.datasets.insert(dataset.id, dataset);
    }

    pub fn add_datafile(&self, datafile: DatafileInfo) {
        self.datafiles.insert(datafile.id, datafile);
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn dataset(&self, id: i64) -> Result<DatasetInfo, CatalogError> {
        self.datasets
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or_else(|| CatalogError::NotFound(format!("dataset {id}")))
    }

    async fn datafile(&self, id: i64) -> Result<DatafileInfo, CatalogError> {
        self.datafiles
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or_else(|| CatalogError::NotFound(format!("datafile {id}")))
    }

    async fn datafiles_of(&self, dataset_id: i64) -> Result<Vec<DatafileInfo>, CatalogError> {
        let mut files: Vec<DatafileInfo> = self
            .datafiles
            .iter()
            .filter(|e| e.value().dataset_id == dataset_id)
            .map(|e| e.value().clone())
            .collect();
        files.sort_by_key(|f| f.id);
        Ok(files)
    }

    async fn datasets_of(&self, investigation_id: i64) -> Result<Vec<DatasetInfo>, CatalogError> {
        let mut datasets: Vec<DatasetInfo> = self
            .datasets
            .iter()
            .filter(|e| e.value().investigation_id == investigation_id)
            .map(|e| e.value().clone())
            .collect();
        datasets.sort_by_key(|d| d.id);
        Ok(datasets)
    }

    async fn register_datafile(
        &self,
        dataset_id: i64,
        name: &str,
        location: &str,
    ) -> Result<i64, CatalogError> {
        // Registration requires the owning dataset to exist.
        self.dataset(dataset_id).await?;
        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.datafiles.insert(
            id,
            DatafileInfo {
                id,
                name: name.to_string(),
                location: location.to_string(),
                create_id: "gateway".to_string(),
                mod_id: "gateway".to_string(),
                dataset_id,
            },
        );
        Ok(id)
    }

    async fn deregister_datafile(&self, id: i64) -> Result<(), CatalogError> {
        self.datafiles.remove(&id);
        Ok(())
    }
}
