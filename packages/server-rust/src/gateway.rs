//! The gateway facade: one object tying catalog, storage, locks, the
//! deferred-operation state machine, and prepared selections together.
//!
//! Constructed once at startup and shared by the request handlers and the
//! timer. A deployment without archive storage runs single-level: data is
//! always online, storage-transition endpoints report not-implemented,
//! and no timer runs.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use coldgate_core::{
    DataInfo, DatafileInfo, DeferredOp, LockKind, ServiceStatus, StorageUnit,
};
use serde::Serialize;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::catalog::Catalog;
use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::fsm::StateMachine;
use crate::locking::{Lock, LockError, LockManager};
use crate::recovery;
use crate::selection::{DataSelection, PreparedStore, SelectionContext};
use crate::storage::{ArchiveStorage, ByteReader, MainStorage};

/// Availability of a selection as reported by the status endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DataStatus {
    Online,
    Restoring,
    Archived,
}

/// A reader that keeps the entity's shared lock alive until the client
/// has consumed the stream.
struct LockedReader {
    inner: ByteReader,
    _lock: Lock,
}

impl AsyncRead for LockedReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

pub struct Gateway {
    config: GatewayConfig,
    catalog: Arc<dyn Catalog>,
    main: Arc<dyn MainStorage>,
    locks: LockManager,
    fsm: Option<Arc<StateMachine>>,
    prepared: PreparedStore,
}

impl Gateway {
    /// Assemble the gateway. `archive` being `None` selects single-level
    /// operation.
    ///
    /// # Errors
    ///
    /// Fails if the cache directories cannot be created.
    pub fn new(
        config: GatewayConfig,
        catalog: Arc<dyn Catalog>,
        main: Arc<dyn MainStorage>,
        archive: Option<Arc<dyn ArchiveStorage>>,
    ) -> Result<Self> {
        let locks = LockManager::new();
        let fsm = archive
            .map(|archive| {
                StateMachine::new(
                    &config,
                    main.clone(),
                    archive,
                    catalog.clone(),
                    locks.clone(),
                )
            })
            .transpose()?;
        let prepared = PreparedStore::new(config.prepared_dir())?;
        Ok(Self {
            config,
            catalog,
            main,
            locks,
            fsm,
            prepared,
        })
    }

    #[must_use]
    pub fn is_two_level(&self) -> bool {
        self.fsm.is_some()
    }

    #[must_use]
    pub fn storage_unit(&self) -> StorageUnit {
        self.config.storage_unit
    }

    #[must_use]
    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    fn fsm(&self) -> Result<&Arc<StateMachine>> {
        self.fsm.as_ref().ok_or_else(|| {
            GatewayError::NotImplemented("two-level storage is not configured".to_string())
        })
    }

    /// Re-queue unfinished writes and start the queue drain. No-op for
    /// single-level deployments.
    ///
    /// # Errors
    ///
    /// Propagates recovery faults.
    pub async fn start(&self, shutdown: watch::Receiver<bool>) -> Result<Option<JoinHandle<()>>> {
        let Some(fsm) = &self.fsm else {
            tracing::info!("single-level storage, no queue drain");
            return Ok(None);
        };
        recovery::restart_unfinished_work(fsm, self.catalog.as_ref(), &self.config.marker_dir())
            .await?;
        Ok(Some(StateMachine::start(fsm.clone(), shutdown)))
    }

    /// Raise the stop flag for running restores (shutdown path).
    pub fn stop_restores(&self) {
        if let Some(fsm) = &self.fsm {
            fsm.stop_restores();
        }
    }

    /// Resolve id lists into a selection at the configured granularity.
    ///
    /// # Errors
    ///
    /// `NotFound`/`BadRequest` per the id lists.
    pub async fn resolve(
        &self,
        inv_ids: Vec<i64>,
        ds_ids: Vec<i64>,
        df_ids: Vec<i64>,
    ) -> Result<DataSelection> {
        if inv_ids.is_empty() && ds_ids.is_empty() && df_ids.is_empty() {
            return Err(GatewayError::BadRequest(
                "at least one of investigationIds, datasetIds or datafileIds must be given"
                    .to_string(),
            ));
        }
        DataSelection::resolve(
            self.catalog.as_ref(),
            self.config.storage_unit,
            inv_ids,
            ds_ids,
            df_ids,
        )
        .await
    }

    /// Load a prepared selection by id.
    ///
    /// # Errors
    ///
    /// `BadRequest`/`NotFound` per the prepared id.
    pub async fn resolve_prepared(&self, prepared_id: &str) -> Result<DataSelection> {
        let prepared = self.prepared.load(prepared_id).await?;
        Ok(DataSelection::from_prepared(
            prepared,
            self.config.storage_unit,
        ))
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    /// Availability of the selection. Does not trigger restores.
    ///
    /// # Errors
    ///
    /// Storage faults propagate.
    pub async fn get_status(&self, selection: &DataSelection) -> Result<DataStatus> {
        let Some(fsm) = &self.fsm else {
            return Ok(DataStatus::Online);
        };
        let restoring = fsm.restoring();
        let maybe_offline = fsm.maybe_offline();

        let mut status = DataStatus::Online;
        for info in selection.primary().values() {
            if restoring.contains(info) {
                if status == DataStatus::Online {
                    status = DataStatus::Restoring;
                }
            } else if maybe_offline.contains(info)
                || !selection.exists_in_main(self.main.as_ref(), info).await?
            {
                status = DataStatus::Archived;
            }
        }
        Ok(status)
    }

    /// Stream a single datafile, restoring it first if needed.
    ///
    /// Packaged (zip) downloads of multi-entity selections are handled by
    /// a fronting packager, not by the gateway core.
    ///
    /// # Errors
    ///
    /// `DataNotOnline` while the restore is in progress, `NotImplemented`
    /// for selections that need packaging.
    pub async fn get_data(&self, selection: &DataSelection) -> Result<(DatafileInfo, ByteReader)> {
        if selection.datafiles().len() != 1 {
            return Err(GatewayError::NotImplemented(
                "packaged downloads are served by the result packager".to_string(),
            ));
        }
        let df = selection
            .datafiles()
            .values()
            .next()
            .cloned()
            .ok_or_else(|| GatewayError::BadRequest("selection holds no datafile".to_string()))?;

        if let Some(fsm) = &self.fsm {
            fsm.check_failure(df.id)?;
            selection.check_online(fsm, self.main.as_ref()).await?;
        }

        // Hold a shared lock on the owning dataset for the lifetime of the
        // stream so an archive cannot pull the data mid-download.
        let lock = self
            .locks
            .lock(df.dataset_id, LockKind::Shared)
            .map_err(|LockError::AlreadyLocked(id)| {
                GatewayError::DataNotOnline(format!(
                    "dataset {id} is being archived or restored, try again later"
                ))
            })?;
        let reader = self.main.get(&df.location, &df.create_id, &df.mod_id).await?;
        let reader: ByteReader = Box::new(LockedReader {
            inner: reader,
            _lock: lock,
        });
        Ok((df, reader))
    }

    /// Store an uploaded datafile, register it, and queue the write-behind.
    ///
    /// # Errors
    ///
    /// `DataNotOnline` while the owning dataset is offline.
    pub async fn put_datafile(
        &self,
        dataset_id: i64,
        name: &str,
        data: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<(i64, u64)> {
        let ds = self.catalog.dataset(dataset_id).await?;

        if let Some(fsm) = &self.fsm {
            // At dataset granularity the dataset must be online before a
            // file can be added to it.
            if self.config.storage_unit == StorageUnit::Dataset {
                let selection = DataSelection::resolve(
                    self.catalog.as_ref(),
                    self.config.storage_unit,
                    vec![],
                    vec![dataset_id],
                    vec![],
                )
                .await?;
                selection.check_online(fsm, self.main.as_ref()).await?;
            }
        }

        let location = format!("{}/{}", ds.location, name);
        let size = self.main.put(data, &location).await?;
        let df_id = self
            .catalog
            .register_datafile(dataset_id, name, &location)
            .await?;

        if let Some(fsm) = &self.fsm {
            match self.config.storage_unit {
                StorageUnit::Dataset => fsm.queue(&DataInfo::Dataset(ds), DeferredOp::Write)?,
                StorageUnit::Datafile => {
                    let df = self.catalog.datafile(df_id).await?;
                    fsm.queue(&DataInfo::Datafile(df), DeferredOp::Write)?;
                }
            }
        }
        tracing::info!(dataset_id, df_id, size, "stored datafile");
        Ok((df_id, size))
    }

    /// Queue an ARCHIVE for everything in the selection.
    ///
    /// # Errors
    ///
    /// `NotImplemented` for single-level deployments.
    pub fn archive(&self, selection: &DataSelection) -> Result<()> {
        selection.schedule(self.fsm()?, DeferredOp::Archive)
    }

    /// Queue a RESTORE for everything in the selection.
    ///
    /// # Errors
    ///
    /// `NotImplemented` for single-level deployments.
    pub fn restore(&self, selection: &DataSelection) -> Result<()> {
        selection.schedule(self.fsm()?, DeferredOp::Restore)
    }

    /// Queue a WRITE for everything in the selection.
    ///
    /// # Errors
    ///
    /// `NotImplemented` for single-level deployments.
    pub fn write(&self, selection: &DataSelection) -> Result<()> {
        selection.schedule(self.fsm()?, DeferredOp::Write)
    }

    /// Delete the selection's data.
    ///
    /// # Errors
    ///
    /// Storage/catalog faults propagate.
    pub async fn delete(&self, selection: &DataSelection) -> Result<()> {
        match &self.fsm {
            Some(fsm) => {
                selection
                    .delete(fsm, self.main.as_ref(), self.catalog.as_ref())
                    .await
            }
            None => {
                selection
                    .delete_physical(self.main.as_ref(), self.catalog.as_ref())
                    .await
            }
        }
    }

    /// Persist the selection for later polling/download and start
    /// recalling whatever is offline. Returns the prepared id.
    ///
    /// # Errors
    ///
    /// Persistence faults become internal errors.
    pub async fn prepare(
        &self,
        selection: &DataSelection,
        zip: bool,
        compress: bool,
    ) -> Result<String> {
        let id = self.prepared.save(&selection.to_prepared(zip, compress)).await?;
        if let Some(fsm) = &self.fsm {
            selection.trigger_restores(fsm, self.main.as_ref()).await?;
        }
        Ok(id)
    }

    /// Incremental readiness poll for a prepared selection.
    ///
    /// # Errors
    ///
    /// Recorded failures propagate; `NotFound` for unknown ids.
    pub async fn is_prepared(&self, prepared_id: &str) -> Result<bool> {
        let selection = Arc::new(self.resolve_prepared(prepared_id).await?);
        let Some(fsm) = &self.fsm else {
            return Ok(true);
        };
        let ctx = SelectionContext {
            fsm: fsm.clone(),
            main: self.main.clone(),
        };
        self.prepared.is_prepared(prepared_id, &selection, &ctx).await
    }

    /// Clear recorded failures for the selection and re-trigger restores.
    ///
    /// # Errors
    ///
    /// Storage faults propagate.
    pub async fn reset(&self, selection: &DataSelection) -> Result<()> {
        if let Some(fsm) = &self.fsm {
            selection.reset(fsm, self.main.as_ref()).await?;
        }
        Ok(())
    }

    /// Structured report of queue contents, lock table, and failures.
    #[must_use]
    pub fn service_status(&self) -> ServiceStatus {
        match &self.fsm {
            Some(fsm) => fsm.service_status(),
            None => {
                let locks = self.locks.lock_info();
                ServiceStatus {
                    lock_count: locks.len(),
                    locks,
                    ops_queue: Vec::new(),
                    failures: Vec::new(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use coldgate_core::RequestedState as S;
    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::catalog::MemoryCatalog;
    use crate::fsm::test_support::{dataset, datafile};
    use crate::storage::{MemoryArchiveStorage, MemoryMainStorage};

    struct GwHarness {
        gateway: Gateway,
        main: Arc<MemoryMainStorage>,
        archive: Arc<MemoryArchiveStorage>,
        catalog: Arc<MemoryCatalog>,
        _cache: tempfile::TempDir,
    }

    fn gw_harness(unit: StorageUnit, two_level: bool) -> GwHarness {
        let cache = tempfile::tempdir().unwrap();
        let config = GatewayConfig {
            storage_unit: unit,
            cache_dir: cache.path().to_path_buf(),
            write_delay: Duration::from_millis(0),
            process_queue_interval: Duration::from_millis(10),
        };
        let main = Arc::new(MemoryMainStorage::new());
        let archive = Arc::new(MemoryArchiveStorage::new());
        let catalog = Arc::new(MemoryCatalog::new());
        let gateway = Gateway::new(
            config,
            catalog.clone(),
            main.clone(),
            two_level.then(|| archive.clone() as Arc<dyn ArchiveStorage>),
        )
        .unwrap();
        GwHarness {
            gateway,
            main,
            archive,
            catalog,
            _cache: cache,
        }
    }

    async fn drive(h: &GwHarness) {
        // One timer pass plus worker settling.
        StateMachine::process_queue(h.gateway.fsm.as_ref().unwrap());
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn end_to_end_restore_then_read() {
        let h = gw_harness(StorageUnit::Datafile, true);
        h.catalog.add_dataset(dataset(1));
        let df = datafile(7, 1);
        h.catalog.add_datafile(df.clone());
        h.archive.insert(&df.location, "archived bytes");

        let selection = h.gateway.resolve(vec![], vec![], vec![7]).await.unwrap();

        // First read: not online, restore queued automatically.
        let err = h.gateway.get_data(&selection).await.err().unwrap();
        assert!(matches!(err, GatewayError::DataNotOnline(_)));

        drive(&h).await;

        // Second read: data restored, failure tracker clear, bytes served.
        let (info, mut reader) = h.gateway.get_data(&selection).await.unwrap();
        assert_eq!(info.id, 7);
        let mut out = String::new();
        reader.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "archived bytes");
        assert!(h.gateway.fsm.as_ref().unwrap().check_failure(7).is_ok());

        // The stream held a shared lock; consumed and dropped, it is gone.
        drop(reader);
        assert!(!h.gateway.locks().is_locked(1));
    }

    #[tokio::test(start_paused = true)]
    async fn put_then_archive_round_trip() {
        let h = gw_harness(StorageUnit::Dataset, true);
        h.catalog.add_dataset(dataset(1));

        let mut body: &[u8] = b"fresh upload";
        let (df_id, size) = h
            .gateway
            .put_datafile(1, "upload.dat", &mut body)
            .await
            .unwrap();
        assert_eq!(size, 12);
        assert!(h.main.exists("inv/ds-1/upload.dat").await.unwrap());

        // The upload queued a WRITE for the dataset.
        assert_eq!(
            h.gateway
                .fsm
                .as_ref()
                .unwrap()
                .requested_state(&dataset(1).into()),
            Some(S::WriteRequested)
        );

        tokio::time::advance(Duration::from_millis(1)).await;
        drive(&h).await;
        assert!(h.archive.contains("inv/ds-1/upload.dat"));

        // Archive the dataset: main copy goes, archive copy stays.
        let selection = h.gateway.resolve(vec![], vec![1], vec![]).await.unwrap();
        h.gateway.archive(&selection).unwrap();
        drive(&h).await;
        assert!(!h.main.exists("inv/ds-1/upload.dat").await.unwrap());
        assert!(h.archive.contains("inv/ds-1/upload.dat"));

        let status = h.gateway.get_status(&selection).await.unwrap();
        assert_eq!(status, DataStatus::Archived);
        let _ = df_id;
    }

    #[tokio::test]
    async fn single_level_reports_online_and_not_implemented() {
        let h = gw_harness(StorageUnit::Datafile, false);
        h.catalog.add_dataset(dataset(1));
        let df = datafile(7, 1);
        h.catalog.add_datafile(df.clone());
        let mut content: &[u8] = b"x";
        h.main.put(&mut content, &df.location).await.unwrap();

        assert!(!h.gateway.is_two_level());
        let selection = h.gateway.resolve(vec![], vec![], vec![7]).await.unwrap();
        assert_eq!(
            h.gateway.get_status(&selection).await.unwrap(),
            DataStatus::Online
        );
        assert!(matches!(
            h.gateway.archive(&selection),
            Err(GatewayError::NotImplemented(_))
        ));

        let (_, mut reader) = h.gateway.get_data(&selection).await.unwrap();
        let mut out = String::new();
        reader.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "x");
    }

    #[tokio::test(start_paused = true)]
    async fn prepare_and_poll_full_cycle() {
        let h = gw_harness(StorageUnit::Datafile, true);
        h.catalog.add_dataset(dataset(1));
        for id in 1..=3 {
            let df = datafile(id, 1);
            h.catalog.add_datafile(df.clone());
            h.archive.insert(&df.location, "cold");
        }

        let selection = h.gateway.resolve(vec![], vec![1], vec![]).await.unwrap();
        let prepared_id = h.gateway.prepare(&selection, true, false).await.unwrap();

        // prepare() already queued the restores.
        assert!(!h.gateway.is_prepared(&prepared_id).await.unwrap());
        drive(&h).await;
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
        assert!(h.gateway.is_prepared(&prepared_id).await.unwrap());

        let err = h.gateway.is_prepared("not-a-uuid").await.unwrap_err();
        assert!(matches!(err, GatewayError::BadRequest(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn get_status_restoring_vs_archived() {
        let h = gw_harness(StorageUnit::Datafile, true);
        h.catalog.add_dataset(dataset(1));
        let df = datafile(7, 1);
        h.catalog.add_datafile(df.clone());
        h.archive.insert(&df.location, "cold");

        let selection = h.gateway.resolve(vec![], vec![], vec![7]).await.unwrap();
        assert_eq!(
            h.gateway.get_status(&selection).await.unwrap(),
            DataStatus::Archived
        );

        h.gateway.restore(&selection).unwrap();
        assert_eq!(
            h.gateway.get_status(&selection).await.unwrap(),
            DataStatus::Restoring
        );

        drive(&h).await;
        assert_eq!(
            h.gateway.get_status(&selection).await.unwrap(),
            DataStatus::Online
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reset_clears_failures() {
        let h = gw_harness(StorageUnit::Datafile, true);
        h.catalog.add_dataset(dataset(1));
        let df = datafile(7, 1);
        h.catalog.add_datafile(df.clone());
        // Not in the archive: the restore will fail.

        let selection = h.gateway.resolve(vec![], vec![], vec![7]).await.unwrap();
        let err = h.gateway.get_data(&selection).await.err().unwrap();
        assert!(matches!(err, GatewayError::DataNotOnline(_)));
        drive(&h).await;

        // The failed restore is now an explicit failure, not a retry loop.
        let err = h.gateway.get_data(&selection).await.err().unwrap();
        assert!(matches!(err, GatewayError::Internal(_)));

        // Reset clears it (and re-queues the restore).
        h.archive.insert(&df.location, "found it");
        h.gateway.reset(&selection).await.unwrap();
        drive(&h).await;
        let (_, mut reader) = h.gateway.get_data(&selection).await.unwrap();
        let mut out = String::new();
        reader.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "found it");
    }
}
