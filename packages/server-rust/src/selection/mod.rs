//! Data selection: resolving client id lists into entity descriptors and
//! deciding online/offline status.
//!
//! A selection is resolved once per request (or loaded from a prepared
//! file) into sorted maps of descriptors. The *primary* entities are the
//! ones the deferred-operation queue works at, datasets or datafiles
//! depending on the configured granularity.

pub mod prepared;

pub use prepared::{Prepared, PreparedStore};

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use coldgate_core::{DataInfo, DatafileInfo, DatasetInfo, DeferredOp, StorageUnit};

use crate::catalog::Catalog;
use crate::error::{GatewayError, Result};
use crate::fsm::StateMachine;
use crate::storage::MainStorage;

/// Parse a comma-separated list of numeric ids. No spaces inside tokens,
/// `None` yields an empty list.
///
/// # Errors
///
/// Rejects malformed lists as a client error before any queue interaction.
pub fn parse_id_list(name: &str, list: Option<&str>) -> Result<Vec<i64>> {
    let Some(list) = list else {
        return Ok(Vec::new());
    };
    list.split(',')
        .map(|token| {
            token.trim().parse::<i64>().map_err(|_| {
                GatewayError::BadRequest(format!(
                    "the {name} parameter '{list}' is not a valid comma separated list of longs"
                ))
            })
        })
        .collect()
}

/// A resolved set of datasets and datafiles.
pub struct DataSelection {
    unit: StorageUnit,
    ds_infos: BTreeMap<i64, DatasetInfo>,
    df_infos: BTreeMap<i64, DatafileInfo>,
    /// Datasets that have no datafiles; they count as online.
    empty_datasets: HashSet<i64>,
    /// The entities at queue granularity, in id order.
    primary: BTreeMap<i64, DataInfo>,
    inv_ids: Vec<i64>,
    ds_ids: Vec<i64>,
    df_ids: Vec<i64>,
}

impl DataSelection {
    /// Resolve id lists through the catalog.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown ids; backend faults become internal errors.
    pub async fn resolve(
        catalog: &dyn Catalog,
        unit: StorageUnit,
        inv_ids: Vec<i64>,
        ds_ids: Vec<i64>,
        df_ids: Vec<i64>,
    ) -> Result<Self> {
        let mut ds_infos = BTreeMap::new();
        let mut df_infos = BTreeMap::new();

        for inv_id in &inv_ids {
            let datasets = catalog.datasets_of(*inv_id).await?;
            if datasets.is_empty() {
                return Err(GatewayError::NotFound(format!(
                    "investigation {inv_id} has no datasets or is not known"
                )));
            }
            for ds in datasets {
                for df in catalog.datafiles_of(ds.id).await? {
                    df_infos.insert(df.id, df);
                }
                ds_infos.insert(ds.id, ds);
            }
        }
        for ds_id in &ds_ids {
            let ds = catalog.dataset(*ds_id).await?;
            for df in catalog.datafiles_of(ds.id).await? {
                df_infos.insert(df.id, df);
            }
            ds_infos.insert(ds.id, ds);
        }
        for df_id in &df_ids {
            let df = catalog.datafile(*df_id).await?;
            let ds = catalog.dataset(df.dataset_id).await?;
            ds_infos.insert(ds.id, ds);
            df_infos.insert(df.id, df);
        }

        let empty_datasets: HashSet<i64> = ds_infos
            .keys()
            .filter(|ds_id| !df_infos.values().any(|df| df.dataset_id == **ds_id))
            .copied()
            .collect();

        Ok(Self::assemble(
            unit,
            ds_infos,
            df_infos,
            empty_datasets,
            inv_ids,
            ds_ids,
            df_ids,
        ))
    }

    /// Rebuild a selection from a prepared file.
    #[must_use]
    pub fn from_prepared(prepared: Prepared, unit: StorageUnit) -> Self {
        let ds_infos: BTreeMap<i64, DatasetInfo> =
            prepared.ds_infos.into_iter().map(|ds| (ds.id, ds)).collect();
        let df_infos: BTreeMap<i64, DatafileInfo> =
            prepared.df_infos.into_iter().map(|df| (df.id, df)).collect();
        let empty_datasets: HashSet<i64> = prepared.empty_datasets.into_iter().collect();
        Self::assemble(
            unit,
            ds_infos,
            df_infos,
            empty_datasets,
            Vec::new(),
            Vec::new(),
            Vec::new(),
        )
    }

    fn assemble(
        unit: StorageUnit,
        ds_infos: BTreeMap<i64, DatasetInfo>,
        df_infos: BTreeMap<i64, DatafileInfo>,
        empty_datasets: HashSet<i64>,
        inv_ids: Vec<i64>,
        ds_ids: Vec<i64>,
        df_ids: Vec<i64>,
    ) -> Self {
        let primary: BTreeMap<i64, DataInfo> = match unit {
            StorageUnit::Dataset => ds_infos
                .iter()
                .map(|(id, ds)| (*id, DataInfo::Dataset(ds.clone())))
                .collect(),
            StorageUnit::Datafile => df_infos
                .iter()
                .map(|(id, df)| (*id, DataInfo::Datafile(df.clone())))
                .collect(),
        };
        Self {
            unit,
            ds_infos,
            df_infos,
            empty_datasets,
            primary,
            inv_ids,
            ds_ids,
            df_ids,
        }
    }

    #[must_use]
    pub fn unit(&self) -> StorageUnit {
        self.unit
    }

    #[must_use]
    pub fn datasets(&self) -> &BTreeMap<i64, DatasetInfo> {
        &self.ds_infos
    }

    #[must_use]
    pub fn datafiles(&self) -> &BTreeMap<i64, DatafileInfo> {
        &self.df_infos
    }

    /// Entities at queue granularity, in id order.
    #[must_use]
    pub fn primary(&self) -> &BTreeMap<i64, DataInfo> {
        &self.primary
    }

    #[must_use]
    pub fn empty_datasets(&self) -> &HashSet<i64> {
        &self.empty_datasets
    }

    /// Whether a download of this selection has to be packaged.
    #[must_use]
    pub fn must_zip(&self) -> bool {
        self.df_ids.len() > 1
            || !self.ds_ids.is_empty()
            || !self.inv_ids.is_empty()
            || (self.df_ids.is_empty() && self.ds_ids.is_empty() && self.inv_ids.is_empty())
    }

    #[must_use]
    pub fn is_single_datafile(&self) -> bool {
        self.df_ids.len() == 1 && self.ds_ids.is_empty() && self.inv_ids.is_empty()
    }

    /// Capture the selection for later polling/download.
    #[must_use]
    pub fn to_prepared(&self, zip: bool, compress: bool) -> Prepared {
        Prepared {
            ds_infos: self.ds_infos.values().cloned().collect(),
            df_infos: self.df_infos.values().cloned().collect(),
            empty_datasets: self.empty_datasets.iter().copied().collect(),
            zip,
            compress,
        }
    }

    // -----------------------------------------------------------------------
    // Online checks
    // -----------------------------------------------------------------------

    /// True if the entity exists in main storage. Empty datasets count as
    /// present (there is nothing to restore).
    pub(crate) async fn exists_in_main(
        &self,
        main: &dyn MainStorage,
        info: &DataInfo,
    ) -> Result<bool> {
        match info {
            DataInfo::Dataset(ds) => {
                if self.empty_datasets.contains(&ds.id) {
                    return Ok(true);
                }
                Ok(main.exists_dataset(ds).await?)
            }
            DataInfo::Datafile(df) => Ok(main.exists(&df.location).await?),
        }
    }

    /// Conservative offline check with restore-on-demand.
    ///
    /// Entities with any pending or in-flight transition other than a
    /// plain write are "maybe offline", a restore is already implied, so
    /// none is queued. Entities absent from main storage get a RESTORE
    /// queued. Returns true if the entity is not yet available.
    ///
    /// # Errors
    ///
    /// Storage faults and queueing faults propagate as internal errors.
    pub async fn restore_if_offline(
        &self,
        fsm: &StateMachine,
        main: &dyn MainStorage,
        info: &DataInfo,
    ) -> Result<bool> {
        if fsm.maybe_offline().contains(info) {
            return Ok(true);
        }
        if !self.exists_in_main(main, info).await? {
            fsm.queue(info, DeferredOp::Restore)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Fail with a data-not-online condition unless every primary entity
    /// is available; restoration is triggered for the ones that are not.
    ///
    /// # Errors
    ///
    /// `DataNotOnline` when anything is unavailable.
    pub async fn check_online(&self, fsm: &StateMachine, main: &dyn MainStorage) -> Result<()> {
        let mut all_online = true;
        for info in self.primary.values() {
            if self.restore_if_offline(fsm, main, info).await? {
                all_online = false;
            }
        }
        if all_online {
            Ok(())
        } else {
            Err(GatewayError::DataNotOnline(
                "before getting, putting, etc. a datafile or dataset, it must be restored; \
                 restoration requested automatically"
                    .to_string(),
            ))
        }
    }

    /// Queue the given transition for every primary entity.
    ///
    /// # Errors
    ///
    /// Propagates queueing faults.
    pub fn schedule(&self, fsm: &StateMachine, op: DeferredOp) -> Result<()> {
        for info in self.primary.values() {
            fsm.queue(info, op)?;
        }
        Ok(())
    }

    /// Clear recorded failures for the selection and re-trigger restores
    /// for anything offline.
    ///
    /// # Errors
    ///
    /// Propagates storage faults from the offline checks.
    pub async fn reset(&self, fsm: &StateMachine, main: &dyn MainStorage) -> Result<()> {
        for info in self.primary.values() {
            fsm.record_success(info.id());
        }
        for info in self.primary.values() {
            self.restore_if_offline(fsm, main, info).await?;
        }
        Ok(())
    }

    /// Trigger restores for anything in the selection that is offline,
    /// without failing; used when a selection is prepared so the data is
    /// being recalled by the time the client polls.
    ///
    /// # Errors
    ///
    /// Storage faults propagate as internal errors.
    pub async fn trigger_restores(&self, fsm: &StateMachine, main: &dyn MainStorage) -> Result<()> {
        for info in self.primary.values() {
            self.restore_if_offline(fsm, main, info).await?;
        }
        Ok(())
    }

    /// Remove the selection's datafiles from the catalog and from main
    /// storage. The catalog no longer references them, so the physical
    /// copy goes directly rather than through the queue.
    ///
    /// # Errors
    ///
    /// Storage and catalog faults propagate.
    pub async fn delete_physical(
        &self,
        main: &dyn MainStorage,
        catalog: &dyn Catalog,
    ) -> Result<()> {
        for df in self.df_infos.values() {
            catalog.deregister_datafile(df.id).await?;
            if main.exists(&df.location).await? {
                tracing::debug!(location = %df.location, "deleting physical file");
                main.delete(&df.location, &df.create_id, &df.mod_id).await?;
            }
        }
        Ok(())
    }

    /// Queue the deferred leg of a delete: datasets get their archive copy
    /// rewritten via a WRITE, datafiles get a DELETE transition.
    ///
    /// # Errors
    ///
    /// Propagates queueing faults.
    pub fn queue_delete(&self, fsm: &StateMachine) -> Result<()> {
        match self.unit {
            StorageUnit::Dataset => {
                for ds in self.ds_infos.values() {
                    fsm.queue(&DataInfo::Dataset(ds.clone()), DeferredOp::Write)?;
                }
            }
            StorageUnit::Datafile => {
                for df in self.df_infos.values() {
                    fsm.queue(&DataInfo::Datafile(df.clone()), DeferredOp::Delete)?;
                }
            }
        }
        Ok(())
    }

    /// Delete the selection: physical content first, then the deferred
    /// bookkeeping per granularity.
    ///
    /// # Errors
    ///
    /// Storage faults propagate; the per-granularity queueing faults too.
    pub async fn delete(
        &self,
        fsm: &StateMachine,
        main: &dyn MainStorage,
        catalog: &dyn Catalog,
    ) -> Result<()> {
        self.delete_physical(main, catalog).await?;
        self.queue_delete(fsm)
    }
}

/// Shared handles the prepared-poll background task needs.
#[derive(Clone)]
pub struct SelectionContext {
    pub fsm: Arc<StateMachine>,
    pub main: Arc<dyn MainStorage>,
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use coldgate_core::DeferredOp as Op;
    use coldgate_core::RequestedState as S;

    use super::*;
    use crate::fsm::test_support::{dataset, datafile, harness};

    #[test]
    fn id_list_parsing() {
        assert_eq!(parse_id_list("datasetIds", None).unwrap(), Vec::<i64>::new());
        assert_eq!(
            parse_id_list("datasetIds", Some("1,2, 3")).unwrap(),
            vec![1, 2, 3]
        );
        assert!(parse_id_list("datasetIds", Some("1,x")).is_err());
        assert!(parse_id_list("datasetIds", Some("")).is_err());
    }

    #[tokio::test]
    async fn resolve_expands_datasets_and_orders_primaries() {
        let h = harness(coldgate_core::StorageUnit::Datafile, Duration::from_millis(0));
        h.catalog.add_dataset(dataset(1));
        for id in [5, 3, 9] {
            h.catalog.add_datafile(datafile(id, 1));
        }

        let selection = DataSelection::resolve(
            h.catalog.as_ref(),
            coldgate_core::StorageUnit::Datafile,
            vec![],
            vec![1],
            vec![],
        )
        .await
        .unwrap();

        let ids: Vec<i64> = selection.primary().keys().copied().collect();
        assert_eq!(ids, vec![3, 5, 9], "sorted by id");
        assert!(selection.must_zip());
        assert!(!selection.is_single_datafile());
    }

    #[tokio::test]
    async fn resolve_unknown_id_is_not_found() {
        let h = harness(coldgate_core::StorageUnit::Dataset, Duration::from_millis(0));
        let result = DataSelection::resolve(
            h.catalog.as_ref(),
            coldgate_core::StorageUnit::Dataset,
            vec![],
            vec![404],
            vec![],
        )
        .await;
        assert!(matches!(result, Err(GatewayError::NotFound(_))));
    }

    #[tokio::test]
    async fn check_online_queues_restore_for_missing_data() {
        let h = harness(coldgate_core::StorageUnit::Datafile, Duration::from_millis(0));
        h.catalog.add_dataset(dataset(1));
        let df = datafile(7, 1);
        h.catalog.add_datafile(df.clone());

        let selection = DataSelection::resolve(
            h.catalog.as_ref(),
            coldgate_core::StorageUnit::Datafile,
            vec![],
            vec![],
            vec![7],
        )
        .await
        .unwrap();

        let err = selection
            .check_online(&h.fsm, h.main.as_ref())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::DataNotOnline(_)));
        assert_eq!(
            h.fsm.requested_state(&df.clone().into()),
            Some(S::RestoreRequested)
        );

        // A second check does not queue a second restore; the entity is
        // maybe-offline already.
        let err = selection
            .check_online(&h.fsm, h.main.as_ref())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::DataNotOnline(_)));
    }

    #[tokio::test]
    async fn check_online_passes_with_data_present() {
        let h = harness(coldgate_core::StorageUnit::Datafile, Duration::from_millis(0));
        h.catalog.add_dataset(dataset(1));
        let df = datafile(7, 1);
        h.catalog.add_datafile(df.clone());
        let mut content: &[u8] = b"x";
        h.main.put(&mut content, &df.location).await.unwrap();

        let selection = DataSelection::resolve(
            h.catalog.as_ref(),
            coldgate_core::StorageUnit::Datafile,
            vec![],
            vec![],
            vec![7],
        )
        .await
        .unwrap();
        selection.check_online(&h.fsm, h.main.as_ref()).await.unwrap();
    }

    #[tokio::test]
    async fn empty_datasets_count_as_online() {
        let h = harness(coldgate_core::StorageUnit::Dataset, Duration::from_millis(0));
        h.catalog.add_dataset(dataset(1));

        let selection = DataSelection::resolve(
            h.catalog.as_ref(),
            coldgate_core::StorageUnit::Dataset,
            vec![],
            vec![1],
            vec![],
        )
        .await
        .unwrap();
        assert!(selection.empty_datasets().contains(&1));
        selection.check_online(&h.fsm, h.main.as_ref()).await.unwrap();
    }

    #[tokio::test]
    async fn delete_at_dataset_granularity_rewrites_archive() {
        let h = harness(coldgate_core::StorageUnit::Dataset, Duration::from_millis(0));
        h.catalog.add_dataset(dataset(1));
        let df = datafile(7, 1);
        h.catalog.add_datafile(df.clone());
        let mut content: &[u8] = b"x";
        h.main.put(&mut content, &df.location).await.unwrap();

        let selection = DataSelection::resolve(
            h.catalog.as_ref(),
            coldgate_core::StorageUnit::Dataset,
            vec![],
            vec![],
            vec![7],
        )
        .await
        .unwrap();

        selection
            .delete(&h.fsm, h.main.as_ref(), h.catalog.as_ref())
            .await
            .unwrap();

        assert!(!h.main.exists(&df.location).await.unwrap());
        assert!(h.catalog.datafile(7).await.is_err());
        assert_eq!(
            h.fsm.requested_state(&dataset(1).into()),
            Some(S::WriteRequested)
        );
    }

    #[tokio::test]
    async fn schedule_queues_every_primary() {
        let h = harness(coldgate_core::StorageUnit::Datafile, Duration::from_millis(0));
        h.catalog.add_dataset(dataset(1));
        for id in [1, 2] {
            h.catalog.add_datafile(datafile(id, 1));
        }
        let selection = DataSelection::resolve(
            h.catalog.as_ref(),
            coldgate_core::StorageUnit::Datafile,
            vec![],
            vec![1],
            vec![],
        )
        .await
        .unwrap();

        selection.schedule(&h.fsm, Op::Archive).unwrap();
        for id in [1, 2] {
            assert_eq!(
                h.fsm.requested_state(&datafile(id, 1).into()),
                Some(S::ArchiveRequested)
            );
        }
    }
}
