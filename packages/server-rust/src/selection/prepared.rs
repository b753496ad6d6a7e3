//! Prepared selections and the incremental is-prepared poll.
//!
//! A prepared selection is a durably identified entity set saved as a
//! JSON file named by UUID; clients poll it and eventually download
//! without re-specifying ids. Polling is incremental: a per-id cursor
//! marks the first entity not yet confirmed online, so each poll scans
//! forward from there instead of from the start, O(remaining) instead of
//! O(total) for selections spanning thousands of entities. Only once the
//! forward scan comes back clean is the already-passed prefix re-checked,
//! to catch entities that failed after having been confirmed earlier.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use coldgate_core::{DatafileInfo, DatasetInfo};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{GatewayError, Result};

use super::{DataSelection, SelectionContext};

/// The persisted form of a prepared selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prepared {
    pub ds_infos: Vec<DatasetInfo>,
    pub df_infos: Vec<DatafileInfo>,
    pub empty_datasets: Vec<i64>,
    pub zip: bool,
    pub compress: bool,
}

/// Per-prepared-id poll state. The lock serializes polls for one id; the
/// cursor is the first entity id not yet confirmed online; the task is
/// the background scan kicked off by the previous poll.
struct PollState {
    cursor: tokio::sync::Mutex<PollCursor>,
}

struct PollCursor {
    from_element: Option<i64>,
    task: Option<JoinHandle<Result<()>>>,
}

/// Store of prepared selections plus their poll cursors.
pub struct PreparedStore {
    dir: PathBuf,
    polls: DashMap<String, Arc<PollState>>,
}

impl PreparedStore {
    /// Create the store, making sure the directory exists.
    ///
    /// # Errors
    ///
    /// Fails if the prepared directory cannot be created.
    pub fn new(dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating prepared directory {}", dir.display()))?;
        Ok(Self {
            dir,
            polls: DashMap::new(),
        })
    }

    /// Persist a prepared selection; returns its id.
    ///
    /// # Errors
    ///
    /// I/O and serialization faults become internal errors.
    pub async fn save(&self, prepared: &Prepared) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let json = serde_json::to_vec(prepared).map_err(anyhow::Error::new)?;
        tokio::fs::write(self.dir.join(&id), json)
            .await
            .with_context(|| format!("writing prepared file {id}"))
            .map_err(GatewayError::Internal)?;
        tracing::debug!(prepared_id = %id, "saved prepared selection");
        Ok(id)
    }

    /// Load a prepared selection by id.
    ///
    /// # Errors
    ///
    /// `BadRequest` for a malformed UUID, `NotFound` for an unknown id.
    pub async fn load(&self, prepared_id: &str) -> Result<Prepared> {
        Uuid::parse_str(prepared_id).map_err(|_| {
            GatewayError::BadRequest(format!("preparedId {prepared_id} is not a valid UUID"))
        })?;
        let bytes = match tokio::fs::read(self.dir.join(prepared_id)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(GatewayError::NotFound(format!(
                    "the preparedId {prepared_id} is not known"
                )));
            }
            Err(e) => return Err(GatewayError::Internal(e.into())),
        };
        serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing prepared file {prepared_id}"))
            .map_err(GatewayError::Internal)
    }

    /// Incremental readiness poll over a prepared selection.
    ///
    /// Returns false immediately when another poll for the same id is in
    /// progress or a background scan is still running. Otherwise scans
    /// forward from the cursor; the first offline entity updates the
    /// cursor, kicks a background scan over the tail (which keeps
    /// triggering restores), and yields false. A clean forward scan
    /// re-checks the prefix before reporting true.
    ///
    /// # Errors
    ///
    /// A recorded failure for any scanned entity propagates, as does a
    /// failure captured by the previous background scan.
    pub async fn is_prepared(
        &self,
        prepared_id: &str,
        selection: &Arc<DataSelection>,
        ctx: &SelectionContext,
    ) -> Result<bool> {
        let state = self
            .polls
            .entry(prepared_id.to_string())
            .or_insert_with(|| {
                Arc::new(PollState {
                    cursor: tokio::sync::Mutex::new(PollCursor {
                        from_element: None,
                        task: None,
                    }),
                })
            })
            .clone();

        let Ok(mut cursor) = state.cursor.try_lock() else {
            tracing::debug!(prepared_id, "poll already in progress");
            return Ok(false);
        };

        if let Some(task) = cursor.task.take() {
            if task.is_finished() {
                // Surface what the background scan hit (a recorded failure
                // aborts it).
                task.await.map_err(|e| {
                    GatewayError::Internal(anyhow::anyhow!("background scan panicked: {e}"))
                })??;
            } else {
                cursor.task = Some(task);
                tracing::debug!(prepared_id, "background scan still running");
                return Ok(false);
            }
        }

        // Forward scan from the cursor.
        let from = cursor.from_element;
        let tail = match from {
            None => selection.primary().range(..),
            Some(from) => selection.primary().range(from..),
        };
        for (id, info) in tail {
            ctx.fsm.check_failure(*id)?;
            if selection
                .restore_if_offline(&ctx.fsm, ctx.main.as_ref(), info)
                .await?
            {
                cursor.from_element = Some(*id);
                let tail_ids: Vec<i64> = selection
                    .primary()
                    .range(*id..)
                    .map(|(id, _)| *id)
                    .collect();
                tracing::debug!(
                    prepared_id,
                    remaining = tail_ids.len(),
                    "offline entity found, scanning tail in background"
                );
                cursor.task = Some(Self::spawn_tail_scan(
                    Arc::clone(selection),
                    ctx.clone(),
                    tail_ids,
                ));
                return Ok(false);
            }
        }

        // Forward scan clean: double-check the prefix for entities that
        // failed after having been confirmed earlier.
        let mut prepared = true;
        if let Some(from) = from {
            for (id, info) in selection.primary().range(..from) {
                ctx.fsm.check_failure(*id)?;
                if selection
                    .restore_if_offline(&ctx.fsm, ctx.main.as_ref(), info)
                    .await?
                {
                    prepared = false;
                }
            }
        }
        Ok(prepared)
    }

    fn spawn_tail_scan(
        selection: Arc<DataSelection>,
        ctx: SelectionContext,
        ids: Vec<i64>,
    ) -> JoinHandle<Result<()>> {
        tokio::spawn(async move {
            for id in ids {
                ctx.fsm.check_failure(id)?;
                if let Some(info) = selection.primary().get(&id) {
                    selection
                        .restore_if_offline(&ctx.fsm, ctx.main.as_ref(), info)
                        .await?;
                }
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use coldgate_core::StorageUnit;

    use super::*;
    use crate::fsm::test_support::{dataset, datafile, harness, Harness};
    use crate::storage::MainStorage;

    async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    fn ctx(h: &Harness) -> SelectionContext {
        SelectionContext {
            fsm: h.fsm.clone(),
            main: h.main.clone(),
        }
    }

    async fn selection_of_files(h: &Harness, n: i64) -> Arc<DataSelection> {
        h.catalog.add_dataset(dataset(1));
        for id in 1..=n {
            h.catalog.add_datafile(datafile(id, 1));
        }
        Arc::new(
            DataSelection::resolve(
                h.catalog.as_ref(),
                StorageUnit::Datafile,
                vec![],
                vec![1],
                vec![],
            )
            .await
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = PreparedStore::new(dir.path().to_path_buf()).unwrap();

        let prepared = Prepared {
            ds_infos: vec![dataset(1)],
            df_infos: vec![datafile(1, 1)],
            empty_datasets: vec![],
            zip: true,
            compress: false,
        };
        let id = store.save(&prepared).await.unwrap();
        let loaded = store.load(&id).await.unwrap();
        assert_eq!(loaded.ds_infos[0].id, 1);
        assert!(loaded.zip);
    }

    #[tokio::test]
    async fn load_rejects_bad_and_unknown_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = PreparedStore::new(dir.path().to_path_buf()).unwrap();

        assert!(matches!(
            store.load("not-a-uuid").await,
            Err(GatewayError::BadRequest(_))
        ));
        let unknown = Uuid::new_v4().to_string();
        assert!(matches!(
            store.load(&unknown).await,
            Err(GatewayError::NotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn incremental_poll_advances_cursor_and_recovers() {
        let h = harness(StorageUnit::Datafile, Duration::from_millis(0));
        let store = PreparedStore::new(h.cache.path().join("prepared")).unwrap();
        let selection = selection_of_files(&h, 1000).await;

        // Everything online except entity 500.
        for df in selection.datafiles().values() {
            if df.id != 500 {
                let mut content: &[u8] = b"x";
                h.main.put(&mut content, &df.location).await.unwrap();
            }
        }
        h.archive.insert(&datafile(500, 1).location, "restored");

        let prepared_id = Uuid::new_v4().to_string();

        // First poll: stops at 500, queues its restore, reports not ready.
        let ready = store
            .is_prepared(&prepared_id, &selection, &ctx(&h))
            .await
            .unwrap();
        assert!(!ready);
        assert_eq!(
            h.fsm.requested_state(&datafile(500, 1).into()),
            Some(coldgate_core::RequestedState::RestoreRequested)
        );
        settle().await;

        // Restore completes.
        crate::fsm::StateMachine::process_queue(&h.fsm);
        settle().await;
        assert!(h.main.exists(&datafile(500, 1).location).await.unwrap());

        // Second poll: forward scan from 500 is clean, prefix re-checked,
        // selection is ready.
        let ready = store
            .is_prepared(&prepared_id, &selection, &ctx(&h))
            .await
            .unwrap();
        assert!(ready);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_fails_fast_on_recorded_failure() {
        let h = harness(StorageUnit::Datafile, Duration::from_millis(0));
        let store = PreparedStore::new(h.cache.path().join("prepared")).unwrap();
        let selection = selection_of_files(&h, 3).await;
        for df in selection.datafiles().values() {
            let mut content: &[u8] = b"x";
            h.main.put(&mut content, &df.location).await.unwrap();
        }

        h.fsm.record_failure(2);
        let prepared_id = Uuid::new_v4().to_string();
        let result = store.is_prepared(&prepared_id, &selection, &ctx(&h)).await;
        assert!(result.is_err());

        h.fsm.record_success(2);
        let ready = store
            .is_prepared(&prepared_id, &selection, &ctx(&h))
            .await
            .unwrap();
        assert!(ready);
    }
}
