//! Request handlers.

use axum::body::{Body, Bytes};
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tokio_util::io::ReaderStream;

use crate::error::{GatewayError, Result};
use crate::selection::{parse_id_list, DataSelection};

use super::{AppState, HealthState};

/// Common selection parameters: either explicit id lists or a prepared id.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionParams {
    pub investigation_ids: Option<String>,
    pub dataset_ids: Option<String>,
    pub datafile_ids: Option<String>,
    pub prepared_id: Option<String>,
}

async fn resolve_selection(state: &AppState, params: &SelectionParams) -> Result<DataSelection> {
    if let Some(prepared_id) = &params.prepared_id {
        return state.gateway.resolve_prepared(prepared_id).await;
    }
    let inv_ids = parse_id_list("investigationIds", params.investigation_ids.as_deref())?;
    let ds_ids = parse_id_list("datasetIds", params.dataset_ids.as_deref())?;
    let df_ids = parse_id_list("datafileIds", params.datafile_ids.as_deref())?;
    state.gateway.resolve(inv_ids, ds_ids, df_ids).await
}

pub async fn ping(State(state): State<AppState>) -> Response {
    match state.shutdown.health_state() {
        HealthState::Ready => (StatusCode::OK, "ColdgateOK").into_response(),
        HealthState::Starting => (StatusCode::SERVICE_UNAVAILABLE, "starting").into_response(),
        HealthState::Draining => (StatusCode::SERVICE_UNAVAILABLE, "draining").into_response(),
    }
}

pub async fn is_two_level(State(state): State<AppState>) -> Json<bool> {
    Json(state.gateway.is_two_level())
}

pub async fn get_service_status(State(state): State<AppState>) -> Response {
    Json(state.gateway.service_status()).into_response()
}

pub async fn get_status(
    State(state): State<AppState>,
    Query(params): Query<SelectionParams>,
) -> Result<Response> {
    let selection = resolve_selection(&state, &params).await?;
    let status = state.gateway.get_status(&selection).await?;
    Ok(Json(status).into_response())
}

pub async fn get_data(
    State(state): State<AppState>,
    Query(params): Query<SelectionParams>,
) -> Result<Response> {
    let selection = resolve_selection(&state, &params).await?;
    let (df, reader) = state.gateway.get_data(&selection).await?;

    let disposition = format!("attachment; filename=\"{}\"", df.name);
    Response::builder()
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_DISPOSITION, disposition)
        .body(Body::from_stream(ReaderStream::new(reader)))
        .map_err(|e| GatewayError::Internal(e.into()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrepareParams {
    pub investigation_ids: Option<String>,
    pub dataset_ids: Option<String>,
    pub datafile_ids: Option<String>,
    pub zip: Option<bool>,
    pub compress: Option<bool>,
}

pub async fn prepare_data(
    State(state): State<AppState>,
    Query(params): Query<PrepareParams>,
) -> Result<Response> {
    let selection_params = SelectionParams {
        investigation_ids: params.investigation_ids,
        dataset_ids: params.dataset_ids,
        datafile_ids: params.datafile_ids,
        prepared_id: None,
    };
    let selection = resolve_selection(&state, &selection_params).await?;
    let prepared_id = state
        .gateway
        .prepare(
            &selection,
            params.zip.unwrap_or(false),
            params.compress.unwrap_or(false),
        )
        .await?;
    Ok(Json(json!({ "preparedId": prepared_id })).into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreparedIdParams {
    pub prepared_id: String,
}

pub async fn is_prepared(
    State(state): State<AppState>,
    Query(params): Query<PreparedIdParams>,
) -> Result<Json<bool>> {
    Ok(Json(state.gateway.is_prepared(&params.prepared_id).await?))
}

pub async fn archive(
    State(state): State<AppState>,
    Query(params): Query<SelectionParams>,
) -> Result<StatusCode> {
    let selection = resolve_selection(&state, &params).await?;
    state.gateway.archive(&selection)?;
    Ok(StatusCode::OK)
}

pub async fn restore(
    State(state): State<AppState>,
    Query(params): Query<SelectionParams>,
) -> Result<StatusCode> {
    let selection = resolve_selection(&state, &params).await?;
    state.gateway.restore(&selection)?;
    Ok(StatusCode::OK)
}

pub async fn write(
    State(state): State<AppState>,
    Query(params): Query<SelectionParams>,
) -> Result<StatusCode> {
    let selection = resolve_selection(&state, &params).await?;
    state.gateway.write(&selection)?;
    Ok(StatusCode::OK)
}

pub async fn reset(
    State(state): State<AppState>,
    Query(params): Query<SelectionParams>,
) -> Result<StatusCode> {
    let selection = resolve_selection(&state, &params).await?;
    state.gateway.reset(&selection).await?;
    Ok(StatusCode::OK)
}

pub async fn delete_data(
    State(state): State<AppState>,
    Query(params): Query<SelectionParams>,
) -> Result<StatusCode> {
    if params.prepared_id.is_some() {
        return Err(GatewayError::BadRequest(
            "delete does not accept a preparedId".to_string(),
        ));
    }
    let selection = resolve_selection(&state, &params).await?;
    state.gateway.delete(&selection).await?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PutParams {
    pub dataset_id: i64,
    pub name: String,
}

pub async fn put_datafile(
    State(state): State<AppState>,
    Query(params): Query<PutParams>,
    body: Bytes,
) -> Result<Response> {
    if params.name.is_empty() || params.name.contains('/') {
        return Err(GatewayError::BadRequest(
            "name must be a plain file name".to_string(),
        ));
    }
    let mut reader = body.as_ref();
    let (id, size) = state
        .gateway
        .put_datafile(params.dataset_id, &params.name, &mut reader)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "id": id, "size": size })),
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::to_bytes;
    use axum::http::Request;
    use coldgate_core::StorageUnit;
    use tower::ServiceExt;

    use super::*;
    use crate::catalog::MemoryCatalog;
    use crate::config::{GatewayConfig, NetworkConfig};
    use crate::fsm::test_support::{dataset, datafile};
    use crate::gateway::Gateway;
    use crate::network::{router, ShutdownController};
    use crate::storage::{ArchiveStorage, MainStorage, MemoryArchiveStorage, MemoryMainStorage};

    struct Rig {
        app: axum::Router,
        catalog: Arc<MemoryCatalog>,
        main: Arc<MemoryMainStorage>,
        archive: Arc<MemoryArchiveStorage>,
        shutdown: Arc<ShutdownController>,
        _cache: tempfile::TempDir,
    }

    fn rig(two_level: bool) -> Rig {
        let cache = tempfile::tempdir().unwrap();
        let config = GatewayConfig {
            storage_unit: StorageUnit::Datafile,
            cache_dir: cache.path().to_path_buf(),
            write_delay: Duration::from_millis(0),
            process_queue_interval: Duration::from_millis(10),
        };
        let catalog = Arc::new(MemoryCatalog::new());
        let main = Arc::new(MemoryMainStorage::new());
        let archive = Arc::new(MemoryArchiveStorage::new());
        let gateway = Gateway::new(
            config,
            catalog.clone(),
            main.clone(),
            two_level.then(|| archive.clone() as Arc<dyn ArchiveStorage>),
        )
        .unwrap();
        let shutdown = Arc::new(ShutdownController::new());
        let state = AppState {
            gateway: Arc::new(gateway),
            shutdown: shutdown.clone(),
        };
        Rig {
            app: router(state, &NetworkConfig::default()),
            catalog,
            main,
            archive,
            shutdown,
            _cache: cache,
        }
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), 1 << 20).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn ping_tracks_health_state() {
        let r = rig(true);
        let response = r
            .app
            .clone()
            .oneshot(Request::get("/ids/ping").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        r.shutdown.set_ready();
        let response = r
            .app
            .clone()
            .oneshot(Request::get("/ids/ping").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn is_two_level_reflects_configuration() {
        let r = rig(false);
        let response = r
            .app
            .clone()
            .oneshot(Request::get("/ids/isTwoLevel").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(body_json(response).await, serde_json::json!(false));
    }

    #[tokio::test]
    async fn get_data_offline_yields_503_and_queues_restore() {
        let r = rig(true);
        r.catalog.add_dataset(dataset(1));
        let df = datafile(7, 1);
        r.catalog.add_datafile(df.clone());
        r.archive.insert(&df.location, "cold");

        let response = r
            .app
            .clone()
            .oneshot(
                Request::get("/ids/getData?datafileIds=7")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json = body_json(response).await;
        assert_eq!(json["code"], "DataNotOnline");

        let status = r
            .app
            .clone()
            .oneshot(
                Request::get("/ids/getStatus?datafileIds=7")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(body_json(status).await, serde_json::json!("RESTORING"));
    }

    #[tokio::test]
    async fn get_data_serves_online_bytes() {
        let r = rig(true);
        r.catalog.add_dataset(dataset(1));
        let df = datafile(7, 1);
        r.catalog.add_datafile(df.clone());
        let mut content: &[u8] = b"hello bytes";
        r.main.put(&mut content, &df.location).await.unwrap();

        let response = r
            .app
            .clone()
            .oneshot(
                Request::get("/ids/getData?datafileIds=7")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"f-7\""
        );
        let bytes = to_bytes(response.into_body(), 1 << 20).await.unwrap();
        assert_eq!(&bytes[..], b"hello bytes");
    }

    #[tokio::test]
    async fn bad_id_list_is_a_400() {
        let r = rig(true);
        let response = r
            .app
            .clone()
            .oneshot(
                Request::get("/ids/getStatus?datafileIds=1,nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn archive_on_single_level_is_501() {
        let r = rig(false);
        r.catalog.add_dataset(dataset(1));
        let df = datafile(7, 1);
        r.catalog.add_datafile(df);

        let response = r
            .app
            .clone()
            .oneshot(
                Request::post("/ids/archive?datafileIds=7")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
    }

    #[tokio::test]
    async fn put_then_get_round_trip() {
        let r = rig(true);
        r.catalog.add_dataset(dataset(1));

        let response = r
            .app
            .clone()
            .oneshot(
                Request::put("/ids/put?datasetId=1&name=upload.dat")
                    .body(Body::from("uploaded"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let json = body_json(response).await;
        let df_id = json["id"].as_i64().unwrap();
        assert_eq!(json["size"], 8);

        let response = r
            .app
            .clone()
            .oneshot(
                Request::get(format!("/ids/getData?datafileIds={df_id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), 1 << 20).await.unwrap();
        assert_eq!(&bytes[..], b"uploaded");
    }

    #[tokio::test]
    async fn prepare_and_poll_via_http() {
        let r = rig(true);
        r.catalog.add_dataset(dataset(1));
        let df = datafile(7, 1);
        r.catalog.add_datafile(df.clone());
        let mut content: &[u8] = b"x";
        r.main.put(&mut content, &df.location).await.unwrap();

        let response = r
            .app
            .clone()
            .oneshot(
                Request::post("/ids/prepareData?datafileIds=7&zip=true")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let prepared_id = body_json(response).await["preparedId"]
            .as_str()
            .unwrap()
            .to_string();

        let response = r
            .app
            .clone()
            .oneshot(
                Request::get(format!("/ids/isPrepared?preparedId={prepared_id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(body_json(response).await, serde_json::json!(true));

        let response = r
            .app
            .clone()
            .oneshot(
                Request::get("/ids/isPrepared?preparedId=unknown")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn service_status_shape_over_http() {
        let r = rig(true);
        r.catalog.add_dataset(dataset(1));
        let df = datafile(7, 1);
        r.catalog.add_datafile(df);

        // Queue a restore so the report has content.
        let _ = r
            .app
            .clone()
            .oneshot(
                Request::post("/ids/restore?datafileIds=7")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let response = r
            .app
            .clone()
            .oneshot(
                Request::get("/ids/getServiceStatus")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["opsQueue"][0]["request"], "RESTORE_REQUESTED");
        assert_eq!(json["lockCount"], 0);
        assert_eq!(json["failures"], serde_json::json!([]));
    }
}
