//! REST surface of the gateway.
//!
//! Thin translation layer: handlers parse parameters, call the gateway
//! facade, and map [`GatewayError`](crate::error::GatewayError) onto HTTP
//! statuses. All coordination logic lives behind the facade.

pub mod handlers;
pub mod shutdown;

pub use shutdown::{HealthState, ShutdownController};

use std::sync::Arc;

use axum::http::HeaderValue;
use axum::routing::{delete, get, post, put};
use axum::Router;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::config::NetworkConfig;
use crate::gateway::Gateway;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub shutdown: Arc<ShutdownController>,
}

/// Build the gateway router.
#[must_use]
pub fn router(state: AppState, config: &NetworkConfig) -> Router {
    let cors = if config.cors_origins.iter().any(|o| o == "*") {
        CorsLayer::new().allow_origin(Any)
    } else {
        let origins: Vec<HeaderValue> = config
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new().allow_origin(AllowOrigin::list(origins))
    };

    Router::new()
        .route("/ids/ping", get(handlers::ping))
        .route("/ids/isTwoLevel", get(handlers::is_two_level))
        .route("/ids/getServiceStatus", get(handlers::get_service_status))
        .route("/ids/getStatus", get(handlers::get_status))
        .route("/ids/getData", get(handlers::get_data))
        .route("/ids/prepareData", post(handlers::prepare_data))
        .route("/ids/isPrepared", get(handlers::is_prepared))
        .route("/ids/archive", post(handlers::archive))
        .route("/ids/restore", post(handlers::restore))
        .route("/ids/write", post(handlers::write))
        .route("/ids/reset", post(handlers::reset))
        .route("/ids/delete", delete(handlers::delete_data))
        .route("/ids/put", put(handlers::put_datafile))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(config.request_timeout))
        .layer(cors)
        .with_state(state)
}
