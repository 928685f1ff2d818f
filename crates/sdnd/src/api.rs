//! HTTP control surface.
//!
//! Handlers only decode requests, call into the command core or the network
//! service, and encode the results. Anything that changes the switch goes
//! through the command core.

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{error, info};

use crate::config::BridgeConf;
use crate::command::CoreHandle;
use crate::error::{SdnError, SdnResult};
use crate::metrics::MetricsCollector;
use crate::network::NetworkService;
use crate::types::{Connection, ConnectionMap, NetworkRequest};

/// Version reported by `GET /version`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Shared state of the request handlers.
#[derive(Clone)]
pub struct AppState {
    pub core: CoreHandle,
    pub networks: NetworkService,
    pub bridge: Arc<RwLock<BridgeConf>>,
    pub metrics: MetricsCollector,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/version", get(get_version))
        .route("/configuration", get(get_configuration).post(set_configuration))
        .route("/networks", get(list_networks))
        .route("/network", post(create_network))
        .route("/network/{name}", get(get_network).delete(delete_network))
        .route("/connections", get(list_connections))
        .route("/connection", post(create_connection))
        .route("/connection/{id}", get(get_connection).delete(delete_connection))
        .route("/cluster/join", post(join_cluster))
        .route("/cluster/leave", post(leave_cluster))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

fn decode<T: DeserializeOwned>(body: &Bytes, what: &str) -> SdnResult<T> {
    if body.is_empty() {
        return Err(SdnError::bad_request(format!("{} request has no body", what)));
    }
    serde_json::from_slice(body)
        .map_err(|e| SdnError::bad_request(format!("{} json decode failed: {}", what, e)))
}

async fn get_version() -> &'static str {
    VERSION
}

async fn get_configuration(State(state): State<AppState>) -> Json<BridgeConf> {
    Json(state.bridge.read().clone())
}

async fn set_configuration(State(state): State<AppState>, body: Bytes) -> SdnResult<StatusCode> {
    let conf: BridgeConf = decode(&body, "configuration")?;
    info!(bridge = %conf.bridge_name, "Updated bridge configuration");
    *state.bridge.write() = conf;
    Ok(StatusCode::OK)
}

async fn list_networks(State(state): State<AppState>) -> SdnResult<impl IntoResponse> {
    Ok(Json(state.networks.list().await?))
}

async fn get_network(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> SdnResult<impl IntoResponse> {
    Ok(Json(state.networks.get(&name).await?))
}

async fn create_network(State(state): State<AppState>, body: Bytes) -> SdnResult<impl IntoResponse> {
    let request: NetworkRequest = decode(&body, "network")?;
    let network = state
        .core
        .create_network(&request.name, &request.subnet)
        .await?;
    Ok(Json(network))
}

async fn delete_network(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> SdnResult<StatusCode> {
    state.core.delete_network(&name).await?;
    Ok(StatusCode::OK)
}

async fn list_connections(State(state): State<AppState>) -> Json<ConnectionMap> {
    Json(state.core.connections().as_ref().clone())
}

async fn get_connection(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> SdnResult<Json<Connection>> {
    state
        .core
        .connection(&id)
        .map(Json)
        .ok_or_else(|| SdnError::not_found(id))
}

async fn create_connection(
    State(state): State<AppState>,
    body: Bytes,
) -> SdnResult<Json<Connection>> {
    let connection: Connection = decode(&body, "connection")?;
    Ok(Json(state.core.connect(connection).await?))
}

async fn delete_connection(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> SdnResult<StatusCode> {
    state.core.disconnect(&id).await?;
    Ok(StatusCode::OK)
}

async fn join_cluster(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> SdnResult<StatusCode> {
    let address = params
        .get("address")
        .filter(|address| !address.is_empty())
        .ok_or_else(|| SdnError::bad_request("address parameter not exist"))?;
    let address: Ipv4Addr = address
        .parse()
        .map_err(|_| SdnError::bad_request("Invalid IP address"))?;

    info!(%address, "Join to cluster");
    state.core.join_cluster(address).await?;
    Ok(StatusCode::OK)
}

async fn leave_cluster(State(state): State<AppState>) -> SdnResult<StatusCode> {
    info!("Node leave cluster");
    state.core.leave_cluster().await?;
    Ok(StatusCode::OK)
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    match state.metrics.encode() {
        Ok((buffer, content_type)) => {
            (StatusCode::OK, [("content-type", content_type)], buffer).into_response()
        }
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
