//! `GET /status`, `GET /status/{name}` and `GET /healthz`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde::Serialize;
use stackd_proxy::RouteTable;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::lifecycle::{InstanceState, ServiceStatus, StateBoard};
use crate::resources::{LedgerHandle, LedgerSnapshot};

/// Shared application state.
#[derive(Clone)]
pub struct StatusState {
    pub board: StateBoard,
    pub ledger: LedgerHandle,
    pub routes: Option<Arc<RouteTable>>,
}

/// One external route as seen by status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteView {
    pub listen_port: u16,
    pub service: String,
    pub target: SocketAddr,
    pub tls: bool,
    pub upgrade: bool,
    pub state: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    /// Every service is healthy.
    pub healthy: bool,
    pub services: Vec<ServiceStatus>,
    pub resources: LedgerSnapshot,
    pub routes: Vec<RouteView>,
}

#[derive(Debug)]
enum StatusError {
    NotFound(String),
    Unavailable(String),
}

impl IntoResponse for StatusError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::NotFound(m) => (StatusCode::NOT_FOUND, m),
            Self::Unavailable(m) => (StatusCode::SERVICE_UNAVAILABLE, m),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

pub fn router(state: StatusState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/status", get(status))
        .route("/status/{name}", get(service_status))
        .with_state(state)
}

/// Serve the status API on `addr` until `cancel` fires.
pub async fn serve(
    addr: SocketAddr,
    state: StatusState,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "Status endpoint listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}

/// `GET /healthz`: the daemon itself is up.
async fn healthz() -> &'static str {
    "ok"
}

/// `GET /status`
async fn status(State(state): State<StatusState>) -> Result<Json<StatusReport>, StatusError> {
    let resources = state
        .ledger
        .snapshot()
        .await
        .map_err(|e| StatusError::Unavailable(e.to_string()))?;
    let services = state.board.all();
    let routes = state
        .routes
        .as_deref()
        .map(route_views)
        .unwrap_or_default();
    Ok(Json(StatusReport {
        healthy: services.iter().all(|s| s.state == InstanceState::Healthy),
        services,
        resources,
        routes,
    }))
}

/// `GET /status/{name}`
async fn service_status(
    Path(name): Path<String>,
    State(state): State<StatusState>,
) -> Result<Json<ServiceStatus>, StatusError> {
    state
        .board
        .get(&name)
        .map(Json)
        .ok_or_else(|| StatusError::NotFound(format!("unknown service '{name}'")))
}

fn route_views(table: &RouteTable) -> Vec<RouteView> {
    table
        .snapshot()
        .slots()
        .map(|slot| RouteView {
            listen_port: slot.entry.listen_port,
            service: slot.entry.service.clone(),
            target: slot.entry.target,
            tls: slot.entry.tls,
            upgrade: slot.entry.upgrade,
            state: slot.state.to_string(),
        })
        .collect()
}
