use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, patch, post};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

use crate::config::{InvalidConfig, PlantConfig, PlantConfigPatch};
use crate::db::Db;
use crate::state::SharedState;
use crate::worker::{PlantHandle, WorkerGone};

const DEFAULT_HISTORY_LIMIT: i64 = 50;
const MAX_HISTORY_LIMIT: i64 = 500;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

pub struct PlantControl {
    pub handle: PlantHandle,
    pub config: watch::Sender<PlantConfig>,
}

#[derive(Clone)]
pub struct AppState {
    pub shared: SharedState,
    pub db: Db,
    pub plants: Arc<BTreeMap<String, PlantControl>>,
}

impl AppState {
    fn plant(&self, id: &str) -> Result<&PlantControl, ApiError> {
        self.plants
            .get(id)
            .ok_or_else(|| ApiError::UnknownPlant(id.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
enum ApiError {
    #[error("unknown plant '{0}'")]
    UnknownPlant(String),
    #[error(transparent)]
    Invalid(#[from] InvalidConfig),
    #[error(transparent)]
    Unavailable(#[from] WorkerGone),
    #[error("{0:#}")]
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = match &self {
            ApiError::UnknownPlant(_) => StatusCode::NOT_FOUND,
            ApiError::Invalid(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = match &self {
            ApiError::Invalid(InvalidConfig(errors)) => json!({ "errors": errors }),
            other => json!({ "error": other.to_string() }),
        };
        (code, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/plants/{id}", get(plant_diagnostics))
        .route("/api/plants/{id}/history", get(plant_history))
        .route("/api/plants/{id}/evaluate", post(evaluate_now))
        .route("/api/plants/{id}/water", post(water_now))
        .route("/api/plants/{id}/config", patch(patch_config))
        .with_state(state)
}

async fn api_status(State(state): State<AppState>) -> impl IntoResponse {
    let st = state.shared.read().await;
    Json(st.to_status())
}

async fn plant_diagnostics(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let diag = state.plant(&id)?.handle.diagnostics().await?;
    Ok(Json(diag).into_response())
}

#[derive(Deserialize)]
struct HistoryQuery {
    limit: Option<i64>,
}

async fn plant_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<HistoryQuery>,
) -> Result<Response, ApiError> {
    state.plant(&id)?;
    let limit = q
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);
    let rows = state
        .db
        .recent_evaluations(&id, limit)
        .await
        .map_err(ApiError::Internal)?;
    Ok(Json(rows).into_response())
}

async fn evaluate_now(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let report = state.plant(&id)?.handle.evaluate().await?;
    Ok(Json(report).into_response())
}

async fn water_now(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let report = state.plant(&id)?.handle.water_now().await?;
    Ok(Json(report).into_response())
}

/// Partial edit of a plant's settings. Takes effect on the plant's next
/// call; not written back to the config file.
async fn patch_config(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(edit): Json<PlantConfigPatch>,
) -> Result<Response, ApiError> {
    let plant = state.plant(&id)?;
    let current = plant.config.borrow().clone();
    let updated = current.patched(&edit)?;

    plant.config.send_replace(updated.clone());
    info!(plant = %id, "web: config updated");
    state
        .shared
        .write()
        .await
        .record_system(format!("{id}: config updated"));

    Ok(Json(updated).into_response())
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!("web api listening on http://{addr}");

    axum::serve(listener, router(state)).await.map_err(|e| {
        error!(error = %e, "web server stopped");
        anyhow::Error::new(e).context("web server error")
    })
}

// ===========================================================================
// Tests
// ===========================================================================
