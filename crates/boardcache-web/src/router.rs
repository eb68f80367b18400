//! Web router using Axum

use crate::error::ApiError;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderValue};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use boardcache_core::catalog::{self, ClimbRow};
use boardcache_core::{CancelToken, CapabilityTier, CoreError, Credentials, DatabaseOrchestrator};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

type AppState = Arc<DatabaseOrchestrator>;

/// Create the web router
///
/// An empty `allowed_origins` allows any origin.
pub fn create_router(orchestrator: AppState, allowed_origins: &[String]) -> Router {
    Router::new()
        .route("/api/health", get(health_handler))
        .route("/sync-public-data", post(sync_public_data_handler))
        .route("/boards/ensure", post(ensure_handler))
        .route("/boards/{board}/climbs/{uuid}", get(climb_handler))
        .route("/export-board-db", get(export_handler))
        .route("/fetch-board-images", post(fetch_images_handler))
        .layer(cors_layer(allowed_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(orchestrator)
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    let allow_origin = if origins.is_empty() {
        AllowOrigin::from(Any)
    } else {
        AllowOrigin::list(origins)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(Any)
        .allow_headers(Any)
}

#[derive(Debug, Deserialize)]
struct SyncRequest {
    board: String,
    username: Option<String>,
    password: Option<String>,
    tier: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EnsureRequest {
    board: String,
    tier: String,
    username: Option<String>,
    password: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExportQuery {
    board: String,
    tier: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ImagesBody {
    board: String,
    username: Option<String>,
    password: Option<String>,
}

async fn health_handler(State(orchestrator): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "cache_root": orchestrator.cache_root().display().to_string(),
        "remote_enabled": orchestrator.remote_enabled(),
    }))
}

/// Ensure a board database, then summarize its climb catalog
async fn sync_public_data_handler(
    State(orchestrator): State<AppState>,
    Json(request): Json<SyncRequest>,
) -> Result<Json<Value>, ApiError> {
    let tier: CapabilityTier = request.tier.as_deref().unwrap_or("catalog").parse()?;
    let credentials = Credentials::from_parts(request.username, request.password);

    let database = orchestrator
        .ensure(&request.board, tier, &credentials)
        .await?;

    let path = database.path.clone();
    let climbs = tokio::task::spawn_blocking(move || catalog::extract_climb_catalog(&path))
        .await
        .map_err(anyhow::Error::from)??;

    info!(board = %database.board, tier = %tier, climbs = climbs.len(), "Public data synced");

    Ok(Json(json!({
        "board": database.board,
        "status": "ok",
        "tier": tier,
        "climb_count": climbs.len(),
        "sample": climbs.into_iter().take(1).collect::<Vec<ClimbRow>>(),
    })))
}

async fn ensure_handler(
    State(orchestrator): State<AppState>,
    Json(request): Json<EnsureRequest>,
) -> Result<Json<Value>, ApiError> {
    let tier: CapabilityTier = request.tier.parse()?;
    let credentials = Credentials::from_parts(request.username, request.password);

    let database = orchestrator
        .ensure(&request.board, tier, &credentials)
        .await?;

    Ok(Json(json!({
        "board": database.board,
        "tier": database.tier,
        "path": database.path.display().to_string(),
        "relations": database.relations,
        "source": database.source,
    })))
}

async fn climb_handler(
    State(orchestrator): State<AppState>,
    Path((board, uuid)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let database = orchestrator
        .ensure(&board, CapabilityTier::Catalog, &Credentials::anonymous())
        .await?;

    let path = database.path.clone();
    let lookup = uuid.clone();
    let climb = tokio::task::spawn_blocking(move || catalog::load_climb(&path, &lookup))
        .await
        .map_err(anyhow::Error::from)??;

    match climb {
        Some(climb) => Ok(Json(Value::Object(climb))),
        None => Err(ApiError::NotFound(format!(
            "Climb {} not found on board '{}'",
            uuid, database.board
        ))),
    }
}

/// Ensure a board database and return the file itself
async fn export_handler(
    State(orchestrator): State<AppState>,
    Query(query): Query<ExportQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let tier: CapabilityTier = query.tier.as_deref().unwrap_or("catalog").parse()?;

    let database = orchestrator
        .ensure(&query.board, tier, &Credentials::anonymous())
        .await?;

    let bytes = tokio::fs::read(&database.path)
        .await
        .map_err(|e| CoreError::StoreIo {
            path: database.path.clone(),
            operation: "read database for export",
            source: e,
        })?;

    info!(board = %database.board, bytes = bytes.len(), "Exporting database");

    let disposition = format!("attachment; filename=\"{}\"", database.board.file_name());
    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    ))
}

/// Ensure a `layouts` database, then cache the board images it references
async fn fetch_images_handler(
    State(orchestrator): State<AppState>,
    Json(request): Json<ImagesBody>,
) -> Result<Json<Value>, ApiError> {
    let credentials = Credentials::from_parts(request.username, request.password);

    let images = orchestrator
        .ensure_images(&request.board, &credentials, &CancelToken::new())
        .await?;

    Ok(Json(json!({
        "board": images.board,
        "status": images.status,
        "image_count": images.image_count,
        "sample": images.sample,
    })))
}
