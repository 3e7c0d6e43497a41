use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::attachment_error;
use crate::api::response::{ApiError, AppQuery, JSend};
use crate::AppState;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Deserialize)]
pub struct CleanupParams {
    #[serde(default)]
    pub expire_seconds: Option<u64>,
    #[serde(default)]
    pub only_metadata: bool,
    #[serde(default)]
    pub batch_size: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct CleanupResponse {
    pub removed: u64,
}

#[derive(Debug, Serialize)]
pub struct InvalidateCacheResponse {
    pub presets_cleared: u64,
}

#[derive(Debug, Serialize)]
pub struct PurgeResponse {
    pub attachments_deleted: u64,
}

// ============================================================================
// Handlers
// ============================================================================

pub async fn health() -> Json<JSend<HealthResponse>> {
    JSend::success(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Trigger an orphan sweep.
/// Route: POST /admin/cleanup?expire_seconds=&only_metadata=&batch_size=
pub async fn admin_cleanup(
    State(state): State<Arc<AppState>>,
    AppQuery(params): AppQuery<CleanupParams>,
) -> Result<Json<JSend<CleanupResponse>>, ApiError> {
    let removed = state
        .manager
        .cleanup(params.expire_seconds, params.only_metadata, params.batch_size)
        .await
        .map_err(attachment_error)?;

    tracing::info!(removed, "Manual attachment cleanup completed");
    Ok(JSend::success(CleanupResponse { removed }))
}

/// Drop every cached derivative of one group, across all presets.
/// Route: DELETE /admin/image-cache/:group
pub async fn admin_invalidate_image_cache(
    State(state): State<Arc<AppState>>,
    Path(group): Path<String>,
) -> Result<Json<JSend<InvalidateCacheResponse>>, ApiError> {
    let presets_cleared = state
        .derivatives
        .invalidate_group(&group)
        .await
        .map_err(|e| ApiError::internal(format!("Failed to invalidate image cache: {e}")))?;

    tracing::info!(group = %group, presets_cleared, "Image cache invalidated");
    Ok(JSend::success(InvalidateCacheResponse { presets_cleared }))
}

pub async fn admin_purge(
    State(state): State<Arc<AppState>>,
) -> Result<Json<JSend<PurgeResponse>>, ApiError> {
    let attachments_deleted = state
        .db
        .purge_all()
        .map_err(|e| ApiError::internal(e.to_string()))?;

    tracing::warn!(attachments = attachments_deleted, "Purged all data");

    Ok(JSend::success(PurgeResponse {
        attachments_deleted,
    }))
}
