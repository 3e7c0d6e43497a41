use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use std::sync::Arc;

use super::attachment_error;
use crate::api::response::ApiError;
use crate::AppState;

/// Serve a cached image derivative, materializing it on first request.
/// Route: GET /images/:preset/*path
pub async fn serve_image(
    State(state): State<Arc<AppState>>,
    Path((preset_name, path)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let preset = state
        .derivatives
        .decode(&preset_name)
        .ok_or_else(|| ApiError::not_found("Unknown image preset"))?;

    let record = state
        .manager
        .find_by_file_path(false, &path)
        .map_err(attachment_error)?
        .ok_or_else(|| ApiError::not_found("Image not found"))?;

    if !record.is_image() {
        return Err(ApiError::bad_request("Attachment is not an image"));
    }

    let dst_path = state
        .derivatives
        .ensure(&record.storage_key(), &preset)
        .await
        .map_err(|e| ApiError::internal(format!("Failed to produce derivative: {e}")))?
        .ok_or_else(|| ApiError::not_found("Image derivative not available"))?;

    let data = state
        .manager
        .store_for(false)
        .get(&dst_path)
        .await
        .map_err(|e| ApiError::internal(format!("Failed to retrieve derivative: {e}")))?;

    let byte_size = data.len() as u64;
    let mut response = (StatusCode::OK, data).into_response();
    let headers = response.headers_mut();

    headers.insert(
        header::CONTENT_TYPE,
        record
            .mime_type()
            .parse()
            .unwrap_or(header::HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(header::CONTENT_LENGTH, header::HeaderValue::from(byte_size));

    // Derivatives are deterministic per (preset, source); cache freely
    headers.insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("public, max-age=3600"),
    );

    Ok(response)
}
