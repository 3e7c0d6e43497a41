use axum::extract::{Multipart, Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::{attachment_error, token_error};
use crate::api::response::{ApiError, AppJson, JSend};
use crate::storage::models::{AttachmentRecord, OwnerRef, DEFAULT_USAGE_TAG};
use crate::AppState;

/// Header carrying the authenticated principal id. Authentication itself
/// happens upstream; this service only consumes the result.
const PRINCIPAL_HEADER: &str = "x-principal-id";

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct AttachmentResponse {
    pub id: u64,
    pub name: String,
    pub name_original: String,
    pub group: Option<String>,
    pub private: bool,
    pub mime_type: String,
    pub created_at: String,
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateFromUrlRequest {
    pub url: String,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub private: bool,
}

#[derive(Debug, Serialize)]
pub struct UrlResponse {
    pub url: String,
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub deleted: bool,
}

#[derive(Debug, Deserialize)]
pub struct UsageRequest {
    pub owner_type: String,
    pub owner_id: String,
    #[serde(default)]
    pub tag: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AddUsageResponse {
    pub added: bool,
}

#[derive(Debug, Serialize)]
pub struct RemoveUsageResponse {
    pub removed: u64,
}

fn attachment_response(state: &AppState, record: &AttachmentRecord) -> AttachmentResponse {
    AttachmentResponse {
        id: record.id,
        name: record.name.clone(),
        name_original: record.name_original.clone(),
        group: record.group.clone(),
        private: record.private,
        mime_type: record.mime_type(),
        created_at: record.created_at.to_rfc3339(),
        url: state.manager.url(record, true),
    }
}

fn principal_from(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(PRINCIPAL_HEADER)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}

// ============================================================================
// Handlers
// ============================================================================

/// Upload a new attachment.
/// Route: POST /attachments (multipart: file, group?, private?)
pub async fn create_attachment(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<JSend<AttachmentResponse>>, ApiError> {
    let mut file_data: Option<bytes::Bytes> = None;
    let mut file_name: Option<String> = None;
    let mut group: Option<String> = None;
    let mut private = false;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("Invalid multipart data: {e}")))?
    {
        let field_name = field.name().unwrap_or("").to_string();

        match field_name.as_str() {
            "file" => {
                file_name = field.file_name().map(|s| s.to_string());
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::bad_request(format!("Failed to read file: {e}")))?;
                file_data = Some(data);
            }
            "group" => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| ApiError::bad_request(format!("Invalid group: {e}")))?;
                if !value.is_empty() {
                    group = Some(value);
                }
            }
            "private" => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| ApiError::bad_request(format!("Invalid private flag: {e}")))?;
                private = value == "true" || value == "1";
            }
            _ => {}
        }
    }

    let data = file_data.ok_or_else(|| ApiError::bad_request("Missing 'file' field"))?;
    let file_name = file_name.unwrap_or_default();

    let record = state
        .manager
        .create_from_bytes(
            data,
            &file_name,
            group.as_deref(),
            private,
            principal_from(&headers),
        )
        .await
        .map_err(attachment_error)?;

    tracing::info!(id = record.id, name = %record.name, private, "Attachment created");
    Ok(JSend::success(attachment_response(&state, &record)))
}

/// Ingest an attachment from a remote URL.
/// Route: POST /attachments/url
pub async fn create_attachment_from_url(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AppJson(request): AppJson<CreateFromUrlRequest>,
) -> Result<Json<JSend<AttachmentResponse>>, ApiError> {
    let record = state
        .manager
        .create_from_url(
            &request.url,
            request.group.as_deref(),
            request.private,
            principal_from(&headers),
        )
        .await
        .map_err(attachment_error)?;

    tracing::info!(id = record.id, url = %request.url, "Attachment ingested from URL");
    Ok(JSend::success(attachment_response(&state, &record)))
}

/// Get attachment metadata.
/// Route: GET /attachments/:id
pub async fn get_attachment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
) -> Result<Json<JSend<AttachmentResponse>>, ApiError> {
    let record = state
        .manager
        .get(id)
        .map_err(attachment_error)?
        .ok_or_else(|| ApiError::not_found("Attachment not found"))?;

    Ok(JSend::success(attachment_response(&state, &record)))
}

/// Resolve a servable URL for an attachment. Public attachments resolve to
/// their direct URL; private ones require an authorized principal and
/// return a tokened download URL.
/// Route: GET /attachments/:id/url
pub async fn obtain_attachment_url(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
    headers: HeaderMap,
) -> Result<Json<JSend<UrlResponse>>, ApiError> {
    let record = state
        .manager
        .get(id)
        .map_err(attachment_error)?
        .ok_or_else(|| ApiError::not_found("Attachment not found"))?;

    if !record.private {
        return Ok(JSend::success(UrlResponse {
            url: state.manager.url(&record, true),
        }));
    }

    let principal_id = principal_from(&headers)
        .ok_or_else(|| ApiError::bad_request(format!("Missing {PRINCIPAL_HEADER} header")))?;

    if !state
        .tokens
        .can_download(record.id, principal_id)
        .await
        .map_err(token_error)?
    {
        return Err(ApiError::forbidden("Not permitted to download this attachment"));
    }

    let token = state
        .tokens
        .obtain(record.id, principal_id)
        .await
        .map_err(token_error)?
        .ok_or_else(|| ApiError::internal("Failed to issue download token"))?;

    Ok(JSend::success(UrlResponse {
        url: format!(
            "{}/attachments/download/{token}",
            state.config.absolute_url_base()
        ),
    }))
}

/// Serve a private attachment by download token.
/// Route: GET /attachments/download/:token
pub async fn download_by_token(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
) -> Result<Response, ApiError> {
    // Cheap structural check before touching the KV store
    if !state.tokens.validate_token_str(&token) {
        return Err(ApiError::not_found("Unknown download token"));
    }

    let (attachment_id, _) = state.tokens.get(&token).await.map_err(token_error)?;
    let attachment_id =
        attachment_id.ok_or_else(|| ApiError::not_found("Unknown download token"))?;

    let record = state
        .manager
        .get(attachment_id)
        .map_err(attachment_error)?
        .ok_or_else(|| ApiError::not_found("Attachment not found"))?;

    let data = state
        .manager
        .store_for(true)
        .get(&record.storage_key())
        .await
        .map_err(|e| match e {
            crate::object_store::ObjectStoreError::NotFound(_) => {
                ApiError::not_found("Attachment content not found")
            }
            _ => ApiError::internal(format!("Failed to retrieve attachment: {e}")),
        })?;

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
    if let Ok(value) = format!("attachment; filename=\"{}\"", record.name_original).parse() {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    // Tokens expire; keep responses out of shared caches
    headers.insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("private, no-store"),
    );

    Ok(response)
}

/// Delete an attachment (blob and metadata).
/// Route: DELETE /attachments/:id
pub async fn delete_attachment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
) -> Result<Json<JSend<DeleteResponse>>, ApiError> {
    let deleted = state.manager.delete(id).await.map_err(attachment_error)?;
    if !deleted {
        return Err(ApiError::not_found("Attachment not found"));
    }

    state
        .tokens
        .destroy(Some(id), None)
        .await
        .map_err(token_error)?;

    tracing::info!(id, "Attachment deleted");
    Ok(JSend::success(DeleteResponse { deleted }))
}

/// Record a usage edge from an owning entity.
/// Route: POST /attachments/:id/usages
pub async fn add_usage(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
    AppJson(request): AppJson<UsageRequest>,
) -> Result<Json<JSend<AddUsageResponse>>, ApiError> {
    if state
        .manager
        .get(id)
        .map_err(attachment_error)?
        .is_none()
    {
        return Err(ApiError::not_found("Attachment not found"));
    }

    let owner = OwnerRef::new(request.owner_type, request.owner_id);
    let tag = request.tag.as_deref().unwrap_or(DEFAULT_USAGE_TAG);
    let added = state
        .db
        .add_usage(id, &owner, tag)
        .map_err(|e| ApiError::internal(e.to_string()))?;

    Ok(JSend::success(AddUsageResponse { added }))
}

/// Remove usage edges from an owning entity. Without a tag every edge for
/// the pair is removed.
/// Route: DELETE /attachments/:id/usages
pub async fn remove_usage(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
    AppJson(request): AppJson<UsageRequest>,
) -> Result<Json<JSend<RemoveUsageResponse>>, ApiError> {
    let owner = OwnerRef::new(request.owner_type, request.owner_id);
    let removed = match request.tag.as_deref() {
        Some(tag) => state.db.remove_usage_tagged(id, &owner, tag),
        None => state.db.remove_usage(id, &owner),
    }
    .map_err(|e| ApiError::internal(e.to_string()))?;

    Ok(JSend::success(RemoveUsageResponse { removed }))
}

/// Serve public attachment content.
/// Route: GET /storage/*path
pub async fn serve_public(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
) -> Result<Response, ApiError> {
    let record = state
        .manager
        .find_by_file_path(false, &path)
        .map_err(attachment_error)?
        .ok_or_else(|| ApiError::not_found("File not found"))?;

    let data = state
        .manager
        .store_for(false)
        .get(&record.storage_key())
        .await
        .map_err(|e| match e {
            crate::object_store::ObjectStoreError::NotFound(_) => {
                ApiError::not_found("File content not found")
            }
            _ => ApiError::internal(format!("Failed to retrieve file: {e}")),
        })?;

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
    if let Ok(value) = format!("inline; filename=\"{}\"", record.name).parse() {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }

    // Content-hash names make blobs immutable; cache freely
    headers.insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("public, max-age=3600"),
    );

    Ok(response)
}
