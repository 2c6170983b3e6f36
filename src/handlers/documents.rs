use axum::{
    extract::{Multipart, Path, State},
    http::{header, HeaderMap, StatusCode},
    Json,
};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::database::Document;
use crate::state::AppState;
use crate::utils::error::ApiError;

/// POST /api/sessions/{id}/documents — multipart upload, field `file`.
pub async fn upload_document(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<Uuid>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<Document>), ApiError> {
    let mut file_name: Option<String> = None;
    let mut declared_mime: Option<String> = None;
    let mut bytes: Option<Vec<u8>> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::Validation(format!("failed to read multipart field: {e}")))?
    {
        if field.name() != Some("file") {
            continue;
        }
        file_name = field.file_name().map(str::to_string);
        declared_mime = field.content_type().map(str::to_string);
        bytes = Some(
            field
                .bytes()
                .await
                .map_err(|e| ApiError::Validation(format!("failed to read file: {e}")))?
                .to_vec(),
        );
    }

    let file_name = file_name.ok_or_else(|| ApiError::Validation("file field required".into()))?;
    let bytes = bytes.ok_or_else(|| ApiError::Validation("file field required".into()))?;

    info!(%session_id, file_name, size = bytes.len(), "upload received");

    let document = state
        .document_service
        .upload(session_id, &file_name, declared_mime.as_deref(), bytes)
        .await?;

    Ok((StatusCode::CREATED, Json(document)))
}

/// GET /api/sessions/{id}/documents
pub async fn list_documents(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<Vec<Document>>, ApiError> {
    if state.repository.get_session(session_id).await?.is_none() {
        return Err(ApiError::SessionNotFound(session_id));
    }
    Ok(Json(state.repository.list_documents(session_id).await?))
}

/// GET /api/documents/{id}
pub async fn get_document(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Document>, ApiError> {
    let document = state
        .repository
        .get_document(id)
        .await?
        .ok_or(ApiError::DocumentNotFound(id))?;
    Ok(Json(document))
}

/// GET /api/documents/{id}/status — same body as the document itself; the
/// client polls this while processing runs.
pub async fn get_document_status(
    state: State<Arc<AppState>>,
    path: Path<Uuid>,
) -> Result<Json<Document>, ApiError> {
    get_document(state, path).await
}

/// DELETE /api/documents/{id}
pub async fn delete_document(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.document_service.delete_document(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/sessions/{sid}/images/{iid} — raw bytes with the stored MIME.
pub async fn get_image(
    State(state): State<Arc<AppState>>,
    Path((session_id, image_id)): Path<(Uuid, Uuid)>,
) -> Result<(HeaderMap, Vec<u8>), ApiError> {
    let image = state
        .repository
        .get_image(session_id, image_id)
        .await?
        .ok_or(ApiError::DocumentNotFound(image_id))?;

    let bytes = state
        .image_store
        .load(std::path::Path::new(&image.file_path))
        .await
        .map_err(|e| ApiError::InternalError(format!("image blob unreadable: {e}")))?;

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        image
            .mime_type
            .parse()
            .unwrap_or(header::HeaderValue::from_static("application/octet-stream")),
    );
    Ok((headers, bytes))
}
