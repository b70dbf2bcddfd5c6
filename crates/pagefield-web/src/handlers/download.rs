use axum::extract::{Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use std::sync::Arc;

use pagefield_core::{ExportFormat, Exporter};

use crate::error::ApiError;
use crate::models::DownloadQuery;
use crate::state::AppState;

/// `GET /download?reference=..`: artifact bytes as an attachment.
pub async fn download(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DownloadQuery>,
) -> Result<Response, ApiError> {
    let path = state
        .artifacts
        .open(&query.reference)
        .ok_or_else(|| ApiError::NotFound("File not found".into()))?;

    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|_| ApiError::NotFound("File not found".into()))?;

    let content_type = path
        .extension()
        .and_then(|e| e.to_str())
        .and_then(ExportFormat::from_extension)
        .map(ExportFormat::content_type)
        .unwrap_or("application/octet-stream");

    Ok((
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", query.reference),
            ),
        ],
        bytes,
    )
        .into_response())
}
