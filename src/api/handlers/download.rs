use crate::AppState;
use crate::api::error::AppError;
use axum::{
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use tokio_util::io::ReaderStream;

#[utoipa::path(
    get,
    path = "/uploads/download/{content_id}/{token}",
    params(
        ("content_id" = String, Path, description = "Content record the file belongs to"),
        ("token" = String, Path, description = "Download token returned on upload completion")
    ),
    responses(
        (status = 200, description = "File download stream"),
        (status = 404, description = "No file matches the token")
    ),
    tag = "files"
)]
pub async fn download_file(
    State(state): State<AppState>,
    Path((content_id, token)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let path = state.addressing.resolve(&content_id, &token).await?;

    let file = tokio::fs::File::open(&path)
        .await
        .map_err(|e| crate::error::UploadError::io("open destination file", &path, e))?;
    let len = file
        .metadata()
        .await
        .map(|m| m.len())
        .map_err(|e| crate::error::UploadError::io("stat destination file", &path, e))?;

    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    let (content_type, disposition) = resolve_file_headers(&filename);

    tracing::info!(content_id = %content_id, file = %filename, "📎 Serving download");

    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    headers.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_str(&disposition).map_err(|e| AppError::Internal(e.to_string()))?,
    );
    headers.insert(header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("private, no-cache"));

    let body = Body::from_stream(ReaderStream::new(file));
    Ok((StatusCode::OK, headers, body).into_response())
}

/// Content type from the extension and an attachment disposition safe for any file name.
pub(crate) fn resolve_file_headers(filename: &str) -> (&'static str, String) {
    let extension = filename.rsplit('.').next().unwrap_or("").to_lowercase();
    let content_type = match extension.as_str() {
        "pdf" => "application/pdf",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "txt" => "text/plain",
        "csv" => "text/csv",
        "zip" => "application/zip",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "mp4" => "video/mp4",
        "mp3" => "audio/mpeg",
        _ => "application/octet-stream",
    };

    let ascii_filename = filename
        .chars()
        .filter(|c| c.is_ascii() && !c.is_control() && *c != '"' && *c != '\\' && *c != ';')
        .take(64)
        .collect::<String>();
    let fallback_filename = if ascii_filename.is_empty() {
        "file"
    } else {
        &ascii_filename
    };
    let encoded_filename = utf8_percent_encode(filename, NON_ALPHANUMERIC).to_string();

    (
        content_type,
        format!(
            "attachment; filename=\"{}\"; filename*=UTF-8''{}",
            fallback_filename, encoded_filename
        ),
    )
}
