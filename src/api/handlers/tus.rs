use crate::AppState;
use crate::api::error::AppError;
use crate::api::middleware::auth::Owner;
use crate::models::DestinationFile;
use crate::services::pipeline::TusRequest;
use crate::services::upload_service::ChunkOutcome;
use axum::{
    Extension,
    extract::{Path, State},
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};

pub const TUS_VERSION: &str = "1.0.0";
pub const TUS_EXTENSIONS: &str = "creation,termination";
pub const OFFSET_OCTET_STREAM: &str = "application/offset+octet-stream";

pub static TUS_RESUMABLE: HeaderName = HeaderName::from_static("tus-resumable");
pub static TUS_VERSION_HEADER: HeaderName = HeaderName::from_static("tus-version");
pub static TUS_EXTENSION: HeaderName = HeaderName::from_static("tus-extension");
pub static TUS_MAX_SIZE: HeaderName = HeaderName::from_static("tus-max-size");
pub static UPLOAD_OFFSET: HeaderName = HeaderName::from_static("upload-offset");
pub static UPLOAD_LENGTH: HeaderName = HeaderName::from_static("upload-length");
pub static UPLOAD_METADATA: HeaderName = HeaderName::from_static("upload-metadata");
pub static UPLOAD_FILE_NAME: HeaderName = HeaderName::from_static("upload-file-name");
pub static UPLOAD_DOWNLOAD_TOKEN: HeaderName = HeaderName::from_static("upload-download-token");
pub static FIELD_NAME: HeaderName = HeaderName::from_static("field-name");

/// Non-ASCII bytes are always escaped as well.
const HEADER_UNSAFE: &AsciiSet = &CONTROLS.add(b' ').add(b'%').add(b'"');

fn header_str<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim)
}

fn header_u64(headers: &HeaderMap, name: &HeaderName) -> Result<u64, AppError> {
    header_str(headers, name)
        .ok_or_else(|| AppError::BadRequest(format!("Missing {} header", name)))?
        .parse()
        .map_err(|_| AppError::BadRequest(format!("Invalid {} header", name)))
}

fn check_version(headers: &HeaderMap) -> Result<(), AppError> {
    match header_str(headers, &TUS_RESUMABLE) {
        Some(version) if version != TUS_VERSION => Err(AppError::PreconditionFailed(format!(
            "Unsupported tus version {}",
            version
        ))),
        _ => Ok(()),
    }
}

fn tus_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(TUS_RESUMABLE.clone(), HeaderValue::from_static(TUS_VERSION));
    headers
}

fn completion_headers(headers: &mut HeaderMap, file: &DestinationFile) -> Result<(), AppError> {
    let name = utf8_percent_encode(&file.file_name, HEADER_UNSAFE).to_string();
    headers.insert(
        UPLOAD_FILE_NAME.clone(),
        HeaderValue::from_str(&name).map_err(|e| AppError::Internal(e.to_string()))?,
    );
    headers.insert(
        UPLOAD_DOWNLOAD_TOKEN.clone(),
        HeaderValue::from_str(&file.token).map_err(|e| AppError::Internal(e.to_string()))?,
    );
    Ok(())
}

/// Runs the request pipeline for one tus call.
fn prepare(
    state: &AppState,
    method: Method,
    owner: &Owner,
    headers: &HeaderMap,
) -> Result<TusRequest, AppError> {
    check_version(headers)?;
    let mut req = TusRequest::new(method);
    req.owner_id = owner.0.clone();
    req.field_name = header_str(headers, &FIELD_NAME).map(str::to_string);
    req.raw_metadata = header_str(headers, &UPLOAD_METADATA).map(str::to_string);
    Ok(state.pipeline.run(req)?)
}

#[utoipa::path(
    options,
    path = "/wp-tus",
    responses(
        (status = 204, description = "Server capabilities in Tus-* headers")
    ),
    tag = "tus"
)]
pub async fn options(State(state): State<AppState>) -> Response {
    let mut headers = tus_headers();
    headers.insert(TUS_VERSION_HEADER.clone(), HeaderValue::from_static(TUS_VERSION));
    headers.insert(TUS_EXTENSION.clone(), HeaderValue::from_static(TUS_EXTENSIONS));
    headers.insert(
        TUS_MAX_SIZE.clone(),
        HeaderValue::from(state.config.max_file_size),
    );
    (StatusCode::NO_CONTENT, headers).into_response()
}

#[utoipa::path(
    post,
    path = "/wp-tus",
    params(
        ("Upload-Length" = u64, Header, description = "Total upload size in bytes"),
        ("Upload-Metadata" = Option<String>, Header, description = "Comma separated `key base64(value)` pairs"),
        ("Field-Name" = String, Header, description = "Form field the upload belongs to")
    ),
    responses(
        (status = 201, description = "Upload created, URL in Location"),
        (status = 401, description = "Unauthorized or missing Field-Name"),
        (status = 413, description = "Upload-Length above the maximum")
    ),
    security(
        ("jwt" = [])
    ),
    tag = "tus"
)]
pub async fn create_upload(
    State(state): State<AppState>,
    Extension(owner): Extension<Owner>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let req = prepare(&state, Method::POST, &owner, &headers)?;
    let size = header_u64(&headers, &UPLOAD_LENGTH)?;
    let (Some(owner_id), Some(field), Some(upload_dir)) = (
        req.owner_id.as_deref(),
        req.field_name.as_deref(),
        req.upload_dir.as_deref(),
    ) else {
        return Err(crate::error::UploadError::Unauthorized.into());
    };

    let created = state
        .upload_service()
        .create_session_in(upload_dir, owner_id, field, size, req.metadata)
        .await?;

    let location = format!("/{}/{}", state.config.api_path, created.session.id);
    let mut response_headers = tus_headers();
    response_headers.insert(
        header::LOCATION,
        HeaderValue::from_str(&location).map_err(|e| AppError::Internal(e.to_string()))?,
    );
    match &created.completed {
        Some(file) => {
            response_headers.insert(UPLOAD_OFFSET.clone(), HeaderValue::from(created.session.size));
            completion_headers(&mut response_headers, file)?;
        }
        None => {
            response_headers.insert(UPLOAD_OFFSET.clone(), HeaderValue::from(0u64));
        }
    }

    Ok((StatusCode::CREATED, response_headers).into_response())
}

#[utoipa::path(
    patch,
    path = "/wp-tus/{id}",
    params(
        ("id" = String, Path, description = "Upload session id"),
        ("Upload-Offset" = u64, Header, description = "Offset the chunk starts at"),
        ("Field-Name" = String, Header, description = "Form field the upload belongs to")
    ),
    request_body(content = Vec<u8>, description = "Chunk data", content_type = "application/offset+octet-stream"),
    responses(
        (status = 204, description = "Chunk stored, new offset in Upload-Offset"),
        (status = 401, description = "Unauthorized or missing Field-Name"),
        (status = 404, description = "Unknown upload"),
        (status = 409, description = "Offset mismatch")
    ),
    security(
        ("jwt" = [])
    ),
    tag = "tus"
)]
pub async fn patch_upload(
    State(state): State<AppState>,
    Extension(owner): Extension<Owner>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let req = prepare(&state, Method::PATCH, &owner, &headers)?;
    let content_type = header_str(&headers, &header::CONTENT_TYPE).unwrap_or_default();
    if content_type != OFFSET_OCTET_STREAM {
        return Err(AppError::UnsupportedMediaType(format!(
            "Content-Type must be {}",
            OFFSET_OCTET_STREAM
        )));
    }
    let offset = header_u64(&headers, &UPLOAD_OFFSET)?;

    let outcome = state
        .upload_service()
        .write_chunk(&id, req.owner_id.as_deref(), offset, &body)
        .await?;

    let mut response_headers = tus_headers();
    response_headers.insert(UPLOAD_OFFSET.clone(), HeaderValue::from(outcome.offset()));
    if let ChunkOutcome::Completed { file, .. } = &outcome {
        completion_headers(&mut response_headers, file)?;
    }

    Ok((StatusCode::NO_CONTENT, response_headers).into_response())
}

#[utoipa::path(
    head,
    path = "/wp-tus/{id}",
    params(
        ("id" = String, Path, description = "Upload session id"),
        ("Field-Name" = String, Header, description = "Form field the upload belongs to")
    ),
    responses(
        (status = 200, description = "Offset and length in Upload-Offset and Upload-Length"),
        (status = 404, description = "Unknown upload")
    ),
    tag = "tus"
)]
pub async fn head_upload(
    State(state): State<AppState>,
    Extension(owner): Extension<Owner>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    prepare(&state, Method::HEAD, &owner, &headers)?;
    let session = state.upload_service().head_status(&id).await?;

    let mut response_headers = tus_headers();
    response_headers.insert(UPLOAD_OFFSET.clone(), HeaderValue::from(session.offset));
    response_headers.insert(UPLOAD_LENGTH.clone(), HeaderValue::from(session.size));
    response_headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));

    Ok((StatusCode::OK, response_headers).into_response())
}

#[utoipa::path(
    delete,
    path = "/wp-tus/{id}",
    params(
        ("id" = String, Path, description = "Upload session id"),
        ("Field-Name" = String, Header, description = "Form field the upload belongs to")
    ),
    responses(
        (status = 204, description = "Upload terminated"),
        (status = 401, description = "Unauthorized"),
        (status = 404, description = "Unknown upload")
    ),
    security(
        ("jwt" = [])
    ),
    tag = "tus"
)]
pub async fn terminate_upload(
    State(state): State<AppState>,
    Extension(owner): Extension<Owner>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let req = prepare(&state, Method::DELETE, &owner, &headers)?;
    state
        .upload_service()
        .terminate(&id, req.owner_id.as_deref())
        .await?;
    Ok((StatusCode::NO_CONTENT, tus_headers()).into_response())
}
