use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode},
};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use http_body_util::BodyExt;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;
use tus_field_uploads::config::UploadConfig;
use tus_field_uploads::services::session_store::MemorySessionStore;
use tus_field_uploads::utils::auth::create_jwt;
use tus_field_uploads::{AppState, create_app};

const SECRET: &str = "test_jwt_secret";

fn setup() -> (TempDir, AppState, Router) {
    let tmp = TempDir::new().unwrap();
    let config = UploadConfig {
        tmp_path: tmp.path().join("tmp"),
        dest_path: tmp.path().join("uploads"),
        jwt_secret: SECRET.to_string(),
        download_secret: "download_secret".to_string(),
        max_file_size: 10 * 1024 * 1024,
        ..UploadConfig::default()
    };
    let state = AppState::new(config, Arc::new(MemorySessionStore::new())).unwrap();
    let app = create_app(state.clone());
    (tmp, state, app)
}

fn bearer(owner: &str) -> String {
    format!("Bearer {}", create_jwt(owner, SECRET).unwrap())
}

fn metadata(pairs: &[(&str, &str)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{} {}", k, STANDARD.encode(v)))
        .collect::<Vec<_>>()
        .join(",")
}

fn header<'a>(response: &'a axum::response::Response, name: &str) -> Option<&'a str> {
    response.headers().get(name).and_then(|v| v.to_str().ok())
}

async fn create(app: &Router, owner: &str, field: &str, size: u64, meta: &str) -> String {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/wp-tus")
                .header("Authorization", bearer(owner))
                .header("Tus-Resumable", "1.0.0")
                .header("Field-Name", field)
                .header("Upload-Length", size.to_string())
                .header("Upload-Metadata", meta)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(header(&response, "tus-resumable"), Some("1.0.0"));
    let location = header(&response, "location").unwrap().to_string();
    assert!(location.starts_with("/wp-tus/"));
    location
}

/// Staged file of the upload behind `location`.
fn staged_path(tmp: &TempDir, owner: &str, field: &str, location: &str, file_name: &str) -> PathBuf {
    let id = location.rsplit('/').next().unwrap();
    tmp.path()
        .join("tmp")
        .join(owner)
        .join(field)
        .join(format!("{}-{}", id, file_name))
}

fn patch(location: &str, owner: &str, field: &str, offset: u64, data: Vec<u8>) -> Request<Body> {
    Request::builder()
        .method("PATCH")
        .uri(location)
        .header("Authorization", bearer(owner))
        .header("Tus-Resumable", "1.0.0")
        .header("Field-Name", field)
        .header("Content-Type", "application/offset+octet-stream")
        .header("Upload-Offset", offset.to_string())
        .body(Body::from(data))
        .unwrap()
}

fn head(location: &str, field: &str) -> Request<Body> {
    Request::builder()
        .method("HEAD")
        .uri(location)
        .header("Tus-Resumable", "1.0.0")
        .header("Field-Name", field)
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn test_options_advertises_capabilities() {
    let (_tmp, _state, app) = setup();
    let response = app
        .oneshot(
            Request::builder()
                .method("OPTIONS")
                .uri("/wp-tus")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(header(&response, "tus-resumable"), Some("1.0.0"));
    assert_eq!(header(&response, "tus-version"), Some("1.0.0"));
    assert_eq!(header(&response, "tus-extension"), Some("creation,termination"));
    assert_eq!(header(&response, "tus-max-size"), Some("10485760"));
}

#[tokio::test]
async fn test_full_resumable_upload_and_download() {
    let (tmp, _state, app) = setup();
    let body: Vec<u8> = (0..3584u32).map(|i| (i % 251) as u8).collect();
    let meta = metadata(&[("filename", "cv.pdf"), ("content_id", "12")]);

    let location = create(&app, "42", "resume", body.len() as u64, &meta).await;
    let staged = staged_path(&tmp, "42", "resume", &location, "cv.pdf");
    assert!(staged.exists());

    // 1. First chunk
    let response = app
        .clone()
        .oneshot(patch(&location, "42", "resume", 0, body[..1024].to_vec()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(header(&response, "upload-offset"), Some("1024"));

    // 2. Replayed chunk is rejected, offset unchanged
    let response = app
        .clone()
        .oneshot(patch(&location, "42", "resume", 0, body[..1024].to_vec()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    // 3. Anonymous status read
    let response = app.clone().oneshot(head(&location, "resume")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, "upload-offset"), Some("1024"));
    assert_eq!(header(&response, "upload-length"), Some("3584"));
    assert_eq!(header(&response, "cache-control"), Some("no-store"));

    // 4. Remaining chunks
    let response = app
        .clone()
        .oneshot(patch(&location, "42", "resume", 1024, body[1024..3072].to_vec()))
        .await
        .unwrap();
    assert_eq!(header(&response, "upload-offset"), Some("3072"));
    assert!(header(&response, "upload-download-token").is_none());

    let response = app
        .clone()
        .oneshot(patch(&location, "42", "resume", 3072, body[3072..].to_vec()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(header(&response, "upload-offset"), Some("3584"));
    assert_eq!(header(&response, "upload-file-name"), Some("cv.pdf"));
    let token = header(&response, "upload-download-token").unwrap().to_string();

    // 5. Promoted into the content record's field directory
    let promoted = tmp.path().join("uploads/12/resume/cv.pdf");
    assert_eq!(std::fs::read(&promoted).unwrap(), body);
    assert!(!staged.exists());

    let response = app.clone().oneshot(head(&location, "resume")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    // 6. Download by token
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/uploads/download/12/{}", token))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, "content-type"), Some("application/pdf"));
    assert!(header(&response, "content-disposition").unwrap().starts_with("attachment;"));
    let downloaded = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(downloaded.to_vec(), body);

    // 7. Token is bound to its content record
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/uploads/download/13/{}", token))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_create_requires_owner_and_field_name() {
    let (_tmp, _state, app) = setup();

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/wp-tus")
                .header("Field-Name", "resume")
                .header("Upload-Length", "10")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/wp-tus")
                .header("Authorization", bearer("42"))
                .header("Upload-Length", "10")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert!(json["error"].as_str().unwrap().contains("Field-Name"));

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/wp-tus?token=not-a-jwt")
                .header("Field-Name", "resume")
                .header("Upload-Length", "10")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_create_rejects_oversized_and_bad_versions() {
    let (_tmp, _state, app) = setup();

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/wp-tus")
                .header("Authorization", bearer("42"))
                .header("Field-Name", "resume")
                .header("Upload-Length", (11 * 1024 * 1024).to_string())
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/wp-tus")
                .header("Authorization", bearer("42"))
                .header("Tus-Resumable", "0.2.2")
                .header("Field-Name", "resume")
                .header("Upload-Length", "10")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PRECONDITION_FAILED);
}

#[tokio::test]
async fn test_patch_rules() {
    let (_tmp, _state, app) = setup();
    let location = create(&app, "42", "resume", 4, &metadata(&[("filename", "a.txt")])).await;

    // Another caller cannot write
    let response = app
        .clone()
        .oneshot(patch(&location, "43", "resume", 0, b"ab".to_vec()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Missing Field-Name
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("PATCH")
                .uri(&location)
                .header("Authorization", bearer("42"))
                .header("Content-Type", "application/offset+octet-stream")
                .header("Upload-Offset", "0")
                .body(Body::from("ab"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Wrong content type
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("PATCH")
                .uri(&location)
                .header("Authorization", bearer("42"))
                .header("Field-Name", "resume")
                .header("Content-Type", "text/plain")
                .header("Upload-Offset", "0")
                .body(Body::from("ab"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);

    // Past the declared length
    let response = app
        .clone()
        .oneshot(patch(&location, "42", "resume", 0, b"abcdef".to_vec()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Unknown upload
    let response = app
        .oneshot(patch("/wp-tus/doesnotexist", "42", "resume", 0, b"ab".to_vec()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_terminate_upload() {
    let (tmp, _state, app) = setup();
    let location = create(&app, "42", "resume", 10, &metadata(&[("filename", "a.txt")])).await;

    let delete = |owner: &str| {
        Request::builder()
            .method("DELETE")
            .uri(&location)
            .header("Authorization", bearer(owner))
            .header("Field-Name", "resume")
            .body(Body::empty())
            .unwrap()
    };

    let response = app.clone().oneshot(delete("43")).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app.clone().oneshot(delete("42")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(!staged_path(&tmp, "42", "resume", &location, "a.txt").exists());

    let response = app.clone().oneshot(head(&location, "resume")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_cleanup_route_sweeps_caller_staging() {
    let (tmp, state, app) = setup();
    let live = create(&app, "42", "resume", 10, &metadata(&[("filename", "a.txt")])).await;
    assert!(live.starts_with("/wp-tus/"));
    let abandoned = state.staging.ensure_field_dir("42", "photo").await.unwrap();
    let other_owner = state.staging.ensure_field_dir("43", "photo").await.unwrap();

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/uploads/cleanup")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/uploads/cleanup")
                .header("Authorization", bearer("42"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let report: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(report["directories_removed"], 1);
    assert_eq!(report["directories_kept"], 1);

    assert!(!abandoned.exists());
    assert!(other_owner.exists());
    assert!(staged_path(&tmp, "42", "resume", &live, "a.txt").exists());
}

#[tokio::test]
async fn test_subject_with_reserved_characters_owns_its_upload() {
    let (tmp, state, app) = setup();
    let owner = "alice+uploads@example.com";
    let location = create(&app, owner, "resume", 3, &metadata(&[("filename", "cv.pdf")])).await;

    let owner_root = state.staging.owner_root(owner);
    assert!(owner_root.starts_with(tmp.path().join("tmp")));
    assert_ne!(owner_root, state.staging.owner_root("aliceuploads@example.com"));

    let response = app
        .clone()
        .oneshot(patch(&location, "aliceuploads@example.com", "resume", 0, b"abc".to_vec()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .clone()
        .oneshot(patch(&location, owner, "resume", 0, b"abc".to_vec()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(header(&response, "upload-file-name"), Some("cv.pdf"));

    let abandoned = state.staging.ensure_field_dir(owner, "photo").await.unwrap();
    assert!(abandoned.starts_with(&owner_root));
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/uploads/cleanup")
                .header("Authorization", bearer(owner))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(!abandoned.exists());
}

#[tokio::test]
async fn test_health_and_request_id() {
    let (_tmp, _state, app) = setup();
    let response = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .header("x-request-id", "abc-123")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, "x-request-id"), Some("abc-123"));
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "ok");
    assert_eq!(json["session_store"], "memory");
}
