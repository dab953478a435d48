pub mod api;
pub mod config;
pub mod error;
pub mod models;
pub mod services;
pub mod utils;

use crate::config::{SessionStoreKind, UploadConfig};
use crate::services::download::{DownloadAddressing, ScopeResolver};
use crate::services::gc::GarbageCollector;
use crate::services::pipeline::Pipeline;
use crate::services::promotion::{PromotionEngine, PromotionHooks};
use crate::services::session_store::{FileSessionStore, MemorySessionStore, SessionStore};
use crate::services::staging::StagingArea;
use crate::services::upload_service::UploadService;
use crate::utils::keyed_mutex::KeyedMutex;
use axum::{
    Router,
    http::{HeaderName, HeaderValue, Method, header},
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
};
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        api::handlers::tus::options,
        api::handlers::tus::create_upload,
        api::handlers::tus::patch_upload,
        api::handlers::tus::head_upload,
        api::handlers::tus::terminate_upload,
        api::handlers::download::download_file,
        api::handlers::cleanup::cleanup_idle,
        api::handlers::health::health_check,
    ),
    components(
        schemas(
            api::handlers::health::HealthResponse,
            models::SweepReport,
            models::DestinationFile,
            models::DestinationTarget,
        )
    ),
    tags(
        (name = "tus", description = "Resumable upload endpoints"),
        (name = "files", description = "Download and staging cleanup endpoints"),
        (name = "system", description = "Health endpoints")
    )
)]
pub struct ApiDoc;

/// Shared, immutable state. Services are built from it per request.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<UploadConfig>,
    pub store: Arc<dyn SessionStore>,
    pub staging: StagingArea,
    pub dest_root: PathBuf,
    pub addressing: DownloadAddressing,
    pub hooks: PromotionHooks,
    pub pipeline: Arc<Pipeline>,
    pub locks: KeyedMutex,
}

impl AppState {
    pub fn new(config: UploadConfig, store: Arc<dyn SessionStore>) -> anyhow::Result<Self> {
        let dest_root = std::path::absolute(&config.dest_path)?;
        let staging = StagingArea::new(std::path::absolute(&config.tmp_path)?);
        let addressing = DownloadAddressing::new(&dest_root, &config.download_secret);
        let pipeline = Arc::new(Pipeline::standard(staging.clone()));

        Ok(Self {
            config: Arc::new(config),
            store,
            staging,
            dest_root,
            addressing,
            hooks: PromotionHooks::default(),
            pipeline,
            locks: KeyedMutex::new(),
        })
    }

    /// Builds the state with the session store selected by the configuration.
    pub async fn from_config(config: UploadConfig) -> anyhow::Result<Self> {
        let store: Arc<dyn SessionStore> = match config.session_store {
            SessionStoreKind::Memory => Arc::new(MemorySessionStore::new()),
            SessionStoreKind::File => {
                Arc::new(FileSessionStore::new(&config.session_store_path).await?)
            }
        };
        tracing::info!(
            store = store.name(),
            enumerate_keys = store.capabilities().enumerate_keys,
            "Session store ready"
        );
        Self::new(config, store)
    }

    pub fn with_hooks(mut self, hooks: PromotionHooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_scope(mut self, resolver: ScopeResolver) -> Self {
        self.addressing = self.addressing.with_scope(resolver);
        self
    }

    /// Makes files under a per-field destination root downloadable.
    pub fn with_download_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.addressing = self.addressing.with_root(root);
        self
    }

    pub fn promotion(&self) -> PromotionEngine {
        PromotionEngine::new(
            &self.dest_root,
            self.staging.clone(),
            self.store.clone(),
            self.addressing.clone(),
            self.hooks.clone(),
        )
    }

    pub fn upload_service(&self) -> UploadService {
        UploadService::new(
            self.store.clone(),
            self.staging.clone(),
            self.promotion(),
            self.locks.clone(),
            self.config.session_ttl(),
            self.config.max_file_size,
        )
    }

    pub fn garbage_collector(&self) -> GarbageCollector {
        GarbageCollector::new(
            self.staging.clone(),
            self.store.clone(),
            self.config.session_ttl(),
        )
    }
}

fn cors_layer(config: &UploadConfig) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();

    let tus_headers = [
        "tus-resumable",
        "tus-version",
        "tus-extension",
        "tus-max-size",
        "upload-offset",
        "upload-length",
        "upload-metadata",
        "upload-file-name",
        "upload-download-token",
        "field-name",
        "x-request-id",
    ]
    .map(HeaderName::from_static);

    let mut allowed = vec![header::AUTHORIZATION, header::CONTENT_TYPE];
    allowed.extend(tus_headers.iter().cloned());
    let mut exposed = vec![header::LOCATION];
    exposed.extend(tus_headers.iter().cloned());

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PATCH,
            Method::HEAD,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(allowed)
        .expose_headers(exposed)
}

pub fn create_app(state: AppState) -> Router {
    let api_root = format!("/{}", state.config.api_path);
    let api_item = format!("/{}/:id", state.config.api_path);
    let download = format!("/{}/download/:content_id/:token", state.config.base_path);
    let cleanup = format!("/{}/cleanup", state.config.base_path);
    let body_limit = usize::try_from(state.config.max_file_size).unwrap_or(usize::MAX);

    let tus = Router::new()
        .route(
            &api_root,
            post(api::handlers::tus::create_upload).options(api::handlers::tus::options),
        )
        .route(
            &api_item,
            axum::routing::patch(api::handlers::tus::patch_upload)
                .head(api::handlers::tus::head_upload)
                .delete(api::handlers::tus::terminate_upload),
        )
        .route(&cleanup, post(api::handlers::cleanup::cleanup_idle))
        .layer(axum::extract::DefaultBodyLimit::max(body_limit))
        .layer(from_fn_with_state(
            state.clone(),
            api::middleware::auth::auth_middleware,
        ));

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .route("/health", get(api::handlers::health::health_check))
        .route(&download, get(api::handlers::download::download_file))
        .merge(tus)
        .layer(from_fn(api::middleware::request_id::request_id_middleware))
        .layer(cors_layer(&state.config))
        .with_state(state)
}
