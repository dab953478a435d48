//! Ordered middleware run on every tus request before it reaches the receiver.

use crate::error::{UploadError, UploadResult};
use crate::services::staging::StagingArea;
use crate::utils::validation::sanitize_file_name;
use axum::http::Method;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Metadata keys holding the client file name.
const FILE_NAME_KEYS: [&str; 2] = ["filename", "name"];

/// What the stages see and refine.
#[derive(Debug, Clone)]
pub struct TusRequest {
    pub method: Method,
    pub owner_id: Option<String>,
    pub field_name: Option<String>,
    pub upload_dir: Option<PathBuf>,
    pub raw_metadata: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

impl TusRequest {
    pub fn new(method: Method) -> Self {
        Self {
            method,
            owner_id: None,
            field_name: None,
            upload_dir: None,
            raw_metadata: None,
            metadata: BTreeMap::new(),
        }
    }

    fn is_read(&self) -> bool {
        matches!(self.method, Method::GET | Method::HEAD | Method::OPTIONS)
    }
}

pub trait UploadMiddleware: Send + Sync {
    fn name(&self) -> &'static str;
    fn handle(&self, req: &mut TusRequest) -> UploadResult<()>;
}

/// Rejects state-changing requests without an authenticated owner.
pub struct Authenticate;

impl UploadMiddleware for Authenticate {
    fn name(&self) -> &'static str {
        "authenticate"
    }

    fn handle(&self, req: &mut TusRequest) -> UploadResult<()> {
        if req.is_read() {
            return Ok(());
        }
        match req.owner_id.as_deref() {
            Some(owner) if !owner.is_empty() => Ok(()),
            _ => Err(UploadError::Unauthorized),
        }
    }
}

/// Points the upload at `<tmp>/<owner dir>/<field>` from the `Field-Name` header.
/// The receiver stages new uploads in the directory chosen here.
pub struct RewriteUploadDir {
    staging: StagingArea,
}

impl RewriteUploadDir {
    pub fn new(staging: StagingArea) -> Self {
        Self { staging }
    }
}

impl UploadMiddleware for RewriteUploadDir {
    fn name(&self) -> &'static str {
        "rewrite-upload-dir"
    }

    fn handle(&self, req: &mut TusRequest) -> UploadResult<()> {
        if matches!(req.method, Method::GET | Method::OPTIONS) {
            return Ok(());
        }

        let field = req
            .field_name
            .as_deref()
            .map(sanitize_file_name)
            .filter(|f| !f.is_empty())
            .ok_or_else(|| UploadError::WrongHeaders("Missing Field-Name header".to_string()))?;

        if let Some(owner) = req.owner_id.as_deref() {
            if owner.trim().is_empty() {
                return Err(UploadError::Unauthorized);
            }
            req.upload_dir = Some(self.staging.field_dir(owner, &field));
        }
        req.field_name = Some(field);
        Ok(())
    }
}

/// Decodes `Upload-Metadata` and sanitizes the file name entries.
pub struct NormalizeMetadata;

impl NormalizeMetadata {
    pub fn parse(raw: &str) -> UploadResult<BTreeMap<String, String>> {
        let mut metadata = BTreeMap::new();
        for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let mut parts = pair.splitn(2, ' ');
            let key = parts.next().unwrap_or_default().trim();
            if key.is_empty() {
                continue;
            }
            let value = match parts.next().map(str::trim).filter(|v| !v.is_empty()) {
                Some(encoded) => {
                    let bytes = STANDARD.decode(encoded).map_err(|_| {
                        UploadError::InvalidRequest(format!("Invalid base64 in metadata key {}", key))
                    })?;
                    String::from_utf8(bytes).map_err(|_| {
                        UploadError::InvalidRequest(format!("Metadata key {} is not UTF-8", key))
                    })?
                }
                None => String::new(),
            };
            metadata.insert(key.to_string(), value);
        }
        Ok(metadata)
    }
}

impl UploadMiddleware for NormalizeMetadata {
    fn name(&self) -> &'static str {
        "normalize-metadata"
    }

    fn handle(&self, req: &mut TusRequest) -> UploadResult<()> {
        let Some(raw) = req.raw_metadata.as_deref() else {
            return Ok(());
        };
        let mut metadata = Self::parse(raw)?;
        for key in FILE_NAME_KEYS {
            if let Some(value) = metadata.get_mut(key) {
                *value = sanitize_file_name(value);
            }
        }
        req.metadata = metadata;
        Ok(())
    }
}

pub struct Pipeline {
    stages: Vec<Box<dyn UploadMiddleware>>,
}

impl Pipeline {
    pub fn new(stages: Vec<Box<dyn UploadMiddleware>>) -> Self {
        Self { stages }
    }

    /// Authenticate, then rewrite the upload dir, then normalize metadata.
    pub fn standard(staging: StagingArea) -> Self {
        Self::new(vec![
            Box::new(Authenticate),
            Box::new(RewriteUploadDir::new(staging)),
            Box::new(NormalizeMetadata),
        ])
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Runs every stage in order, stopping at the first error.
    pub fn run(&self, mut req: TusRequest) -> UploadResult<TusRequest> {
        for stage in &self.stages {
            if let Err(e) = stage.handle(&mut req) {
                tracing::debug!(stage = stage.name(), method = %req.method, "Request rejected: {}", e);
                return Err(e);
            }
        }
        Ok(req)
    }
}
