//! Capability tokens for promoted files.
//!
//! Token = hex(HMAC-SHA256(secret, scope || 0x1f || path)). Nothing is stored;
//! a download request is resolved by recomputing tokens for the candidate
//! files of one content record.

use crate::error::{UploadError, UploadResult};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;

type HmacSha256 = Hmac<Sha256>;

const SCOPE_SEPARATOR: u8 = 0x1f;

/// Maps a content id to the content kind used to scope its tokens.
pub type ScopeResolver = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

fn mac_for(path: &Path, secret: &[u8], scope: Option<&str>) -> HmacSha256 {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key size");
    if let Some(scope) = scope {
        mac.update(scope.as_bytes());
    }
    mac.update(&[SCOPE_SEPARATOR]);
    mac.update(path.as_os_str().as_encoded_bytes());
    mac
}

pub fn compute_token(path: &Path, secret: &[u8], scope: Option<&str>) -> String {
    hex::encode(mac_for(path, secret, scope).finalize().into_bytes())
}

pub fn verify_token(path: &Path, secret: &[u8], scope: Option<&str>, token: &str) -> bool {
    let Ok(tag) = hex::decode(token) else {
        return false;
    };
    mac_for(path, secret, scope).verify_slice(&tag).is_ok()
}

/// Resolves `(content_id, token)` pairs to files under the destination roots.
#[derive(Clone)]
pub struct DownloadAddressing {
    roots: Vec<PathBuf>,
    secret: Vec<u8>,
    scope: Option<ScopeResolver>,
}

impl DownloadAddressing {
    pub fn new(dest_root: impl Into<PathBuf>, secret: impl AsRef<[u8]>) -> Self {
        Self {
            roots: vec![dest_root.into()],
            secret: secret.as_ref().to_vec(),
            scope: None,
        }
    }

    /// Also search `root` (per-field destination overrides).
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.roots.push(root.into());
        self
    }

    pub fn with_scope(mut self, resolver: ScopeResolver) -> Self {
        self.scope = Some(resolver);
        self
    }

    fn scope_for(&self, content_id: &str) -> Option<String> {
        self.scope.as_ref().and_then(|resolve| resolve(content_id))
    }

    pub fn token_for(&self, path: &Path, content_id: &str) -> String {
        let scope = self.scope_for(content_id);
        compute_token(path, &self.secret, scope.as_deref())
    }

    pub fn verify(&self, path: &Path, content_id: &str, token: &str) -> bool {
        let scope = self.scope_for(content_id);
        verify_token(path, &self.secret, scope.as_deref(), token)
    }

    /// Finds the file of `content_id` whose token matches.
    ///
    /// Walks `<root>/<content_id>/<field_key>/<file>` for every root.
    pub async fn resolve(&self, content_id: &str, token: &str) -> UploadResult<PathBuf> {
        if content_id.is_empty()
            || content_id.contains(['/', '\\'])
            || content_id == "."
            || content_id == ".."
        {
            return Err(UploadError::NotFound);
        }

        for root in &self.roots {
            let content_dir = root.join(content_id);
            for field_dir in read_children(&content_dir, true).await? {
                for file in read_children(&field_dir, false).await? {
                    if self.verify(&file, content_id, token) {
                        tracing::debug!(content_id, file = %file.display(), "Resolved download token");
                        return Ok(file);
                    }
                }
            }
        }

        Err(UploadError::NotFound)
    }
}

async fn read_children(dir: &Path, dirs: bool) -> UploadResult<Vec<PathBuf>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(UploadError::io("read destination dir", dir, e)),
    };

    let mut children = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| UploadError::io("read destination dir", dir, e))?
    {
        let Ok(file_type) = entry.file_type().await else {
            continue;
        };
        if (dirs && file_type.is_dir()) || (!dirs && file_type.is_file()) {
            children.push(entry.path());
        }
    }
    children.sort();
    Ok(children)
}
