//! Upload session metadata storage.
//!
//! Every backend honours the same contract: entries expire after the TTL given
//! to `put`, `keys` only lists live entries, and `delete` is idempotent.

use crate::error::{UploadError, UploadResult};
use crate::models::UploadSession;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Optional operations a backend supports, fixed when the backend is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreCapabilities {
    /// `keys()` returns every live session id. Invalidation scans are skipped otherwise.
    pub enumerate_keys: bool,
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, id: &str) -> UploadResult<Option<UploadSession>>;
    async fn put(&self, id: &str, session: &UploadSession, ttl: Duration) -> UploadResult<()>;
    async fn delete(&self, id: &str) -> UploadResult<()>;
    async fn keys(&self) -> UploadResult<Vec<String>>;
    fn capabilities(&self) -> StoreCapabilities;
    fn name(&self) -> &'static str;
}

/// Lists live sessions whose staged file lies under `prefix`.
pub async fn sessions_under(
    store: &dyn SessionStore,
    prefix: &Path,
) -> UploadResult<Vec<UploadSession>> {
    if !store.capabilities().enumerate_keys {
        return Ok(Vec::new());
    }

    let mut found = Vec::new();
    for key in store.keys().await? {
        if let Some(session) = store.get(&key).await? {
            if session.file_path.starts_with(prefix) {
                found.push(session);
            }
        }
    }
    Ok(found)
}

const MAX_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

pub(crate) fn expiry_from(ttl: Duration) -> DateTime<Utc> {
    let ttl = chrono::Duration::from_std(ttl.min(MAX_TTL)).unwrap_or_else(|_| chrono::Duration::zero());
    Utc::now() + ttl
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEntry {
    session: UploadSession,
    expires_at: DateTime<Utc>,
}

impl StoredEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Process-local store.
#[derive(Clone, Default)]
pub struct MemorySessionStore {
    entries: Arc<DashMap<String, StoredEntry>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self, id: &str) -> UploadResult<Option<UploadSession>> {
        let now = Utc::now();
        let expired = match self.entries.get(id) {
            Some(entry) if !entry.is_expired(now) => return Ok(Some(entry.session.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove_if(id, |_, entry| entry.is_expired(now));
        }
        Ok(None)
    }

    async fn put(&self, id: &str, session: &UploadSession, ttl: Duration) -> UploadResult<()> {
        self.entries.insert(
            id.to_string(),
            StoredEntry {
                session: session.clone(),
                expires_at: expiry_from(ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, id: &str) -> UploadResult<()> {
        self.entries.remove(id);
        Ok(())
    }

    async fn keys(&self) -> UploadResult<Vec<String>> {
        let now = Utc::now();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        Ok(self.entries.iter().map(|e| e.key().clone()).collect())
    }

    fn capabilities(&self) -> StoreCapabilities {
        StoreCapabilities {
            enumerate_keys: true,
        }
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// One JSON document per session inside a directory.
pub struct FileSessionStore {
    dir: PathBuf,
}

impl FileSessionStore {
    pub async fn new(dir: impl Into<PathBuf>) -> UploadResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| UploadError::io("create session store", &dir, e))?;
        Ok(Self { dir })
    }

    fn entry_path(&self, id: &str) -> UploadResult<PathBuf> {
        if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            return Err(UploadError::NotFound);
        }
        Ok(self.dir.join(format!("{}.json", id)))
    }

    async fn read_entry(&self, path: &Path) -> UploadResult<Option<StoredEntry>> {
        match fs::read(path).await {
            Ok(bytes) => match serde_json::from_slice::<StoredEntry>(&bytes) {
                Ok(entry) => Ok(Some(entry)),
                Err(e) => {
                    tracing::warn!(path = %path.display(), "Dropping unreadable session entry: {}", e);
                    let _ = fs::remove_file(path).await;
                    Ok(None)
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(UploadError::io("read session", path, e)),
        }
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn get(&self, id: &str) -> UploadResult<Option<UploadSession>> {
        let path = match self.entry_path(id) {
            Ok(path) => path,
            Err(_) => return Ok(None),
        };
        match self.read_entry(&path).await? {
            Some(entry) if entry.is_expired(Utc::now()) => {
                let _ = fs::remove_file(&path).await;
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.session)),
            None => Ok(None),
        }
    }

    async fn put(&self, id: &str, session: &UploadSession, ttl: Duration) -> UploadResult<()> {
        let path = self.entry_path(id)?;
        let entry = StoredEntry {
            session: session.clone(),
            expires_at: expiry_from(ttl),
        };
        let bytes = serde_json::to_vec(&entry)?;

        // Write then rename so concurrent readers never observe a torn document
        let tmp = self.dir.join(format!(".{}.{}.tmp", id, uuid::Uuid::new_v4().simple()));
        let mut file = fs::File::create(&tmp)
            .await
            .map_err(|e| UploadError::io("write session", &tmp, e))?;
        file.write_all(&bytes)
            .await
            .map_err(|e| UploadError::io("write session", &tmp, e))?;
        file.flush()
            .await
            .map_err(|e| UploadError::io("write session", &tmp, e))?;
        drop(file);

        fs::rename(&tmp, &path)
            .await
            .map_err(|e| UploadError::io_move("store session", &tmp, &path, e))
    }

    async fn delete(&self, id: &str) -> UploadResult<()> {
        let Ok(path) = self.entry_path(id) else {
            return Ok(());
        };
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(UploadError::io("delete session", &path, e)),
        }
    }

    async fn keys(&self) -> UploadResult<Vec<String>> {
        let mut dir = fs::read_dir(&self.dir)
            .await
            .map_err(|e| UploadError::io("list sessions", &self.dir, e))?;
        let now = Utc::now();
        let mut keys = Vec::new();

        while let Some(item) = dir
            .next_entry()
            .await
            .map_err(|e| UploadError::io("list sessions", &self.dir, e))?
        {
            let path = item.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(id) = name.strip_suffix(".json") else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            match self.read_entry(&path).await? {
                Some(entry) if entry.is_expired(now) => {
                    let _ = fs::remove_file(&path).await;
                }
                Some(_) => keys.push(id.to_string()),
                None => {}
            }
        }

        Ok(keys)
    }

    fn capabilities(&self) -> StoreCapabilities {
        StoreCapabilities {
            enumerate_keys: true,
        }
    }

    fn name(&self) -> &'static str {
        "file"
    }
}
