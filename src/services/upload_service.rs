use crate::error::{UploadError, UploadResult};
use crate::models::{DestinationFile, DestinationTarget, UploadSession};
use crate::services::promotion::PromotionEngine;
use crate::services::session_store::{SessionStore, expiry_from};
use crate::services::staging::{StagingArea, owner_dir_name, staged_file_name};
use crate::utils::keyed_mutex::KeyedMutex;
use crate::utils::validation::{require_segment, sanitize_file_name, validate_file_size};
use chrono::Utc;
use std::collections::BTreeMap;
use std::path::{Component, Path};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Result of accepting one chunk.
#[derive(Debug, Clone)]
pub enum ChunkOutcome {
    InProgress { offset: u64 },
    Completed { offset: u64, file: DestinationFile },
}

impl ChunkOutcome {
    pub fn offset(&self) -> u64 {
        match self {
            ChunkOutcome::InProgress { offset } | ChunkOutcome::Completed { offset, .. } => *offset,
        }
    }
}

/// A freshly created session. Zero-length uploads are promoted right away.
#[derive(Debug, Clone)]
pub struct CreatedUpload {
    pub session: UploadSession,
    pub completed: Option<DestinationFile>,
}

/// Receives tus chunks into the staging area and promotes finished uploads.
///
/// Built per request from shared state; holds no state of its own.
#[derive(Clone)]
pub struct UploadService {
    store: Arc<dyn SessionStore>,
    staging: StagingArea,
    promotion: PromotionEngine,
    locks: KeyedMutex,
    ttl: Duration,
    max_file_size: u64,
}

impl UploadService {
    pub fn new(
        store: Arc<dyn SessionStore>,
        staging: StagingArea,
        promotion: PromotionEngine,
        locks: KeyedMutex,
        ttl: Duration,
        max_file_size: u64,
    ) -> Self {
        Self {
            store,
            staging,
            promotion,
            locks,
            ttl,
            max_file_size,
        }
    }

    pub fn promotion(&self) -> &PromotionEngine {
        &self.promotion
    }

    /// Starts an upload whose destination comes from the `content_id` and
    /// `field_key` metadata entries.
    pub async fn create_session(
        &self,
        owner_id: &str,
        field_name: &str,
        size: u64,
        metadata: BTreeMap<String, String>,
    ) -> UploadResult<CreatedUpload> {
        let upload_dir = self
            .staging
            .field_dir(owner_id, &require_segment(field_name, "Field name")?);
        self.create_session_in(&upload_dir, owner_id, field_name, size, metadata)
            .await
    }

    /// Starts an upload in the directory the request pipeline picked.
    pub async fn create_session_in(
        &self,
        upload_dir: &Path,
        owner_id: &str,
        field_name: &str,
        size: u64,
        metadata: BTreeMap<String, String>,
    ) -> UploadResult<CreatedUpload> {
        let target = DestinationTarget {
            content_id: metadata_segment(&metadata, "content_id")
                .unwrap_or_else(|| owner_dir_name(owner_id)),
            field_key: metadata_segment(&metadata, "field_key")
                .unwrap_or_else(|| sanitize_file_name(field_name)),
            dest_override: None,
        };
        self.open_session(upload_dir, owner_id, field_name, size, metadata, target)
            .await
    }

    /// Starts an upload with an explicit destination.
    pub async fn create_session_for(
        &self,
        owner_id: &str,
        field_name: &str,
        size: u64,
        metadata: BTreeMap<String, String>,
        target: DestinationTarget,
    ) -> UploadResult<CreatedUpload> {
        let upload_dir = self
            .staging
            .field_dir(owner_id, &require_segment(field_name, "Field name")?);
        self.open_session(&upload_dir, owner_id, field_name, size, metadata, target)
            .await
    }

    async fn open_session(
        &self,
        upload_dir: &Path,
        owner_id: &str,
        field_name: &str,
        size: u64,
        metadata: BTreeMap<String, String>,
        target: DestinationTarget,
    ) -> UploadResult<CreatedUpload> {
        validate_file_size(size, self.max_file_size)?;
        if owner_id.trim().is_empty() {
            return Err(UploadError::InvalidRequest("Owner id cannot be empty".to_string()));
        }
        let field_name = require_segment(field_name, "Field name")?;

        // Cleanup and invalidation are scoped to the owner's root
        let owner_root = self.staging.owner_root(owner_id);
        let escapes = upload_dir
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::CurDir));
        if escapes || upload_dir == owner_root || !upload_dir.starts_with(&owner_root) {
            tracing::warn!(
                owner_id,
                dir = %upload_dir.display(),
                "Upload directory outside the owner's staging root"
            );
            return Err(UploadError::InvalidRequest(
                "Upload directory outside the owner's staging root".to_string(),
            ));
        }

        let id = Uuid::new_v4().simple().to_string();
        let file_name = ["filename", "name"]
            .iter()
            .filter_map(|key| metadata.get(*key))
            .map(|name| sanitize_file_name(name))
            .find(|name| !name.is_empty())
            .unwrap_or_else(|| id.clone());

        self.staging.ensure_dir(upload_dir).await?;
        let file_path = upload_dir.join(staged_file_name(&id, &file_name));
        self.staging.create_file(&file_path).await?;

        let now = Utc::now();
        let session = UploadSession {
            id: id.clone(),
            field_name,
            owner_id: owner_id.to_string(),
            file_name,
            file_path,
            offset: 0,
            size,
            target,
            metadata,
            created_at: now,
            expires_at: expiry_from(self.ttl),
            completed_at: None,
        };
        self.store.put(&id, &session, self.ttl).await?;

        tracing::info!(
            session_id = %id,
            owner_id = %session.owner_id,
            field = %session.field_name,
            size,
            "Created upload session"
        );

        let completed = if size == 0 {
            Some(self.promotion.promote(&session).await?)
        } else {
            None
        };
        Ok(CreatedUpload { session, completed })
    }

    /// Writes `data` at `offset`, promoting the upload once the last byte lands.
    pub async fn write_chunk(
        &self,
        session_id: &str,
        owner_id: Option<&str>,
        offset: u64,
        data: &[u8],
    ) -> UploadResult<ChunkOutcome> {
        let owner_id = owner_id.ok_or(UploadError::Unauthorized)?;
        let guard = self.locks.lock(session_id).await;

        let result = self.write_locked(session_id, owner_id, offset, data).await;
        if matches!(result, Ok(ChunkOutcome::Completed { .. }) | Err(UploadError::NotFound)) {
            self.locks.release(session_id, guard);
        }
        result
    }

    async fn write_locked(
        &self,
        session_id: &str,
        owner_id: &str,
        offset: u64,
        data: &[u8],
    ) -> UploadResult<ChunkOutcome> {
        let mut session = self.live_session(session_id).await?;
        if session.owner_id != owner_id {
            tracing::warn!(session_id, owner_id, "Rejected chunk from non-owner");
            return Err(UploadError::Unauthorized);
        }
        if offset != session.offset {
            return Err(UploadError::OffsetMismatch {
                expected: session.offset,
                got: offset,
            });
        }
        let len = data.len() as u64;
        if offset.saturating_add(len) > session.size {
            return Err(UploadError::ChunkOverflow {
                offset,
                len,
                size: session.size,
            });
        }

        if data.is_empty() {
            return self.finish_if_complete(session).await;
        }

        match self.staging.current_len(&session.file_path).await? {
            Some(on_disk) if on_disk == session.offset => {}
            None if session.offset == 0 => {
                if let Some(dir) = session.staging_dir() {
                    self.staging.ensure_dir(dir).await?;
                }
                self.staging.create_file(&session.file_path).await?;
            }
            on_disk => {
                tracing::warn!(
                    session_id,
                    path = %session.file_path.display(),
                    expected = session.offset,
                    ?on_disk,
                    "Staged file does not match session offset, dropping session"
                );
                self.staging.remove_file(&session.file_path).await?;
                self.store.delete(session_id).await?;
                return Err(UploadError::NotFound);
            }
        }

        session.offset = self.staging.write_at(&session.file_path, offset, data).await?;
        session.expires_at = expiry_from(self.ttl);
        self.store.put(session_id, &session, self.ttl).await?;

        tracing::debug!(session_id, offset = session.offset, size = session.size, "Stored chunk");
        self.finish_if_complete(session).await
    }

    async fn finish_if_complete(&self, session: UploadSession) -> UploadResult<ChunkOutcome> {
        if !session.is_complete() {
            return Ok(ChunkOutcome::InProgress {
                offset: session.offset,
            });
        }
        let file = self.promotion.promote(&session).await?;
        Ok(ChunkOutcome::Completed {
            offset: session.offset,
            file,
        })
    }

    /// Current offset and length of an upload.
    pub async fn head_status(&self, session_id: &str) -> UploadResult<UploadSession> {
        self.live_session(session_id).await
    }

    /// Cancels an upload, removing its staged bytes.
    pub async fn terminate(&self, session_id: &str, owner_id: Option<&str>) -> UploadResult<()> {
        let owner_id = owner_id.ok_or(UploadError::Unauthorized)?;
        let guard = self.locks.lock(session_id).await;

        let session = match self.live_session(session_id).await {
            Ok(session) => session,
            Err(e) => {
                self.locks.release(session_id, guard);
                return Err(e);
            }
        };
        if session.owner_id != owner_id {
            return Err(UploadError::Unauthorized);
        }

        self.staging.remove_file(&session.file_path).await?;
        self.store.delete(session_id).await?;
        self.locks.release(session_id, guard);
        tracing::info!(session_id, owner_id, "Terminated upload");
        Ok(())
    }

    async fn live_session(&self, session_id: &str) -> UploadResult<UploadSession> {
        match self.store.get(session_id).await? {
            Some(session) if session.completed_at.is_none() => Ok(session),
            _ => Err(UploadError::NotFound),
        }
    }
}

fn metadata_segment(metadata: &BTreeMap<String, String>, key: &str) -> Option<String> {
    metadata
        .get(key)
        .map(|value| sanitize_file_name(value))
        .filter(|value| !value.is_empty())
}
