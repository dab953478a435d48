use crate::error::{UploadError, UploadResult};
use crate::models::{DestinationFile, DestinationTarget, UploadSession, ValidatedPaths};
use crate::services::download::DownloadAddressing;
use crate::services::session_store::{SessionStore, sessions_under};
use crate::services::staging::{StagingArea, client_file_name, path_exists};
use crate::utils::validation::{sanitize_file_name, split_file_name};
use chrono::Utc;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;

/// Rewrites the default destination root for a target: `(target, default_root) -> root`.
pub type DestinationResolver = Arc<dyn Fn(&DestinationTarget, &Path) -> PathBuf + Send + Sync>;

/// Builds the candidate name for collision attempt `n`: `(stem, extension, n) -> file name`.
pub type CandidateNamer = Arc<dyn Fn(&str, Option<&str>, u32) -> String + Send + Sync>;

const MAX_NAME_ATTEMPTS: u32 = 10_000;

/// Extension points injected from configuration.
#[derive(Clone, Default)]
pub struct PromotionHooks {
    pub destination: Option<DestinationResolver>,
    pub candidate_name: Option<CandidateNamer>,
}

/// `stem-n.ext`, or `stem-n` without an extension.
pub fn default_candidate_name(stem: &str, ext: Option<&str>, n: u32) -> String {
    match ext {
        Some(ext) => format!("{}-{}.{}", stem, n, ext),
        None => format!("{}-{}", stem, n),
    }
}

/// Moves completed uploads from staging into permanent storage.
#[derive(Clone)]
pub struct PromotionEngine {
    dest_root: PathBuf,
    staging: StagingArea,
    store: Arc<dyn SessionStore>,
    addressing: DownloadAddressing,
    hooks: PromotionHooks,
}

impl PromotionEngine {
    pub fn new(
        dest_root: impl Into<PathBuf>,
        staging: StagingArea,
        store: Arc<dyn SessionStore>,
        addressing: DownloadAddressing,
        hooks: PromotionHooks,
    ) -> Self {
        Self {
            dest_root: dest_root.into(),
            staging,
            store,
            addressing,
            hooks,
        }
    }

    /// `<override or resolved root>/<content_id>/<field_key>`
    pub fn destination_dir(&self, target: &DestinationTarget) -> PathBuf {
        self.content_root(target).join(&target.field_key)
    }

    fn content_root(&self, target: &DestinationTarget) -> PathBuf {
        let root = match (&target.dest_override, &self.hooks.destination) {
            (Some(dir), _) => dir.clone(),
            (None, Some(resolve)) => resolve(target, self.dest_root.as_path()),
            (None, None) => self.dest_root.clone(),
        };
        root.join(&target.content_id)
    }

    /// First free name in `dir`, trying `file_name` then the numbered candidates.
    pub async fn resolve_collision(&self, dir: &Path, file_name: &str) -> UploadResult<String> {
        let (stem, ext) = split_file_name(file_name);
        let mut candidate = file_name.to_string();
        let mut n = 0;

        while path_exists(&dir.join(&candidate)).await? {
            n += 1;
            if n > MAX_NAME_ATTEMPTS {
                return Err(UploadError::io(
                    "resolve file name",
                    dir.join(file_name),
                    std::io::Error::new(
                        std::io::ErrorKind::AlreadyExists,
                        "no free file name left",
                    ),
                ));
            }
            candidate = match &self.hooks.candidate_name {
                Some(name) => sanitize_file_name(&name(&stem, ext.as_deref(), n)),
                None => default_candidate_name(&stem, ext.as_deref(), n),
            };
        }

        Ok(candidate)
    }

    /// Checks a candidate field value against staging and destination.
    ///
    /// A value is valid when the file is staged (a new upload) or already
    /// present in the destination (an unchanged value).
    pub async fn validate(
        &self,
        candidate: &str,
        staging_dir: &Path,
        target: &DestinationTarget,
    ) -> UploadResult<ValidatedPaths> {
        let file_name = sanitize_file_name(candidate);
        if file_name.is_empty() {
            return Ok(ValidatedPaths::default());
        }

        let dest_dir = self.destination_dir(target);
        match self.staging.find_staged(staging_dir, &file_name).await? {
            Some(staged) => self.staged_paths(staged, file_name, &dest_dir).await,
            None if path_exists(&dest_dir.join(&file_name)).await? => Ok(ValidatedPaths {
                valid: true,
                resolved_dest: Some(dest_dir.join(&file_name)),
                file_name,
                staged: None,
            }),
            None => Ok(ValidatedPaths {
                file_name,
                ..ValidatedPaths::default()
            }),
        }
    }

    async fn staged_paths(
        &self,
        staged: PathBuf,
        file_name: String,
        dest_dir: &Path,
    ) -> UploadResult<ValidatedPaths> {
        let resolved = self.resolve_collision(dest_dir, &file_name).await?;
        Ok(ValidatedPaths {
            valid: true,
            resolved_dest: Some(dest_dir.join(resolved)),
            file_name,
            staged: Some(staged),
        })
    }

    /// Moves a validated staged file into place and returns the final file name.
    pub async fn commit(&self, paths: &ValidatedPaths) -> UploadResult<String> {
        let Some(dest) = paths.resolved_dest.as_ref().filter(|_| paths.valid) else {
            return Err(UploadError::InvalidRequest("Value was not validated".to_string()));
        };
        let dest_dir = dest
            .parent()
            .ok_or_else(|| UploadError::InvalidRequest("Destination has no directory".to_string()))?;

        let Some(staged) = &paths.staged else {
            return final_name(dest);
        };

        let staged_name = staged.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        if client_file_name(staged_name) != paths.file_name {
            return Err(UploadError::PathIntegrity {
                expected: paths.file_name.clone(),
                found: staged_name.to_string(),
            });
        }

        fs::create_dir_all(dest_dir)
            .await
            .map_err(|e| UploadError::io("create destination dir", dest_dir, e))?;

        // rename() replaces silently, so re-check a name taken since validation
        let dest = if path_exists(dest).await? {
            let wanted = final_name(dest)?;
            dest_dir.join(self.resolve_collision(dest_dir, &wanted).await?)
        } else {
            dest.clone()
        };

        fs::rename(staged, &dest).await.map_err(|e| {
            tracing::error!(
                from = %staged.display(),
                to = %dest.display(),
                "Failed to move staged file: {}",
                e
            );
            UploadError::io_move("move staged file", staged, &dest, e)
        })?;

        final_name(&dest)
    }

    /// Promotes a completed session. Runs at most once per session.
    pub async fn promote(&self, session: &UploadSession) -> UploadResult<DestinationFile> {
        let stored = self
            .store
            .get(&session.id)
            .await?
            .ok_or(UploadError::AlreadyPromoted)?;
        if stored.completed_at.is_some() {
            return Err(UploadError::AlreadyPromoted);
        }
        if !stored.is_complete() {
            return Err(UploadError::InvalidRequest(format!(
                "Upload incomplete: {} of {} bytes",
                stored.offset, stored.size
            )));
        }

        let staging_dir = stored
            .staging_dir()
            .map(Path::to_path_buf)
            .ok_or_else(|| UploadError::PathIntegrity {
                expected: stored.file_name.clone(),
                found: stored.file_path.display().to_string(),
            })?;

        let staged_name = stored
            .file_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let staged_exists = path_exists(&stored.file_path).await?;
        if !staged_exists || client_file_name(&staged_name) != stored.file_name {
            tracing::error!(
                session_id = %stored.id,
                expected = %stored.file_path.display(),
                staged_exists,
                "Staged file does not match session metadata"
            );
            return Err(UploadError::PathIntegrity {
                expected: stored.file_name.clone(),
                found: staged_name,
            });
        }
        let paths = self
            .staged_paths(
                stored.file_path.clone(),
                stored.file_name.clone(),
                &self.destination_dir(&stored.target),
            )
            .await?;

        // Claim the session so a concurrent attempt sees it as promoted
        let mut claimed = stored.clone();
        claimed.completed_at = Some(Utc::now());
        self.store
            .put(&claimed.id, &claimed, remaining_ttl(&claimed))
            .await?;

        let final_name = match self.commit(&paths).await {
            Ok(name) => name,
            Err(e) => {
                if let Err(restore) = self
                    .store
                    .put(&stored.id, &stored, remaining_ttl(&stored))
                    .await
                {
                    tracing::warn!(session_id = %stored.id, "Failed to release session claim: {}", restore);
                }
                return Err(e);
            }
        };

        let dest_dir = self.destination_dir(&stored.target);
        let path = dest_dir.join(&final_name);
        tracing::info!(
            session_id = %stored.id,
            owner_id = %stored.owner_id,
            field = %stored.field_name,
            dest = %path.display(),
            "Promoted upload"
        );

        match self.staging.purge_siblings(&staging_dir, None).await {
            Ok(0) => {}
            Ok(n) => tracing::info!(dir = %staging_dir.display(), "Purged {} leftover staged files", n),
            Err(e) => tracing::warn!(dir = %staging_dir.display(), "Failed to purge staging dir: {}", e),
        }

        if let Err(e) = self.invalidate_siblings(&stored.id, &staging_dir).await {
            tracing::warn!(session_id = %stored.id, "Failed to invalidate stale sessions: {}", e);
        }

        if let Err(e) = self.store.delete(&stored.id).await {
            tracing::warn!(session_id = %stored.id, "Failed to delete promoted session: {}", e);
        }

        let size = fs::metadata(&path).await.map(|m| m.len()).unwrap_or(stored.size);
        Ok(DestinationFile {
            token: self.addressing.token_for(&path, &stored.target.content_id),
            path,
            file_name: final_name,
            size,
            content_id: stored.target.content_id.clone(),
            field_key: stored.target.field_key.clone(),
        })
    }

    /// Deletes other sessions staged under the same owner/field directory.
    async fn invalidate_siblings(&self, session_id: &str, staging_dir: &Path) -> UploadResult<usize> {
        if !self.store.capabilities().enumerate_keys {
            tracing::debug!(store = self.store.name(), "Store cannot enumerate keys, skipping invalidation");
            return Ok(0);
        }

        let mut removed = 0;
        for stale in sessions_under(self.store.as_ref(), staging_dir).await? {
            if stale.id == session_id {
                continue;
            }
            self.store.delete(&stale.id).await?;
            tracing::debug!(session_id = %stale.id, "Invalidated superseded session");
            removed += 1;
        }
        Ok(removed)
    }

    /// Deletes files of the field that the saved value no longer references.
    pub async fn prune_destination(
        &self,
        target: &DestinationTarget,
        keep: &[String],
    ) -> UploadResult<usize> {
        let dir = self.destination_dir(target);
        let keep: BTreeSet<&str> = keep.iter().map(String::as_str).collect();

        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(UploadError::io("read destination dir", &dir, e)),
        };

        let mut removed = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| UploadError::io("read destination dir", &dir, e))?
        {
            let path = entry.path();
            let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
            let name = entry.file_name();
            if !is_file || keep.contains(name.to_string_lossy().as_ref()) {
                continue;
            }
            match fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) => tracing::warn!(path = %path.display(), "Failed to prune file: {}", e),
            }
        }
        Ok(removed)
    }

    /// Removes the whole destination directory of one field value.
    pub async fn remove_field_storage(&self, target: &DestinationTarget) -> UploadResult<()> {
        remove_dir_if_present(&self.destination_dir(target)).await
    }

    /// Removes every destination directory of a deleted content record.
    pub async fn remove_content_storage(
        &self,
        content_id: &str,
        targets: &[DestinationTarget],
    ) -> UploadResult<usize> {
        let mut roots = BTreeSet::new();
        roots.insert(self.dest_root.join(content_id));
        for target in targets.iter().filter(|t| t.content_id == content_id) {
            roots.insert(self.content_root(target));
        }

        let mut removed = 0;
        for root in roots {
            if path_exists(&root).await? {
                remove_dir_if_present(&root).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn final_name(path: &Path) -> UploadResult<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| UploadError::InvalidRequest("Destination has no file name".to_string()))
}

async fn remove_dir_if_present(dir: &Path) -> UploadResult<()> {
    match fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(UploadError::io("remove destination dir", dir, e)),
    }
}

pub(crate) fn remaining_ttl(session: &UploadSession) -> Duration {
    (session.expires_at - Utc::now())
        .to_std()
        .unwrap_or(Duration::ZERO)
}
