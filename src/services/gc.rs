use crate::error::UploadResult;
use crate::models::SweepReport;
use crate::services::session_store::SessionStore;
use crate::services::staging::StagingArea;
use chrono::Utc;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Reclaims staging directories of abandoned uploads.
#[derive(Clone)]
pub struct GarbageCollector {
    staging: StagingArea,
    store: Arc<dyn SessionStore>,
    ttl: Duration,
}

impl GarbageCollector {
    pub fn new(staging: StagingArea, store: Arc<dyn SessionStore>, ttl: Duration) -> Self {
        Self { staging, store, ttl }
    }

    /// Removes the caller's field directories that no live session is writing to.
    pub async fn sweep_idle(&self, owner_id: &str) -> UploadResult<SweepReport> {
        let owner_root = self.staging.owner_root(owner_id);
        let report = self.sweep_owner_root(&owner_root, false).await?;
        tracing::info!(
            owner_id,
            removed = report.directories_removed,
            kept = report.directories_kept,
            sessions = report.sessions_removed,
            "Swept idle staging directories"
        );
        Ok(report)
    }

    /// Sweeps every owner root, sparing directories touched within the TTL.
    /// Empty owner roots are removed too.
    pub async fn sweep_expired(&self) -> UploadResult<SweepReport> {
        let mut total = SweepReport::default();
        for owner_root in self.staging.list_dirs(self.staging.root()).await? {
            let report = match self.sweep_owner_root(&owner_root, true).await {
                Ok(report) => report,
                Err(e) => {
                    tracing::warn!(dir = %owner_root.display(), "Failed to sweep owner root: {}", e);
                    total.failures += 1;
                    continue;
                }
            };
            total.directories_removed += report.directories_removed;
            total.directories_kept += report.directories_kept;
            total.sessions_removed += report.sessions_removed;
            total.failures += report.failures;

            if report.directories_kept == 0 && is_empty_dir(&owner_root).await {
                if let Err(e) = self.staging.remove_dir(&owner_root).await {
                    tracing::warn!(dir = %owner_root.display(), "Failed to remove owner root: {}", e);
                }
            }
        }

        tracing::info!(
            removed = total.directories_removed,
            kept = total.directories_kept,
            sessions = total.sessions_removed,
            failures = total.failures,
            "Garbage collection finished"
        );
        Ok(total)
    }

    async fn sweep_owner_root(&self, owner_root: &Path, spare_recent: bool) -> UploadResult<SweepReport> {
        let mut report = SweepReport::default();
        let dirs = self.staging.list_dirs(owner_root).await?;
        if dirs.is_empty() {
            return Ok(report);
        }

        let enumerable = self.store.capabilities().enumerate_keys;
        let mut sessions = Vec::new();
        if enumerable {
            for key in self.store.keys().await? {
                if let Some(session) = self.store.get(&key).await? {
                    if session.file_path.starts_with(owner_root) {
                        sessions.push(session);
                    }
                }
            }
        }

        let now = Utc::now();
        let live: BTreeSet<PathBuf> = sessions
            .iter()
            .filter(|s| s.is_live(now))
            .filter_map(|s| s.staging_dir().map(Path::to_path_buf))
            .collect();

        for dir in dirs {
            let keep = if enumerable {
                live.contains(&dir) || (spare_recent && self.recently_touched(&dir).await)
            } else {
                self.recently_touched(&dir).await
            };
            if keep {
                report.directories_kept += 1;
                continue;
            }

            if let Err(e) = self.staging.remove_dir(&dir).await {
                tracing::warn!(dir = %dir.display(), "Failed to remove staging dir: {}", e);
                report.failures += 1;
                continue;
            }
            report.directories_removed += 1;

            for session in sessions.iter().filter(|s| s.file_path.starts_with(&dir)) {
                match self.store.delete(&session.id).await {
                    Ok(()) => report.sessions_removed += 1,
                    Err(e) => {
                        tracing::warn!(session_id = %session.id, "Failed to delete session: {}", e);
                        report.failures += 1;
                    }
                }
            }
        }

        Ok(report)
    }

    /// Fallback liveness check when the store cannot list sessions.
    async fn recently_touched(&self, dir: &Path) -> bool {
        let Ok(meta) = tokio::fs::metadata(dir).await else {
            return false;
        };
        let Ok(modified) = meta.modified() else {
            return true;
        };
        SystemTime::now()
            .duration_since(modified)
            .map(|age| age < self.ttl)
            .unwrap_or(true)
    }
}

async fn is_empty_dir(dir: &Path) -> bool {
    match tokio::fs::read_dir(dir).await {
        Ok(mut entries) => matches!(entries.next_entry().await, Ok(None)),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DestinationTarget, UploadSession};
    use crate::services::session_store::{MemorySessionStore, StoreCapabilities};
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn session(id: &str, path: PathBuf, offset: u64, size: u64) -> UploadSession {
        UploadSession {
            id: id.to_string(),
            field_name: "doc".to_string(),
            owner_id: "7".to_string(),
            file_name: "a.txt".to_string(),
            file_path: path,
            offset,
            size,
            target: DestinationTarget {
                content_id: "7".to_string(),
                field_key: "doc".to_string(),
                dest_override: None,
            },
            metadata: BTreeMap::new(),
            created_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::hours(1),
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn test_sweep_idle_keeps_live_sessions() {
        let tmp = TempDir::new().unwrap();
        let staging = StagingArea::new(tmp.path());
        let store = Arc::new(MemorySessionStore::new());
        let gc = GarbageCollector::new(staging.clone(), store.clone(), Duration::from_secs(3600));

        let live_dir = staging.ensure_field_dir("7", "doc").await.unwrap();
        let stale_dir = staging.ensure_field_dir("7", "photo").await.unwrap();
        let other_owner = staging.ensure_field_dir("8", "doc").await.unwrap();

        store
            .put("live", &session("live", live_dir.join("a.txt"), 10, 100), Duration::from_secs(60))
            .await
            .unwrap();
        store
            .put("done", &session("done", stale_dir.join("b.txt"), 100, 100), Duration::from_secs(60))
            .await
            .unwrap();

        let report = gc.sweep_idle("7").await.unwrap();

        assert_eq!(report.directories_removed, 1);
        assert_eq!(report.directories_kept, 1);
        assert_eq!(report.sessions_removed, 1);
        assert!(live_dir.exists());
        assert!(!stale_dir.exists());
        assert!(other_owner.exists());
        assert!(store.get("live").await.unwrap().is_some());
        assert!(store.get("done").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sweep_expired_covers_all_owners() {
        let tmp = TempDir::new().unwrap();
        let staging = StagingArea::new(tmp.path());
        let store = Arc::new(MemorySessionStore::new());
        let gc = GarbageCollector::new(staging.clone(), store.clone(), Duration::ZERO);

        let abandoned = staging.ensure_field_dir("8", "doc").await.unwrap();
        let live_dir = staging.ensure_field_dir("9", "doc").await.unwrap();
        store
            .put("live", &session("live", live_dir.join("a.txt"), 0, 5), Duration::from_secs(60))
            .await
            .unwrap();

        let report = gc.sweep_expired().await.unwrap();

        assert_eq!(report.directories_removed, 1);
        assert!(!abandoned.exists());
        assert!(!staging.owner_root("8").exists());
        assert!(live_dir.exists());

        // Recently touched directories survive the periodic sweep
        let recent = staging.ensure_field_dir("10", "doc").await.unwrap();
        let patient = GarbageCollector::new(staging.clone(), store, Duration::from_secs(3600));
        let report = patient.sweep_expired().await.unwrap();
        assert_eq!(report.directories_removed, 0);
        assert!(recent.exists());
    }

    struct OpaqueStore(MemorySessionStore);

    #[async_trait]
    impl SessionStore for OpaqueStore {
        async fn get(&self, id: &str) -> UploadResult<Option<UploadSession>> {
            self.0.get(id).await
        }
        async fn put(&self, id: &str, session: &UploadSession, ttl: Duration) -> UploadResult<()> {
            self.0.put(id, session, ttl).await
        }
        async fn delete(&self, id: &str) -> UploadResult<()> {
            self.0.delete(id).await
        }
        async fn keys(&self) -> UploadResult<Vec<String>> {
            Ok(Vec::new())
        }
        fn capabilities(&self) -> StoreCapabilities {
            StoreCapabilities {
                enumerate_keys: false,
            }
        }
        fn name(&self) -> &'static str {
            "opaque"
        }
    }

    #[tokio::test]
    async fn test_opaque_store_falls_back_to_mtime() {
        let tmp = TempDir::new().unwrap();
        let staging = StagingArea::new(tmp.path());
        let store = Arc::new(OpaqueStore(MemorySessionStore::new()));

        let dir = staging.ensure_field_dir("7", "doc").await.unwrap();

        let fresh = GarbageCollector::new(staging.clone(), store.clone(), Duration::from_secs(3600));
        let report = fresh.sweep_idle("7").await.unwrap();
        assert_eq!(report.directories_kept, 1);
        assert!(dir.exists());

        let eager = GarbageCollector::new(staging.clone(), store, Duration::ZERO);
        let report = eager.sweep_idle("7").await.unwrap();
        assert_eq!(report.directories_removed, 1);
        assert!(!dir.exists());
    }
}
