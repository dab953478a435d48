use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use utoipa::ToSchema;

/// Where a completed upload is promoted to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct DestinationTarget {
    /// Owning content record, first segment under the destination root
    pub content_id: String,
    /// Field key, second segment under the destination root
    pub field_key: String,
    /// Per-field root that replaces the configured destination root
    #[schema(value_type = Option<String>)]
    pub dest_override: Option<PathBuf>,
}

/// One resumable upload attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSession {
    pub id: String,
    pub field_name: String,
    pub owner_id: String,
    pub file_name: String,
    pub file_path: PathBuf,
    pub offset: u64,
    pub size: u64,
    pub target: DestinationTarget,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl UploadSession {
    pub fn is_complete(&self) -> bool {
        self.offset == self.size
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Incomplete and within its TTL.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        !self.is_complete() && self.completed_at.is_none() && !self.is_expired(now)
    }

    pub fn staging_dir(&self) -> Option<&Path> {
        self.file_path.parent()
    }
}

/// A promoted file in permanent storage.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct DestinationFile {
    #[serde(skip)]
    pub path: PathBuf,
    pub file_name: String,
    pub size: u64,
    pub content_id: String,
    pub field_key: String,
    pub token: String,
}

/// Outcome of validating a candidate field value against staging and destination.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidatedPaths {
    pub valid: bool,
    pub file_name: String,
    pub staged: Option<PathBuf>,
    pub resolved_dest: Option<PathBuf>,
}

/// Counts reported by a garbage collection pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct SweepReport {
    pub directories_removed: usize,
    pub directories_kept: usize,
    pub sessions_removed: usize,
    pub failures: usize,
}
