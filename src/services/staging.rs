use crate::error::{UploadError, UploadResult};
use crate::utils::validation::sanitize_file_name;
use sha2::{Digest, Sha256};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

/// Length of a simple-format session id (`Uuid::simple`).
const SESSION_ID_LEN: usize = 32;

/// Maps an owner id to the name of its staging directory.
///
/// Ids that are already safe path segments are used as they are. Any other id
/// becomes `~` followed by the SHA-256 of the id; `~` never survives
/// sanitizing, so the two forms cannot collide.
pub fn owner_dir_name(owner_id: &str) -> String {
    if !owner_id.is_empty() && sanitize_file_name(owner_id) == owner_id {
        return owner_id.to_string();
    }
    format!("~{}", hex::encode(Sha256::digest(owner_id.as_bytes())))
}

/// On-disk name of a session's staged file: `<session_id>-<file_name>`.
pub fn staged_file_name(session_id: &str, file_name: &str) -> String {
    format!("{}-{}", session_id, file_name)
}

/// Client file name of a staged file, with the session id prefix removed.
pub fn client_file_name(disk_name: &str) -> &str {
    match disk_name.split_at_checked(SESSION_ID_LEN) {
        Some((id, rest))
            if id.bytes().all(|b| b.is_ascii_hexdigit()) && rest.len() > 1 && rest.starts_with('-') =>
        {
            &rest[1..]
        }
        _ => disk_name,
    }
}

/// `try_exists` that reports stat failures instead of treating them as absent.
pub async fn path_exists(path: &Path) -> UploadResult<bool> {
    fs::try_exists(path)
        .await
        .map_err(|e| UploadError::io("stat path", path, e))
}

/// Temporary storage for in-progress uploads, laid out as
/// `<root>/<owner dir>/<field_name>/<session_id>-<file_name>`.
#[derive(Debug, Clone)]
pub struct StagingArea {
    root: PathBuf,
}

impl StagingArea {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Staging root of one caller. Cleanup never reaches outside it.
    pub fn owner_root(&self, owner_id: &str) -> PathBuf {
        self.root.join(owner_dir_name(owner_id))
    }

    pub fn field_dir(&self, owner_id: &str, field_name: &str) -> PathBuf {
        self.owner_root(owner_id).join(field_name)
    }

    pub async fn ensure_field_dir(&self, owner_id: &str, field_name: &str) -> UploadResult<PathBuf> {
        let dir = self.field_dir(owner_id, field_name);
        self.ensure_dir(&dir).await?;
        Ok(dir)
    }

    pub async fn ensure_dir(&self, dir: &Path) -> UploadResult<()> {
        if !path_exists(dir).await? {
            fs::create_dir_all(dir)
                .await
                .map_err(|e| UploadError::io("create staging dir", dir, e))?;
            tracing::debug!(dir = %dir.display(), "Created staging directory");
        }
        Ok(())
    }

    /// Creates an empty staged file. Fails if the file already exists.
    pub async fn create_file(&self, path: &Path) -> UploadResult<()> {
        fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await
            .map_err(|e| UploadError::io("create staged file", path, e))?;
        Ok(())
    }

    /// Newest staged file in `dir` whose client name is `file_name`.
    pub async fn find_staged(&self, dir: &Path, file_name: &str) -> UploadResult<Option<PathBuf>> {
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(UploadError::io("read staging dir", dir, e)),
        };

        let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| UploadError::io("read staging dir", dir, e))?
        {
            let disk_name = entry.file_name();
            if client_file_name(&disk_name.to_string_lossy()) != file_name {
                continue;
            }
            let meta = entry
                .metadata()
                .await
                .map_err(|e| UploadError::io("stat staged file", entry.path(), e))?;
            if !meta.is_file() {
                continue;
            }
            let modified = meta.modified().unwrap_or(std::time::UNIX_EPOCH);
            if newest.as_ref().is_none_or(|(seen, _)| modified >= *seen) {
                newest = Some((modified, entry.path()));
            }
        }
        Ok(newest.map(|(_, path)| path))
    }

    /// Writes `data` at `offset` and returns the new end of data.
    pub async fn write_at(&self, path: &Path, offset: u64, data: &[u8]) -> UploadResult<u64> {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .open(path)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => UploadError::NotFound,
                _ => UploadError::io("open staged file", path, e),
            })?;

        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| UploadError::io("seek staged file", path, e))?;
        file.write_all(data)
            .await
            .map_err(|e| UploadError::io("write staged file", path, e))?;
        file.sync_data()
            .await
            .map_err(|e| UploadError::io("sync staged file", path, e))?;

        Ok(offset + data.len() as u64)
    }

    /// Bytes currently on disk for a staged file, `None` when it is gone.
    pub async fn current_len(&self, path: &Path) -> UploadResult<Option<u64>> {
        match fs::metadata(path).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(UploadError::io("stat staged file", path, e)),
        }
    }

    /// Deletes every regular file in `dir` except `keep`. Returns how many were removed.
    pub async fn purge_siblings(&self, dir: &Path, keep: Option<&Path>) -> UploadResult<usize> {
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(UploadError::io("read staging dir", dir, e)),
        };

        let mut removed = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| UploadError::io("read staging dir", dir, e))?
        {
            let path = entry.path();
            if Some(path.as_path()) == keep {
                continue;
            }
            let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
            if !is_file {
                continue;
            }
            match fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) => {
                    tracing::warn!(path = %path.display(), "Failed to purge staged file: {}", e)
                }
            }
        }
        Ok(removed)
    }

    /// Subdirectories directly below `dir`.
    pub async fn list_dirs(&self, dir: &Path) -> UploadResult<Vec<PathBuf>> {
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(UploadError::io("read staging dir", dir, e)),
        };

        let mut dirs = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| UploadError::io("read staging dir", dir, e))?
        {
            if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                dirs.push(entry.path());
            }
        }
        Ok(dirs)
    }

    pub async fn remove_dir(&self, dir: &Path) -> UploadResult<()> {
        match fs::remove_dir_all(dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(UploadError::io("remove staging dir", dir, e)),
        }
    }

    pub async fn remove_file(&self, path: &Path) -> UploadResult<()> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(UploadError::io("remove staged file", path, e)),
        }
    }
}
