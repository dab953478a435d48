use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Which backend holds upload session metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStoreKind {
    Memory,
    File,
}

impl SessionStoreKind {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "memory" | "apcu" => Some(Self::Memory),
            "file" => Some(Self::File),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::File => "file",
        }
    }
}

/// Runtime configuration for the upload service
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Staging root; each owner gets `<tmp_path>/<owner_id>/` (default: system temp dir + crate name)
    pub tmp_path: PathBuf,

    /// Permanent storage root; files land in `<dest_path>/<content_id>/<field_key>/`
    pub dest_path: PathBuf,

    /// Session store backend: "memory" or "file" (default: "memory")
    pub session_store: SessionStoreKind,

    /// Directory used by the file session store
    pub session_store_path: PathBuf,

    /// Session TTL in seconds (default: 86400)
    pub cache_ttl_secs: u64,

    /// Maximum upload size in bytes (default: 1 GB)
    pub max_file_size: u64,

    /// Mount point of the tus endpoint (default: "wp-tus")
    pub api_path: String,

    /// Mount point of download and cleanup routes (default: "uploads")
    pub base_path: String,

    /// Key for download tokens
    pub download_secret: String,

    /// JWT Secret Key
    pub jwt_secret: String,

    /// Allowed CORS Origins (comma separated)
    pub allowed_origins: Vec<String>,

    /// Interval of the expired-staging sweep in seconds, 0 disables it (default: 3600)
    pub worker_interval_secs: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        let tmp_root = env::temp_dir().join(env!("CARGO_PKG_NAME"));
        Self {
            tmp_path: tmp_root.join("tmp"),
            dest_path: PathBuf::from("./data/uploads"),
            session_store: SessionStoreKind::Memory,
            session_store_path: tmp_root.join("sessions"),
            cache_ttl_secs: 86_400,
            max_file_size: 1024 * 1024 * 1024, // 1 GB
            api_path: "wp-tus".to_string(),
            base_path: "uploads".to_string(),
            download_secret: "secret".to_string(),
            jwt_secret: "secret".to_string(),
            allowed_origins: vec![
                "http://localhost:3000".to_string(),
                "http://localhost:5173".to_string(), // Vite default
                "http://127.0.0.1:3000".to_string(),
            ],
            worker_interval_secs: 3600,
        }
    }
}

impl UploadConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            tmp_path: env::var("TMP_PATH")
                .map(PathBuf::from)
                .unwrap_or(default.tmp_path),

            dest_path: env::var("DEST_PATH")
                .map(PathBuf::from)
                .unwrap_or(default.dest_path),

            session_store: env::var("SESSION_STORE")
                .ok()
                .and_then(|v| SessionStoreKind::parse(&v))
                .unwrap_or(default.session_store),

            session_store_path: env::var("SESSION_STORE_PATH")
                .map(PathBuf::from)
                .unwrap_or(default.session_store_path),

            cache_ttl_secs: env::var("CACHE_TTL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.cache_ttl_secs),

            max_file_size: env::var("MAX_FILE_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.max_file_size),

            api_path: env::var("API_PATH")
                .map(|v| v.trim_matches('/').to_string())
                .unwrap_or(default.api_path),

            base_path: env::var("BASE_PATH")
                .map(|v| v.trim_matches('/').to_string())
                .unwrap_or(default.base_path),

            download_secret: env::var("DOWNLOAD_SECRET").unwrap_or(default.download_secret),

            jwt_secret: env::var("JWT_SECRET").unwrap_or(default.jwt_secret), // Fallback for dev convenience, strictly enforced in production method

            allowed_origins: env::var("ALLOWED_ORIGINS")
                .ok()
                .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or(default.allowed_origins),

            worker_interval_secs: env::var("WORKER_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.worker_interval_secs),
        }
    }

    /// Create config for development (in-memory sessions, short TTL, local roots)
    pub fn development() -> Self {
        Self {
            dest_path: PathBuf::from("./data/dev-uploads"),
            cache_ttl_secs: 3600,
            worker_interval_secs: 300,
            ..Self::default()
        }
    }

    /// Create config for production (secrets are mandatory)
    pub fn production() -> Self {
        let from_env = Self::from_env();
        Self {
            jwt_secret: env::var("JWT_SECRET").expect("CRITICAL: JWT_SECRET must be set"),
            download_secret: env::var("DOWNLOAD_SECRET")
                .expect("CRITICAL: DOWNLOAD_SECRET must be set"),
            ..from_env
        }
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}
