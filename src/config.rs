//! Engine configuration and shared protocol constants

use std::path::PathBuf;
use std::time::Duration;

// Read granularity for hashing and for draining response bodies (64 KiB).
// Matches the streaming checksum loop so memory stays flat on large files.
pub const IO_CHUNK_SIZE: usize = 64 * 1024;

// Transfer chunk size (10 MB). Files are split into ceil(size / chunk)
// pieces and moved one piece at a time.
pub const TRANSFER_CHUNK_SIZE: u64 = 10 * 1024 * 1024;

// Oldest server API release this engine understands. The server reports
// its version as "<major>.<minor>" from /ping.
pub const API_VERSION_MAJOR: u32 = 2019;
pub const API_VERSION_MINOR: u32 = 3;

// Metadata lives in <project>/.mergin/mergin.json
pub const METADATA_DIR: &str = ".mergin";
pub const METADATA_FILE: &str = "mergin.json";

pub const DEFAULT_API_ROOT: &str = "https://public.cloudmergin.com";

// SQLite side-files are transient and must never sync.
pub const DEFAULT_IGNORE_EXTENSIONS: &[&str] = &["gpkg-shm", "gpkg-wal"];

pub mod retry {
    use std::time::Duration;

    // Attempts per chunk exchange before the sync fails.
    pub const MAX_ATTEMPTS: u32 = 3;

    // First backoff delay; doubles per attempt.
    pub const BASE_DELAY: Duration = Duration::from_millis(500);

    // Delay before attempt `n` (1-based; attempt 1 has no delay).
    pub fn delay_for_attempt(base: Duration, attempt: u32) -> Duration {
        base * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

/// Knobs for a [`crate::client::MerginClient`]. `chunk_size` and the retry
/// settings exist mainly so tests can shrink them; production callers keep
/// the defaults.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server root, e.g. `https://public.cloudmergin.com`.
    pub api_root: String,
    /// Directory that holds one subdirectory per downloaded project.
    pub data_dir: PathBuf,
    /// File extensions excluded from listing, hashing and transfer.
    pub ignore_extensions: Vec<String>,
    pub chunk_size: u64,
    pub retry_limit: u32,
    pub retry_base_delay: Duration,
}

impl ClientConfig {
    pub fn new(api_root: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        ClientConfig {
            api_root: api_root.into(),
            data_dir: data_dir.into(),
            ignore_extensions: DEFAULT_IGNORE_EXTENSIONS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            chunk_size: TRANSFER_CHUNK_SIZE,
            retry_limit: retry::MAX_ATTEMPTS,
            retry_base_delay: retry::BASE_DELAY,
        }
    }

    /// Joins `path` onto the API root, normalizing slashes on the seam.
    pub fn endpoint(&self, path: &str) -> String {
        let root = self.api_root.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        format!("{root}/{path}")
    }

    pub fn expected_api_version(&self) -> String {
        format!("{API_VERSION_MAJOR}.{API_VERSION_MINOR}")
    }
}
