use std::path::{Path, PathBuf};

pub const DATA_FILE_SUFFIX: &str = "lumbung.db";
pub const LOG_FILE_SUFFIX: &str = "lumbung.log";
pub const DEFAULT_RECOVERY_EXTENSION: &str = "lumbung";

#[derive(Debug, Clone, PartialEq)]
pub struct DatabaseConfig {
    /// fsync the log when a transaction commits.
    pub sync_on_commit: bool,
    /// LOB-typed values up to this many bytes stay inline in the row.
    pub lob_inline_threshold: usize,
    /// Checkpoint automatically once the log grows past this many bytes.
    pub checkpoint_log_bytes: u64,
    /// Flush cached dirty pages once this many accumulate.
    pub cache_dirty_limit: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            sync_on_commit: true,
            lob_inline_threshold: 256,
            checkpoint_log_bytes: 4 << 20,
            cache_dirty_limit: 1024,
        }
    }
}

impl DatabaseConfig {
    pub fn with_sync_on_commit(mut self, sync_on_commit: bool) -> Self {
        self.sync_on_commit = sync_on_commit;
        self
    }

    pub fn with_lob_inline_threshold(mut self, threshold: usize) -> Self {
        self.lob_inline_threshold = threshold;
        self
    }

    pub fn with_checkpoint_log_bytes(mut self, bytes: u64) -> Self {
        self.checkpoint_log_bytes = bytes;
        self
    }

    pub fn with_cache_dirty_limit(mut self, pages: usize) -> Self {
        self.cache_dirty_limit = pages;
        self
    }
}

pub fn data_file_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}.{}", name, DATA_FILE_SUFFIX))
}

/// The log lives next to the data file: `x.lumbung.db` -> `x.lumbung.log`.
pub fn log_file_path(data_path: &Path) -> PathBuf {
    data_path.with_extension("log")
}
