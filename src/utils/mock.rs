use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::{
    recovery::RecoveryConfig,
    storage::{
        config::{DatabaseConfig, data_file_path},
        database::Database,
    },
    types::error::DatabaseError,
};

/// A throwaway database directory for tests and benchmarks. The directory
/// and everything in it is removed on drop.
pub struct TempDatabase {
    dir: TempDir,
    name: String,
    database: Option<Database>,
}

impl TempDatabase {
    pub fn new() -> Result<Self, DatabaseError> {
        Self::with_prefix("lumbung")
    }

    pub fn with_prefix(prefix: &str) -> Result<Self, DatabaseError> {
        let dir = tempfile::Builder::new().prefix(prefix).tempdir()?;
        Ok(Self {
            dir,
            name: prefix.to_string(),
            database: None,
        })
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data_path(&self) -> PathBuf {
        data_file_path(self.dir(), &self.name)
    }

    pub fn recovery_config(&self) -> RecoveryConfig {
        RecoveryConfig::new(self.dir(), self.name.clone())
    }

    /// Open (or reopen) the database, closing any handle already held.
    pub fn open(&mut self, config: DatabaseConfig) -> Result<&Database, DatabaseError> {
        self.close()?;
        let database = Database::open(self.dir.path(), &self.name, config)?;
        Ok(self.database.insert(database))
    }

    pub fn database(&self) -> Option<&Database> {
        self.database.as_ref()
    }

    /// Checkpoint and release the current handle.
    pub fn close(&mut self) -> Result<(), DatabaseError> {
        match self.database.take() {
            Some(database) => database.close(),
            None => Ok(()),
        }
    }

    /// Drop the handle without a checkpoint, as a crash would.
    pub fn crash(&mut self) {
        self.database = None;
    }
}
