//! Offline recovery: rebuild a replayable script from the raw pages of a
//! database file, without going through the log or the indexes.

pub mod emit;
pub mod engine;
pub mod report;
pub mod scanner;

use std::{fmt, path::PathBuf};

pub use engine::RecoveryEngine;
pub use report::{RecoveryReport, RecoveryWarning};

use crate::{
    storage::config::{DEFAULT_RECOVERY_EXTENSION, data_file_path},
    types::error::DatabaseError,
};

#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryConfig {
    pub dir: PathBuf,
    pub name: String,
    /// Middle part of the script name: `<name>.<extension>.sql`.
    pub extension: String,
    /// Append the warnings as a trailing comment block.
    pub include_warnings_in_script: bool,
}

impl RecoveryConfig {
    pub fn new(dir: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            name: name.into(),
            extension: DEFAULT_RECOVERY_EXTENSION.to_string(),
            include_warnings_in_script: true,
        }
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    pub fn with_warnings_in_script(mut self, include: bool) -> Self {
        self.include_warnings_in_script = include;
        self
    }

    pub fn data_path(&self) -> PathBuf {
        data_file_path(&self.dir, &self.name)
    }

    pub fn script_path(&self) -> PathBuf {
        self.dir.join(format!("{}.{}.sql", self.name, self.extension))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RecoveryPhase {
    ScanSchema,
    ScanData,
    ScanLob,
    EmitScript,
    Done,
}

impl fmt::Display for RecoveryPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecoveryPhase::ScanSchema => "SCAN_SCHEMA",
            RecoveryPhase::ScanData => "SCAN_DATA",
            RecoveryPhase::ScanLob => "SCAN_LOB",
            RecoveryPhase::EmitScript => "EMIT_SCRIPT",
            RecoveryPhase::Done => "DONE",
        };
        f.write_str(name)
    }
}

/// Run every phase against `config` and write the script. Only a file that
/// cannot be opened or whose page size cannot be determined fails.
pub fn recover(config: &RecoveryConfig) -> Result<RecoveryReport, DatabaseError> {
    RecoveryEngine::open(config.clone())?.run()
}
