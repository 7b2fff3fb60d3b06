use std::{collections::BTreeMap, fmt, path::PathBuf};

use crate::{
    recovery::RecoveryPhase,
    types::{LobId, PageId, RowId, error::DatabaseError},
};

/// One unit the engine had to skip or shorten, and why.
#[derive(Debug)]
pub struct RecoveryWarning {
    pub phase: RecoveryPhase,
    pub page_id: Option<PageId>,
    pub table: Option<String>,
    pub row_id: Option<RowId>,
    pub lob_id: Option<LobId>,
    pub error: DatabaseError,
}

impl RecoveryWarning {
    pub fn new(phase: RecoveryPhase, error: DatabaseError) -> Self {
        Self {
            phase,
            page_id: None,
            table: None,
            row_id: None,
            lob_id: None,
            error,
        }
    }

    pub fn on_page(mut self, page_id: PageId) -> Self {
        self.page_id = Some(page_id);
        self
    }

    pub fn in_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn for_row(mut self, row_id: RowId) -> Self {
        self.row_id = Some(row_id);
        self
    }

    pub fn for_lob(mut self, lob_id: LobId) -> Self {
        self.lob_id = Some(lob_id);
        self
    }
}

impl fmt::Display for RecoveryWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.phase)?;
        if let Some(page_id) = self.page_id {
            write!(f, " page {}", page_id)?;
        }
        if let Some(table) = &self.table {
            write!(f, " table {}", table)?;
        }
        if let Some(row_id) = self.row_id {
            write!(f, " row {}", row_id)?;
        }
        if let Some(lob_id) = self.lob_id {
            write!(f, " lob {}", lob_id)?;
        }
        write!(f, ": {}", self.error)
    }
}

#[derive(Debug)]
pub struct RecoveryReport {
    /// Recovered tables in creation order.
    pub tables: Vec<String>,
    pub rows_per_table: BTreeMap<String, usize>,
    /// LOB values inlined into the script.
    pub lobs: usize,
    pub pages_scanned: u64,
    pub warnings: Vec<RecoveryWarning>,
    pub script_path: PathBuf,
}

impl RecoveryReport {
    pub fn total_rows(&self) -> usize {
        self.rows_per_table.values().sum()
    }

    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }

    pub fn warnings_in(&self, phase: RecoveryPhase) -> impl Iterator<Item = &RecoveryWarning> {
        self.warnings
            .iter()
            .filter(move |warning| warning.phase == phase)
    }
}

impl fmt::Display for RecoveryReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "script: {}", self.script_path.display())?;
        writeln!(
            f,
            "pages scanned: {}, tables: {}, rows: {}, lobs: {}",
            self.pages_scanned,
            self.tables.len(),
            self.total_rows(),
            self.lobs
        )?;
        for table in &self.tables {
            let rows = self.rows_per_table.get(table).copied().unwrap_or(0);
            writeln!(f, "  {}: {} row(s)", table, rows)?;
        }
        if !self.warnings.is_empty() {
            writeln!(f, "{} warning(s):", self.warnings.len())?;
            for warning in &self.warnings {
                writeln!(f, "  {}", warning)?;
            }
        }
        Ok(())
    }
}
