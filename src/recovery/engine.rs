use std::{
    collections::{BTreeMap, HashSet},
    io::BufWriter,
    mem,
    sync::Arc,
};

use tracing::{info, warn};

use crate::{
    recovery::{
        RecoveryConfig, RecoveryPhase,
        emit::ScriptWriter,
        report::{RecoveryReport, RecoveryWarning},
        scanner::PageScanner,
    },
    storage::{
        heap::{RowCell, decode_overflow_cell},
        lob::LobChunk,
        schema::{TableSchema, decode_schema},
    },
    types::{
        LobId, NO_PAGE, PageId, RowId, TableId,
        error::DatabaseError,
        page::PageType,
        row::Row,
        value::{LobRef, Value},
    },
};

/// Pages sorted by type during the schema pass. Only pages that passed
/// validation are listed.
#[derive(Debug, Default)]
struct Inventory {
    data: Vec<PageId>,
    overflow: HashSet<PageId>,
    lob: Vec<PageId>,
}

/// The usable prefix of one LOB: chunk pages in sequence order.
#[derive(Debug, Default)]
struct RecoveredLob {
    pages: Vec<PageId>,
    length: u64,
    damaged: bool,
}

/// Walks a page file phase by phase: schema, rows, LOB chunks, then the
/// script. Page-level problems become warnings; the run carries on.
pub struct RecoveryEngine {
    config: RecoveryConfig,
    phase: RecoveryPhase,
    scanner: PageScanner,
    inventory: Inventory,
    tables: BTreeMap<TableId, Arc<TableSchema>>,
    rows: BTreeMap<TableId, BTreeMap<RowId, Row>>,
    lobs: BTreeMap<LobId, RecoveredLob>,
    warnings: Vec<RecoveryWarning>,
}

/// Chunk payloads of one LOB read straight from the file, capped at the
/// length recorded in the row. The first read failure ends the stream.
struct ChunkStream<'a> {
    scanner: &'a mut PageScanner,
    pages: std::vec::IntoIter<PageId>,
    remaining: u64,
    failure: Option<(PageId, DatabaseError)>,
}

impl Iterator for ChunkStream<'_> {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Vec<u8>> {
        if self.remaining == 0 || self.failure.is_some() {
            return None;
        }
        let page_id = self.pages.next()?;
        let chunk = self
            .scanner
            .read_page(page_id)
            .and_then(|page| LobChunk::from_page(&page));
        match chunk {
            Ok(chunk) => {
                let mut payload = chunk.payload;
                payload.truncate(self.remaining.min(payload.len() as u64) as usize);
                self.remaining -= payload.len() as u64;
                Some(payload)
            }
            Err(err) => {
                self.failure = Some((page_id, err));
                None
            }
        }
    }
}

impl RecoveryEngine {
    pub fn open(config: RecoveryConfig) -> Result<Self, DatabaseError> {
        let scanner = PageScanner::open(&config.data_path())?;
        Ok(Self {
            config,
            phase: RecoveryPhase::ScanSchema,
            scanner,
            inventory: Inventory::default(),
            tables: BTreeMap::new(),
            rows: BTreeMap::new(),
            lobs: BTreeMap::new(),
            warnings: Vec::new(),
        })
    }

    pub fn phase(&self) -> RecoveryPhase {
        self.phase
    }

    pub fn run(mut self) -> Result<RecoveryReport, DatabaseError> {
        info!(
            database = %self.config.name,
            pages = self.scanner.physical_pages(),
            "recovery started"
        );
        self.scan_schema();
        self.scan_data();
        self.scan_lob();
        let report = self.emit_script()?;
        self.enter(RecoveryPhase::Done);
        info!(
            script = %report.script_path.display(),
            tables = report.tables.len(),
            rows = report.total_rows(),
            warnings = report.warnings.len(),
            "recovery finished"
        );
        Ok(report)
    }

    fn enter(&mut self, phase: RecoveryPhase) {
        self.phase = phase;
        info!(phase = %phase, "recovery phase");
    }

    fn record(&mut self, warning: RecoveryWarning) {
        warn!("{}", warning);
        self.warnings.push(warning);
    }

    fn scan_schema(&mut self) {
        self.enter(RecoveryPhase::ScanSchema);
        let phase = self.phase;
        let physical = self.scanner.physical_pages();
        if let Some(reason) = self.scanner.header_damage() {
            let reason = format!(
                "{}, assuming {}-byte pages",
                reason.to_lowercase(),
                self.scanner.page_size()
            );
            self.record(
                RecoveryWarning::new(phase, DatabaseError::CorruptedPage { page_id: 0, reason })
                    .on_page(0),
            );
        }
        match self.scanner.declared_pages() {
            Some(declared) if declared > physical => self.record(RecoveryWarning::new(
                phase,
                DatabaseError::TruncatedFile {
                    expected_pages: declared,
                    actual_pages: physical,
                },
            )),
            Some(_) => {}
            None if self.scanner.header_damage().is_some() => {}
            None => self.record(
                RecoveryWarning::new(
                    phase,
                    DatabaseError::CorruptedPage {
                        page_id: 0,
                        reason: "header fields unreadable, scanning every page".to_string(),
                    },
                )
                .on_page(0),
            ),
        }

        for page_id in 1..physical {
            let page = match self.scanner.read_page(page_id) {
                Ok(page) => page,
                Err(err) => {
                    self.record(RecoveryWarning::new(phase, err).on_page(page_id));
                    continue;
                }
            };
            match page.page_type {
                PageType::Schema => {
                    for (_, cell) in page.cells() {
                        match decode_schema(cell) {
                            Ok(schema) => self.adopt_schema(page_id, schema),
                            Err(err) => {
                                self.record(RecoveryWarning::new(phase, err).on_page(page_id))
                            }
                        }
                    }
                }
                PageType::Data => self.inventory.data.push(page_id),
                PageType::Overflow => {
                    self.inventory.overflow.insert(page_id);
                }
                PageType::LobChunk => self.inventory.lob.push(page_id),
                PageType::Header | PageType::Free | PageType::IndexLeaf | PageType::IndexInterior => {}
            }
        }
    }

    fn adopt_schema(&mut self, page_id: PageId, schema: TableSchema) {
        let phase = self.phase;
        let positions_ok = schema
            .columns
            .iter()
            .enumerate()
            .all(|(position, column)| column.position == position);
        let indexes_ok = schema.indexes.iter().all(|index| {
            !index.columns.is_empty()
                && index
                    .columns
                    .iter()
                    .all(|&position| position < schema.columns.len())
        });
        let problem = if schema.name.is_empty() || schema.columns.is_empty() {
            Some("table record has no name or no columns".to_string())
        } else if !positions_ok || !indexes_ok {
            Some(format!("column positions of table '{}' are inconsistent", schema.name))
        } else if self.tables.contains_key(&schema.table_id) {
            Some(format!("table id {} is defined twice", schema.table_id))
        } else if self.tables.values().any(|other| other.name == schema.name) {
            Some(format!("table '{}' is defined twice", schema.name))
        } else {
            None
        };

        match problem {
            Some(details) => self.record(
                RecoveryWarning::new(phase, DatabaseError::SchemaInconsistent { details })
                    .on_page(page_id)
                    .in_table(schema.name),
            ),
            None => {
                self.tables.insert(schema.table_id, Arc::new(schema));
            }
        }
    }

    fn scan_data(&mut self) {
        self.enter(RecoveryPhase::ScanData);
        let phase = self.phase;
        for page_id in mem::take(&mut self.inventory.data) {
            let page = match self.scanner.read_page(page_id) {
                Ok(page) => page,
                Err(err) => {
                    self.record(RecoveryWarning::new(phase, err).on_page(page_id));
                    continue;
                }
            };
            let Some(schema) = self.tables.get(&page.owner).cloned() else {
                self.record(
                    RecoveryWarning::new(
                        phase,
                        DatabaseError::SchemaInconsistent {
                            details: format!("data page owned by unknown table {}", page.owner),
                        },
                    )
                    .on_page(page_id),
                );
                continue;
            };

            for (_, bytes) in page.cells() {
                let cell = match RowCell::from_bytes(bytes) {
                    Ok(cell) => cell,
                    Err(err) => {
                        self.record(
                            RecoveryWarning::new(phase, err)
                                .on_page(page_id)
                                .in_table(&schema.name),
                        );
                        continue;
                    }
                };
                let row_id = cell.row_id;
                let row = self.assemble_row(&schema, cell);
                let rows = self.rows.entry(schema.table_id).or_default();
                let outcome = match row {
                    Ok(_) if rows.contains_key(&row_id) => Err(DatabaseError::SchemaInconsistent {
                        details: format!("row id {} appears twice", row_id),
                    }),
                    Ok(row) => {
                        rows.insert(row_id, row);
                        Ok(())
                    }
                    Err(err) => Err(err),
                };
                if let Err(err) = outcome {
                    self.record(
                        RecoveryWarning::new(phase, err)
                            .on_page(page_id)
                            .in_table(&schema.name)
                            .for_row(row_id),
                    );
                }
            }
        }

        for schema in self.tables.values() {
            let count = self.rows.get(&schema.table_id).map_or(0, BTreeMap::len);
            info!(table = %schema.name, rows = count, "rows recovered");
        }
    }

    /// Rebuild a row's payload, following its overflow chain only through
    /// pages that validated in the schema pass.
    fn assemble_row(&mut self, schema: &TableSchema, cell: RowCell) -> Result<Row, DatabaseError> {
        let total = cell.total_len as usize;
        let row_id = cell.row_id;
        let mut payload = cell.inline;
        let mut next = cell.overflow_head;
        let mut visited = HashSet::new();

        while payload.len() < total {
            let Some(page_id) = next else {
                return Err(DatabaseError::OverflowChainBroken {
                    page_id: NO_PAGE,
                    reason: format!("chain ends after {} of {} bytes", payload.len(), total),
                });
            };
            if !visited.insert(page_id) || !self.inventory.overflow.contains(&page_id) {
                return Err(DatabaseError::OverflowChainBroken {
                    page_id,
                    reason: "continuation page missing, unreadable or revisited".to_string(),
                });
            }
            let page = self.scanner.read_page(page_id)?;
            let (owner_row, piece) = decode_overflow_cell(&page)?;
            if page.owner != schema.table_id || owner_row != row_id {
                return Err(DatabaseError::OverflowChainBroken {
                    page_id,
                    reason: format!("page belongs to row {} of table {}", owner_row, page.owner),
                });
            }
            payload.extend_from_slice(piece);
            next = page.next_page_id;
        }
        if payload.len() != total {
            return Err(DatabaseError::OverflowChainBroken {
                page_id: next.unwrap_or(NO_PAGE),
                reason: format!("assembled {} bytes, expected {}", payload.len(), total),
            });
        }

        let row = Row::from_bytes(&payload)?;
        schema
            .validate_row(&row.values)
            .map_err(|err| DatabaseError::SchemaInconsistent {
                details: err.to_string(),
            })?;
        Ok(Row::with_row_id(row_id, row.values))
    }

    fn scan_lob(&mut self) {
        self.enter(RecoveryPhase::ScanLob);
        let phase = self.phase;

        let mut chunks: BTreeMap<LobId, BTreeMap<u32, Vec<(PageId, u64)>>> = BTreeMap::new();
        for page_id in mem::take(&mut self.inventory.lob) {
            let chunk = self
                .scanner
                .read_page(page_id)
                .and_then(|page| Ok((page.owner, LobChunk::from_page(&page)?)));
            match chunk {
                Ok((owner, chunk)) if owner == chunk.lob_id => {
                    chunks
                        .entry(chunk.lob_id)
                        .or_default()
                        .entry(chunk.sequence)
                        .or_default()
                        .push((page_id, chunk.payload.len() as u64));
                }
                Ok((owner, chunk)) => self.record(
                    RecoveryWarning::new(
                        phase,
                        DatabaseError::CorruptedPage {
                            page_id,
                            reason: format!(
                                "chunk of LOB {} on a page owned by {}",
                                chunk.lob_id, owner
                            ),
                        },
                    )
                    .on_page(page_id),
                ),
                Err(err) => self.record(RecoveryWarning::new(phase, err).on_page(page_id)),
            }
        }

        for (lob_id, sequences) in chunks {
            let mut lob = RecoveredLob::default();
            for (expected, (sequence, pages)) in (0u32..).zip(sequences) {
                if sequence != expected {
                    lob.damaged = true;
                    self.record(
                        RecoveryWarning::new(
                            phase,
                            DatabaseError::LobChunkMissing {
                                lob_id,
                                sequence: expected,
                            },
                        )
                        .on_page(pages[0].0)
                        .for_lob(lob_id),
                    );
                    break;
                }
                if pages.len() > 1 {
                    lob.damaged = true;
                    self.record(
                        RecoveryWarning::new(phase, DatabaseError::LobChunkOrder { lob_id, sequence })
                            .on_page(pages[1].0)
                            .for_lob(lob_id),
                    );
                    break;
                }
                let (page_id, length) = pages[0];
                lob.pages.push(page_id);
                lob.length += length;
            }
            self.lobs.insert(lob_id, lob);
        }

        // Compare against the references the rows carry.
        let mut short = Vec::new();
        for (table_id, rows) in &self.rows {
            let Some(schema) = self.tables.get(table_id) else {
                continue;
            };
            for (&row_id, row) in rows {
                for value in &row.values {
                    let Value::Lob(reference) = value else {
                        continue;
                    };
                    let recovered = self.lobs.get(&reference.lob_id);
                    let (available, chunks, damaged) = recovered
                        .map_or((0, 0, false), |lob| (lob.length, lob.pages.len(), lob.damaged));
                    if available < reference.length && !damaged {
                        short.push(
                            RecoveryWarning::new(
                                phase,
                                DatabaseError::LobChunkMissing {
                                    lob_id: reference.lob_id,
                                    sequence: chunks as u32,
                                },
                            )
                            .in_table(&schema.name)
                            .for_row(row_id)
                            .for_lob(reference.lob_id),
                        );
                    }
                }
            }
        }
        for warning in short {
            self.record(warning);
        }
        info!(lobs = self.lobs.len(), "LOB chunks grouped");
    }

    fn emit_script(&mut self) -> Result<RecoveryReport, DatabaseError> {
        self.enter(RecoveryPhase::EmitScript);
        let script_path = self.config.script_path();

        // Written next to the target and renamed into place when complete.
        let temp = tempfile::NamedTempFile::new_in(&self.config.dir)?;
        let mut writer = ScriptWriter::new(BufWriter::new(temp));
        writer.header(
            &self.config.name,
            self.scanner.page_size(),
            self.scanner.physical_pages(),
        )?;

        let tables = mem::take(&mut self.tables);
        let mut rows = mem::take(&mut self.rows);
        let mut table_names = Vec::with_capacity(tables.len());
        let mut rows_per_table = BTreeMap::new();
        let mut lobs_written = 0;

        for schema in tables.values() {
            writer.create_table(schema)?;
            let table_rows = rows.remove(&schema.table_id).unwrap_or_default();
            for (&row_id, row) in &table_rows {
                writer.begin_insert(&schema.name)?;
                for value in &row.values {
                    match value {
                        Value::Lob(reference) => {
                            if let Some(warning) = self.write_lob(&mut writer, reference)? {
                                self.record(warning.in_table(&schema.name).for_row(row_id));
                            }
                            lobs_written += 1;
                        }
                        other => writer.value(other)?,
                    }
                }
                writer.end_insert()?;
            }
            for index in &schema.indexes {
                writer.create_index(schema, index)?;
            }
            table_names.push(schema.name.clone());
            rows_per_table.insert(schema.name.clone(), table_rows.len());
        }
        if self.config.include_warnings_in_script {
            writer.warnings(&self.warnings)?;
        }

        let temp = writer
            .finish()?
            .into_inner()
            .map_err(|err| DatabaseError::Io(err.into_error()))?;
        temp.persist(&script_path)
            .map_err(|err| DatabaseError::Io(err.error))?;

        Ok(RecoveryReport {
            tables: table_names,
            rows_per_table,
            lobs: lobs_written,
            pages_scanned: self.scanner.physical_pages(),
            warnings: mem::take(&mut self.warnings),
            script_path,
        })
    }

    fn write_lob<W: std::io::Write>(
        &mut self,
        writer: &mut ScriptWriter<W>,
        reference: &LobRef,
    ) -> Result<Option<RecoveryWarning>, DatabaseError> {
        let pages = self
            .lobs
            .get(&reference.lob_id)
            .map(|lob| lob.pages.clone())
            .unwrap_or_default();
        let mut stream = ChunkStream {
            scanner: &mut self.scanner,
            pages: pages.into_iter(),
            remaining: reference.length,
            failure: None,
        };
        writer.lob(reference.kind, &mut stream)?;
        Ok(stream.failure.map(|(page_id, err)| {
            RecoveryWarning::new(self.phase, err)
                .on_page(page_id)
                .for_lob(reference.lob_id)
        }))
    }
}
