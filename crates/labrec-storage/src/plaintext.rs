//! Merging recorder that appends the joined table to a delimited text file.
//!
//! Every committed group is recorded in a JSON-lines journal next to the file
//! with the byte offset the file ended at after that group. On open, bytes past
//! the last committed offset belong to a group that was interrupted mid-write
//! and are truncated away. A file without a readable journal is adopted as-is:
//! its groups and length are written to a fresh journal as the baseline before
//! anything is appended.

use crate::error::RecorderError;
use crate::lock::{sidecar_path, TargetLock};
use crate::recorder::{conflict_category, ResumePoint, WriteReport};
use chrono::{DateTime, Utc};
use labrec_core::{CellValue, ColumnDiff, MergedTable, RecordGroup, RecordIndex, INDEX_COLUMNS};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const JOURNAL_SUFFIX: &str = ".journal";
pub const LOCK_SUFFIX: &str = ".lock";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct JournalEntry {
    /// `None` marks a baseline entry for a target holding no groups yet.
    group: Option<RecordGroup>,
    rows: u64,
    end_offset: u64,
    committed_at: DateTime<Utc>,
}

pub struct CsvRecorder {
    path: PathBuf,
    journal_path: PathBuf,
    header: Option<Vec<String>>,
    committed: BTreeSet<RecordGroup>,
    committed_len: u64,
    _lock: TargetLock,
}

impl CsvRecorder {
    pub fn open(path: &Path) -> Result<(Self, ResumePoint), RecorderError> {
        let lock = TargetLock::acquire(sidecar_path(path, LOCK_SUFFIX), path)?;
        let journal_path = sidecar_path(path, JOURNAL_SUFFIX);
        let entries = read_journal(&journal_path)?;
        let file_len = match fs::metadata(path) {
            Ok(metadata) => metadata.len(),
            Err(err) if err.kind() == ErrorKind::NotFound => 0,
            Err(err) => return Err(err.into()),
        };

        let mut committed = entries
            .iter()
            .filter_map(|entry| entry.group)
            .collect::<BTreeSet<_>>();
        // Every write is preceded by a baseline entry, so a journal without
        // one readable entry never had anything appended under it.
        let adopting = entries.is_empty();
        let committed_len = if adopting {
            file_len
        } else {
            entries.last().map_or(0, |entry| entry.end_offset)
        };

        let mut recovered_partial = false;
        if file_len < committed_len {
            return Err(RecorderError::corrupt(
                path,
                format!("file has {file_len} bytes but the journal committed {committed_len}"),
            ));
        }
        if file_len > committed_len {
            OpenOptions::new()
                .write(true)
                .open(path)?
                .set_len(committed_len)?;
            recovered_partial = true;
            warn!(
                event = "recorder_partial_group_discarded",
                kind = "csv",
                target = %path.display(),
                discarded_bytes = file_len - committed_len
            );
        }

        let header = if committed_len > 0 {
            let mut reader = csv::ReaderBuilder::new().has_headers(true).from_path(path)?;
            let header = reader
                .headers()?
                .iter()
                .map(str::to_string)
                .collect::<Vec<String>>();
            Some(header)
        } else {
            None
        };

        if adopting {
            let mut rows_by_group: BTreeMap<RecordGroup, u64> = BTreeMap::new();
            if committed_len > 0 {
                let adopted = Self::read_merged(path)?;
                for row in &adopted.rows {
                    *rows_by_group.entry(row.index.group).or_default() += 1;
                }
                info!(
                    event = "recorder_adopted_target",
                    kind = "csv",
                    target = %path.display(),
                    rows = adopted.len(),
                    groups = rows_by_group.len()
                );
            }
            write_baseline(&journal_path, &rows_by_group, committed_len)?;
            committed.extend(rows_by_group.keys().copied());
        }

        let resume = ResumePoint {
            last_group: committed.last().copied(),
            recovered_partial,
        };
        info!(
            event = "recorder_opened",
            kind = "csv",
            target = %path.display(),
            last_group = ?resume.last_group
        );
        Ok((
            Self {
                path: path.to_path_buf(),
                journal_path,
                header,
                committed,
                committed_len,
                _lock: lock,
            },
            resume,
        ))
    }

    pub fn contains_group(&self, group: RecordGroup) -> bool {
        self.committed.contains(&group)
    }

    pub fn last_group(&self) -> Option<RecordGroup> {
        self.committed.last().copied()
    }

    pub fn write(
        &mut self,
        group: RecordGroup,
        merged: &MergedTable,
    ) -> Result<WriteReport, RecorderError> {
        let columns = merged.columns();
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(Vec::new());

        let header = match &self.header {
            _ if merged.is_empty() => None,
            Some(header) => {
                let diff = ColumnDiff::between(
                    header
                        .iter()
                        .map(String::as_str)
                        .filter(|name| !is_row_number(name)),
                    columns.iter().map(String::as_str),
                );
                if !diff.is_empty() {
                    return Err(RecorderError::SchemaConflict {
                        target: self.path.clone(),
                        group,
                        category: conflict_category(&diff),
                        diff,
                    });
                }
                Some(header.clone())
            }
            None => {
                writer.write_record(&columns)?;
                Some(columns.clone())
            }
        };

        if let Some(header) = &header {
            // Row-number columns of adopted files are left blank.
            let positions = header
                .iter()
                .map(|name| columns.iter().position(|column| column == name))
                .collect::<Vec<Option<usize>>>();
            for row in 0..merged.len() {
                let Some(cells) = merged.full_row(row) else {
                    continue;
                };
                let record = positions.iter().map(|position| {
                    position.map_or_else(String::new, |position| cells[position].to_string())
                });
                writer.write_record(record)?;
            }
        }
        let bytes = writer
            .into_inner()
            .map_err(|err| RecorderError::Io(err.into_error()))?;

        if let Err(err) = self.append(&bytes) {
            self.rollback();
            return Err(err);
        }
        let entry = JournalEntry {
            group: Some(group),
            rows: merged.len() as u64,
            end_offset: self.committed_len + bytes.len() as u64,
            committed_at: Utc::now(),
        };
        if let Err(err) = append_journal(&self.journal_path, &entry) {
            self.rollback();
            return Err(err);
        }

        self.committed_len = entry.end_offset;
        self.committed.insert(group);
        if self.header.is_none() {
            self.header = header;
        }
        Ok(WriteReport {
            group,
            rows_written: merged.len(),
            skipped: false,
        })
    }

    pub fn close(self) -> Result<(), RecorderError> {
        info!(
            event = "recorder_closed",
            kind = "csv",
            target = %self.path.display(),
            lock = %self._lock.path().display()
        );
        Ok(())
    }

    /// Reads a delimited text target back into a merged table. Columns with an
    /// empty header (a row-number column written by other tools) are ignored.
    pub fn read_merged(path: &Path) -> Result<MergedTable, RecorderError> {
        let mut reader = csv::ReaderBuilder::new().has_headers(true).from_path(path)?;
        let headers = reader
            .headers()?
            .iter()
            .map(str::to_string)
            .collect::<Vec<String>>();
        let positions =
            INDEX_COLUMNS.map(|name| headers.iter().position(|header| header == name));
        let [Some(group_pos), Some(group_ind_pos), Some(row_pos)] = positions else {
            return Err(RecorderError::corrupt(
                path,
                "header lacks RecordGroup, RecordGroupInd and RecordRow columns",
            ));
        };
        let value_columns = headers
            .iter()
            .enumerate()
            .filter(|(position, name)| {
                !is_row_number(name) && ![group_pos, group_ind_pos, row_pos].contains(position)
            })
            .map(|(position, name)| (position, name.clone()))
            .collect::<Vec<(usize, String)>>();

        let mut rows = Vec::new();
        for (line, record) in reader.records().enumerate() {
            let record = record?;
            let parse_index = |position: usize| {
                record
                    .get(position)
                    .and_then(|value| value.trim().parse::<u64>().ok())
                    .ok_or_else(|| {
                        RecorderError::corrupt(
                            path,
                            format!("row {} has an invalid index value", line + 1),
                        )
                    })
            };
            let index = RecordIndex {
                group: parse_index(group_pos)?,
                group_ind: parse_index(group_ind_pos)?,
                row: parse_index(row_pos)?,
            };
            let values = value_columns
                .iter()
                .map(|(position, _)| CellValue::parse_text(record.get(*position).unwrap_or("")))
                .collect();
            rows.push((index, values));
        }

        let names = value_columns
            .into_iter()
            .map(|(_, name)| name)
            .collect::<Vec<String>>();
        Ok(MergedTable::from_parts(&names, rows)?)
    }

    fn append(&self, bytes: &[u8]) -> Result<(), RecorderError> {
        if bytes.is_empty() {
            return Ok(());
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(bytes)?;
        file.sync_data()?;
        Ok(())
    }

    fn rollback(&self) {
        let result = OpenOptions::new()
            .write(true)
            .open(&self.path)
            .and_then(|file| file.set_len(self.committed_len));
        if let Err(err) = result {
            warn!(
                event = "recorder_rollback_failed",
                kind = "csv",
                target = %self.path.display(),
                error = %err
            );
        }
    }
}

/// Unnamed leading columns hold row numbers written by other tools.
fn is_row_number(column: &str) -> bool {
    column.trim().is_empty()
}

fn read_journal(path: &Path) -> Result<Vec<JournalEntry>, RecorderError> {
    let file = match fs::File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    let mut entries = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<JournalEntry>(&line) {
            Ok(entry) => entries.push(entry),
            Err(err) => {
                // A torn trailing entry means its group never committed.
                warn!(
                    event = "recorder_journal_entry_ignored",
                    journal = %path.display(),
                    error = %err
                );
                break;
            }
        }
    }
    Ok(entries)
}

fn append_journal(path: &Path, entry: &JournalEntry) -> Result<(), RecorderError> {
    let mut line = serde_json::to_string(entry).map_err(RecorderError::serialization)?;
    line.push('\n');
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(line.as_bytes())?;
    file.sync_data()?;
    Ok(())
}

fn write_baseline(
    path: &Path,
    rows_by_group: &BTreeMap<RecordGroup, u64>,
    end_offset: u64,
) -> Result<(), RecorderError> {
    let committed_at = Utc::now();
    let mut entries = rows_by_group
        .iter()
        .map(|(group, rows)| JournalEntry {
            group: Some(*group),
            rows: *rows,
            end_offset,
            committed_at,
        })
        .collect::<Vec<_>>();
    if entries.is_empty() {
        entries.push(JournalEntry {
            group: None,
            rows: 0,
            end_offset,
            committed_at,
        });
    }
    let mut out = String::new();
    for entry in &entries {
        out.push_str(&serde_json::to_string(entry).map_err(RecorderError::serialization)?);
        out.push('\n');
    }
    let mut file = fs::File::create(path)?;
    file.write_all(out.as_bytes())?;
    file.sync_data()?;
    Ok(())
}
