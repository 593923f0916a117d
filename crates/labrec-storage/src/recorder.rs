use crate::config::{Capability, RecorderConfig, RecorderKind};
use crate::container::ParquetRecorder;
use crate::error::RecorderError;
use crate::plaintext::CsvRecorder;
use crate::sqlite::SqliteRecorder;
use labrec_core::{Category, ColumnDiff, GroupTables, RecordGroup, TableMerger};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    Unopened,
    Open,
    Closed,
}

/// Where a freshly opened target left off.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumePoint {
    pub last_group: Option<RecordGroup>,
    /// An interrupted group was found and dropped while opening.
    pub recovered_partial: bool,
}

impl ResumePoint {
    pub fn next_group(&self) -> RecordGroup {
        self.last_group.map_or(0, |group| group + 1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteReport {
    pub group: RecordGroup,
    pub rows_written: usize,
    /// The group was already persisted; nothing was written.
    pub skipped: bool,
}

enum Backend {
    Csv(CsvRecorder),
    Sqlite(SqliteRecorder),
    Parquet(ParquetRecorder),
}

impl Backend {
    fn contains_group(&self, group: RecordGroup) -> bool {
        match self {
            Backend::Csv(recorder) => recorder.contains_group(group),
            Backend::Sqlite(recorder) => recorder.contains_group(group),
            Backend::Parquet(recorder) => recorder.contains_group(group),
        }
    }

    fn last_group(&self) -> Option<RecordGroup> {
        match self {
            Backend::Csv(recorder) => recorder.last_group(),
            Backend::Sqlite(recorder) => recorder.last_group(),
            Backend::Parquet(recorder) => recorder.last_group(),
        }
    }

    fn close(self) -> Result<(), RecorderError> {
        match self {
            Backend::Csv(recorder) => recorder.close(),
            Backend::Sqlite(recorder) => recorder.close(),
            Backend::Parquet(recorder) => recorder.close(),
        }
    }
}

/// Persists closed record groups to one target. Merging kinds receive the
/// joined table, the container kind receives the three tables unchanged.
pub struct Recorder {
    config: RecorderConfig,
    state: RecorderState,
    backend: Option<Backend>,
}

impl Recorder {
    pub fn new(config: RecorderConfig) -> Self {
        Self {
            config,
            state: RecorderState::Unopened,
            backend: None,
        }
    }

    pub fn capability(&self) -> Capability {
        self.config.kind.capability()
    }

    pub fn kind(&self) -> RecorderKind {
        self.config.kind
    }

    pub fn state(&self) -> RecorderState {
        self.state
    }

    pub fn target(&self) -> &Path {
        &self.config.path
    }

    pub fn open(&mut self) -> Result<ResumePoint, RecorderError> {
        match self.state {
            RecorderState::Open => {
                return Err(RecorderError::AlreadyOpen {
                    target: self.config.path.clone(),
                })
            }
            RecorderState::Closed => {
                return Err(RecorderError::ClosedTarget {
                    target: self.config.path.clone(),
                })
            }
            RecorderState::Unopened => {}
        }

        if let Some(parent) = self.config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let path = self.config.path.as_path();
        let (backend, resume) = match self.config.kind {
            RecorderKind::Csv => {
                let (recorder, resume) = CsvRecorder::open(path)?;
                (Backend::Csv(recorder), resume)
            }
            RecorderKind::Sqlite => {
                let (recorder, resume) = SqliteRecorder::open(path)?;
                (Backend::Sqlite(recorder), resume)
            }
            RecorderKind::Parquet => {
                let (recorder, resume) = ParquetRecorder::open(path)?;
                (Backend::Parquet(recorder), resume)
            }
        };
        self.backend = Some(backend);
        self.state = RecorderState::Open;
        Ok(resume)
    }

    /// Appends one closed group. Re-writing a group that is already persisted
    /// is a no-op reported with `skipped`.
    pub fn write(&mut self, tables: &GroupTables) -> Result<WriteReport, RecorderError> {
        let target = self.config.path.clone();
        let backend = match (self.state, self.backend.as_mut()) {
            (RecorderState::Open, Some(backend)) => backend,
            (RecorderState::Closed, _) => return Err(RecorderError::ClosedTarget { target }),
            _ => return Err(RecorderError::NotOpen { target }),
        };

        let group = tables.group;
        if backend.contains_group(group) {
            info!(
                event = "recorder_group_skipped",
                kind = self.config.kind.as_str(),
                target = %target.display(),
                group = group
            );
            return Ok(WriteReport {
                group,
                rows_written: 0,
                skipped: true,
            });
        }
        if let Some(last) = backend.last_group() {
            if group < last {
                return Err(RecorderError::OutOfOrder {
                    target,
                    group,
                    last,
                });
            }
        }

        let result = match backend {
            Backend::Csv(recorder) => TableMerger::merge_group(tables)
                .map_err(RecorderError::from)
                .and_then(|merged| recorder.write(group, &merged)),
            Backend::Sqlite(recorder) => TableMerger::merge_group(tables)
                .map_err(RecorderError::from)
                .and_then(|merged| recorder.write(group, &merged)),
            Backend::Parquet(recorder) => recorder.write(tables),
        };

        match result {
            Ok(report) => {
                info!(
                    event = "recorder_group_written",
                    kind = self.config.kind.as_str(),
                    target = %target.display(),
                    group = group,
                    rows = report.rows_written
                );
                Ok(report)
            }
            Err(err) => {
                warn!(
                    event = "recorder_write_failed",
                    kind = self.config.kind.as_str(),
                    target = %target.display(),
                    group = group,
                    error = %err
                );
                match err {
                    RecorderError::SchemaConflict { .. }
                    | RecorderError::TypeConflict { .. }
                    | RecorderError::Record(_) => Err(err),
                    other => Err(RecorderError::Write {
                        target,
                        group,
                        source: Box::new(other),
                    }),
                }
            }
        }
    }

    /// Releases the target. Closing twice, or closing a recorder that was
    /// never opened, is not an error.
    pub fn close(&mut self) -> Result<(), RecorderError> {
        self.state = RecorderState::Closed;
        match self.backend.take() {
            Some(backend) => backend.close(),
            None => Ok(()),
        }
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(
                event = "recorder_close_failed",
                target = %self.config.path.display(),
                error = %err
            );
        }
    }
}

/// Category a merged-table column diff is attributed to, taken from the first
/// differing column.
pub(crate) fn conflict_category(diff: &ColumnDiff) -> Category {
    diff.missing
        .iter()
        .chain(diff.unexpected.iter())
        .next()
        .map_or(Category::Data, |column| Category::classify_merged(column).0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use labrec_core::{CategoryTable, TableSchema};

    fn empty_table(category: Category) -> CategoryTable {
        CategoryTable::new(TableSchema::new(category, Vec::<String>::new()).expect("schema"))
    }

    #[test]
    fn resume_point_names_the_next_group() {
        assert_eq!(ResumePoint::default().next_group(), 0);
        let resume = ResumePoint {
            last_group: Some(4),
            recovered_partial: false,
        };
        assert_eq!(resume.next_group(), 5);
    }

    #[test]
    fn conflict_is_attributed_by_prefix() {
        let diff = ColumnDiff {
            missing: Vec::new(),
            unexpected: vec!["proc.current".to_string()],
        };
        assert_eq!(conflict_category(&diff), Category::ProcParams);
        assert_eq!(conflict_category(&ColumnDiff::default()), Category::Data);
    }

    #[test]
    fn lifecycle_errors_before_open_and_after_close() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = RecorderConfig::new(RecorderKind::Csv, dir.path().join("run.csv"));
        let mut recorder = Recorder::new(config);
        let empty = GroupTables {
            group: 0,
            data: empty_table(Category::Data),
            params: empty_table(Category::ProcParams),
            metadata: empty_table(Category::Metadata),
        };
        assert!(matches!(
            recorder.write(&empty),
            Err(RecorderError::NotOpen { .. })
        ));
        recorder.open().expect("open");
        assert!(matches!(
            recorder.open(),
            Err(RecorderError::AlreadyOpen { .. })
        ));
        recorder.close().expect("close");
        recorder.close().expect("close twice");
        assert_eq!(recorder.state(), RecorderState::Closed);
        assert!(matches!(
            recorder.write(&empty),
            Err(RecorderError::ClosedTarget { .. })
        ));
        assert!(matches!(
            recorder.open(),
            Err(RecorderError::ClosedTarget { .. })
        ));
    }
}
