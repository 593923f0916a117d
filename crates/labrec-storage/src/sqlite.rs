use crate::error::RecorderError;
use crate::lock::{sidecar_path, TargetLock};
use crate::recorder::{conflict_category, ResumePoint, WriteReport};
use chrono::{DateTime, SecondsFormat, Utc};
use labrec_core::{CellValue, ColumnDiff, MergedTable, RecordGroup, RecordIndex, INDEX_COLUMNS};
use rusqlite::types::{Value, ValueRef};
use rusqlite::{params, params_from_iter, Connection, OpenFlags};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::info;

pub const LABREC_SCHEMA_VERSION: i64 = 1;
pub const RECORDS_TABLE: &str = "records";
pub const LOCK_SUFFIX: &str = ".lock";

/// Merging recorder storing the joined table in one SQLite table. Each group
/// is inserted in a single transaction together with its `labrec_groups` row,
/// so an interrupted group never becomes visible.
pub struct SqliteRecorder {
    path: PathBuf,
    conn: Connection,
    columns: Option<Vec<String>>,
    committed: BTreeSet<RecordGroup>,
    _lock: TargetLock,
}

impl SqliteRecorder {
    pub fn open(path: &Path) -> Result<(Self, ResumePoint), RecorderError> {
        let lock = TargetLock::acquire(sidecar_path(path, LOCK_SUFFIX), path)?;
        let conn = Connection::open(path)?;
        migrate(&conn)?;

        let columns = table_columns(&conn)?;
        if columns.is_some() {
            // Rows written without the group registry are taken as committed.
            let adopted = conn.execute(
                &format!(
                    "INSERT OR IGNORE INTO labrec_groups (record_group, rows, committed_at)
                     SELECT {group}, COUNT(*), ?1 FROM {table} GROUP BY {group}",
                    group = quote_ident(INDEX_COLUMNS[0]),
                    table = quote_ident(RECORDS_TABLE),
                ),
                params![Utc::now().to_rfc3339()],
            )?;
            if adopted > 0 {
                info!(
                    event = "recorder_adopted_target",
                    kind = "sqlite",
                    target = %path.display(),
                    groups = adopted
                );
            }
        }
        let committed = committed_groups(&conn)?;

        let resume = ResumePoint {
            last_group: committed.last().copied(),
            recovered_partial: false,
        };
        info!(
            event = "recorder_opened",
            kind = "sqlite",
            target = %path.display(),
            last_group = ?resume.last_group
        );
        Ok((
            Self {
                path: path.to_path_buf(),
                conn,
                columns,
                committed,
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

    pub fn schema_version(&self) -> Result<i64, RecorderError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn write(
        &mut self,
        group: RecordGroup,
        merged: &MergedTable,
    ) -> Result<WriteReport, RecorderError> {
        let columns = merged.columns();
        let mut created = false;
        if !merged.is_empty() {
            if let Some(existing) = &self.columns {
                let diff = ColumnDiff::between(
                    existing.iter().map(String::as_str),
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
            } else {
                created = true;
            }
        }

        let tx = self.conn.transaction()?;
        if created {
            tx.execute_batch(&create_table_sql(&columns))?;
        }
        if !merged.is_empty() {
            let insert = format!(
                "INSERT INTO {} ({}) VALUES ({})",
                quote_ident(RECORDS_TABLE),
                columns
                    .iter()
                    .map(|column| quote_ident(column))
                    .collect::<Vec<_>>()
                    .join(", "),
                (1..=columns.len())
                    .map(|position| format!("?{position}"))
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            let mut stmt = tx.prepare(&insert)?;
            for row in 0..merged.len() {
                let Some(cells) = merged.full_row(row) else {
                    continue;
                };
                stmt.execute(params_from_iter(cells.iter().map(to_sql_value)))?;
            }
        }
        tx.execute(
            "INSERT INTO labrec_groups (record_group, rows, committed_at) VALUES (?1, ?2, ?3)",
            params![group as i64, merged.len() as i64, Utc::now().to_rfc3339()],
        )?;
        tx.commit()?;

        if created {
            self.columns = Some(columns);
        }
        self.committed.insert(group);
        Ok(WriteReport {
            group,
            rows_written: merged.len(),
            skipped: false,
        })
    }

    pub fn close(self) -> Result<(), RecorderError> {
        self.conn.close().map_err(|(_, err)| RecorderError::Sqlite(err))?;
        info!(
            event = "recorder_closed",
            kind = "sqlite",
            target = %self.path.display(),
            lock = %self._lock.path().display()
        );
        Ok(())
    }

    /// Reads every row of a SQLite target back, ordered by index. Text cells
    /// holding an RFC 3339 timestamp come back as timestamps.
    pub fn read_merged(path: &Path) -> Result<MergedTable, RecorderError> {
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        let Some(columns) = table_columns(&conn)? else {
            return Ok(MergedTable::from_parts(&[], Vec::new())?);
        };
        let positions = INDEX_COLUMNS.map(|name| columns.iter().position(|column| column == name));
        let [Some(group_pos), Some(group_ind_pos), Some(row_pos)] = positions else {
            return Err(RecorderError::corrupt(path, "records table lacks index columns"));
        };
        let value_columns = columns
            .iter()
            .enumerate()
            .filter(|(position, _)| ![group_pos, group_ind_pos, row_pos].contains(position))
            .map(|(position, name)| (position, name.clone()))
            .collect::<Vec<(usize, String)>>();

        let query = format!(
            "SELECT * FROM {} ORDER BY {}",
            quote_ident(RECORDS_TABLE),
            INDEX_COLUMNS
                .iter()
                .map(|column| quote_ident(column))
                .collect::<Vec<_>>()
                .join(", ")
        );
        let mut stmt = conn.prepare(&query)?;
        let mut rows = stmt.query([])?;
        let mut parts = Vec::new();
        while let Some(row) = rows.next()? {
            let index = RecordIndex {
                group: row.get::<_, i64>(group_pos)? as u64,
                group_ind: row.get::<_, i64>(group_ind_pos)? as u64,
                row: row.get::<_, i64>(row_pos)? as u64,
            };
            let mut values = Vec::with_capacity(value_columns.len());
            for (position, _) in &value_columns {
                values.push(from_sql_value(row.get_ref(*position)?));
            }
            parts.push((index, values));
        }

        let names = value_columns
            .into_iter()
            .map(|(_, name)| name)
            .collect::<Vec<String>>();
        Ok(MergedTable::from_parts(&names, parts)?)
    }
}

fn migrate(conn: &Connection) -> Result<(), RecorderError> {
    let current: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if current > LABREC_SCHEMA_VERSION {
        return Err(RecorderError::UnsupportedSchemaVersion {
            found: current,
            supported: LABREC_SCHEMA_VERSION,
        });
    }

    if current < 1 {
        let sql = include_str!("../migrations/0001_labrec_schema.sql");
        conn.execute_batch(sql)?;
        conn.execute("PRAGMA user_version = 1", []).map(|_| ())?;
    }

    Ok(())
}

fn committed_groups(conn: &Connection) -> Result<BTreeSet<RecordGroup>, RecorderError> {
    let mut stmt = conn.prepare("SELECT record_group FROM labrec_groups")?;
    let groups = stmt
        .query_map([], |row| row.get::<_, i64>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(groups.into_iter().map(|group| group as u64).collect())
}

fn table_columns(conn: &Connection) -> Result<Option<Vec<String>>, RecorderError> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1) ORDER BY cid")?;
    let columns = stmt
        .query_map([RECORDS_TABLE], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok((!columns.is_empty()).then_some(columns))
}

fn create_table_sql(columns: &[String]) -> String {
    let definitions = columns
        .iter()
        .map(|column| {
            if INDEX_COLUMNS.contains(&column.as_str()) {
                format!("{} INTEGER NOT NULL", quote_ident(column))
            } else {
                quote_ident(column)
            }
        })
        .collect::<Vec<_>>()
        .join(", ");
    let key = INDEX_COLUMNS
        .iter()
        .map(|column| quote_ident(column))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "CREATE TABLE {} ({definitions}, PRIMARY KEY ({key}))",
        quote_ident(RECORDS_TABLE)
    )
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn to_sql_value(value: &CellValue) -> Value {
    match value {
        CellValue::Null => Value::Null,
        CellValue::Bool(flag) => Value::Integer(i64::from(*flag)),
        CellValue::Int(number) => Value::Integer(*number),
        CellValue::Float(number) => Value::Real(*number),
        CellValue::Timestamp(ts) => Value::Text(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
        CellValue::Text(text) => Value::Text(text.clone()),
    }
}

fn from_sql_value(value: ValueRef<'_>) -> CellValue {
    match value {
        ValueRef::Null => CellValue::Null,
        ValueRef::Integer(number) => CellValue::Int(number),
        ValueRef::Real(number) => CellValue::Float(number),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            let text = String::from_utf8_lossy(bytes);
            match DateTime::parse_from_rfc3339(&text) {
                Ok(ts) => CellValue::Timestamp(ts.with_timezone(&Utc)),
                Err(_) => CellValue::Text(text.into_owned()),
            }
        }
    }
}
