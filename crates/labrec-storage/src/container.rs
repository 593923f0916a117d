//! Non-merging recorder keeping the three category tables apart in a directory
//! container:
//!
//! ```text
//! <target>/schema.json
//! <target>/data/group-00000000.parquet
//! <target>/proc_params/group-00000000.parquet
//! <target>/metadata/group-00000000.parquet
//! ```
//!
//! A group is committed once its file exists in all three sections. Files are
//! written under a `.tmp` name and renamed only after all three are synced, so
//! a group found in fewer sections on open was interrupted and is removed.

use crate::error::RecorderError;
use crate::lock::TargetLock;
use crate::recorder::{ResumePoint, WriteReport};
use arrow::array::{
    Array, ArrayRef, BooleanArray, Float64Array, Int64Array, StringArray,
    TimestampMicrosecondArray, UInt64Array,
};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};
use labrec_core::{
    Category, CategoryTable, CellValue, ColumnDiff, GroupTables, RecordGroup, TableRow,
    TableSchema,
};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use parquet::format::KeyValue;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const CONTAINER_FORMAT_VERSION: u32 = 1;
pub const MANIFEST_FILE: &str = "schema.json";
const LOCK_FILE: &str = ".lock";
const TMP_SUFFIX: &str = ".tmp";

/// Storage type of a container column, fixed when the column is first written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    Bool,
    Int,
    Float,
    Timestamp,
    Text,
}

impl ColumnKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ColumnKind::Bool => "bool",
            ColumnKind::Int => "int",
            ColumnKind::Float => "float",
            ColumnKind::Timestamp => "timestamp",
            ColumnKind::Text => "text",
        }
    }

    fn of(value: &CellValue) -> Option<Self> {
        match value {
            CellValue::Null => None,
            CellValue::Bool(_) => Some(ColumnKind::Bool),
            CellValue::Int(_) => Some(ColumnKind::Int),
            CellValue::Float(_) => Some(ColumnKind::Float),
            CellValue::Timestamp(_) => Some(ColumnKind::Timestamp),
            CellValue::Text(_) => Some(ColumnKind::Text),
        }
    }

    fn unify(self, other: Self) -> Self {
        match (self, other) {
            (left, right) if left == right => left,
            (ColumnKind::Int, ColumnKind::Float) | (ColumnKind::Float, ColumnKind::Int) => {
                ColumnKind::Float
            }
            _ => ColumnKind::Text,
        }
    }

    fn data_type(self) -> DataType {
        match self {
            ColumnKind::Bool => DataType::Boolean,
            ColumnKind::Int => DataType::Int64,
            ColumnKind::Float => DataType::Float64,
            ColumnKind::Timestamp => DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
            ColumnKind::Text => DataType::Utf8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub kind: ColumnKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerManifest {
    pub format_version: u32,
    #[serde(default)]
    pub sections: BTreeMap<Category, Vec<ColumnSpec>>,
}

impl Default for ContainerManifest {
    fn default() -> Self {
        Self {
            format_version: CONTAINER_FORMAT_VERSION,
            sections: BTreeMap::new(),
        }
    }
}

impl ContainerManifest {
    fn load(dir: &Path) -> Result<Self, RecorderError> {
        let path = dir.join(MANIFEST_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = fs::read(&path)?;
        let manifest: ContainerManifest =
            serde_json::from_slice(&contents).map_err(RecorderError::serialization)?;
        if manifest.format_version > CONTAINER_FORMAT_VERSION {
            return Err(RecorderError::UnsupportedSchemaVersion {
                found: i64::from(manifest.format_version),
                supported: i64::from(CONTAINER_FORMAT_VERSION),
            });
        }
        Ok(manifest)
    }

    fn store(&self, dir: &Path) -> Result<(), RecorderError> {
        let path = dir.join(MANIFEST_FILE);
        let tmp = dir.join(format!("{MANIFEST_FILE}{TMP_SUFFIX}"));
        let contents = serde_json::to_vec_pretty(self).map_err(RecorderError::serialization)?;
        fs::write(&tmp, contents)?;
        File::open(&tmp)?.sync_all()?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn section(&self, category: Category) -> &[ColumnSpec] {
        self.sections
            .get(&category)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

pub struct ParquetRecorder {
    path: PathBuf,
    manifest: ContainerManifest,
    committed: BTreeSet<RecordGroup>,
    _lock: TargetLock,
}

impl ParquetRecorder {
    pub fn open(path: &Path) -> Result<(Self, ResumePoint), RecorderError> {
        if path.exists() && !path.is_dir() {
            return Err(RecorderError::corrupt(path, "container target must be a directory"));
        }
        for category in Category::ALL {
            fs::create_dir_all(path.join(category.as_str()))?;
        }
        let lock = TargetLock::acquire(path.join(LOCK_FILE), path)?;
        let manifest = ContainerManifest::load(path)?;

        let mut recovered_partial = false;
        let mut found = BTreeMap::new();
        for category in Category::ALL {
            let listing = scan_section(&path.join(category.as_str()))?;
            for stray in &listing.temporary {
                fs::remove_file(stray)?;
                recovered_partial = true;
            }
            found.insert(category, listing.groups);
        }
        let complete = Category::ALL
            .iter()
            .filter_map(|category| found.get(category))
            .fold(None, |acc: Option<BTreeSet<RecordGroup>>, groups| match acc {
                None => Some(groups.clone()),
                Some(acc) => Some(acc.intersection(groups).copied().collect()),
            })
            .unwrap_or_default();
        for (category, groups) in &found {
            for group in groups.difference(&complete) {
                fs::remove_file(section_file(path, *category, *group))?;
                recovered_partial = true;
                warn!(
                    event = "recorder_partial_group_discarded",
                    kind = "parquet",
                    target = %path.display(),
                    section = category.as_str(),
                    group = *group
                );
            }
        }

        let resume = ResumePoint {
            last_group: complete.last().copied(),
            recovered_partial,
        };
        info!(
            event = "recorder_opened",
            kind = "parquet",
            target = %path.display(),
            last_group = ?resume.last_group
        );
        Ok((
            Self {
                path: path.to_path_buf(),
                manifest,
                committed: complete,
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

    pub fn manifest(&self) -> &ContainerManifest {
        &self.manifest
    }

    pub fn write(&mut self, tables: &GroupTables) -> Result<WriteReport, RecorderError> {
        let group = tables.group;
        let mut manifest = self.manifest.clone();
        for category in Category::ALL {
            let table = tables.table(category);
            if table.is_empty() {
                continue;
            }
            match manifest.sections.get(&category) {
                Some(specs) => {
                    let diff = ColumnDiff::between(
                        specs.iter().map(|spec| spec.name.as_str()),
                        table.columns().iter().map(String::as_str),
                    );
                    if !diff.is_empty() {
                        return Err(RecorderError::SchemaConflict {
                            target: self.path.clone(),
                            group,
                            category,
                            diff,
                        });
                    }
                }
                None => {
                    manifest.sections.insert(category, infer_specs(table));
                }
            }
        }

        let mut batches = Vec::with_capacity(Category::ALL.len());
        for category in Category::ALL {
            batches.push((
                category,
                self.section_batch(group, tables.table(category), manifest.section(category))?,
            ));
        }

        let mut staged = Vec::new();
        for (category, batch) in &batches {
            let final_path = section_file(&self.path, *category, group);
            let tmp_path = tmp_path(&final_path);
            staged.push((tmp_path.clone(), final_path));
            if let Err(err) = write_section(&tmp_path, *category, group, batch) {
                discard_files(staged.iter().map(|(tmp, _)| tmp));
                return Err(err);
            }
        }
        if manifest != self.manifest {
            if let Err(err) = manifest.store(&self.path) {
                discard_files(staged.iter().map(|(tmp, _)| tmp));
                return Err(err);
            }
        }
        for (position, (tmp, final_path)) in staged.iter().enumerate() {
            if let Err(err) = fs::rename(tmp, final_path) {
                discard_files(staged[..position].iter().map(|(_, done)| done));
                discard_files(staged[position..].iter().map(|(pending, _)| pending));
                return Err(err.into());
            }
        }

        self.manifest = manifest;
        self.committed.insert(group);
        debug!(
            event = "container_group_committed",
            target = %self.path.display(),
            group = group,
            data_rows = tables.data.len(),
            records = tables.record_count()
        );
        Ok(WriteReport {
            group,
            rows_written: tables.data.len(),
            skipped: false,
        })
    }

    pub fn close(self) -> Result<(), RecorderError> {
        info!(
            event = "recorder_closed",
            kind = "parquet",
            target = %self.path.display(),
            lock = %self._lock.path().display()
        );
        Ok(())
    }

    /// Reads every committed group of a container back into its three tables.
    /// Groups missing from any section are not returned.
    pub fn read_container(path: &Path) -> Result<Vec<GroupTables>, RecorderError> {
        let manifest = ContainerManifest::load(path)?;
        let mut found = Vec::new();
        for category in Category::ALL {
            found.push(scan_section(&path.join(category.as_str()))?.groups);
        }
        let complete = found
            .iter()
            .skip(1)
            .fold(found[0].clone(), |acc, groups| {
                acc.intersection(groups).copied().collect()
            });

        let mut groups = Vec::with_capacity(complete.len());
        for group in complete {
            let read = |category: Category| {
                read_section(
                    path,
                    &section_file(path, category, group),
                    category,
                    manifest.section(category),
                )
            };
            groups.push(GroupTables {
                group,
                data: read(Category::Data)?,
                params: read(Category::ProcParams)?,
                metadata: read(Category::Metadata)?,
            });
        }
        Ok(groups)
    }

    fn section_batch(
        &self,
        group: RecordGroup,
        table: &CategoryTable,
        specs: &[ColumnSpec],
    ) -> Result<RecordBatch, RecorderError> {
        let category = table.category();
        let mut fields = category
            .index_columns()
            .iter()
            .map(|name| Field::new(*name, DataType::UInt64, false))
            .collect::<Vec<Field>>();
        let mut columns: Vec<ArrayRef> = vec![
            Arc::new(UInt64Array::from(
                table.rows.iter().map(|row| row.group).collect::<Vec<u64>>(),
            )),
            Arc::new(UInt64Array::from(
                table.rows.iter().map(|row| row.group_ind).collect::<Vec<u64>>(),
            )),
        ];
        if category == Category::Data {
            columns.push(Arc::new(UInt64Array::from(
                table
                    .rows
                    .iter()
                    .map(|row| row.row.unwrap_or_default())
                    .collect::<Vec<u64>>(),
            )));
        }

        for spec in specs {
            fields.push(Field::new(spec.name.as_str(), spec.kind.data_type(), true));
            let position = table.column_position(&spec.name);
            let cells = table
                .rows
                .iter()
                .map(|row| {
                    position
                        .and_then(|position| row.values.get(position))
                        .unwrap_or(&CellValue::Null)
                })
                .collect::<Vec<&CellValue>>();
            columns.push(self.encode_column(group, spec, &cells)?);
        }

        Ok(RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)?)
    }

    fn encode_column(
        &self,
        group: RecordGroup,
        spec: &ColumnSpec,
        cells: &[&CellValue],
    ) -> Result<ArrayRef, RecorderError> {
        let conflict = |value: &CellValue| RecorderError::TypeConflict {
            target: self.path.clone(),
            group,
            column: spec.name.clone(),
            expected: spec.kind.as_str().to_string(),
            found: value.type_name().to_string(),
        };
        let array: ArrayRef = match spec.kind {
            ColumnKind::Bool => Arc::new(BooleanArray::from(
                cells
                    .iter()
                    .map(|value| match value {
                        CellValue::Null => Ok(None),
                        CellValue::Bool(flag) => Ok(Some(*flag)),
                        other => Err(conflict(other)),
                    })
                    .collect::<Result<Vec<Option<bool>>, _>>()?,
            )),
            ColumnKind::Int => Arc::new(Int64Array::from(
                cells
                    .iter()
                    .map(|value| match value {
                        CellValue::Null => Ok(None),
                        CellValue::Int(number) => Ok(Some(*number)),
                        other => Err(conflict(other)),
                    })
                    .collect::<Result<Vec<Option<i64>>, _>>()?,
            )),
            ColumnKind::Float => Arc::new(Float64Array::from(
                cells
                    .iter()
                    .map(|value| match value {
                        CellValue::Null => Ok(None),
                        CellValue::Int(_) | CellValue::Float(_) => Ok(value.as_f64()),
                        other => Err(conflict(other)),
                    })
                    .collect::<Result<Vec<Option<f64>>, _>>()?,
            )),
            ColumnKind::Timestamp => Arc::new(
                TimestampMicrosecondArray::from(
                    cells
                        .iter()
                        .map(|value| match value {
                            CellValue::Null => Ok(None),
                            CellValue::Timestamp(ts) => Ok(Some(ts.timestamp_micros())),
                            other => Err(conflict(other)),
                        })
                        .collect::<Result<Vec<Option<i64>>, _>>()?,
                )
                .with_timezone("UTC"),
            ),
            ColumnKind::Text => Arc::new(StringArray::from(
                cells
                    .iter()
                    .map(|value| (!value.is_null()).then(|| value.to_string()))
                    .collect::<Vec<Option<String>>>(),
            )),
        };
        Ok(array)
    }
}

fn infer_specs(table: &CategoryTable) -> Vec<ColumnSpec> {
    table
        .columns()
        .iter()
        .enumerate()
        .map(|(position, name)| {
            let kind = table
                .rows
                .iter()
                .filter_map(|row| row.values.get(position).and_then(ColumnKind::of))
                .reduce(ColumnKind::unify)
                .unwrap_or(ColumnKind::Text);
            ColumnSpec {
                name: name.clone(),
                kind,
            }
        })
        .collect()
}

struct SectionListing {
    groups: BTreeSet<RecordGroup>,
    temporary: Vec<PathBuf>,
}

fn scan_section(dir: &Path) -> Result<SectionListing, RecorderError> {
    let mut listing = SectionListing {
        groups: BTreeSet::new(),
        temporary: Vec::new(),
    };
    if !dir.exists() {
        return Ok(listing);
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if name.ends_with(TMP_SUFFIX) {
            listing.temporary.push(entry.path());
            continue;
        }
        let group = name
            .strip_prefix("group-")
            .and_then(|rest| rest.strip_suffix(".parquet"))
            .and_then(|digits| digits.parse::<RecordGroup>().ok());
        if let Some(group) = group {
            listing.groups.insert(group);
        }
    }
    Ok(listing)
}

fn section_file(dir: &Path, category: Category, group: RecordGroup) -> PathBuf {
    dir.join(category.as_str())
        .join(format!("group-{group:08}.parquet"))
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(TMP_SUFFIX);
    PathBuf::from(name)
}

fn discard_files<'a>(paths: impl Iterator<Item = &'a PathBuf>) {
    for path in paths {
        if let Err(err) = fs::remove_file(path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(
                    event = "container_cleanup_failed",
                    path = %path.display(),
                    error = %err
                );
            }
        }
    }
}

fn writer_properties(category: Category, group: RecordGroup) -> WriterProperties {
    let metadata = vec![
        KeyValue {
            key: "created_by".to_string(),
            value: Some("labrec".to_string()),
        },
        KeyValue {
            key: "labrec.section".to_string(),
            value: Some(category.as_str().to_string()),
        },
        KeyValue {
            key: "labrec.record_group".to_string(),
            value: Some(group.to_string()),
        },
    ];
    WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .set_key_value_metadata(Some(metadata))
        .build()
}

fn write_section(
    path: &Path,
    category: Category,
    group: RecordGroup,
    batch: &RecordBatch,
) -> Result<(), RecorderError> {
    let file = File::create(path)?;
    let properties = writer_properties(category, group);
    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(properties))?;
    writer.write(batch)?;
    let file = writer.into_inner()?;
    file.sync_all()?;
    Ok(())
}

fn read_section(
    container: &Path,
    path: &Path,
    category: Category,
    specs: &[ColumnSpec],
) -> Result<CategoryTable, RecorderError> {
    let schema = TableSchema::new(category, specs.iter().map(|spec| spec.name.clone()))?;
    let mut table = CategoryTable::new(schema);
    let reader = ParquetRecordBatchReaderBuilder::try_new(File::open(path)?)?.build()?;
    for batch in reader {
        let batch = batch?;
        let rows = batch.num_rows();
        let index = category
            .index_columns()
            .iter()
            .map(|name| {
                batch
                    .column_by_name(name)
                    .and_then(|column| column.as_any().downcast_ref::<UInt64Array>())
                    .ok_or_else(|| {
                        RecorderError::corrupt(
                            container,
                            format!("{} lacks index column {name}", path.display()),
                        )
                    })
            })
            .collect::<Result<Vec<&UInt64Array>, _>>()?;

        let mut columns = Vec::with_capacity(specs.len());
        for spec in specs {
            let cells = match batch.column_by_name(&spec.name) {
                Some(column) => decode_column(column.as_ref(), spec.kind),
                None if rows == 0 => Some(Vec::new()),
                None => None,
            };
            columns.push(cells.ok_or_else(|| {
                RecorderError::corrupt(
                    container,
                    format!(
                        "{} column '{}' is missing or not {}",
                        path.display(),
                        spec.name,
                        spec.kind.as_str()
                    ),
                )
            })?);
        }

        for position in 0..rows {
            table.rows.push(TableRow {
                group: index[0].value(position),
                group_ind: index[1].value(position),
                row: index.get(2).map(|rows| rows.value(position)),
                values: columns
                    .iter()
                    .map(|cells| cells[position].clone())
                    .collect(),
            });
        }
    }
    Ok(table)
}

fn decode_column(array: &dyn Array, kind: ColumnKind) -> Option<Vec<CellValue>> {
    let cells: Vec<CellValue> = match kind {
        ColumnKind::Bool => {
            let array = array.as_any().downcast_ref::<BooleanArray>()?;
            (0..array.len())
                .map(|i| nullable(array, i, || CellValue::Bool(array.value(i))))
                .collect()
        }
        ColumnKind::Int => {
            let array = array.as_any().downcast_ref::<Int64Array>()?;
            (0..array.len())
                .map(|i| nullable(array, i, || CellValue::Int(array.value(i))))
                .collect()
        }
        ColumnKind::Float => {
            let array = array.as_any().downcast_ref::<Float64Array>()?;
            (0..array.len())
                .map(|i| nullable(array, i, || CellValue::Float(array.value(i))))
                .collect()
        }
        ColumnKind::Timestamp => {
            let array = array.as_any().downcast_ref::<TimestampMicrosecondArray>()?;
            (0..array.len())
                .map(|i| {
                    nullable(array, i, || {
                        DateTime::<Utc>::from_timestamp_micros(array.value(i))
                            .map_or(CellValue::Null, CellValue::Timestamp)
                    })
                })
                .collect()
        }
        ColumnKind::Text => {
            let array = array.as_any().downcast_ref::<StringArray>()?;
            (0..array.len())
                .map(|i| nullable(array, i, || CellValue::Text(array.value(i).to_string())))
                .collect()
        }
    };
    Some(cells)
}

fn nullable(array: &dyn Array, position: usize, value: impl FnOnce() -> CellValue) -> CellValue {
    if array.is_null(position) {
        CellValue::Null
    } else {
        value()
    }
}
