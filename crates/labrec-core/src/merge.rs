use crate::error::RecordError;
use crate::index::{RecordIndex, RecordKey};
use crate::schema::{Category, ColumnDiff, RecordSchema, TableSchema, INDEX_COLUMNS};
use crate::table::{CategoryTable, GroupTables, TableRow};
use crate::value::CellValue;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedRow {
    pub index: RecordIndex,
    /// Data, then `proc.*`, then `meta.*` values, in schema order.
    pub values: Vec<CellValue>,
}

/// Wide table joining data rows with their record's parameters and metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedTable {
    pub schema: RecordSchema,
    pub rows: Vec<MergedRow>,
}

impl MergedTable {
    /// Full header: index columns, data, `proc.*`, `meta.*`.
    pub fn columns(&self) -> Vec<String> {
        self.schema.merged_columns()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_position(&self, column: &str) -> Option<usize> {
        self.columns()
            .iter()
            .skip(INDEX_COLUMNS.len())
            .position(|name| name == column)
    }

    pub fn value(&self, row: usize, column: &str) -> Option<&CellValue> {
        let position = self.column_position(column)?;
        self.rows.get(row)?.values.get(position)
    }

    /// Index values followed by the row's cells, aligned with [`Self::columns`].
    pub fn full_row(&self, row: usize) -> Option<Vec<CellValue>> {
        let row = self.rows.get(row)?;
        let mut cells = vec![
            CellValue::Int(row.index.group as i64),
            CellValue::Int(row.index.group_ind as i64),
            CellValue::Int(row.index.row as i64),
        ];
        cells.extend(row.values.iter().cloned());
        Some(cells)
    }

    /// Rebuilds a merged table read back from a target. Columns may arrive in
    /// any order; they are regrouped by prefix into canonical order.
    pub fn from_parts(
        columns: &[String],
        rows: Vec<(RecordIndex, Vec<CellValue>)>,
    ) -> Result<Self, RecordError> {
        let mut positions: BTreeMap<Category, Vec<(usize, String)>> = BTreeMap::new();
        for (position, column) in columns.iter().enumerate() {
            let (category, name) = Category::classify_merged(column);
            positions
                .entry(category)
                .or_default()
                .push((position, name.to_string()));
        }
        let table_schema = |category: Category| {
            TableSchema::new(
                category,
                positions
                    .get(&category)
                    .map(|entries| entries.iter().map(|(_, name)| name.clone()).collect())
                    .unwrap_or_else(Vec::new),
            )
        };
        let schema = RecordSchema {
            data: table_schema(Category::Data)?,
            params: table_schema(Category::ProcParams)?,
            metadata: table_schema(Category::Metadata)?,
        };
        let order = Category::ALL
            .iter()
            .flat_map(|category| positions.get(category).into_iter().flatten())
            .map(|(position, _)| *position)
            .collect::<Vec<usize>>();

        let mut merged_rows = Vec::with_capacity(rows.len());
        for (index, values) in rows {
            if values.len() != columns.len() {
                return Err(RecordError::Schema {
                    category: Category::Data,
                    diff: ColumnDiff {
                        missing: columns.iter().skip(values.len()).cloned().collect(),
                        unexpected: Vec::new(),
                    },
                });
            }
            merged_rows.push(MergedRow {
                index,
                values: order.iter().map(|position| values[*position].clone()).collect(),
            });
        }
        Ok(Self {
            schema,
            rows: merged_rows,
        })
    }
}

pub struct TableMerger;

impl TableMerger {
    /// Left-joins data rows onto their parameter and metadata rows by record
    /// key. Row order follows the data table. A data row without exactly one
    /// matching parameter and metadata row, or repeating another data row's
    /// index, is a builder defect and fails the merge instead of being
    /// null-filled.
    pub fn merge(
        data: &CategoryTable,
        params: &CategoryTable,
        metadata: &CategoryTable,
    ) -> Result<MergedTable, RecordError> {
        let params_by_key = index_records(params)?;
        let metadata_by_key = index_records(metadata)?;

        let mut rows = Vec::with_capacity(data.len());
        let mut seen = BTreeSet::new();
        for data_row in &data.rows {
            let key = data_row.record_key();
            let row = data_row.row.ok_or_else(|| RecordError::ReferentialIntegrity {
                group: key.group,
                group_ind: key.group_ind,
                reason: "data row carries no RecordRow".to_string(),
            })?;
            let index = RecordIndex {
                group: key.group,
                group_ind: key.group_ind,
                row,
            };
            if !seen.insert(index) {
                return Err(RecordError::ReferentialIntegrity {
                    group: key.group,
                    group_ind: key.group_ind,
                    reason: format!("duplicate data row {row}"),
                });
            }
            let params_row = params_by_key
                .get(&key)
                .ok_or_else(|| missing(key, Category::ProcParams))?;
            let metadata_row = metadata_by_key
                .get(&key)
                .ok_or_else(|| missing(key, Category::Metadata))?;

            let mut values = Vec::with_capacity(
                data_row.values.len() + params_row.values.len() + metadata_row.values.len(),
            );
            values.extend(data_row.values.iter().cloned());
            values.extend(params_row.values.iter().cloned());
            values.extend(metadata_row.values.iter().cloned());
            rows.push(MergedRow { index, values });
        }

        Ok(MergedTable {
            schema: RecordSchema {
                data: data.schema.clone(),
                params: params.schema.clone(),
                metadata: metadata.schema.clone(),
            },
            rows,
        })
    }

    pub fn merge_group(tables: &GroupTables) -> Result<MergedTable, RecordError> {
        Self::merge(&tables.data, &tables.params, &tables.metadata)
    }

    /// Splits a merged table by column prefix back into per-group category
    /// tables. Parameter and metadata rows are emitted once per record; rows of
    /// one record that disagree on them are rejected.
    pub fn split(merged: &MergedTable) -> Result<Vec<GroupTables>, RecordError> {
        let data_len = merged.schema.data.len();
        let params_len = merged.schema.params.len();
        let mut groups: BTreeMap<u64, GroupTables> = BTreeMap::new();
        let mut seen_records: BTreeMap<RecordKey, usize> = BTreeMap::new();

        for row in &merged.rows {
            let key = row.index.record_key();
            let tables = groups.entry(key.group).or_insert_with(|| GroupTables {
                group: key.group,
                data: CategoryTable::new(merged.schema.data.clone()),
                params: CategoryTable::new(merged.schema.params.clone()),
                metadata: CategoryTable::new(merged.schema.metadata.clone()),
            });
            let (data_values, rest) = row.values.split_at(data_len.min(row.values.len()));
            let (params_values, metadata_values) = rest.split_at(params_len.min(rest.len()));

            tables.data.rows.push(TableRow {
                group: key.group,
                group_ind: key.group_ind,
                row: Some(row.index.row),
                values: data_values.to_vec(),
            });

            match seen_records.get(&key) {
                Some(position) => {
                    let params_row = &tables.params.rows[*position];
                    let metadata_row = &tables.metadata.rows[*position];
                    if !same_cells(&params_row.values, params_values)
                        || !same_cells(&metadata_row.values, metadata_values)
                    {
                        return Err(RecordError::ReferentialIntegrity {
                            group: key.group,
                            group_ind: key.group_ind,
                            reason: "record rows disagree on parameters or metadata".to_string(),
                        });
                    }
                }
                None => {
                    seen_records.insert(key, tables.params.rows.len());
                    for (table, values) in [
                        (&mut tables.params, params_values),
                        (&mut tables.metadata, metadata_values),
                    ] {
                        table.rows.push(TableRow {
                            group: key.group,
                            group_ind: key.group_ind,
                            row: None,
                            values: values.to_vec(),
                        });
                    }
                }
            }
        }

        Ok(groups.into_values().collect())
    }
}

fn index_records(table: &CategoryTable) -> Result<BTreeMap<RecordKey, &TableRow>, RecordError> {
    let mut by_key = BTreeMap::new();
    for row in &table.rows {
        let key = row.record_key();
        if by_key.insert(key, row).is_some() {
            return Err(RecordError::ReferentialIntegrity {
                group: key.group,
                group_ind: key.group_ind,
                reason: format!("duplicate {} row", table.category()),
            });
        }
    }
    Ok(by_key)
}

fn missing(key: RecordKey, category: Category) -> RecordError {
    RecordError::ReferentialIntegrity {
        group: key.group,
        group_ind: key.group_ind,
        reason: format!("no matching {category} row"),
    }
}

fn same_cells(left: &[CellValue], right: &[CellValue]) -> bool {
    left.len() == right.len()
        && left.iter().zip(right).all(|pair| match pair {
            (CellValue::Float(a), CellValue::Float(b)) => a == b || (a.is_nan() && b.is_nan()),
            (a, b) => a == b,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::CategoryTableBuilder;
    use crate::index::IndexAllocator;
    use crate::value::value_map;

    fn sweep_group() -> GroupTables {
        let mut builder = CategoryTableBuilder::new(IndexAllocator::new());
        let metadata = value_map([("sensor", "p9374a")]);
        for voltage in [0.0, 2.0] {
            builder
                .begin_record(&value_map([("voltage", voltage)]), &metadata)
                .expect("begin");
            for step in 0..3 {
                builder
                    .add_sample(&value_map([("time", step as f64), ("power", voltage * 0.5)]))
                    .expect("sample");
            }
        }
        builder.end_group().expect("end")
    }

    #[test]
    fn merge_prefixes_and_joins_on_record_key() {
        let group = sweep_group();
        let merged = TableMerger::merge_group(&group).expect("merge");
        assert_eq!(
            merged.columns(),
            vec![
                "RecordGroup",
                "RecordGroupInd",
                "RecordRow",
                "power",
                "time",
                "proc.voltage",
                "meta.sensor",
            ]
        );
        assert_eq!(merged.len(), 6);
        assert_eq!(merged.value(4, "proc.voltage"), Some(&CellValue::Float(2.0)));
        assert_eq!(
            merged.full_row(4).expect("row")[..3],
            [CellValue::Int(0), CellValue::Int(1), CellValue::Int(1)]
        );
    }

    #[test]
    fn merge_is_deterministic_to_the_byte() {
        let group = sweep_group();
        let first = serde_json::to_vec(&TableMerger::merge_group(&group).expect("merge"))
            .expect("encode");
        let second = serde_json::to_vec(&TableMerger::merge_group(&group).expect("merge"))
            .expect("encode");
        assert_eq!(first, second);
    }

    #[test]
    fn missing_parameter_row_is_never_null_filled() {
        let mut group = sweep_group();
        group.params.rows.retain(|row| row.group_ind != 1);
        let err = TableMerger::merge_group(&group).expect_err("dangling data rows");
        match err {
            RecordError::ReferentialIntegrity {
                group, group_ind, ..
            } => assert_eq!((group, group_ind), (0, 1)),
            other => panic!("unexpected error: {other:?}"),
        }

        let mut group = sweep_group();
        let duplicate = group.metadata.rows[0].clone();
        group.metadata.rows.push(duplicate);
        assert!(matches!(
            TableMerger::merge_group(&group),
            Err(RecordError::ReferentialIntegrity { .. })
        ));
    }

    #[test]
    fn repeated_data_index_is_rejected() {
        let mut group = sweep_group();
        let duplicate = group.data.rows[4].clone();
        group.data.rows.push(duplicate);
        match TableMerger::merge_group(&group).expect_err("duplicate data row") {
            RecordError::ReferentialIntegrity {
                group, group_ind, ..
            } => assert_eq!((group, group_ind), (0, 1)),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn split_by_prefix_recovers_category_tables() {
        let group = sweep_group();
        let merged = TableMerger::merge_group(&group).expect("merge");
        let split = TableMerger::split(&merged).expect("split");
        assert_eq!(split, vec![group]);
    }

    #[test]
    fn from_parts_restores_canonical_column_order() {
        let columns = ["meta.sensor", "power", "proc.voltage"]
            .iter()
            .map(|name| name.to_string())
            .collect::<Vec<_>>();
        let index = RecordIndex {
            group: 2,
            group_ind: 0,
            row: 0,
        };
        let merged = MergedTable::from_parts(
            &columns,
            vec![(
                index,
                vec![
                    CellValue::from("p9374a"),
                    CellValue::Float(-3.0),
                    CellValue::Float(5.0),
                ],
            )],
        )
        .expect("from parts");
        assert_eq!(
            merged.columns()[3..],
            ["power", "proc.voltage", "meta.sensor"]
        );
        assert_eq!(
            merged.rows[0].values,
            vec![
                CellValue::Float(-3.0),
                CellValue::Float(5.0),
                CellValue::from("p9374a")
            ]
        );
    }
}
