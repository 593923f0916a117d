use crate::index::{RecordGroup, RecordGroupInd, RecordIndex, RecordKey, RecordRow};
use crate::schema::{Category, TableSchema};
use crate::value::{CellValue, ValueMap};
use serde::{Deserialize, Serialize};

/// One indexed row. `row` is only set for data tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableRow {
    pub group: RecordGroup,
    pub group_ind: RecordGroupInd,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row: Option<RecordRow>,
    pub values: Vec<CellValue>,
}

impl TableRow {
    pub fn record_key(&self) -> RecordKey {
        RecordKey {
            group: self.group,
            group_ind: self.group_ind,
        }
    }

    pub fn index(&self) -> RecordIndex {
        RecordIndex {
            group: self.group,
            group_ind: self.group_ind,
            row: self.row.unwrap_or(0),
        }
    }
}

/// Tabular buffer for one category; values are stored in schema column order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryTable {
    pub schema: TableSchema,
    pub rows: Vec<TableRow>,
}

impl CategoryTable {
    pub fn new(schema: TableSchema) -> Self {
        Self {
            schema,
            rows: Vec::new(),
        }
    }

    pub fn category(&self) -> Category {
        self.schema.category
    }

    pub fn columns(&self) -> &[String] {
        &self.schema.columns
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Appends a row whose key set has already been checked against the schema.
    pub fn push(&mut self, key: RecordKey, row: Option<RecordRow>, values: &ValueMap) {
        let values = self
            .schema
            .columns
            .iter()
            .map(|column| values.get(column).cloned().unwrap_or(CellValue::Null))
            .collect();
        self.rows.push(TableRow {
            group: key.group,
            group_ind: key.group_ind,
            row,
            values,
        });
    }

    pub fn column_position(&self, column: &str) -> Option<usize> {
        self.schema.columns.iter().position(|name| name == column)
    }

    pub fn value(&self, row: usize, column: &str) -> Option<&CellValue> {
        let position = self.column_position(column)?;
        self.rows.get(row)?.values.get(position)
    }

    pub fn column_values<'a>(&'a self, column: &str) -> Vec<&'a CellValue> {
        match self.column_position(column) {
            Some(position) => self
                .rows
                .iter()
                .filter_map(|row| row.values.get(position))
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn row_map(&self, row: usize) -> Option<ValueMap> {
        let row = self.rows.get(row)?;
        Some(
            self.schema
                .columns
                .iter()
                .cloned()
                .zip(row.values.iter().cloned())
                .collect(),
        )
    }

    pub fn sort_by_index(&mut self) {
        self.rows
            .sort_by_key(|row| (row.group, row.group_ind, row.row.unwrap_or(0)));
    }
}

/// The three category tables of one completed record group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupTables {
    pub group: RecordGroup,
    pub data: CategoryTable,
    pub params: CategoryTable,
    pub metadata: CategoryTable,
}

impl GroupTables {
    pub fn table(&self, category: Category) -> &CategoryTable {
        match category {
            Category::Data => &self.data,
            Category::ProcParams => &self.params,
            Category::Metadata => &self.metadata,
        }
    }

    pub fn record_count(&self) -> usize {
        self.params.len()
    }

    pub fn sample_count(&self) -> usize {
        self.data.len()
    }
}
