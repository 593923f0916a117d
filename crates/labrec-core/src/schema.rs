use crate::error::RecordError;
use crate::index::{RECORD_GROUP_COLUMN, RECORD_GROUP_IND_COLUMN, RECORD_ROW_COLUMN};
use crate::value::ValueMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

pub const PROC_PREFIX: &str = "proc.";
pub const META_PREFIX: &str = "meta.";
pub const INDEX_COLUMNS: [&str; 3] = [
    RECORD_GROUP_COLUMN,
    RECORD_GROUP_IND_COLUMN,
    RECORD_ROW_COLUMN,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Data,
    ProcParams,
    Metadata,
}

impl Category {
    pub const ALL: [Category; 3] = [Category::Data, Category::ProcParams, Category::Metadata];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Data => "data",
            Category::ProcParams => "proc_params",
            Category::Metadata => "metadata",
        }
    }

    /// Prefix applied to this category's columns in a merged table.
    pub fn merged_prefix(self) -> &'static str {
        match self {
            Category::Data => "",
            Category::ProcParams => PROC_PREFIX,
            Category::Metadata => META_PREFIX,
        }
    }

    /// Data rows are keyed per sample; parameters and metadata per record.
    pub fn index_columns(self) -> &'static [&'static str] {
        match self {
            Category::Data => &INDEX_COLUMNS,
            Category::ProcParams | Category::Metadata => &INDEX_COLUMNS[..2],
        }
    }

    /// Classifies a merged column name back to its category and original name.
    pub fn classify_merged(column: &str) -> (Category, &str) {
        if let Some(name) = column.strip_prefix(PROC_PREFIX) {
            (Category::ProcParams, name)
        } else if let Some(name) = column.strip_prefix(META_PREFIX) {
            (Category::Metadata, name)
        } else {
            (Category::Data, column)
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim() {
            "data" => Ok(Category::Data),
            "proc_params" | "proc" => Ok(Category::ProcParams),
            "metadata" | "meta" => Ok(Category::Metadata),
            other => Err(format!("Unknown category: {other}")),
        }
    }
}

/// Column-set difference between an established schema and an offered row or
/// an existing target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDiff {
    pub missing: Vec<String>,
    pub unexpected: Vec<String>,
}

impl ColumnDiff {
    pub fn between<'a, E, A>(expected: E, actual: A) -> Self
    where
        E: IntoIterator<Item = &'a str>,
        A: IntoIterator<Item = &'a str>,
    {
        let expected = expected.into_iter().collect::<BTreeSet<_>>();
        let actual = actual.into_iter().collect::<BTreeSet<_>>();
        Self {
            missing: expected
                .difference(&actual)
                .map(|name| name.to_string())
                .collect(),
            unexpected: actual
                .difference(&expected)
                .map(|name| name.to_string())
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty()
    }
}

impl fmt::Display for ColumnDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "missing [{}], unexpected [{}]",
            self.missing.join(", "),
            self.unexpected.join(", ")
        )
    }
}

pub fn validate_column_name(category: Category, column: &str) -> Result<(), RecordError> {
    let reason = if column.trim().is_empty() {
        Some("column names cannot be empty".to_string())
    } else if INDEX_COLUMNS.contains(&column) {
        Some("name is reserved for the record index".to_string())
    } else if column.starts_with(PROC_PREFIX) || column.starts_with(META_PREFIX) {
        Some(format!(
            "prefixes '{PROC_PREFIX}' and '{META_PREFIX}' are reserved for merged tables"
        ))
    } else {
        None
    };

    match reason {
        Some(reason) => Err(RecordError::Naming {
            category,
            column: column.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

/// Fixed column set of one category table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub category: Category,
    pub columns: Vec<String>,
}

impl TableSchema {
    pub fn new<I, S>(category: Category, columns: I) -> Result<Self, RecordError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let columns = columns.into_iter().map(Into::into).collect::<Vec<String>>();
        let mut seen = BTreeSet::new();
        for column in &columns {
            validate_column_name(category, column)?;
            if !seen.insert(column.as_str()) {
                return Err(RecordError::Naming {
                    category,
                    column: column.clone(),
                    reason: "column declared twice".to_string(),
                });
            }
        }
        Ok(Self { category, columns })
    }

    pub fn from_values(category: Category, values: &ValueMap) -> Result<Self, RecordError> {
        Self::new(category, values.keys().cloned())
    }

    /// Rejects rows whose key set differs from the declared columns.
    pub fn check(&self, values: &ValueMap) -> Result<(), RecordError> {
        for key in values.keys() {
            validate_column_name(self.category, key)?;
        }
        let diff = ColumnDiff::between(
            self.columns.iter().map(String::as_str),
            values.keys().map(String::as_str),
        );
        if diff.is_empty() {
            Ok(())
        } else {
            Err(RecordError::Schema {
                category: self.category,
                diff,
            })
        }
    }

    pub fn merged_columns(&self) -> impl Iterator<Item = String> + '_ {
        let prefix = self.category.merged_prefix();
        self.columns
            .iter()
            .map(move |column| format!("{prefix}{column}"))
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// Declared column sets for all three categories of a procedure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordSchema {
    pub data: TableSchema,
    pub params: TableSchema,
    pub metadata: TableSchema,
}

impl RecordSchema {
    pub fn new<D, P, M, S>(data: D, params: P, metadata: M) -> Result<Self, RecordError>
    where
        D: IntoIterator<Item = S>,
        P: IntoIterator<Item = S>,
        M: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Ok(Self {
            data: TableSchema::new(Category::Data, data)?,
            params: TableSchema::new(Category::ProcParams, params)?,
            metadata: TableSchema::new(Category::Metadata, metadata)?,
        })
    }

    pub fn table(&self, category: Category) -> &TableSchema {
        match category {
            Category::Data => &self.data,
            Category::ProcParams => &self.params,
            Category::Metadata => &self.metadata,
        }
    }

    /// Column order of the merged table: index, data, `proc.*`, `meta.*`.
    pub fn merged_columns(&self) -> Vec<String> {
        INDEX_COLUMNS
            .iter()
            .map(|column| column.to_string())
            .chain(self.data.merged_columns())
            .chain(self.params.merged_columns())
            .chain(self.metadata.merged_columns())
            .collect()
    }
}
