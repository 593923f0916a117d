use crate::index::{RecordGroup, RecordGroupInd};
use crate::schema::{Category, ColumnDiff};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RecordError {
    #[error("sequencing error: {0}")]
    Sequencing(String),
    #[error("schema mismatch in {category} table: {diff}")]
    Schema { category: Category, diff: ColumnDiff },
    #[error("invalid column name '{column}' in {category} table: {reason}")]
    Naming {
        category: Category,
        column: String,
        reason: String,
    },
    #[error("referential integrity violated for record ({group}, {group_ind}): {reason}")]
    ReferentialIntegrity {
        group: RecordGroup,
        group_ind: RecordGroupInd,
        reason: String,
    },
}

impl RecordError {
    pub fn sequencing(message: impl Into<String>) -> Self {
        Self::Sequencing(message.into())
    }

    /// Schema and naming errors are raised before any buffer is touched, so the
    /// caller may fix its input and retry the same call.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::ReferentialIntegrity { .. })
    }
}
