use crate::error::RecordError;
use serde::{Deserialize, Serialize};
use std::fmt;

pub type RecordGroup = u64;
pub type RecordGroupInd = u64;
pub type RecordRow = u64;

pub const RECORD_GROUP_COLUMN: &str = "RecordGroup";
pub const RECORD_GROUP_IND_COLUMN: &str = "RecordGroupInd";
pub const RECORD_ROW_COLUMN: &str = "RecordRow";

/// Key of a record: one row in the procedure-parameter and metadata tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    pub group: RecordGroup,
    pub group_ind: RecordGroupInd,
}

/// Full index of one data sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordIndex {
    pub group: RecordGroup,
    pub group_ind: RecordGroupInd,
    pub row: RecordRow,
}

impl RecordIndex {
    pub fn record_key(&self) -> RecordKey {
        RecordKey {
            group: self.group,
            group_ind: self.group_ind,
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.group, self.group_ind)
    }
}

impl fmt::Display for RecordIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.group, self.group_ind, self.row)
    }
}

/// Hands out the three-level record index for a single producer.
///
/// Groups are never reused: a resumed allocator continues after the highest
/// group already persisted in the target, and a discarded group still
/// consumes its number.
#[derive(Debug, Clone, Default)]
pub struct IndexAllocator {
    last_group: Option<RecordGroup>,
    group_open: bool,
    next_group_ind: RecordGroupInd,
    current_group_ind: Option<RecordGroupInd>,
    next_row: RecordRow,
}

impl IndexAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resume(last_persisted: Option<RecordGroup>) -> Self {
        Self {
            last_group: last_persisted,
            ..Self::default()
        }
    }

    pub fn next_group(&mut self) -> RecordGroup {
        let group = self.last_group.map_or(0, |last| last + 1);
        self.last_group = Some(group);
        self.group_open = true;
        self.next_group_ind = 0;
        self.current_group_ind = None;
        self.next_row = 0;
        group
    }

    pub fn next_record(&mut self) -> Result<RecordGroupInd, RecordError> {
        if !self.group_open {
            return Err(RecordError::sequencing(
                "next_record called before a record group was opened",
            ));
        }
        let group_ind = self.next_group_ind;
        self.next_group_ind += 1;
        self.current_group_ind = Some(group_ind);
        self.next_row = 0;
        Ok(group_ind)
    }

    pub fn next_row(&mut self) -> Result<RecordRow, RecordError> {
        if self.current_group_ind.is_none() {
            return Err(RecordError::sequencing(
                "next_row called before a record was opened",
            ));
        }
        let row = self.next_row;
        self.next_row += 1;
        Ok(row)
    }

    /// Marks the current group as finished; the next record needs a new group.
    pub fn close_group(&mut self) {
        self.group_open = false;
        self.current_group_ind = None;
    }

    pub fn current_group(&self) -> Option<RecordGroup> {
        if self.group_open {
            self.last_group
        } else {
            None
        }
    }

    pub fn current_record(&self) -> Option<RecordKey> {
        let group = self.current_group()?;
        let group_ind = self.current_group_ind?;
        Some(RecordKey { group, group_ind })
    }

    pub fn last_group(&self) -> Option<RecordGroup> {
        self.last_group
    }

    /// Index of the most recently allocated row of the open record.
    pub fn current(&self) -> Option<RecordIndex> {
        let key = self.current_record()?;
        let row = self.next_row.checked_sub(1)?;
        Some(RecordIndex {
            group: key.group,
            group_ind: key.group_ind,
            row,
        })
    }
}
