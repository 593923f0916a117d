//! Record indexing and table model for archiving measurement output.
//!
//! A producer opens records with their procedure parameters and metadata and
//! appends data samples to them; [`CategoryTableBuilder`] keeps the three
//! category tables linked through the `(RecordGroup, RecordGroupInd,
//! RecordRow)` index, and [`TableMerger`] joins them into one wide table for
//! targets that store a single table.

pub mod builder;
pub mod error;
pub mod feed;
pub mod index;
pub mod merge;
pub mod schema;
pub mod sequence;
pub mod table;
pub mod value;

pub use builder::CategoryTableBuilder;
pub use error::RecordError;
pub use feed::{FeedPublisher, LiveFeed, LiveSample, DEFAULT_FEED_CAPACITY};
pub use index::{
    IndexAllocator, RecordGroup, RecordGroupInd, RecordIndex, RecordKey, RecordRow,
    RECORD_GROUP_COLUMN, RECORD_GROUP_IND_COLUMN, RECORD_ROW_COLUMN,
};
pub use merge::{MergedRow, MergedTable, TableMerger};
pub use schema::{
    Category, ColumnDiff, RecordSchema, TableSchema, INDEX_COLUMNS, META_PREFIX, PROC_PREFIX,
};
pub use sequence::{ProcedureSequence, SequenceError, SequenceNode, SequenceValue};
pub use table::{CategoryTable, GroupTables, TableRow};
pub use value::{value_map, CellValue, ValueMap};
