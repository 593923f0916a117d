//! Persistence targets for record groups built with `labrec-core`.
//!
//! Three recorder kinds share one open/write/close lifecycle: delimited text
//! and SQLite store the merged table, the Parquet container keeps the three
//! category tables apart.

pub mod config;
pub mod container;
pub mod error;
mod lock;
pub mod plaintext;
pub mod recorder;
pub mod session;
pub mod sqlite;

pub use config::{Capability, RecorderConfig, RecorderKind};
pub use container::{ColumnKind, ColumnSpec, ContainerManifest, ParquetRecorder};
pub use error::RecorderError;
pub use plaintext::CsvRecorder;
pub use recorder::{Recorder, RecorderState, ResumePoint, WriteReport};
pub use session::ArchiveSession;
pub use sqlite::SqliteRecorder;
