use crate::error::RecorderError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecorderKind {
    Csv,
    Sqlite,
    Parquet,
}

/// Whether a target stores one joined table or the three category tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Merging,
    NonMerging,
}

impl RecorderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RecorderKind::Csv => "csv",
            RecorderKind::Sqlite => "sqlite",
            RecorderKind::Parquet => "parquet",
        }
    }

    pub fn capability(self) -> Capability {
        match self {
            RecorderKind::Csv | RecorderKind::Sqlite => Capability::Merging,
            RecorderKind::Parquet => Capability::NonMerging,
        }
    }

    /// Conventional file extension of the target, used when a config names a
    /// bare stem.
    pub fn extension(self) -> &'static str {
        match self {
            RecorderKind::Csv => "csv",
            RecorderKind::Sqlite => "sqlite",
            RecorderKind::Parquet => "lrc",
        }
    }
}

impl fmt::Display for RecorderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecorderKind {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "csv" | "plaintext" | "text" => Ok(RecorderKind::Csv),
            "sqlite" | "sql" | "db" => Ok(RecorderKind::Sqlite),
            "parquet" | "binary" | "container" => Ok(RecorderKind::Parquet),
            other => Err(format!("Unknown recorder kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecorderConfig {
    pub kind: RecorderKind,
    pub path: PathBuf,
}

impl RecorderConfig {
    pub fn new(kind: RecorderKind, path: impl Into<PathBuf>) -> Self {
        let mut path = path.into();
        if path.extension().is_none() {
            path.set_extension(kind.extension());
        }
        Self { kind, path }
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, RecorderError> {
        let config: RecorderConfig =
            toml::from_str(contents).map_err(|err| RecorderError::Config(err.to_string()))?;
        Ok(Self::new(config.kind, config.path))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, RecorderError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&contents)
    }

    pub fn to_toml_string(&self) -> Result<String, RecorderError> {
        toml::to_string_pretty(self).map_err(|err| RecorderError::Config(err.to_string()))
    }
}
