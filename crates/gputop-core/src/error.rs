use std::num::ParseFloatError;

use thiserror::Error;

/// Failure to turn one telemetry row into a snapshot.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RecordError {
    /// Wrong number of fields, usually a row cut off mid-write.
    #[error("unexpected number of fields: got {found}, want {expected}")]
    Shape { found: usize, expected: usize },

    #[error("error parsing field {index} ({raw}): {source}")]
    FieldFormat {
        index: usize,
        raw: String,
        #[source]
        source: ParseFloatError,
    },
}

impl RecordError {
    /// True when the row is truncated rather than malformed.
    pub fn is_incomplete(&self) -> bool {
        matches!(self, RecordError::Shape { .. })
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Producer command must not be empty")]
    EmptyCommand,
}

pub type Result<T> = std::result::Result<T, RecordError>;
