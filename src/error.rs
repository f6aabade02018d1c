use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, WriteError>;

/// Everything that can go wrong between `write_header` and `close`.
///
/// Only `IndexerUnavailable` (at construction) and, in permissive mode,
/// record-level `HeaderShape` conditions are recovered internally;
/// every other variant surfaces to the caller and leaves the writer
/// unusable.
#[derive(Debug, Error)]
pub enum WriteError {
    /// Dictionary lookup miss, duplicate header id, or an undeclared
    /// INFO/FORMAT/FILTER key on a record.
    #[error("header shape: {0}")]
    HeaderShape(String),

    /// Malformed record: empty alleles, end before start, negative counts.
    #[error("record shape: {0}")]
    RecordShape(String),

    /// The record exceeds a fixed BCF2 limit.
    #[error("unsupported record shape: {0}")]
    UnsupportedShape(String),

    /// Sort-buffer contract violation.
    #[error("ordering: {0}")]
    Ordering(String),

    /// Operation called in the wrong writer state.
    #[error("lifecycle: {0}")]
    Lifecycle(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    /// The index sink could not be opened. Non-fatal: indexing is
    /// disabled and writing continues.
    #[error("indexer unavailable: {0}")]
    IndexerUnavailable(String),
}

impl WriteError {
    pub(crate) fn header_shape(context: &str, detail: impl AsRef<str>) -> Self {
        WriteError::HeaderShape(format!("{}: {}", context, detail.as_ref()))
    }

    pub(crate) fn record_shape(chrom: &str, start: i64, detail: impl AsRef<str>) -> Self {
        WriteError::RecordShape(format!("{}:{}: {}", chrom, start, detail.as_ref()))
    }

    pub(crate) fn unsupported(chrom: &str, start: i64, detail: impl AsRef<str>) -> Self {
        WriteError::UnsupportedShape(format!("{}:{}: {}", chrom, start, detail.as_ref()))
    }

    /// A stand-in raised by every operation after the writer has
    /// already failed with `original`.
    pub(crate) fn poisoned(original: &str) -> Self {
        WriteError::Lifecycle(format!("writer failed previously: {}", original))
    }
}
