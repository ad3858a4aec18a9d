//! Typed errors for the ETL core.
//!
//! Propagation policy: validation and write-conflict errors stay local to a
//! record, throttling stays local to the gate, anything that escapes a batch
//! loop becomes a batch failure, and only pre-loop failures are fatal.

use thiserror::Error;

use crate::models::SourceId;

/// Transport vs. payload failures when pulling from a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    Network,
    Data,
}

impl FetchErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchErrorKind::Network => "network",
            FetchErrorKind::Data => "data",
        }
    }
}

/// Per-record validation failures against the unified schema.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("field `{field}` is not numeric")]
    NotNumeric { field: &'static str },
    #[error("field `{field}` must be strictly positive, got {value}")]
    NotPositive { field: &'static str, value: f64 },
    #[error("field `{field}` must be non-negative, got {value}")]
    Negative { field: &'static str, value: f64 },
    #[error("symbol `{0}` exceeds 20 characters")]
    SymbolTooLong(String),
    #[error("name exceeds 100 characters")]
    NameTooLong,
    #[error("unparsable timestamp `{0}`")]
    BadTimestamp(String),
}

#[derive(Debug, Error)]
pub enum EtlError {
    #[error("a run is already in progress")]
    RunInProgress,

    #[error("admission denied for {source}, next token in ~{wait_hint_ms}ms")]
    Throttled { source: SourceId, wait_hint_ms: u64 },

    #[error("fetch from {source} failed ({}): {message}", .kind.as_str())]
    SourceFetch {
        source: SourceId,
        kind: FetchErrorKind,
        message: String,
    },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("batch {batch_no} failed for {source}: {message}")]
    Batch {
        source: SourceId,
        batch_no: usize,
        message: String,
    },

    #[error("fatal setup failure: {0}")]
    FatalSetup(String),
}
