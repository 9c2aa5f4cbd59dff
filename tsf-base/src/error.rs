// Every error is traced at the point it is constructed (see the `new_*`
// constructors below), not only when it is displayed or propagated, following
// the same discipline as submerge-base::error::Error::new.

use std::path::PathBuf;
use tracing::{debug, error, warn};

pub type Result<T> = std::result::Result<T, TsfError>;

#[derive(Debug, thiserror::Error)]
pub enum TsfError {
    #[error("failed to open catalog '{path}': {message}")]
    OpenFailed { path: PathBuf, message: String },

    #[error("failed to prepare statement for chunk table '{table}': {message}")]
    PrepareFailed { table: String, message: String },

    #[error("corrupt chunk header for chunk table '{table}' chunk {chunk_id}: {reason}")]
    CorruptHeader {
        table: String,
        chunk_id: i64,
        reason: String,
    },

    #[error("unknown value-type format tag '{tag}' in chunk table '{table}' chunk {chunk_id}")]
    UnknownFormat {
        table: String,
        chunk_id: i64,
        tag: String,
    },

    #[error("corrupt compressed data in chunk table '{table}' chunk {chunk_id}: {reason}")]
    CorruptData {
        table: String,
        chunk_id: i64,
        reason: String,
    },

    #[error("out of memory decompressing chunk table '{table}' chunk {chunk_id}")]
    OutOfMemory { table: String, chunk_id: i64 },

    #[error("short buffer decompressing chunk table '{table}' chunk {chunk_id}")]
    ShortBuffer { table: String, chunk_id: i64 },

    #[error("unknown compression method {method} in chunk table '{table}' chunk {chunk_id}")]
    UnknownCompression {
        table: String,
        chunk_id: i64,
        method: u8,
    },

    #[error("field '{symbol}' of value type {value_type:?} does not support indirection")]
    UnsupportedIndirection {
        symbol: String,
        value_type: &'static str,
    },

    #[error("no field with symbol '{symbol}' in source")]
    UnknownField { symbol: String },

    #[error("fields passed to query_table must share one field layout, got {first:?} and {other:?}")]
    InconsistentFieldTypes {
        first: &'static str,
        other: &'static str,
    },

    #[error("offset {offset} is out of range for chunk of {len} records")]
    OutOfRange { offset: i64, len: i64 },

    #[error("sqlite error: {0}")]
    Sqlite(String),

    #[error("malformed metadata JSON: {0}")]
    Json(String),
}

impl TsfError {
    pub fn open_failed(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        let e = TsfError::OpenFailed {
            path: path.into(),
            message: message.into(),
        };
        error!(target: "tsf", "{e}");
        e
    }

    pub fn prepare_failed(table: impl Into<String>, message: impl Into<String>) -> Self {
        let e = TsfError::PrepareFailed {
            table: table.into(),
            message: message.into(),
        };
        error!(target: "tsf", "{e}");
        e
    }

    pub fn corrupt_header(
        table: impl Into<String>,
        chunk_id: i64,
        reason: impl Into<String>,
    ) -> Self {
        let e = TsfError::CorruptHeader {
            table: table.into(),
            chunk_id,
            reason: reason.into(),
        };
        warn!(target: "tsf", "{e}");
        e
    }

    pub fn unknown_format(table: impl Into<String>, chunk_id: i64, tag: impl Into<String>) -> Self {
        let e = TsfError::UnknownFormat {
            table: table.into(),
            chunk_id,
            tag: tag.into(),
        };
        warn!(target: "tsf", "{e}");
        e
    }

    pub fn corrupt_data(table: impl Into<String>, chunk_id: i64, reason: impl Into<String>) -> Self {
        let e = TsfError::CorruptData {
            table: table.into(),
            chunk_id,
            reason: reason.into(),
        };
        warn!(target: "tsf", "{e}");
        e
    }

    pub fn unsupported_indirection(symbol: impl Into<String>, value_type: &'static str) -> Self {
        let e = TsfError::UnsupportedIndirection {
            symbol: symbol.into(),
            value_type,
        };
        warn!(target: "tsf", "{e}");
        e
    }

    pub fn unknown_field(symbol: impl Into<String>) -> Self {
        let e = TsfError::UnknownField {
            symbol: symbol.into(),
        };
        warn!(target: "tsf", "{e}");
        e
    }

    pub fn inconsistent_field_types(first: &'static str, other: &'static str) -> Self {
        let e = TsfError::InconsistentFieldTypes { first, other };
        warn!(target: "tsf", "{e}");
        e
    }

    pub fn out_of_range(offset: i64, len: i64) -> Self {
        let e = TsfError::OutOfRange { offset, len };
        debug!(target: "tsf", "{e}");
        e
    }

    pub fn out_of_memory(table: impl Into<String>, chunk_id: i64) -> Self {
        let e = TsfError::OutOfMemory {
            table: table.into(),
            chunk_id,
        };
        error!(target: "tsf", "{e}");
        e
    }
}

impl From<rusqlite::Error> for TsfError {
    fn from(err: rusqlite::Error) -> Self {
        let e = TsfError::Sqlite(err.to_string());
        error!(target: "tsf", "{e}");
        e
    }
}

impl From<serde_json::Error> for TsfError {
    fn from(err: serde_json::Error) -> Self {
        let e = TsfError::Json(err.to_string());
        warn!(target: "tsf", "{e}");
        e
    }
}
