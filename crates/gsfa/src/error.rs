//! Error kinds for the GSFA writer and reader.

use compactindex::CompactIndexError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GsfaError {
    #[error("malformed header: {0}")]
    MalformedHeader(String),

    #[error("invalid magic bytes")]
    InvalidMagic,

    #[error("unsupported version: expected {expected}, got {got}")]
    UnsupportedVersion { expected: u64, got: u64 },

    #[error("key not found")]
    NotFound,

    #[error("out of bounds: {what}")]
    OutOfBounds { what: &'static str },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("operation canceled")]
    Canceled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("compact index error: {0}")]
    Index(#[from] CompactIndexError),

    #[error("zstd codec error: {0}")]
    Codec(String),
}

pub type Result<T> = std::result::Result<T, GsfaError>;
