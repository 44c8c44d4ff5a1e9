use thiserror::Error;

/// Errors surfaced by [`crate::builder::CompactIndexBuilder`] and
/// [`crate::reader::CompactIndexReader`].
#[derive(Debug, Error)]
pub enum CompactIndexError {
    #[error("invalid magic bytes — not a compactindex file")]
    InvalidMagic,

    #[error("unsupported format version {got} (expected {expected})")]
    UnsupportedVersion { expected: u8, got: u8 },

    #[error("malformed header: {0}")]
    MalformedHeader(String),

    #[error("key not found")]
    NotFound,

    #[error("mining exhausted its attempt budget for bucket {bucket}")]
    Collision { bucket: u32 },

    #[error("offset or index {what} out of bounds")]
    OutOfBounds { what: &'static str },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation canceled")]
    Canceled,

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, CompactIndexError>;
