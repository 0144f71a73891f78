use thiserror::Error;

/// Crate-wide error kind. Every subsystem (namespace, block-checksum, async
/// I/O, scheduling) returns one of these rather than raising an exception.
#[derive(Debug, Error)]
pub enum NsError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    Exists(String),

    #[error("container not empty: {0}")]
    NotEmpty(String),

    #[error("range error: {0}")]
    Range(String),

    #[error("corrupt data: {0}")]
    Corrupt(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("operation expired")]
    Expired,

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl From<std::io::Error> for NsError {
    fn from(e: std::io::Error) -> Self {
        NsError::Io(e.to_string())
    }
}

impl From<bincode::error::EncodeError> for NsError {
    fn from(e: bincode::error::EncodeError) -> Self {
        NsError::Corrupt(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for NsError {
    fn from(e: bincode::error::DecodeError) -> Self {
        NsError::Corrupt(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, NsError>;
