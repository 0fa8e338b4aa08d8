use thiserror::Error;

/// Shared lightweight error type for core primitive operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Invalid caller input or malformed primitive value.
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    /// Decode/parsing failure.
    #[error("decode error: {0}")]
    Decode(&'static str),
}
