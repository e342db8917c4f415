//! Common error types for the Burrow engine.

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`BurrowError`].
pub type BurrowResult<T> = Result<T, BurrowError>;

/// Common errors across the Burrow engine.
#[derive(Error, Diagnostic, Debug)]
pub enum BurrowError {
    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(burrow::io))]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_from_io() {
        let err: BurrowError = std::io::Error::other("disk full").into();
        assert!(matches!(err, BurrowError::Io(_)));
        assert_eq!(err.to_string(), "I/O error: disk full");
    }
}
