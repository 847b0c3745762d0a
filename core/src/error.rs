//! Error types for the core crate
//!
//! This module provides a consolidated error type for credential parsing
//! and SCRAM conversation failures.

use thiserror::Error;

/// Core error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A stored SCRAM verifier string could not be parsed
    #[error("Invalid SCRAM verifier: {0}")]
    InvalidVerifier(String),

    /// A SCRAM message was malformed or out of sequence
    #[error("SCRAM protocol error: {0}")]
    ScramProtocol(String),

    /// The peer's proof or signature did not verify
    #[error("SCRAM verification failed: {0}")]
    ScramVerification(String),

    /// Cryptographic operation error
    #[error("Cryptographic error: {0}")]
    CryptoError(String),
}

/// Result type for the core crate
pub type Result<T> = std::result::Result<T, CoreError>;

/// Convert a displayable error into a malformed-verifier error
pub fn to_verifier_error<E: std::fmt::Display>(err: E) -> CoreError {
    CoreError::InvalidVerifier(err.to_string())
}

/// Convert a displayable error into a SCRAM protocol error
pub fn to_scram_error<E: std::fmt::Display>(err: E) -> CoreError {
    CoreError::ScramProtocol(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoreError::InvalidVerifier("wrong field count".to_string());
        assert_eq!(err.to_string(), "Invalid SCRAM verifier: wrong field count");

        let err = to_scram_error("missing nonce");
        assert_eq!(err, CoreError::ScramProtocol("missing nonce".to_string()));
    }
}
