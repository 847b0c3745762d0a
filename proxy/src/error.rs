//! Error types for the PostgreSQL gateway
//!
//! This module provides the gateway's error taxonomy and the mapping from an
//! error to the fatal message a client is allowed to see.

use std::io;

use pggateway_core::CoreError;
use thiserror::Error;

use crate::tls::TlsError;

/// Result type for the gateway
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Error type for the gateway
#[derive(Debug, Error)]
pub enum GatewayError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed or unexpected protocol message
    #[error("PostgreSQL protocol error: {0}")]
    Protocol(String),

    /// Connection rejected by listener or plugin policy
    #[error("Policy error: {0}")]
    Policy(PolicyViolation),

    /// Client authentication failed
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Dialing or authenticating to the upstream server failed
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// TLS setup or handshake error
    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    /// Credential or SCRAM failure
    #[error("Credential error: {0}")]
    Credential(#[from] CoreError),

    /// The peer closed the connection
    #[error("Connection closed")]
    ConnectionClosed,
}

/// Reasons a connection is refused before or during authentication
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyViolation {
    /// Startup packet without a `user` option
    MissingUser,

    /// Startup packet without a `database` option
    MissingDatabase,

    /// Database not in the allow-list
    UnknownDatabase(String),

    /// Listener requires TLS but the client did not ask for it
    SslRequired,
}

impl std::fmt::Display for PolicyViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolicyViolation::MissingUser => write!(f, "user startup option is required"),
            PolicyViolation::MissingDatabase => write!(f, "database startup option is required"),
            PolicyViolation::UnknownDatabase(database) => write!(f, "unknown database \"{}\"", database),
            PolicyViolation::SslRequired => write!(f, "server does not support SSL, but SSL was required"),
        }
    }
}

impl GatewayError {
    /// Whether this error is an ordinary disconnect rather than a failure
    pub fn is_disconnect(&self) -> bool {
        match self {
            GatewayError::ConnectionClosed => true,
            GatewayError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof | io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

/// Message sent to clients whose authentication failed
pub const AUTH_FAILED_MESSAGE: &str = "failed to authenticate";

/// Message sent to clients when the upstream server could not be used
pub const UPSTREAM_FAILED_MESSAGE: &str = "error connecting to server";

/// Convert a GatewayError to the SQLSTATE and message shown to the client
///
/// Authentication and upstream failures are deliberately generic.
pub fn to_pg_error(error: &GatewayError) -> (&'static str, String) {
    match error {
        GatewayError::Policy(PolicyViolation::UnknownDatabase(_)) => ("3D000", error_text(error)), // Invalid catalog name
        GatewayError::Policy(_) => ("28000", error_text(error)), // Invalid authorization specification
        GatewayError::Protocol(msg) => ("08P01", msg.clone()), // Protocol violation
        GatewayError::Auth(_) | GatewayError::Credential(_) => ("28P01", AUTH_FAILED_MESSAGE.to_string()), // Invalid password
        GatewayError::Upstream(_) => ("08006", UPSTREAM_FAILED_MESSAGE.to_string()), // Connection failure
        _ => ("XX000", "internal error".to_string()), // Internal error
    }
}

fn error_text(error: &GatewayError) -> String {
    match error {
        GatewayError::Policy(violation) => violation.to_string(),
        other => other.to_string(),
    }
}
