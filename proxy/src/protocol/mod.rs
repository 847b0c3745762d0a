//! PostgreSQL wire protocol implementation
//!
//! This module provides framing, parsing and formatting for the subset of
//! the PostgreSQL frontend/backend protocol the gateway needs to understand.

/// Frame codecs and the raw frame type
pub mod codec;

/// Message types for the PostgreSQL wire protocol
pub mod message;

/// Message parser for PostgreSQL wire protocol messages
pub mod parser;

/// Message formatter for messages the gateway originates
pub mod formatter;

// Re-export common types
pub use self::codec::{BackendCodec, FrontendCodec, RawMessage};
pub use self::message::{
    AuthenticationRequest, BackendMessage, ErrorFields, FrontendMessage, SaslInitialResponse, StartupMessage,
    StartupPacket, TransactionStatus,
};
