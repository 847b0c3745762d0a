//! PostgreSQL gateway
//!
//! This crate provides a transparent gateway for the PostgreSQL wire protocol.
//! It terminates client connections, authenticates them through a chain of
//! plugins, logs in to a real server on their behalf and relays the session.

// Error types and result
pub mod error;
pub use error::{GatewayError, PolicyViolation, Result};

// Configuration
pub mod config;
pub use config::{Config, ListenerConfig, TargetConfig};

// Wire protocol
pub mod protocol;

// Transport
pub mod stream;
pub mod tls;

// Authentication and logging plugins
pub mod plugins;
pub use plugins::{AuthenticationPlugin, LoggingPlugin, PluginCatalog, PluginRegistry};

// Client sessions
pub mod session;
pub use session::Session;

// Listener and server
pub mod listener;
pub use listener::Listener;
pub mod server;
pub use server::Server;
