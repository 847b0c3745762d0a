//! # pggateway core
//!
//! Credential handling for the PostgreSQL gateway: plaintext and salted MD5
//! password checks, SCRAM-SHA-256 stored credentials, and both roles of the
//! SCRAM conversation. Nothing in this crate performs I/O.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod crypto;
pub mod error;
pub mod scram;

/// Re-export common types for ease of use
pub use crypto::{check_md5_password, check_plaintext_password, generate_salt, md5_password_hash};
pub use error::{CoreError, Result};
pub use scram::{ScramClient, ScramServer, StoredCredentials, SCRAM_SHA_256, SCRAM_SHA_256_PLUS};

/// Version of the core crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
