//! SCRAM-SHA-256 (RFC 5802 / RFC 7677) as used by PostgreSQL
//!
//! The gateway plays both roles: [`ScramServer`] verifies a connecting client
//! against [`StoredCredentials`], and [`ScramClient`] authenticates the gateway
//! to an upstream server. Channel binding is not supported in either role.

mod client;
mod server;
mod verifier;

pub use client::ScramClient;
pub use server::ScramServer;
pub use verifier::{KeyFactors, StoredCredentials};

use crate::error::{CoreError, Result};

/// SASL mechanism name for SCRAM-SHA-256
pub const SCRAM_SHA_256: &str = "SCRAM-SHA-256";

/// SASL mechanism name for SCRAM-SHA-256 with channel binding
pub const SCRAM_SHA_256_PLUS: &str = "SCRAM-SHA-256-PLUS";

/// Iteration count PostgreSQL uses for new verifiers
pub const DEFAULT_ITERATIONS: u32 = 4096;

/// Split a SCRAM message into `(name, value)` attributes
fn parse_attributes(message: &str) -> Result<Vec<(char, &str)>> {
    message
        .split(',')
        .map(|attribute| {
            let mut chars = attribute.chars();
            match (chars.next(), chars.next()) {
                (Some(name), Some('=')) if name.is_ascii_alphabetic() => Ok((name, &attribute[2..])),
                _ => Err(CoreError::ScramProtocol(format!("malformed attribute {:?}", attribute))),
            }
        })
        .collect()
}

/// Fetch a required attribute at a fixed position
fn expect_attribute<'a>(attributes: &[(char, &'a str)], index: usize, name: char) -> Result<&'a str> {
    match attributes.get(index) {
        Some((found, value)) if *found == name => Ok(value),
        Some((found, _)) => Err(CoreError::ScramProtocol(format!(
            "expected attribute '{}', found '{}'",
            name, found
        ))),
        None => Err(CoreError::ScramProtocol(format!("missing attribute '{}'", name))),
    }
}

fn utf8(message: &[u8]) -> Result<&str> {
    std::str::from_utf8(message).map_err(|_| CoreError::ScramProtocol("message is not UTF-8".to_string()))
}
