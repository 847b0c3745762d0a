//! Plaintext and salted MD5 password checks
//!
//! PostgreSQL's MD5 scheme stores `"md5" + hex(md5(password + user))` and
//! challenges the client with a 4-byte salt; the client answers with
//! `"md5" + hex(md5(inner_hex + salt))`.

use super::{secure_compare, MD5_SALT_LEN};

const MD5_PREFIX: &str = "md5";

/// Length of a hex-encoded MD5 digest
const MD5_HEX_LEN: usize = 32;

/// Build the stored credential for `user` / `password`
pub fn md5_stored_credential(user: &str, password: &str) -> String {
    let inner = md5::compute(format!("{}{}", password, user).as_bytes());
    format!("{}{:x}", MD5_PREFIX, inner)
}

/// Compute the salted response a client sends for an MD5 challenge
pub fn md5_password_hash(user: &str, password: &str, salt: &[u8; MD5_SALT_LEN]) -> String {
    let stored = md5_stored_credential(user, password);
    salted_digest(&stored[MD5_PREFIX.len()..], salt)
}

/// Check a client's response to an MD5 challenge against a stored credential
///
/// `stored` is the `md5<hex>` credential and `response` the raw password
/// message payload (without the trailing NUL). Malformed inputs never match.
pub fn check_md5_password(stored: &str, salt: &[u8; MD5_SALT_LEN], response: &[u8]) -> bool {
    let inner_hex = match stored.strip_prefix(MD5_PREFIX) {
        Some(hex) if hex.len() == MD5_HEX_LEN && hex.bytes().all(|b| b.is_ascii_hexdigit()) => hex,
        _ => return false,
    };
    if !response.starts_with(MD5_PREFIX.as_bytes()) {
        return false;
    }

    let expected = salted_digest(&inner_hex.to_ascii_lowercase(), salt);
    secure_compare(expected.as_bytes(), response)
}

/// Check a cleartext password byte-for-byte
pub fn check_plaintext_password(stored: &str, supplied: &[u8]) -> bool {
    secure_compare(stored.as_bytes(), supplied)
}

fn salted_digest(inner_hex: &str, salt: &[u8; MD5_SALT_LEN]) -> String {
    let mut data = Vec::with_capacity(inner_hex.len() + MD5_SALT_LEN);
    data.extend_from_slice(inner_hex.as_bytes());
    data.extend_from_slice(salt);
    format!("{}{:x}", MD5_PREFIX, md5::compute(&data))
}
