//! Cryptographic primitives shared by the credential checks
//!
//! This module provides the hashing, HMAC and randomness helpers used by the
//! salted MD5 check and both SCRAM conversation roles.

mod password;

pub use password::{check_md5_password, check_plaintext_password, md5_password_hash, md5_stored_credential};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use constant_time_eq::constant_time_eq;
use hmac::{Hmac, Mac};
use rand::{thread_rng, Rng, RngCore};
use sha2::{Digest, Sha256};

/// Length of the salt PostgreSQL uses for MD5 challenges
pub const MD5_SALT_LEN: usize = 4;

/// Number of random bytes in a SCRAM nonce before base64 encoding
const NONCE_LEN: usize = 18;

/// Generate a random 4-byte salt for an MD5 challenge
pub fn generate_salt() -> [u8; MD5_SALT_LEN] {
    let mut salt = [0u8; MD5_SALT_LEN];
    thread_rng().fill(&mut salt);
    salt
}

/// Generate a printable SCRAM nonce
///
/// Base64 output never contains `,`, so the nonce is safe to embed in a
/// SCRAM attribute list.
pub fn generate_nonce() -> String {
    let mut bytes = [0u8; NONCE_LEN];
    thread_rng().fill_bytes(&mut bytes);
    BASE64.encode(bytes)
}

/// SHA-256 of `data`
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut output = [0u8; 32];
    output.copy_from_slice(&Sha256::digest(data));
    output
}

/// HMAC-SHA-256 of `data` under `key`
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    let mut output = [0u8; 32];
    output.copy_from_slice(&mac.finalize().into_bytes());
    output
}

/// XOR two equal-length byte strings
pub fn xor_bytes(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut output = [0u8; 32];
    for (i, byte) in output.iter_mut().enumerate() {
        *byte = a[i] ^ b[i];
    }
    output
}

/// Compare two byte strings in constant time
pub fn secure_compare(a: &[u8], b: &[u8]) -> bool {
    constant_time_eq(a, b)
}
