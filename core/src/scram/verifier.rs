//! Stored SCRAM-SHA-256 credentials
//!
//! A verifier is serialized the way PostgreSQL stores it in `pg_authid`:
//! `SCRAM-SHA-256$<iterations>:<salt>$<StoredKey>:<ServerKey>`, with the salt
//! and both keys base64-encoded.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha2::Sha256;

use super::SCRAM_SHA_256;
use crate::crypto::{hmac_sha256, sha256};
use crate::error::{to_verifier_error, CoreError, Result};

/// Salt and iteration count used to derive the salted password
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyFactors {
    /// Random salt
    pub salt: Vec<u8>,

    /// PBKDF2 iteration count
    pub iterations: u32,
}

/// Server-side SCRAM credential; enough to verify a client without its password
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCredentials {
    /// Key derivation parameters
    pub key_factors: KeyFactors,

    /// `H(ClientKey)`
    pub stored_key: [u8; 32],

    /// `HMAC(SaltedPassword, "Server Key")`
    pub server_key: [u8; 32],
}

impl StoredCredentials {
    /// Parse a serialized verifier string
    ///
    /// Both `$` and `:` act as field separators; exactly five fields are
    /// required. The leading mechanism tag is not interpreted.
    pub fn parse(verifier: &str) -> Result<Self> {
        let normalized = verifier.replace('$', ":");
        let fields: Vec<&str> = normalized.split(':').collect();
        if fields.len() != 5 {
            return Err(CoreError::InvalidVerifier(format!(
                "expected 5 fields, found {}",
                fields.len()
            )));
        }

        let iterations: u32 = fields[1]
            .parse()
            .map_err(|e| to_verifier_error(format!("iteration count {:?}: {}", fields[1], e)))?;
        if iterations == 0 {
            return Err(CoreError::InvalidVerifier("iteration count must be positive".to_string()));
        }

        let salt = decode_field("salt", fields[2])?;
        if salt.is_empty() {
            return Err(CoreError::InvalidVerifier("salt is empty".to_string()));
        }

        Ok(Self {
            key_factors: KeyFactors { salt, iterations },
            stored_key: decode_key("stored key", fields[3])?,
            server_key: decode_key("server key", fields[4])?,
        })
    }

    /// Derive stored credentials from a password
    pub fn from_password(password: &[u8], salt: &[u8], iterations: u32) -> Self {
        let salted_password = salted_password(password, salt, iterations);
        let client_key = hmac_sha256(&salted_password, b"Client Key");

        Self {
            key_factors: KeyFactors {
                salt: salt.to_vec(),
                iterations,
            },
            stored_key: sha256(&client_key),
            server_key: hmac_sha256(&salted_password, b"Server Key"),
        }
    }

    /// Serialize into the `SCRAM-SHA-256$iter:salt$storedKey:serverKey` form
    pub fn to_verifier(&self) -> String {
        format!(
            "{}${}:{}${}:{}",
            SCRAM_SHA_256,
            self.key_factors.iterations,
            BASE64.encode(&self.key_factors.salt),
            BASE64.encode(self.stored_key),
            BASE64.encode(self.server_key)
        )
    }
}

impl FromStr for StoredCredentials {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for StoredCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_verifier())
    }
}

/// PBKDF2-HMAC-SHA-256 of the password, the `Hi()` function of RFC 5802
pub(crate) fn salted_password(password: &[u8], salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut output = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(password, salt, iterations, &mut output);
    output
}

fn decode_field(name: &str, value: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(value)
        .map_err(|e| to_verifier_error(format!("{}: {}", name, e)))
}

fn decode_key(name: &str, value: &str) -> Result<[u8; 32]> {
    let raw = decode_field(name, value)?;
    raw.as_slice()
        .try_into()
        .map_err(|_| to_verifier_error(format!("{} must be 32 bytes, found {}", name, raw.len())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    const SECUREPASSWORD_VERIFIER: &str = "SCRAM-SHA-256$4096:CCKYO5ux7oZ5CcIMzDXw/A==$I0vnZaWMaqCF2xR3/+lMgXwJZKdHILWKFsQm3QpgRp0=:TBiVAuxlUrYOBqnvsVzFISHxwG+aqAyWUcC8ovl5pGs=";

    #[test]
    fn test_parse_known_verifier() {
        let credentials = StoredCredentials::parse(SECUREPASSWORD_VERIFIER).unwrap();
        assert_eq!(credentials.key_factors.iterations, 4096);
        assert_eq!(credentials.key_factors.salt.len(), 16);

        let derived = StoredCredentials::from_password(
            b"securepassword",
            &credentials.key_factors.salt,
            4096,
        );
        assert_eq!(derived, credentials);
        assert_eq!(derived.to_verifier(), SECUREPASSWORD_VERIFIER);
    }

    #[test]
    fn test_parse_postgres_protocol_verifier() {
        let verifier = postgres_protocol::password::scram_sha_256(b"hunter2");
        let credentials: StoredCredentials = verifier.parse().unwrap();
        assert_eq!(credentials.to_string(), verifier);
    }

    #[rstest]
    #[case::too_few_fields("SCRAM-SHA-256$4096:c2FsdA==$c3RvcmVk")]
    #[case::too_many_fields("SCRAM-SHA-256$4096:c2FsdA==$a:b:c")]
    #[case::empty("")]
    #[case::non_numeric_iterations("SCRAM-SHA-256$many:CCKYO5ux7oZ5CcIMzDXw/A==$I0vnZaWMaqCF2xR3/+lMgXwJZKdHILWKFsQm3QpgRp0=:TBiVAuxlUrYOBqnvsVzFISHxwG+aqAyWUcC8ovl5pGs=")]
    #[case::negative_iterations("SCRAM-SHA-256$-1:CCKYO5ux7oZ5CcIMzDXw/A==$I0vnZaWMaqCF2xR3/+lMgXwJZKdHILWKFsQm3QpgRp0=:TBiVAuxlUrYOBqnvsVzFISHxwG+aqAyWUcC8ovl5pGs=")]
    #[case::zero_iterations("SCRAM-SHA-256$0:CCKYO5ux7oZ5CcIMzDXw/A==$I0vnZaWMaqCF2xR3/+lMgXwJZKdHILWKFsQm3QpgRp0=:TBiVAuxlUrYOBqnvsVzFISHxwG+aqAyWUcC8ovl5pGs=")]
    #[case::bad_salt("SCRAM-SHA-256$4096:not*base64$I0vnZaWMaqCF2xR3/+lMgXwJZKdHILWKFsQm3QpgRp0=:TBiVAuxlUrYOBqnvsVzFISHxwG+aqAyWUcC8ovl5pGs=")]
    #[case::empty_salt("SCRAM-SHA-256$4096:$I0vnZaWMaqCF2xR3/+lMgXwJZKdHILWKFsQm3QpgRp0=:TBiVAuxlUrYOBqnvsVzFISHxwG+aqAyWUcC8ovl5pGs=")]
    #[case::bad_stored_key("SCRAM-SHA-256$4096:CCKYO5ux7oZ5CcIMzDXw/A==$!!!!:TBiVAuxlUrYOBqnvsVzFISHxwG+aqAyWUcC8ovl5pGs=")]
    #[case::short_server_key("SCRAM-SHA-256$4096:CCKYO5ux7oZ5CcIMzDXw/A==$I0vnZaWMaqCF2xR3/+lMgXwJZKdHILWKFsQm3QpgRp0=:c2hvcnQ=")]
    fn test_parse_rejects_malformed(#[case] verifier: &str) {
        let result = StoredCredentials::parse(verifier);
        assert!(matches!(result, Err(CoreError::InvalidVerifier(_))), "{:?}", result);
    }

    proptest! {
        #[test]
        fn prop_verifier_round_trip(
            iterations in 1u32..=u32::MAX,
            salt in proptest::collection::vec(any::<u8>(), 1..64),
            stored_key in any::<[u8; 32]>(),
            server_key in any::<[u8; 32]>(),
        ) {
            let credentials = StoredCredentials {
                key_factors: KeyFactors { salt, iterations },
                stored_key,
                server_key,
            };
            let parsed = StoredCredentials::parse(&credentials.to_verifier()).unwrap();
            prop_assert_eq!(parsed, credentials);
        }

        #[test]
        fn prop_parse_never_panics(input in "\\PC{0,128}") {
            let _ = StoredCredentials::parse(&input);
        }
    }
}
