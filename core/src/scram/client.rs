//! Client role of the SCRAM-SHA-256 exchange

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use super::verifier::salted_password;
use super::{expect_attribute, parse_attributes, utf8};
use crate::crypto::{generate_nonce, hmac_sha256, secure_compare, sha256, xor_bytes};
use crate::error::{to_scram_error, CoreError, Result};

/// gs2 header for a client without channel binding support
const GS2_HEADER: &str = "n,,";

/// `base64(GS2_HEADER)`
const CHANNEL_BINDING: &str = "biws";

#[derive(Debug)]
enum ClientState {
    Initial,
    WaitingForServerFirst { client_first_bare: String },
    WaitingForServerFinal { server_signature: [u8; 32] },
    Complete,
    Failed,
}

/// Drives a SCRAM-SHA-256 exchange against a server
pub struct ScramClient {
    user: String,
    password: Vec<u8>,
    nonce: String,
    state: ClientState,
}

impl ScramClient {
    /// Create a client for `user` / `password`
    pub fn new(user: &str, password: &[u8]) -> Self {
        Self::with_nonce(user, password, generate_nonce())
    }

    pub(crate) fn with_nonce(user: &str, password: &[u8], nonce: String) -> Self {
        Self {
            user: user.to_string(),
            password: password.to_vec(),
            nonce,
            state: ClientState::Initial,
        }
    }

    /// Produce client-first-message
    pub fn client_first(&mut self) -> Result<String> {
        if !matches!(self.state, ClientState::Initial) {
            self.state = ClientState::Failed;
            return Err(to_scram_error("client-first-message already sent"));
        }

        let client_first_bare = format!("n={},r={}", escape_username(&self.user), self.nonce);
        let message = format!("{}{}", GS2_HEADER, client_first_bare);
        self.state = ClientState::WaitingForServerFirst { client_first_bare };
        Ok(message)
    }

    /// Consume server-first-message and produce client-final-message
    pub fn handle_server_first(&mut self, message: &[u8]) -> Result<String> {
        let state = std::mem::replace(&mut self.state, ClientState::Failed);
        let ClientState::WaitingForServerFirst { client_first_bare } = state else {
            return Err(to_scram_error("server-first-message out of sequence"));
        };

        let server_first = utf8(message)?;
        let attributes = parse_attributes(server_first)?;
        let nonce = expect_attribute(&attributes, 0, 'r')?;
        if !nonce.starts_with(&self.nonce) || nonce.len() == self.nonce.len() {
            return Err(to_scram_error("server nonce does not extend client nonce"));
        }
        let salt = BASE64
            .decode(expect_attribute(&attributes, 1, 's')?)
            .map_err(|e| to_scram_error(format!("invalid salt encoding: {}", e)))?;
        let iterations: u32 = expect_attribute(&attributes, 2, 'i')?
            .parse()
            .map_err(|e| to_scram_error(format!("invalid iteration count: {}", e)))?;
        if iterations == 0 {
            return Err(to_scram_error("iteration count must be positive"));
        }

        let salted_password = salted_password(&self.password, &salt, iterations);
        let client_key = hmac_sha256(&salted_password, b"Client Key");
        let stored_key = sha256(&client_key);
        let server_key = hmac_sha256(&salted_password, b"Server Key");

        let without_proof = format!("c={},r={}", CHANNEL_BINDING, nonce);
        let auth_message = format!("{},{},{}", client_first_bare, server_first, without_proof);

        let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes());
        let proof = xor_bytes(&client_key, &client_signature);
        let server_signature = hmac_sha256(&server_key, auth_message.as_bytes());

        self.state = ClientState::WaitingForServerFinal { server_signature };
        Ok(format!("{},p={}", without_proof, BASE64.encode(proof)))
    }

    /// Verify server-final-message
    pub fn verify_server_final(&mut self, message: &[u8]) -> Result<()> {
        let state = std::mem::replace(&mut self.state, ClientState::Failed);
        let ClientState::WaitingForServerFinal { server_signature } = state else {
            return Err(to_scram_error("server-final-message out of sequence"));
        };

        let message = utf8(message)?;
        let attributes = parse_attributes(message)?;
        match attributes.first() {
            Some(('v', signature)) => {
                let signature = BASE64
                    .decode(signature)
                    .map_err(|e| to_scram_error(format!("invalid server signature encoding: {}", e)))?;
                if !secure_compare(&signature, &server_signature) {
                    return Err(CoreError::ScramVerification("server signature mismatch".to_string()));
                }
                self.state = ClientState::Complete;
                Ok(())
            }
            Some(('e', reason)) => Err(CoreError::ScramVerification(format!("server rejected authentication: {}", reason))),
            _ => Err(to_scram_error("server-final-message has no verifier")),
        }
    }

    /// Whether the server signature has been verified
    pub fn is_complete(&self) -> bool {
        matches!(self.state, ClientState::Complete)
    }
}

impl std::fmt::Debug for ScramClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScramClient")
            .field("user", &self.user)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// Escape `=` and `,` in a SCRAM username (RFC 5802 section 5.1)
fn escape_username(user: &str) -> String {
    user.replace('=', "=3D").replace(',', "=2C")
}

#[cfg(test)]
mod tests {
    use super::*;

    const SERVER_FIRST: &str =
        "r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096";

    fn rfc7677_client() -> ScramClient {
        ScramClient::with_nonce("user", b"pencil", "rOprNGfwEbeRWgbNEkqO".to_string())
    }

    #[test]
    fn test_rfc7677_exchange() {
        let mut client = rfc7677_client();
        assert_eq!(client.client_first().unwrap(), "n,,n=user,r=rOprNGfwEbeRWgbNEkqO");

        let client_final = client.handle_server_first(SERVER_FIRST.as_bytes()).unwrap();
        assert_eq!(
            client_final,
            "c=biws,r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,p=dHzbZapWIk4jUhN+Ute9ytag9zjfMHgsqmmiz7AndVQ="
        );

        client
            .verify_server_final(b"v=6rriTRBi23WpRR/wtup+mMhUZUn/dB5nLTJRsjl95G4=")
            .unwrap();
        assert!(client.is_complete());
    }

    #[test]
    fn test_bad_server_signature() {
        let mut client = rfc7677_client();
        client.client_first().unwrap();
        client.handle_server_first(SERVER_FIRST.as_bytes()).unwrap();

        let result = client.verify_server_final(b"v=AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=");
        assert!(matches!(result, Err(CoreError::ScramVerification(_))));
        assert!(!client.is_complete());
    }

    #[test]
    fn test_server_error_attribute() {
        let mut client = rfc7677_client();
        client.client_first().unwrap();
        client.handle_server_first(SERVER_FIRST.as_bytes()).unwrap();

        let result = client.verify_server_final(b"e=invalid-proof");
        assert!(matches!(result, Err(CoreError::ScramVerification(msg)) if msg.contains("invalid-proof")));
    }

    #[test]
    fn test_server_nonce_must_extend_client_nonce() {
        let mut client = rfc7677_client();
        client.client_first().unwrap();
        let result = client.handle_server_first(b"r=someoneelse,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096");
        assert!(result.is_err());

        let mut client = rfc7677_client();
        client.client_first().unwrap();
        let result = client.handle_server_first(b"r=rOprNGfwEbeRWgbNEkqO,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096");
        assert!(result.is_err());
    }

    #[test]
    fn test_out_of_sequence() {
        let mut client = rfc7677_client();
        assert!(client.handle_server_first(SERVER_FIRST.as_bytes()).is_err());

        let mut client = rfc7677_client();
        client.client_first().unwrap();
        assert!(client.client_first().is_err());
    }

    #[test]
    fn test_escape_username() {
        assert_eq!(escape_username("a=b,c"), "a=3Db=2Cc");
        assert_eq!(escape_username("plain"), "plain");
    }
}
