//! Server role of the SCRAM-SHA-256 exchange

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use super::{expect_attribute, parse_attributes, utf8, StoredCredentials};
use crate::crypto::{generate_nonce, hmac_sha256, secure_compare, sha256, xor_bytes};
use crate::error::{to_scram_error, CoreError, Result};

#[derive(Debug)]
enum ServerState {
    /// Waiting for client-first-message
    Initial,

    /// server-first-message sent, waiting for client-final-message
    WaitingForClientFinal {
        gs2_header: String,
        client_first_bare: String,
        server_first: String,
        nonce: String,
    },

    /// Client proof verified and server-final-message produced
    Complete,

    /// A step failed; the conversation cannot continue
    Failed,
}

/// Verifies a SCRAM-SHA-256 client against stored credentials
#[derive(Debug)]
pub struct ScramServer {
    credentials: StoredCredentials,
    server_nonce: String,
    state: ServerState,
}

impl ScramServer {
    /// Start a conversation for the given stored credentials
    pub fn new(credentials: StoredCredentials) -> Self {
        Self::with_nonce(credentials, generate_nonce())
    }

    pub(crate) fn with_nonce(credentials: StoredCredentials, server_nonce: String) -> Self {
        Self {
            credentials,
            server_nonce,
            state: ServerState::Initial,
        }
    }

    /// Consume client-first-message and produce server-first-message
    ///
    /// The username attribute is not interpreted; PostgreSQL clients send an
    /// empty one and identify the role through the startup packet instead.
    pub fn handle_client_first(&mut self, message: &[u8]) -> Result<String> {
        if !matches!(self.state, ServerState::Initial) {
            return Err(self.fail("client-first-message out of sequence"));
        }

        let result = self.parse_client_first(message);
        match result {
            Ok((gs2_header, client_first_bare, client_nonce)) => {
                let nonce = format!("{}{}", client_nonce, self.server_nonce);
                let server_first = format!(
                    "r={},s={},i={}",
                    nonce,
                    BASE64.encode(&self.credentials.key_factors.salt),
                    self.credentials.key_factors.iterations
                );
                self.state = ServerState::WaitingForClientFinal {
                    gs2_header,
                    client_first_bare,
                    server_first: server_first.clone(),
                    nonce,
                };
                Ok(server_first)
            }
            Err(e) => {
                self.state = ServerState::Failed;
                Err(e)
            }
        }
    }

    /// Consume client-final-message, verify the proof and produce server-final-message
    pub fn handle_client_final(&mut self, message: &[u8]) -> Result<String> {
        let state = std::mem::replace(&mut self.state, ServerState::Failed);
        let ServerState::WaitingForClientFinal {
            gs2_header,
            client_first_bare,
            server_first,
            nonce,
        } = state
        else {
            return Err(to_scram_error("client-final-message out of sequence"));
        };

        let message = utf8(message)?;
        let proof_start = message
            .rfind(",p=")
            .ok_or_else(|| to_scram_error("client-final-message has no proof"))?;
        let without_proof = &message[..proof_start];
        let proof = BASE64
            .decode(&message[proof_start + 3..])
            .map_err(|e| to_scram_error(format!("invalid proof encoding: {}", e)))?;
        let proof: [u8; 32] = proof
            .as_slice()
            .try_into()
            .map_err(|_| to_scram_error("proof must be 32 bytes"))?;

        let attributes = parse_attributes(without_proof)?;
        let channel_binding = BASE64
            .decode(expect_attribute(&attributes, 0, 'c')?)
            .map_err(|e| to_scram_error(format!("invalid channel binding encoding: {}", e)))?;
        if channel_binding != gs2_header.as_bytes() {
            return Err(to_scram_error("channel binding does not match gs2 header"));
        }
        if expect_attribute(&attributes, 1, 'r')? != nonce {
            return Err(to_scram_error("nonce mismatch"));
        }

        let auth_message = format!("{},{},{}", client_first_bare, server_first, without_proof);
        let client_signature = hmac_sha256(&self.credentials.stored_key, auth_message.as_bytes());
        let client_key = xor_bytes(&proof, &client_signature);
        if !secure_compare(&sha256(&client_key), &self.credentials.stored_key) {
            return Err(CoreError::ScramVerification("invalid client proof".to_string()));
        }

        let server_signature = hmac_sha256(&self.credentials.server_key, auth_message.as_bytes());
        self.state = ServerState::Complete;
        Ok(format!("v={}", BASE64.encode(server_signature)))
    }

    /// Whether the client has been verified
    pub fn is_complete(&self) -> bool {
        matches!(self.state, ServerState::Complete)
    }

    fn parse_client_first(&self, message: &[u8]) -> Result<(String, String, String)> {
        let message = utf8(message)?;

        // gs2-header: cbind-flag "," [authzid] ","
        let mut parts = message.splitn(3, ',');
        let cbind_flag = parts.next().unwrap_or_default();
        let authzid = parts
            .next()
            .ok_or_else(|| to_scram_error("client-first-message has no gs2 header"))?;
        let client_first_bare = parts
            .next()
            .ok_or_else(|| to_scram_error("client-first-message has no bare part"))?;

        match cbind_flag {
            "n" | "y" => {}
            flag if flag.starts_with("p=") => {
                return Err(to_scram_error("channel binding is not supported"));
            }
            flag => return Err(to_scram_error(format!("invalid channel binding flag {:?}", flag))),
        }
        if !authzid.is_empty() {
            return Err(to_scram_error("authorization identity is not supported"));
        }

        let attributes = parse_attributes(client_first_bare)?;
        expect_attribute(&attributes, 0, 'n')?;
        let client_nonce = expect_attribute(&attributes, 1, 'r')?;
        if client_nonce.is_empty() {
            return Err(to_scram_error("client nonce is empty"));
        }

        let gs2_header = format!("{},{},", cbind_flag, authzid);
        Ok((gs2_header, client_first_bare.to_string(), client_nonce.to_string()))
    }

    fn fail(&mut self, reason: &str) -> CoreError {
        self.state = ServerState::Failed;
        to_scram_error(reason)
    }
}
