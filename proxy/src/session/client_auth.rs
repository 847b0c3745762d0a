//! Client-facing authentication exchanges
//!
//! The gateway plays the server role here: it issues the challenge, reads the
//! client's answer and checks it against a stored credential.

use bytes::Bytes;
use pggateway_core::{check_md5_password, check_plaintext_password, ScramServer, StoredCredentials, SCRAM_SHA_256};

use super::Session;
use crate::error::{GatewayError, Result};
use crate::protocol::codec::RawMessage;
use crate::protocol::formatter;
use crate::protocol::message::AuthenticationRequest;
use crate::protocol::parser::{parse_password_message, parse_sasl_initial_response, parse_sasl_response};

impl Session {
    /// Send a password challenge and return the client's password message payload
    ///
    /// MD5 challenges always carry this session's salt.
    pub async fn get_user_password(&mut self, request: AuthenticationRequest) -> Result<Bytes> {
        let request = match request {
            AuthenticationRequest::Md5Password { .. } => AuthenticationRequest::Md5Password { salt: self.salt() },
            other => other,
        };
        let frame = self.challenge_client(&request).await?;
        parse_password_message(&frame)
    }

    /// Verify the client against a plaintext stored password
    pub async fn authenticate_client_plaintext(&mut self, stored: &str) -> Result<()> {
        let password = self.get_user_password(AuthenticationRequest::CleartextPassword).await?;
        if !check_plaintext_password(stored, &password) {
            return Err(GatewayError::Auth(format!(
                "plaintext password check failed for user {}",
                self.user()
            )));
        }
        Ok(())
    }

    /// Verify the client against an `md5<hex>` stored credential
    pub async fn authenticate_client_md5(&mut self, stored: &str) -> Result<()> {
        let salt = self.salt();
        let response = self
            .get_user_password(AuthenticationRequest::Md5Password { salt })
            .await?;
        if !check_md5_password(stored, &salt, &response) {
            return Err(GatewayError::Auth(format!(
                "md5 password check failed for user {}",
                self.user()
            )));
        }
        Ok(())
    }

    /// Run the server side of SCRAM-SHA-256 against a stored verifier
    ///
    /// On success the client has received the server-final message; on any
    /// failure it has received nothing beyond the server-first message.
    pub async fn authenticate_client_scram(&mut self, credentials: &StoredCredentials) -> Result<()> {
        let request = AuthenticationRequest::Sasl {
            mechanisms: vec![SCRAM_SHA_256.to_string()],
        };
        let frame = self.challenge_client(&request).await?;
        let initial = parse_sasl_initial_response(&frame)?;
        if initial.mechanism != SCRAM_SHA_256 {
            return Err(GatewayError::Auth(format!(
                "client selected unsupported SASL mechanism {:?}",
                initial.mechanism
            )));
        }
        if initial.data.is_empty() {
            return Err(GatewayError::Protocol(
                "SASLInitialResponse carries no client-first message".to_string(),
            ));
        }

        let mut server = ScramServer::new(credentials.clone());
        let server_first = server.handle_client_first(&initial.data)?;

        let frame = self
            .challenge_client(&AuthenticationRequest::SaslContinue {
                data: Bytes::from(server_first),
            })
            .await?;
        let client_final = parse_sasl_response(&frame)?;
        let server_final = server.handle_client_final(&client_final)?;

        let done = AuthenticationRequest::SaslFinal {
            data: Bytes::from(server_final),
        };
        self.write_to_client(formatter::authentication_request(&done)).await
    }

    /// Write an authentication request and read the client's 'p' reply
    async fn challenge_client(&mut self, request: &AuthenticationRequest) -> Result<RawMessage> {
        self.write_to_client(formatter::authentication_request(request))
            .await?;

        let frame = self.read_client_message().await?;
        match frame.tag() {
            Some(b'p') => Ok(frame),
            Some(tag) => Err(GatewayError::Protocol(format!(
                "expected password message, got message type '{}'",
                tag.escape_ascii()
            ))),
            None => Err(GatewayError::Protocol("expected password message".to_string())),
        }
    }
}
