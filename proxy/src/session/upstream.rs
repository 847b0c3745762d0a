//! Upstream connection setup
//!
//! Dialing the target, negotiating TLS with it and, for plugins that log in
//! on the client's behalf, answering whatever authentication method the real
//! server asks for.

use bytes::Bytes;
use pggateway_core::{md5_password_hash, ScramClient, SCRAM_SHA_256, SCRAM_SHA_256_PLUS};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use super::Session;
use crate::config::TargetConfig;
use crate::error::{GatewayError, Result};
use crate::protocol::codec::{BackendCodec, RawMessage};
use crate::protocol::formatter;
use crate::protocol::message::{AuthenticationRequest, BackendMessage};
use crate::protocol::parser::parse_backend_message;
use crate::stream::{boxed_tcp, BoxedStream};
use crate::tls::TlsConnector;

impl Session {
    /// Connect to `target`, upgrading to TLS first when `ssl` is set
    pub async fn dial(&mut self, target: &TargetConfig, connector: &TlsConnector, ssl: bool) -> Result<()> {
        let address = target.address();
        self.log.info(&format!("dialing upstream {}", address));

        let stream = match TcpStream::connect(&address).await {
            Ok(stream) => boxed_tcp(stream),
            Err(e) => {
                self.log.error(&format!("failed to dial upstream {}: {}", address, e));
                return Err(GatewayError::Upstream(format!("dial {}: {}", address, e)));
            }
        };

        let stream = if ssl {
            match negotiate_tls(stream, &target.host, connector).await {
                Ok(stream) => stream,
                Err(e) => {
                    let e = match e {
                        GatewayError::Upstream(_) => at_upstream(&address, e),
                        other => GatewayError::Upstream(format!(
                            "upstream {}: TLS negotiation failed: {}",
                            address, other
                        )),
                    };
                    self.log.error(&e.to_string());
                    return Err(e);
                }
            }
        } else {
            stream
        };

        self.upstream = Some(Framed::new(stream, BackendCodec::new()));
        self.upstream_address = Some(address);
        Ok(())
    }

    /// Forward the client's startup packet to the upstream unchanged
    pub async fn forward_startup(&mut self) -> Result<()> {
        let frame = self.startup_frame.clone();
        self.write_to_server(frame).await
    }

    /// Log in to the upstream as `user`, answering the method the server demands
    ///
    /// The startup message keeps every client option except `user`. The
    /// exchange runs until the server sends `AuthenticationOk`, which is passed
    /// to the client. A rejection by the server never reaches the client: it
    /// is logged with the upstream address and returned as an upstream error.
    pub async fn auth_on_server(&mut self, user: &str, password: &str) -> Result<()> {
        match self.login_upstream(user, password).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let address = self.upstream_address.clone().unwrap_or_default();
                let e = at_upstream(&address, e);
                self.log.error(&format!("upstream login as {} failed: {}", user, e));
                Err(e)
            }
        }
    }

    async fn login_upstream(&mut self, user: &str, password: &str) -> Result<()> {
        let startup = self.startup.with_user(user);
        self.write_to_server(formatter::startup_message(&startup))
            .await?;

        let (frame, message) = self.read_handshake_message().await?;
        let request = match message {
            BackendMessage::Authentication(request) => request,
            other => return Err(unexpected_response(&other)),
        };

        match request {
            AuthenticationRequest::Ok => return self.write_to_client(frame).await,
            AuthenticationRequest::CleartextPassword => {
                self.write_to_server(formatter::password_message(password.as_bytes()))
                    .await?
            }
            AuthenticationRequest::Md5Password { salt } => {
                let hash = md5_password_hash(user, password, &salt);
                self.write_to_server(formatter::password_message(hash.as_bytes()))
                    .await?
            }
            AuthenticationRequest::Sasl { mechanisms } => self.scram_on_server(&mechanisms, user, password).await?,
            other => {
                return Err(GatewayError::Upstream(format!(
                    "unexpected password request method {} from server",
                    other.code()
                )))
            }
        }

        self.await_authentication_ok().await
    }

    /// Wait for the server's verdict and pass `AuthenticationOk` to the client
    ///
    /// Notices sent before the verdict are passed on as well.
    async fn await_authentication_ok(&mut self) -> Result<()> {
        loop {
            let (frame, message) = self.read_handshake_message().await?;
            match message {
                BackendMessage::Authentication(AuthenticationRequest::Ok) => {
                    return self.write_to_client(frame).await;
                }
                BackendMessage::Other(b'N') => self.write_to_client(frame).await?,
                other => return Err(unexpected_response(&other)),
            }
        }
    }

    async fn scram_on_server(&mut self, mechanisms: &[String], user: &str, password: &str) -> Result<()> {
        if !mechanisms.iter().any(|m| m == SCRAM_SHA_256) {
            if mechanisms.iter().any(|m| m == SCRAM_SHA_256_PLUS) {
                return Err(GatewayError::Upstream(format!("{} is not supported", SCRAM_SHA_256_PLUS)));
            }
            return Err(GatewayError::Upstream(format!(
                "no supported SASL mechanism offered by server: {:?}",
                mechanisms
            )));
        }

        let mut client = ScramClient::new(user, password.as_bytes());
        let client_first = client.client_first().map_err(upstream_scram_error)?;

        let server_first = self
            .sasl_step(formatter::sasl_initial_response(SCRAM_SHA_256, client_first.as_bytes()), false)
            .await?;
        let client_final = client
            .handle_server_first(&server_first)
            .map_err(upstream_scram_error)?;

        let server_final = self
            .sasl_step(formatter::sasl_response(client_final.as_bytes()), true)
            .await?;
        client
            .verify_server_final(&server_final)
            .map_err(upstream_scram_error)
    }

    /// Send one SASL message and return the payload of the expected reply
    async fn sasl_step(&mut self, message: RawMessage, expect_final: bool) -> Result<Bytes> {
        self.write_to_server(message).await?;

        let (_, response) = self.read_handshake_message().await?;
        match response {
            BackendMessage::Authentication(AuthenticationRequest::SaslContinue { data }) if !expect_final => Ok(data),
            BackendMessage::Authentication(AuthenticationRequest::SaslFinal { data }) if expect_final => Ok(data),
            other => Err(unexpected_response(&other)),
        }
    }

    /// Read and parse an upstream message while the gateway drives the handshake
    async fn read_handshake_message(&mut self) -> Result<(RawMessage, BackendMessage)> {
        let frame = match self.read_server_message().await {
            Ok(frame) => frame,
            Err(e) if e.is_disconnect() => {
                return Err(GatewayError::Upstream(
                    "server closed the connection during authentication".to_string(),
                ))
            }
            Err(e) => return Err(e),
        };
        let message = parse_backend_message(&frame)?;
        Ok((frame, message))
    }
}

/// Send SSLRequest and upgrade if the server answers 'S'
async fn negotiate_tls(mut stream: BoxedStream, host: &str, connector: &TlsConnector) -> Result<BoxedStream> {
    stream.write_all(formatter::ssl_request().as_bytes()).await?;
    stream.flush().await?;

    match stream.read_u8().await? {
        b'S' => Ok(connector.connect(stream, host).await?),
        b'N' => Err(GatewayError::Upstream("server does not support SSL".to_string())),
        other => Err(GatewayError::Upstream(format!(
            "unexpected SSLRequest response '{}'",
            other.escape_ascii()
        ))),
    }
}

/// Name the upstream in an upstream error; other errors pass through
fn at_upstream(address: &str, error: GatewayError) -> GatewayError {
    match error {
        GatewayError::Upstream(message) => GatewayError::Upstream(format!("upstream {}: {}", address, message)),
        other => other,
    }
}

fn unexpected_response(message: &BackendMessage) -> GatewayError {
    match message {
        BackendMessage::ErrorResponse(fields) => GatewayError::Upstream(format!(
            "server responded with error: {} {}",
            fields.code.as_deref().unwrap_or("?"),
            fields.message.as_deref().unwrap_or("")
        )),
        other => GatewayError::Upstream(format!("unexpected response from server: {}", other.summary())),
    }
}

fn upstream_scram_error(error: pggateway_core::CoreError) -> GatewayError {
    GatewayError::Upstream(format!("SCRAM exchange with server failed: {}", error))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::PluginRegistry;
    use crate::protocol::codec::FrontendCodec;
    use crate::protocol::message::{ErrorFields, StartupPacket};
    use crate::protocol::parser::{parse_password_message, parse_sasl_initial_response, parse_sasl_response, parse_startup};
    use crate::session::test_session;
    use futures_util::{SinkExt, StreamExt};
    use pggateway_core::{ScramServer, StoredCredentials};
    use std::sync::Arc;
    use tokio::net::TcpListener;

    fn target(port: u16) -> TargetConfig {
        serde_yaml::from_str(&format!("host: 127.0.0.1\nport: {}\nuser: postgres", port)).unwrap()
    }

    /// Accept one connection and hand it to `script` as a framed server socket
    async fn fake_upstream<F, Fut>(script: F) -> (u16, tokio::task::JoinHandle<()>)
    where
        F: FnOnce(Framed<TcpStream, FrontendCodec>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            script(Framed::new(socket, FrontendCodec::new())).await;
        });
        (port, handle)
    }

    async fn read_startup(server: &mut Framed<TcpStream, FrontendCodec>) -> crate::protocol::StartupMessage {
        let frame = server.next().await.unwrap().unwrap();
        match parse_startup(&frame).unwrap() {
            StartupPacket::Startup(startup) => startup,
            other => panic!("Expected startup, got {:?}", other),
        }
    }

    fn session() -> (Session, tokio::io::DuplexStream) {
        test_session(Arc::new(PluginRegistry::new(Vec::new(), Vec::new())))
    }

    #[tokio::test]
    async fn test_md5_login_substitutes_user() {
        let (port, server) = fake_upstream(|mut server| async move {
            let startup = read_startup(&mut server).await;
            assert_eq!(startup.user(), Some("postgres"));
            assert_eq!(startup.database(), Some("test"));

            let salt = [9, 8, 7, 6];
            server
                .send(formatter::authentication_request(&AuthenticationRequest::Md5Password { salt }))
                .await
                .unwrap();
            let frame = server.next().await.unwrap().unwrap();
            let password = parse_password_message(&frame).unwrap();
            assert_eq!(&password[..], md5_password_hash("postgres", "secret", &salt).as_bytes());
            server
                .send(formatter::authentication_request(&AuthenticationRequest::Ok))
                .await
                .unwrap();
        })
        .await;

        let (mut session, mut client) = session();
        let connector = TlsConnector::new_insecure().unwrap();
        session.dial(&target(port), &connector, false).await.unwrap();
        session.auth_on_server("postgres", "secret").await.unwrap();
        server.await.unwrap();

        let ok = formatter::authentication_request(&AuthenticationRequest::Ok);
        let mut forwarded = vec![0u8; ok.len()];
        client.read_exact(&mut forwarded).await.unwrap();
        assert_eq!(forwarded, ok.as_bytes());
    }

    #[tokio::test]
    async fn test_cleartext_login_rejected_by_server() {
        let (port, server) = fake_upstream(|mut server| async move {
            read_startup(&mut server).await;
            server
                .send(formatter::authentication_request(&AuthenticationRequest::CleartextPassword))
                .await
                .unwrap();
            let frame = server.next().await.unwrap().unwrap();
            assert_eq!(&parse_password_message(&frame).unwrap()[..], b"wrong");
            server
                .send(formatter::error_response(&ErrorFields::fatal(
                    "28P01",
                    "password authentication failed for user \"postgres\"",
                )))
                .await
                .unwrap();
        })
        .await;

        let (mut session, _client) = session();
        let connector = TlsConnector::new_insecure().unwrap();
        session.dial(&target(port), &connector, false).await.unwrap();
        assert_eq!(session.upstream_address(), Some(format!("127.0.0.1:{}", port).as_str()));

        let result = session.auth_on_server("postgres", "wrong").await;
        let address = format!("127.0.0.1:{}", port);
        assert!(matches!(result, Err(GatewayError::Upstream(msg)) if msg.contains("28P01") && msg.contains(&address)));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_notice_before_authentication_ok_is_forwarded() {
        let notice = RawMessage::new(b'N', b"SNOTICE\0C00000\0Mhello\0\0");
        let sent = notice.clone();
        let (port, server) = fake_upstream(|mut server| async move {
            read_startup(&mut server).await;
            server
                .send(formatter::authentication_request(&AuthenticationRequest::CleartextPassword))
                .await
                .unwrap();
            server.next().await.unwrap().unwrap();
            server.send(sent).await.unwrap();
            server
                .send(formatter::authentication_request(&AuthenticationRequest::Ok))
                .await
                .unwrap();
        })
        .await;

        let (mut session, mut client) = session();
        let connector = TlsConnector::new_insecure().unwrap();
        session.dial(&target(port), &connector, false).await.unwrap();
        session.auth_on_server("postgres", "secret").await.unwrap();
        server.await.unwrap();

        let ok = formatter::authentication_request(&AuthenticationRequest::Ok);
        let mut forwarded = vec![0u8; notice.len() + ok.len()];
        client.read_exact(&mut forwarded).await.unwrap();
        assert_eq!(&forwarded[..notice.len()], notice.as_bytes());
        assert_eq!(&forwarded[notice.len()..], ok.as_bytes());
    }

    #[tokio::test]
    async fn test_scram_login_verifies_server() {
        let (port, server) = fake_upstream(|mut server| async move {
            read_startup(&mut server).await;
            server
                .send(formatter::authentication_request(&AuthenticationRequest::Sasl {
                    mechanisms: vec![SCRAM_SHA_256_PLUS.to_string(), SCRAM_SHA_256.to_string()],
                }))
                .await
                .unwrap();

            let credentials = StoredCredentials::from_password(b"secret", b"upstream-salt", 4096);
            let mut scram = ScramServer::new(credentials);

            let frame = server.next().await.unwrap().unwrap();
            let initial = parse_sasl_initial_response(&frame).unwrap();
            assert_eq!(initial.mechanism, SCRAM_SHA_256);
            let server_first = scram.handle_client_first(&initial.data).unwrap();
            server
                .send(formatter::authentication_request(&AuthenticationRequest::SaslContinue {
                    data: Bytes::from(server_first),
                }))
                .await
                .unwrap();

            let frame = server.next().await.unwrap().unwrap();
            let server_final = scram.handle_client_final(&parse_sasl_response(&frame).unwrap()).unwrap();
            server
                .send(formatter::authentication_request(&AuthenticationRequest::SaslFinal {
                    data: Bytes::from(server_final),
                }))
                .await
                .unwrap();
            server
                .send(formatter::authentication_request(&AuthenticationRequest::Ok))
                .await
                .unwrap();
        })
        .await;

        let (mut session, _client) = session();
        let connector = TlsConnector::new_insecure().unwrap();
        session.dial(&target(port), &connector, false).await.unwrap();
        session.auth_on_server("postgres", "secret").await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_scram_plus_only_is_rejected() {
        let (port, server) = fake_upstream(|mut server| async move {
            read_startup(&mut server).await;
            server
                .send(formatter::authentication_request(&AuthenticationRequest::Sasl {
                    mechanisms: vec![SCRAM_SHA_256_PLUS.to_string()],
                }))
                .await
                .unwrap();
        })
        .await;

        let (mut session, _client) = session();
        let connector = TlsConnector::new_insecure().unwrap();
        session.dial(&target(port), &connector, false).await.unwrap();
        let result = session.auth_on_server("postgres", "secret").await;
        assert!(matches!(result, Err(GatewayError::Upstream(msg)) if msg.contains("not supported")));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_error_response_is_upstream_error() {
        let (port, server) = fake_upstream(|mut server| async move {
            read_startup(&mut server).await;
            server
                .send(formatter::error_response(&ErrorFields::fatal("3D000", "database \"test\" does not exist")))
                .await
                .unwrap();
        })
        .await;

        let (mut session, _client) = session();
        let connector = TlsConnector::new_insecure().unwrap();
        session.dial(&target(port), &connector, false).await.unwrap();
        let result = session.auth_on_server("postgres", "secret").await;
        assert!(matches!(result, Err(GatewayError::Upstream(msg)) if msg.contains("3D000")));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_ssl_refused_by_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 8];
            socket.read_exact(&mut request).await.unwrap();
            assert_eq!(&request[..], formatter::ssl_request().as_bytes());
            socket.write_all(b"N").await.unwrap();
        });

        let (mut session, _client) = session();
        let connector = TlsConnector::new_insecure().unwrap();
        let result = session.dial(&target(port), &connector, true).await;
        assert!(matches!(result, Err(GatewayError::Upstream(msg)) if msg.contains("does not support SSL")));
        assert!(!session.has_upstream());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_dial_failure_is_upstream_error() {
        // Bind then drop to get a port nobody listens on
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let (mut session, _client) = session();
        let connector = TlsConnector::new_insecure().unwrap();
        let result = session.dial(&target(port), &connector, false).await;
        assert!(matches!(result, Err(GatewayError::Upstream(_))));
    }
}
