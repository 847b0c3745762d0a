//! Client sessions
//!
//! A [`Session`] is one client connection that passed the listener's
//! startup checks. It is authenticated by the listener's plugin chain, which
//! also dials the upstream server, and then relays traffic in both directions
//! until either side goes away.

mod client_auth;
mod relay;
mod upstream;

pub use relay::{is_flush_boundary, RelayBatch, FLUSH_THRESHOLD};

use std::fmt;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use pggateway_core::generate_salt;
use tokio_util::codec::Framed;
use uuid::Uuid;

use crate::error::{to_pg_error, GatewayError, Result};
use crate::plugins::{LogContext, LogLevel, PluginRegistry};
use crate::protocol::codec::{BackendCodec, FrontendCodec, RawMessage};
use crate::protocol::formatter;
use crate::protocol::message::StartupMessage;
use crate::protocol::parser::{parse_backend_message, parse_frontend_message};
use crate::stream::BoxedStream;

/// Framed connection to a client
pub type ClientConnection = Framed<BoxedStream, FrontendCodec>;

/// Framed connection to an upstream server
pub type UpstreamConnection = Framed<BoxedStream, BackendCodec>;

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Startup accepted, nothing exchanged yet
    Created,
    /// Running the authentication chain
    Authenticating,
    /// Relaying between client and upstream
    Proxying,
    /// Connections released
    Closed,
}

/// One client connection and, once dialed, its upstream connection
pub struct Session {
    id: Uuid,
    user: String,
    database: String,
    is_encrypted: bool,

    /// Parsed startup message
    startup: StartupMessage,

    /// Startup packet exactly as the client sent it
    startup_frame: RawMessage,

    /// Salt for MD5 challenges issued to this client
    salt: [u8; 4],

    client: Option<ClientConnection>,
    upstream: Option<UpstreamConnection>,

    /// `host:port` of the dialed upstream
    upstream_address: Option<String>,

    registry: Arc<PluginRegistry>,
    log: SessionLog,
    state: SessionState,
}

impl Session {
    /// Create a session for a client whose startup packet was accepted
    pub fn new(
        startup: StartupMessage,
        startup_frame: RawMessage,
        user: String,
        database: String,
        is_encrypted: bool,
        client: ClientConnection,
        registry: Arc<PluginRegistry>,
    ) -> Self {
        let id = Uuid::new_v4();

        let mut context = LogContext::new();
        context.insert("session_id".to_string(), id.to_string().into());
        context.insert("user".to_string(), user.clone().into());
        context.insert("database".to_string(), database.clone().into());
        context.insert("ssl".to_string(), is_encrypted.into());
        let log = SessionLog {
            registry: Arc::clone(&registry),
            context,
        };

        Self {
            id,
            user,
            database,
            is_encrypted,
            startup,
            startup_frame,
            salt: generate_salt(),
            client: Some(client),
            upstream: None,
            upstream_address: None,
            registry,
            log,
            state: SessionState::Created,
        }
    }

    /// Unique session identifier
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// User name from the startup packet
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Database name from the startup packet
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Whether the client connection is TLS
    pub fn is_encrypted(&self) -> bool {
        self.is_encrypted
    }

    /// Parsed startup message
    pub fn startup(&self) -> &StartupMessage {
        &self.startup
    }

    /// Salt used for MD5 challenges
    pub fn salt(&self) -> [u8; 4] {
        self.salt
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether an upstream connection has been established
    pub fn has_upstream(&self) -> bool {
        self.upstream.is_some()
    }

    /// Address of the upstream server, once dialed
    pub fn upstream_address(&self) -> Option<&str> {
        self.upstream_address.as_deref()
    }

    /// Base logging context of this session
    pub fn log_context(&self) -> LogContext {
        self.log.context.clone()
    }

    /// Authenticate the client and relay traffic until the session ends
    ///
    /// Failures the client can still be told about are written to it as a
    /// FATAL error before the error is returned.
    pub async fn handle(&mut self) -> Result<()> {
        self.state = SessionState::Authenticating;

        let registry = Arc::clone(&self.registry);
        let result = match registry.authenticate(self).await {
            Ok(true) => {
                self.state = SessionState::Proxying;
                self.proxy().await
            }
            Ok(false) => Err(GatewayError::Auth(format!(
                "no authentication plugin accepted user {}",
                self.user
            ))),
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            if self.state != SessionState::Proxying && !e.is_disconnect() {
                self.reject(e).await;
            }
        }

        self.close().await;
        result
    }

    /// Tell the client why the session ends; write failures are ignored
    async fn reject(&mut self, error: &GatewayError) {
        let (code, message) = to_pg_error(error);
        if let Some(client) = self.client.as_mut() {
            let _ = client.send(formatter::fatal_error(code, &message)).await;
        }
    }

    async fn proxy(&mut self) -> Result<()> {
        let client = self.client.take().ok_or(GatewayError::ConnectionClosed)?;
        let upstream = self
            .upstream
            .take()
            .ok_or_else(|| GatewayError::Upstream("session has no upstream connection".to_string()))?;
        relay::run(client, upstream, self.log.clone()).await
    }

    /// Release both connections; safe to call more than once
    pub async fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        if let Some(mut upstream) = self.upstream.take() {
            let _ = upstream.close().await;
        }
        if let Some(mut client) = self.client.take() {
            let _ = client.close().await;
        }
        self.state = SessionState::Closed;
    }

    fn client_mut(&mut self) -> Result<&mut ClientConnection> {
        self.client.as_mut().ok_or(GatewayError::ConnectionClosed)
    }

    fn upstream_mut(&mut self) -> Result<&mut UpstreamConnection> {
        self.upstream
            .as_mut()
            .ok_or_else(|| GatewayError::Upstream("session has no upstream connection".to_string()))
    }

    /// Read one message from the client
    pub async fn read_client_message(&mut self) -> Result<RawMessage> {
        let next = self.client_mut()?.next().await;
        match next {
            Some(Ok(frame)) => {
                self.log.client_request(&frame);
                Ok(frame)
            }
            Some(Err(e)) => {
                self.log.read_failed("client request", &e, self.state == SessionState::Closed);
                Err(e)
            }
            None => Err(GatewayError::ConnectionClosed),
        }
    }

    /// Read one message from the upstream server
    pub async fn read_server_message(&mut self) -> Result<RawMessage> {
        let next = self.upstream_mut()?.next().await;
        match next {
            Some(Ok(frame)) => {
                self.log.server_response(&frame);
                Ok(frame)
            }
            Some(Err(e)) => {
                self.log.read_failed("server response", &e, self.state == SessionState::Closed);
                Err(e)
            }
            None => Err(GatewayError::ConnectionClosed),
        }
    }

    /// Write one message to the client and flush it
    pub async fn write_to_client(&mut self, message: RawMessage) -> Result<()> {
        self.log.gateway_message("gateway request to client", &message, Side::Client);
        self.client_mut()?.send(message).await
    }

    /// Write one message to the upstream server and flush it
    pub async fn write_to_server(&mut self, message: RawMessage) -> Result<()> {
        self.log.gateway_message("gateway request to server", &message, Side::Server);
        self.upstream_mut()?.send(message).await
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("user", &self.user)
            .field("database", &self.database)
            .field("is_encrypted", &self.is_encrypted)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Side {
    Client,
    Server,
}

/// Session-scoped logging through the listener's registry
#[derive(Clone)]
pub(crate) struct SessionLog {
    registry: Arc<PluginRegistry>,
    context: LogContext,
}

impl SessionLog {
    fn with_message(&self, summary: String) -> LogContext {
        let mut context = self.context.clone();
        context.insert("message".to_string(), summary.into());
        context
    }

    // Summaries parse the frame, so skip them when nobody records debug events
    fn tracing(&self) -> bool {
        self.registry.enabled(LogLevel::Debug)
    }

    pub(crate) fn client_request(&self, frame: &RawMessage) {
        if !self.tracing() {
            return;
        }
        self.registry
            .debug(&self.with_message(summarize(frame, Side::Client)), "client request");
    }

    pub(crate) fn server_response(&self, frame: &RawMessage) {
        if !self.tracing() {
            return;
        }
        self.registry
            .debug(&self.with_message(summarize(frame, Side::Server)), "server response");
    }

    fn gateway_message(&self, message: &str, frame: &RawMessage, to: Side) {
        if !self.tracing() {
            return;
        }
        // Messages to the client are backend messages and vice versa
        let parsed_as = match to {
            Side::Client => Side::Server,
            Side::Server => Side::Client,
        };
        self.registry
            .debug(&self.with_message(summarize(frame, parsed_as)), message);
    }

    /// Parse failures are errors unless they are a plain disconnect or the
    /// session is already shutting down
    pub(crate) fn read_failed(&self, what: &str, error: &GatewayError, stopping: bool) {
        if stopping || error.is_disconnect() {
            return;
        }
        self.registry
            .error(&self.context, &format!("error parsing {}: {}", what, error));
    }

    pub(crate) fn info(&self, message: &str) {
        self.registry.info(&self.context, message);
    }

    pub(crate) fn warn(&self, message: &str) {
        self.registry.warn(&self.context, message);
    }

    pub(crate) fn error(&self, message: &str) {
        self.registry.error(&self.context, message);
    }
}

/// One-line description of a frame that never includes credentials
fn summarize(frame: &RawMessage, side: Side) -> String {
    let Some(tag) = frame.tag() else {
        return format!("StartupPacket({} bytes)", frame.len());
    };
    let summary = match side {
        Side::Client => parse_frontend_message(frame).map(|message| message.summary()),
        Side::Server => parse_backend_message(frame).map(|message| message.summary()),
    };
    summary.unwrap_or_else(|_| format!("Message('{}', malformed)", tag.escape_ascii()))
}

/// Session over an in-memory client connection, for tests
#[cfg(test)]
pub(crate) fn test_session(registry: Arc<PluginRegistry>) -> (Session, tokio::io::DuplexStream) {
    let (client_side, gateway_side) = tokio::io::duplex(64 * 1024);
    let codec = FrontendCodec::after_startup();

    let startup = StartupMessage::new(vec![
        ("user".to_string(), "alice".to_string()),
        ("database".to_string(), "test".to_string()),
    ]);
    let startup_frame = formatter::startup_message(&startup);
    let session = Session::new(
        startup,
        startup_frame,
        "alice".to_string(),
        "test".to_string(),
        false,
        Framed::new(Box::new(gateway_side) as BoxedStream, codec),
        registry,
    );
    (session, client_side)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AUTH_FAILED_MESSAGE;
    use crate::protocol::message::BackendMessage;
    use tokio::io::AsyncReadExt;

    fn empty_registry() -> Arc<PluginRegistry> {
        Arc::new(PluginRegistry::new(Vec::new(), Vec::new()))
    }

    #[tokio::test]
    async fn test_new_session_identity() {
        let (first, _a) = test_session(empty_registry());
        let (second, _b) = test_session(empty_registry());

        assert_ne!(first.id(), second.id());
        assert_eq!(first.user(), "alice");
        assert_eq!(first.database(), "test");
        assert_eq!(first.state(), SessionState::Created);
        assert!(!first.has_upstream());

        let context = first.log_context();
        assert_eq!(context["session_id"], serde_json::json!(first.id().to_string()));
        assert_eq!(context["ssl"], serde_json::json!(false));
    }

    #[tokio::test]
    async fn test_unaccepted_session_gets_fatal_error() {
        let (mut session, mut client) = test_session(empty_registry());

        let result = session.handle().await;
        assert!(matches!(result, Err(GatewayError::Auth(_))));
        assert_eq!(session.state(), SessionState::Closed);

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        let frame = RawMessage::new(received[0], &received[5..]);
        match parse_backend_message(&frame).unwrap() {
            BackendMessage::ErrorResponse(fields) => {
                assert_eq!(fields.severity.as_deref(), Some("FATAL"));
                assert_eq!(fields.message.as_deref(), Some(AUTH_FAILED_MESSAGE));
            }
            other => panic!("Expected error response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (mut session, _client) = test_session(empty_registry());
        session.close().await;
        session.close().await;
        assert_eq!(session.state(), SessionState::Closed);
        assert!(matches!(
            session.read_client_message().await,
            Err(GatewayError::ConnectionClosed)
        ));
    }

    /// Records every event it is given but only asks for info and above
    struct InfoRecorder(Arc<std::sync::Mutex<Vec<String>>>);

    impl crate::plugins::LoggingPlugin for InfoRecorder {
        fn log(&mut self, _level: LogLevel, _context: &LogContext, message: &str) {
            self.0.lock().unwrap().push(message.to_string());
        }

        fn enabled(&self, level: LogLevel) -> bool {
            level >= LogLevel::Info
        }
    }

    #[tokio::test]
    async fn test_message_summaries_skipped_without_debug_logging() {
        let recorded = Arc::new(std::sync::Mutex::new(Vec::new()));
        let registry = Arc::new(PluginRegistry::new(
            Vec::new(),
            vec![(
                "info".to_string(),
                Box::new(InfoRecorder(Arc::clone(&recorded))) as Box<dyn crate::plugins::LoggingPlugin>,
            )],
        ));
        let (session, _client) = test_session(registry);

        let query = RawMessage::new(b'Q', b"SELECT 1\0");
        session.log.client_request(&query);
        session.log.server_response(&formatter::terminate());
        session.log.info("session ended");

        assert_eq!(*recorded.lock().unwrap(), vec!["session ended".to_string()]);
    }

    #[test]
    fn test_summaries_redact_credentials() {
        let password = formatter::password_message(b"hunter2");
        let summary = summarize(&password, Side::Client);
        assert!(!summary.contains("hunter2"), "{}", summary);
        assert!(summary.contains("redacted"));
    }
}
