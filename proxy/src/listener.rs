//! Listener: one bound address and its policy
//!
//! The listener accepts connections, negotiates encryption, checks the
//! startup identity against its policy and hands every surviving connection
//! to a [`Session`] running on its own task.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info};
use serde_yaml::Mapping;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::ListenerConfig;
use crate::error::{to_pg_error, GatewayError, PolicyViolation, Result};
use crate::plugins::{LogContext, PluginCatalog, PluginRegistry, LOG_FACADE_PLUGIN};
use crate::protocol::codec::{FrontendCodec, RawMessage};
use crate::protocol::formatter;
use crate::protocol::message::{StartupMessage, StartupPacket};
use crate::protocol::parser::parse_startup;
use crate::session::{ClientConnection, Session};
use crate::stream::{boxed_tcp, BoxedStream};
use crate::tls::TlsAcceptor;

/// Accepts clients on one address
pub struct Listener {
    config: Arc<ListenerConfig>,

    /// Process-wide logging used when the listener configures none
    default_logging: Mapping,

    socket: Option<TcpListener>,
    registry: Option<Arc<PluginRegistry>>,
    acceptor: Option<TlsAcceptor>,

    stopping: AtomicBool,
    shutdown: CancellationToken,
    sessions: TaskTracker,
}

/// What a connected client needs from its listener
#[derive(Clone)]
struct ClientContext {
    config: Arc<ListenerConfig>,
    registry: Arc<PluginRegistry>,
    acceptor: Option<TlsAcceptor>,
}

/// Outcome of the startup exchange
enum Negotiation {
    /// A regular startup packet arrived
    Ready {
        client: ClientConnection,
        startup: StartupMessage,
        frame: RawMessage,
        encrypted: bool,
    },
    /// The connection ended by protocol, not by failure
    Closed(String),
    /// Negotiation failed; the client is returned when it can still be told
    Failed {
        client: Option<ClientConnection>,
        error: GatewayError,
    },
}

impl Listener {
    /// Create an unbound listener
    pub fn new(config: ListenerConfig, default_logging: Mapping) -> Self {
        Self {
            config: Arc::new(config),
            default_logging,
            socket: None,
            registry: None,
            acceptor: None,
            stopping: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            sessions: TaskTracker::new(),
        }
    }

    /// Configured bind address
    pub fn bind_address(&self) -> &str {
        &self.config.bind
    }

    /// Bind the socket and build the plugin registry and TLS acceptor
    pub async fn listen(&mut self, catalog: &PluginCatalog) -> Result<()> {
        let registry = PluginRegistry::build(catalog, &self.config.authentication, &self.logging_section())?;

        if self.config.ssl.enabled {
            let (Some(certificate), Some(key)) = (&self.config.ssl.certificate, &self.config.ssl.key) else {
                return Err(GatewayError::Config(
                    "ssl.enabled requires ssl.certificate and ssl.key".to_string(),
                ));
            };
            self.acceptor = Some(TlsAcceptor::new(certificate, key)?);
        }

        let socket = TcpListener::bind(&self.config.bind).await?;
        info!(
            "listener {} bound to {} (ssl: {}, plugins: {:?})",
            self.config.bind,
            socket.local_addr()?,
            self.config.ssl.enabled,
            registry.auth_plugin_names()
        );

        self.socket = Some(socket);
        self.registry = Some(Arc::new(registry));
        Ok(())
    }

    /// Logging plugins for this listener, falling back to the process-wide
    /// section and then to the `log` plugin
    fn logging_section(&self) -> Mapping {
        if !self.config.logging.is_empty() {
            return self.config.logging.clone();
        }
        if !self.default_logging.is_empty() {
            return self.default_logging.clone();
        }
        let mut logging = Mapping::new();
        logging.insert(LOG_FACADE_PLUGIN.into(), serde_yaml::Value::Null);
        logging
    }

    /// Address the socket is bound to
    pub fn local_addr(&self) -> Result<SocketAddr> {
        let socket = self.bound_socket()?;
        Ok(socket.local_addr()?)
    }

    fn bound_socket(&self) -> Result<&TcpListener> {
        self.socket
            .as_ref()
            .ok_or_else(|| GatewayError::Config(format!("listener {} is not bound", self.config.bind)))
    }

    /// Whether [`close`](Self::close) was called
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Run the accept loop until the listener is closed or accepting fails
    pub async fn handle(&self) -> Result<()> {
        let socket = self.bound_socket()?;
        let registry = self
            .registry
            .as_ref()
            .ok_or_else(|| GatewayError::Config(format!("listener {} has no plugins", self.config.bind)))?;

        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                accepted = socket.accept() => accepted,
            };

            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
                Err(_) if self.is_stopping() => return Ok(()),
                Err(e) => {
                    error!("listener {} failed to accept: {}", self.config.bind, e);
                    registry.error(&LogContext::new(), &format!("listener {} failed to accept: {}", self.config.bind, e));
                    return Err(e.into());
                }
            };
            debug!("listener {} accepted connection from {}", self.config.bind, peer);

            let context = ClientContext {
                config: Arc::clone(&self.config),
                registry: Arc::clone(registry),
                acceptor: self.acceptor.clone(),
            };
            self.sessions.spawn(serve_client(boxed_tcp(stream), peer, context));
        }
    }

    /// Stop accepting; sessions already running are left to finish
    pub fn close(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.shutdown.cancel();
        self.sessions.close();
    }

    /// Wait until every session spawned by this listener has ended
    ///
    /// Only returns once the listener has been closed.
    pub async fn wait_for_sessions(&self) {
        self.sessions.wait().await;
    }

    /// Number of sessions still running
    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }
}

/// Drive one client from its first byte to the end of its session
async fn serve_client(stream: BoxedStream, peer: SocketAddr, context: ClientContext) {
    let mut log_context = LogContext::new();
    log_context.insert("client".to_string(), peer.to_string().into());

    let client = Framed::new(stream, FrontendCodec::new());
    let (mut client, startup, frame, encrypted) = match negotiate(client, context.acceptor.as_ref()).await {
        Negotiation::Ready {
            client,
            startup,
            frame,
            encrypted,
        } => (client, startup, frame, encrypted),
        Negotiation::Closed(reason) => {
            context.registry.debug(&log_context, &reason);
            return;
        }
        Negotiation::Failed { client, error } => {
            if let Some(mut client) = client {
                reject(&mut client, &error).await;
            }
            if !error.is_disconnect() {
                context
                    .registry
                    .warn(&log_context, &format!("startup failed: {}", error));
            }
            return;
        }
    };

    let (user, database) = match check_startup(&context.config, &startup, encrypted) {
        Ok(identity) => identity,
        Err(error) => {
            reject(&mut client, &error).await;
            context
                .registry
                .warn(&log_context, &format!("connection rejected: {}", error));
            return;
        }
    };

    let mut session = Session::new(
        startup,
        frame,
        user,
        database,
        encrypted,
        client,
        Arc::clone(&context.registry),
    );
    let mut session_context = session.log_context();
    session_context.insert("client".to_string(), peer.to_string().into());
    context.registry.info(&session_context, "new client session");

    match session.handle().await {
        Ok(()) => context.registry.info(&session_context, "session ended"),
        Err(e) if e.is_disconnect() => context.registry.info(&session_context, "client disconnected"),
        Err(e) => {
            if let Some(upstream) = session.upstream_address() {
                session_context.insert("upstream".to_string(), upstream.to_string().into());
            }
            context
                .registry
                .error(&session_context, &format!("session failed: {}", e))
        }
    }
}

/// Read startup packets until a regular startup message arrives
async fn negotiate(mut client: ClientConnection, acceptor: Option<&TlsAcceptor>) -> Negotiation {
    let mut encrypted = false;

    loop {
        let frame = match client.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(error)) => {
                return Negotiation::Failed {
                    client: Some(client),
                    error,
                }
            }
            None => {
                return Negotiation::Failed {
                    client: None,
                    error: GatewayError::ConnectionClosed,
                }
            }
        };
        let packet = match parse_startup(&frame) {
            Ok(packet) => packet,
            Err(error) => {
                return Negotiation::Failed {
                    client: Some(client),
                    error,
                }
            }
        };

        match packet {
            StartupPacket::Startup(startup) => {
                return Negotiation::Ready {
                    client,
                    startup,
                    frame,
                    encrypted,
                }
            }
            StartupPacket::SslRequest if encrypted => {
                return Negotiation::Failed {
                    client: Some(client),
                    error: GatewayError::Protocol("SSLRequest on an encrypted connection".to_string()),
                }
            }
            StartupPacket::SslRequest => {
                let Some(acceptor) = acceptor else {
                    let _ = refuse(&mut client).await;
                    return Negotiation::Closed("SSL requested but not enabled".to_string());
                };
                match upgrade(client, acceptor).await {
                    Ok(upgraded) => {
                        client = upgraded;
                        encrypted = true;
                    }
                    Err(error) => return Negotiation::Failed { client: None, error },
                }
            }
            StartupPacket::GssEncRequest => {
                if let Err(error) = refuse(&mut client).await {
                    return Negotiation::Failed { client: None, error };
                }
            }
            StartupPacket::CancelRequest { process_id, .. } => {
                return Negotiation::Closed(format!("cancel request for backend {} ignored", process_id));
            }
        }
    }
}

/// Answer an encryption request with 'N'
async fn refuse(client: &mut ClientConnection) -> Result<()> {
    let stream = client.get_mut();
    stream.write_all(b"N").await?;
    stream.flush().await?;
    Ok(())
}

/// Answer an SSLRequest with 'S' and run the server side of the TLS handshake
async fn upgrade(client: ClientConnection, acceptor: &TlsAcceptor) -> Result<ClientConnection> {
    let parts = client.into_parts();
    if !parts.read_buf.is_empty() {
        return Err(GatewayError::Protocol(
            "received unencrypted data after SSL request".to_string(),
        ));
    }

    let mut stream = parts.io;
    stream.write_all(b"S").await?;
    stream.flush().await?;
    let stream = acceptor.accept(stream).await?;

    // The codec is still expecting the startup packet
    Ok(Framed::new(stream, parts.codec))
}

/// Apply the listener's policy to a startup message
///
/// Returns the user and database the session runs as.
fn check_startup(config: &ListenerConfig, startup: &StartupMessage, encrypted: bool) -> Result<(String, String)> {
    if config.ssl.required && !encrypted {
        return Err(GatewayError::Policy(PolicyViolation::SslRequired));
    }
    let user = startup
        .user()
        .ok_or(GatewayError::Policy(PolicyViolation::MissingUser))?;
    let database = startup
        .database()
        .ok_or(GatewayError::Policy(PolicyViolation::MissingDatabase))?;
    if !config.database_allowed(database) {
        return Err(GatewayError::Policy(PolicyViolation::UnknownDatabase(database.to_string())));
    }
    Ok((user.to_string(), database.to_string()))
}

/// Send the client-visible form of `error`; write failures are ignored
async fn reject(client: &mut ClientConnection, error: &GatewayError) {
    if error.is_disconnect() {
        return;
    }
    let (code, message) = to_pg_error(error);
    let _ = client.send(formatter::fatal_error(code, &message)).await;
}
