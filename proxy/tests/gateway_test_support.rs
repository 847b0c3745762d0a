//! Test utilities for gateway integration tests.
//!
//! Provides a gateway listener on an ephemeral port, a scripted fake
//! upstream server and a few client-side protocol helpers.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

use pggateway_proxy::config::Config;
use pggateway_proxy::listener::Listener;
use pggateway_proxy::plugins::PluginCatalog;
use pggateway_proxy::protocol::parser::{parse_backend_message, parse_startup};
use pggateway_proxy::protocol::{
    formatter, AuthenticationRequest, BackendCodec, BackendMessage, ErrorFields, FrontendCodec, RawMessage,
    StartupMessage, StartupPacket,
};

/// Client view of a connection: reads backend messages, writes raw frames
pub type TestClient = Framed<TcpStream, BackendCodec>;

/// Server view of a connection: reads the startup packet, then frontend messages
pub type TestServer = Framed<TcpStream, FrontendCodec>;

/// A listener running on an ephemeral port.
///
/// The listener is closed when the wrapper is dropped.
pub struct TestGateway {
    listener: Arc<Listener>,
    addr: SocketAddr,
    handle: JoinHandle<pggateway_proxy::Result<()>>,
}

impl TestGateway {
    /// Starts the first listener of `yaml` with the built-in plugins.
    pub async fn start(yaml: &str) -> Self {
        let config = Config::from_yaml(yaml).unwrap();
        let mut listener = Listener::new(config.listeners[0].clone(), config.logging.clone());
        listener
            .listen(&PluginCatalog::with_builtin_plugins())
            .await
            .unwrap();

        let listener = Arc::new(listener);
        let addr = listener.local_addr().unwrap();
        let accept = Arc::clone(&listener);
        let handle = tokio::spawn(async move { accept.handle().await });

        Self { listener, addr, handle }
    }

    pub fn listener(&self) -> &Listener {
        &self.listener
    }

    /// Opens a raw TCP connection to the gateway.
    pub async fn connect_raw(&self) -> TcpStream {
        TcpStream::connect(self.addr).await.unwrap()
    }

    /// Opens a connection and sends a startup packet with the given options.
    pub async fn connect(&self, options: &[(&str, &str)]) -> TestClient {
        let mut client = Framed::new(self.connect_raw().await, BackendCodec::new());
        client.send(startup_frame(options)).await.unwrap();
        client
    }

    /// Closes the listener and waits for the accept loop to return.
    pub async fn shutdown(self) {
        self.listener.close();
        self.listener.wait_for_sessions().await;
    }
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        self.listener.close();
        self.handle.abort();
    }
}

/// Accepts one connection on an ephemeral port and runs `script` on it.
pub async fn fake_upstream<F, Fut>(script: F) -> (u16, JoinHandle<()>)
where
    F: FnOnce(TestServer) -> Fut + Send + 'static,
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

/// An ephemeral port nothing listens on.
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

pub fn startup_frame(options: &[(&str, &str)]) -> RawMessage {
    let startup = StartupMessage::new(
        options
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect(),
    );
    formatter::startup_message(&startup)
}

/// Reads the startup message a fake upstream receives.
pub async fn read_startup(server: &mut TestServer) -> StartupMessage {
    let frame = server.next().await.unwrap().unwrap();
    match parse_startup(&frame).unwrap() {
        StartupPacket::Startup(startup) => startup,
        other => panic!("Expected startup, got {:?}", other),
    }
}

/// Reads the next backend message.
pub async fn next_message(client: &mut TestClient) -> BackendMessage {
    let frame = client.next().await.unwrap().unwrap();
    parse_backend_message(&frame).unwrap()
}

/// Reads the next backend message, which must be an authentication request.
pub async fn next_auth_request(client: &mut TestClient) -> AuthenticationRequest {
    match next_message(client).await {
        BackendMessage::Authentication(request) => request,
        other => panic!("Expected authentication request, got {:?}", other),
    }
}

/// Reads an ErrorResponse and asserts the connection is closed afterwards.
pub async fn expect_fatal(client: &mut TestClient) -> ErrorFields {
    let fields = match next_message(client).await {
        BackendMessage::ErrorResponse(fields) => fields,
        other => panic!("Expected error response, got {:?}", other),
    };
    assert_eq!(fields.severity.as_deref(), Some("FATAL"));
    assert!(client.next().await.is_none(), "connection should be closed after a fatal error");
    fields
}

/// Sends the usual post-authentication greeting from a fake upstream.
pub async fn greet(server: &mut TestServer) {
    server
        .send(formatter::authentication_request(&AuthenticationRequest::Ok))
        .await
        .unwrap();
    server
        .send(formatter::ready_for_query(pggateway_proxy::protocol::TransactionStatus::Idle))
        .await
        .unwrap();
}
