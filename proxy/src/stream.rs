//! Byte-stream abstraction shared by client and upstream connections
//!
//! A connection starts as a TCP socket and may be upgraded to TLS in the
//! middle of the startup exchange. Boxing both behind one trait object lets
//! sessions hold either without caring which.

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Any bidirectional async byte stream usable as a connection
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Type-erased connection
pub type BoxedStream = Box<dyn AsyncStream>;

/// Box a freshly accepted or dialed TCP socket
pub fn boxed_tcp(stream: TcpStream) -> BoxedStream {
    // Startup and auth messages are small; do not let Nagle hold them back
    let _ = stream.set_nodelay(true);
    Box::new(stream)
}
