//! Bidirectional relay between an authenticated client and its upstream
//!
//! Each direction runs on its own task and reports its terminal result once
//! over a channel. The first result to arrive cancels the other direction.

use futures_util::{SinkExt, StreamExt};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use super::{ClientConnection, SessionLog, UpstreamConnection};
use crate::error::{GatewayError, Result};
use crate::protocol::codec::{BackendCodec, FrontendCodec, RawMessage};
use crate::stream::BoxedStream;

/// Buffered upstream messages beyond this count are flushed immediately
pub const FLUSH_THRESHOLD: usize = 15;

type Reader<C> = FramedRead<ReadHalf<BoxedStream>, C>;
type Writer<C> = FramedWrite<WriteHalf<BoxedStream>, C>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    ClientToUpstream,
    UpstreamToClient,
}

/// Whether an upstream message ends a unit the client is waiting for
///
/// That is ReadyForQuery, or an authentication request other than
/// AuthenticationOk, which the client has to answer.
pub fn is_flush_boundary(message: &RawMessage) -> bool {
    match message.tag() {
        Some(b'Z') => true,
        Some(b'R') => message.body().get(..4).map_or(false, |code| code != [0, 0, 0, 0]),
        _ => false,
    }
}

/// Upstream messages waiting to be written to the client
#[derive(Debug, Default)]
pub struct RelayBatch {
    messages: Vec<RawMessage>,
}

impl RelayBatch {
    /// Create an empty batch
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer a message; returns whether the batch should be flushed now
    pub fn push(&mut self, message: RawMessage) -> bool {
        let boundary = is_flush_boundary(&message);
        self.messages.push(message);
        boundary || self.messages.len() > FLUSH_THRESHOLD
    }

    /// Take every buffered message
    pub fn take(&mut self) -> Vec<RawMessage> {
        std::mem::take(&mut self.messages)
    }

    /// Number of buffered messages
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Relay until either side ends the session
///
/// Returns the first error reported by either direction; a client Terminate
/// or a cancelled direction is a clean end.
pub(crate) async fn run(mut client: ClientConnection, upstream: UpstreamConnection, log: SessionLog) -> Result<()> {
    client.codec_mut().relaying();
    let (client_reader, client_writer) = split(client);
    let (upstream_reader, upstream_writer) = split(upstream);

    let stop = CancellationToken::new();
    // Stops both directions if the session task itself is dropped
    let _guard = stop.clone().drop_guard();
    let (done_tx, mut done_rx) = mpsc::channel::<(Direction, Result<()>)>(2);

    {
        let log = log.clone();
        let stop = stop.clone();
        let done = done_tx.clone();
        tokio::spawn(async move {
            let result = client_to_upstream(client_reader, upstream_writer, &log, &stop).await;
            let _ = done.send((Direction::ClientToUpstream, result)).await;
        });
    }
    {
        let log = log.clone();
        let stop = stop.clone();
        let done = done_tx;
        tokio::spawn(async move {
            let result = upstream_to_client(upstream_reader, client_writer, &log, &stop).await;
            let _ = done.send((Direction::UpstreamToClient, result)).await;
        });
    }

    let mut first_error = None;
    for _ in 0..2 {
        let Some((direction, result)) = done_rx.recv().await else {
            break;
        };
        stop.cancel();
        if let Err(e) = result {
            ::log::debug!("relay direction {:?} ended: {}", direction, e);
            first_error.get_or_insert(e);
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Split a framed connection into independently owned read and write halves
fn split<C>(framed: Framed<BoxedStream, C>) -> (Reader<C>, Writer<C>)
where
    C: Clone,
{
    let parts = framed.into_parts();
    let (read_half, write_half) = tokio::io::split(parts.io);

    let mut reader = FramedRead::new(read_half, parts.codec.clone());
    // Keep bytes the peer already sent
    reader.read_buffer_mut().extend_from_slice(&parts.read_buf);

    (reader, FramedWrite::new(write_half, parts.codec))
}

async fn client_to_upstream(
    mut client: Reader<FrontendCodec>,
    mut upstream: Writer<BackendCodec>,
    log: &SessionLog,
    stop: &CancellationToken,
) -> Result<()> {
    loop {
        let next = tokio::select! {
            _ = stop.cancelled() => return Ok(()),
            next = client.next() => next,
        };
        let message = match next {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                log.read_failed("client request", &e, stop.is_cancelled());
                return Err(e);
            }
            None => return Err(GatewayError::ConnectionClosed),
        };
        log.client_request(&message);

        let terminate = message.tag() == Some(b'X');
        upstream.send(message).await?;
        if terminate {
            log.info("client terminated the session");
            return Ok(());
        }
    }
}

async fn upstream_to_client(
    mut upstream: Reader<BackendCodec>,
    mut client: Writer<FrontendCodec>,
    log: &SessionLog,
    stop: &CancellationToken,
) -> Result<()> {
    let mut batch = RelayBatch::new();

    let result = loop {
        let next = tokio::select! {
            _ = stop.cancelled() => break Ok(()),
            next = upstream.next() => next,
        };
        let message = match next {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                log.read_failed("server response", &e, stop.is_cancelled());
                break Err(e);
            }
            None => break Err(GatewayError::ConnectionClosed),
        };
        log.server_response(&message);

        if batch.push(message) {
            if let Err(e) = flush(&mut client, &mut batch).await {
                break Err(e);
            }
        }
    };

    if !batch.is_empty() {
        if let Err(e) = flush(&mut client, &mut batch).await {
            log.warn(&format!("failed to flush pending server messages: {}", e));
        }
    }
    result
}

async fn flush(client: &mut Writer<FrontendCodec>, batch: &mut RelayBatch) -> Result<()> {
    for message in batch.take() {
        client.feed(message).await?;
    }
    client.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::PluginRegistry;
    use crate::protocol::formatter;
    use crate::protocol::message::{AuthenticationRequest, TransactionStatus};
    use crate::session::test_session;
    use proptest::prelude::*;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn data_row(i: u8) -> RawMessage {
        RawMessage::new(b'D', &[0, 1, 0, 0, 0, 1, b'0' + (i % 10)])
    }

    #[test]
    fn test_flush_policy_20_rows_then_ready() {
        let mut batch = RelayBatch::new();
        let mut flushes = Vec::new();

        let messages = (0..20)
            .map(data_row)
            .chain(std::iter::once(formatter::ready_for_query(TransactionStatus::Idle)));
        for message in messages {
            if batch.push(message) {
                flushes.push(batch.take().len());
            }
        }

        assert_eq!(flushes, vec![16, 5]);
        assert!(batch.is_empty());
    }

    proptest! {
        #[test]
        fn prop_batches_never_exceed_threshold_and_lose_nothing(rows in 0usize..100) {
            let mut batch = RelayBatch::new();
            let mut flushed = Vec::new();

            let messages = (0..rows)
                .map(|i| data_row(i as u8))
                .chain(std::iter::once(formatter::ready_for_query(TransactionStatus::Idle)));
            for message in messages {
                if batch.push(message) {
                    flushed.push(batch.take().len());
                }
            }

            prop_assert!(batch.is_empty());
            prop_assert_eq!(flushed.iter().sum::<usize>(), rows + 1);
            prop_assert!(flushed.iter().all(|&size| size <= FLUSH_THRESHOLD + 1));
        }
    }

    #[test]
    fn test_flush_boundaries() {
        assert!(is_flush_boundary(&formatter::ready_for_query(TransactionStatus::Idle)));
        assert!(is_flush_boundary(&formatter::authentication_request(
            &AuthenticationRequest::CleartextPassword
        )));
        assert!(!is_flush_boundary(&formatter::authentication_request(&AuthenticationRequest::Ok)));
        assert!(!is_flush_boundary(&data_row(1)));
    }

    fn connection_pair<C>(codec: C) -> (Framed<BoxedStream, C>, tokio::io::DuplexStream) {
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        (Framed::new(Box::new(ours) as BoxedStream, codec), theirs)
    }

    fn session_log() -> SessionLog {
        let (session, _client) = test_session(Arc::new(PluginRegistry::new(Vec::new(), Vec::new())));
        session.log.clone()
    }

    #[tokio::test]
    async fn test_relay_is_byte_for_byte_and_ends_on_terminate() {
        let (client, mut client_peer) = connection_pair(FrontendCodec::after_startup());
        let (upstream, mut upstream_peer) = connection_pair(BackendCodec::new());

        let relay = tokio::spawn(run(client, upstream, session_log()));

        let query = RawMessage::new(b'Q', b"SELECT 1\0");
        client_peer.write_all(query.as_bytes()).await.unwrap();
        let mut forwarded = vec![0u8; query.len()];
        upstream_peer.read_exact(&mut forwarded).await.unwrap();
        assert_eq!(forwarded, query.as_bytes());

        let mut response = Vec::new();
        response.extend_from_slice(data_row(7).as_bytes());
        response.extend_from_slice(formatter::ready_for_query(TransactionStatus::Idle).as_bytes());
        upstream_peer.write_all(&response).await.unwrap();
        let mut relayed = vec![0u8; response.len()];
        client_peer.read_exact(&mut relayed).await.unwrap();
        assert_eq!(relayed, response);

        client_peer.write_all(formatter::terminate().as_bytes()).await.unwrap();
        let mut terminate = [0u8; 5];
        upstream_peer.read_exact(&mut terminate).await.unwrap();
        assert_eq!(&terminate, formatter::terminate().as_bytes());

        relay.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_authenticated_client_may_send_large_queries() {
        let (client, mut client_peer) = connection_pair(FrontendCodec::after_startup());
        let (upstream, mut upstream_peer) = connection_pair(BackendCodec::new());

        let relay = tokio::spawn(run(client, upstream, session_log()));

        let mut sql = vec![b'x'; 100 * 1024];
        sql.push(0);
        let query = RawMessage::new(b'Q', &sql);
        let sent = query.clone();
        let writer = tokio::spawn(async move {
            client_peer.write_all(sent.as_bytes()).await.unwrap();
            client_peer
        });

        let mut forwarded = vec![0u8; query.len()];
        upstream_peer.read_exact(&mut forwarded).await.unwrap();
        assert_eq!(forwarded, query.as_bytes());

        drop(writer.await.unwrap());
        assert!(relay.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_upstream_disconnect_ends_relay() {
        let (client, _client_peer) = connection_pair(FrontendCodec::after_startup());
        let (upstream, upstream_peer) = connection_pair(BackendCodec::new());

        let relay = tokio::spawn(run(client, upstream, session_log()));
        drop(upstream_peer);

        let result = relay.await.unwrap();
        assert!(matches!(result, Err(e) if e.is_disconnect()));
    }
}
