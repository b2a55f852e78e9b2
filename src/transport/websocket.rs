//! WebSocket transport built on tokio-tungstenite.
//!
//! Each connection runs two tasks. The reader pushes inbound frames to the
//! handler and reports the end of the stream as [`Inbound::Closed`]. The writer
//! owns the sink, so writes from concurrent callers go out one at a time in
//! queue order; every write is acknowledged back to its caller.

use std::sync::Arc;

use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_util::sync::CancellationToken;
use tracing::instrument::WithSubscriber;
use tracing::{debug, trace};

use super::{Connector, Inbound, MessageHandler, Transport};
use crate::error::TransportError;

/// Frames queued for the writer before `send_text` callers start waiting.
const OUTGOING_QUEUE: usize = 64;

type Outgoing = (Message, oneshot::Sender<Result<(), TransportError>>);

/// Opens plain `ws://` connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(
        &self,
        url: &str,
        on_message: MessageHandler,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        let (stream, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        debug!(url, "WebSocket connected");

        let (sink, source) = stream.split();
        let shutdown = CancellationToken::new();
        let (outgoing_tx, outgoing_rx) = mpsc::channel(OUTGOING_QUEUE);

        tokio::spawn(write_loop(sink, outgoing_rx, shutdown.clone()).with_current_subscriber());
        tokio::spawn(read_loop(source, on_message, shutdown.clone()).with_current_subscriber());

        Ok(Arc::new(WebSocketTransport {
            outgoing: outgoing_tx,
            shutdown,
        }))
    }
}

struct WebSocketTransport {
    outgoing: mpsc::Sender<Outgoing>,
    shutdown: CancellationToken,
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send_text(&self, frame: String) -> Result<(), TransportError> {
        if self.shutdown.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let (ack_tx, ack_rx) = oneshot::channel();
        self.outgoing
            .send((Message::Text(frame), ack_tx))
            .await
            .map_err(|_| TransportError::Closed)?;
        ack_rx.await.map_err(|_| TransportError::Closed)?
    }

    fn close(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn write_loop<S>(
    mut sink: S,
    mut outgoing: mpsc::Receiver<Outgoing>,
    shutdown: CancellationToken,
) where
    S: Sink<Message, Error = WsError> + Unpin,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            next = outgoing.recv() => next,
        };
        let Some((message, ack)) = next else {
            break;
        };
        let result = sink
            .send(message)
            .await
            .map_err(|e| TransportError::Send(e.to_string()));
        let failed = result.is_err();
        let _ = ack.send(result);
        if failed {
            shutdown.cancel();
            break;
        }
    }

    // Queued writes are failed by dropping their acks.
    outgoing.close();
    if let Err(e) = sink.send(Message::Close(None)).await {
        trace!(error = %e, "Failed to send close frame");
    }
    let _ = sink.close().await;
}

async fn read_loop<S>(mut source: S, on_message: MessageHandler, shutdown: CancellationToken)
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let reason = loop {
        let frame = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return,
            frame = source.next() => frame,
        };
        match frame {
            Some(Ok(Message::Text(text))) => on_message(Inbound::Text(text)),
            Some(Ok(Message::Binary(data))) => on_message(Inbound::Binary(data)),
            Some(Ok(Message::Close(frame))) => {
                break frame
                    .map(|f| f.reason.into_owned())
                    .filter(|reason| !reason.is_empty());
            }
            // Ping/pong are answered by tungstenite itself.
            Some(Ok(_)) => continue,
            Some(Err(e)) => break Some(e.to_string()),
            None => break None,
        }
    };

    debug!(reason = ?reason, "WebSocket closed by peer");
    on_message(Inbound::Closed(reason));
    shutdown.cancel();
}
