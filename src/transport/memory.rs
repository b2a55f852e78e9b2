//! In-process transport with a scriptable peer.
//!
//! [`pair`] returns a connector for the client side and a [`MemoryPeer`] that
//! plays the daemon: it reads what the client wrote and injects inbound frames.
//! Injected frames cross over to a dedicated delivery thread through the
//! bounded channel, so the client's message handler runs concurrently with
//! application calls, just like a real network transport.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::{Connector, Inbound, MessageHandler, Transport};
use crate::error::TransportError;
use crate::sync::channel;

/// Inbound frames buffered ahead of the delivery thread.
const INBOUND_CAPACITY: usize = 64;

struct Link {
    inbound_rx: Mutex<Option<channel::Receiver<Inbound>>>,
    outbound_tx: mpsc::UnboundedSender<String>,
    closed: CancellationToken,
    refuse: AtomicBool,
    connects: AtomicUsize,
}

/// Creates a connected client/peer pair.
pub fn pair() -> (MemoryConnector, MemoryPeer) {
    let (inbound_tx, inbound_rx) = match channel::channel(INBOUND_CAPACITY) {
        Ok(halves) => halves,
        Err(e) => unreachable!("fixed capacity is valid: {e}"),
    };
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let link = Arc::new(Link {
        inbound_rx: Mutex::new(Some(inbound_rx)),
        outbound_tx,
        closed: CancellationToken::new(),
        refuse: AtomicBool::new(false),
        connects: AtomicUsize::new(0),
    });
    (
        MemoryConnector { link: link.clone() },
        MemoryPeer {
            inbound: inbound_tx,
            outbound: tokio::sync::Mutex::new(outbound_rx),
            link,
        },
    )
}

/// Client side of a [`pair`]. Accepts a single connection; the URL is ignored.
#[derive(Clone)]
pub struct MemoryConnector {
    link: Arc<Link>,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(
        &self,
        url: &str,
        on_message: MessageHandler,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        self.link.connects.fetch_add(1, Ordering::SeqCst);
        if self.link.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::Connect(format!("{url}: connection refused")));
        }
        let mut inbound = self
            .link
            .inbound_rx
            .lock()
            .take()
            .ok_or_else(|| TransportError::Connect("memory link already used".to_string()))?;

        let dispatch = tracing::dispatcher::get_default(|d| d.clone());
        thread::Builder::new()
            .name("memory-transport".to_string())
            .spawn(move || {
                tracing::dispatcher::with_default(&dispatch, || {
                    while let Some(message) = inbound.recv() {
                        on_message(message);
                    }
                    trace!("Memory transport delivery finished");
                })
            })
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        Ok(Arc::new(MemoryTransport {
            link: self.link.clone(),
        }))
    }
}

struct MemoryTransport {
    link: Arc<Link>,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send_text(&self, frame: String) -> Result<(), TransportError> {
        if self.link.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        self.link
            .outbound_tx
            .send(frame)
            .map_err(|_| TransportError::Send("peer dropped".to_string()))
    }

    fn close(&self) {
        self.link.closed.cancel();
    }
}

/// The far end of a [`pair`].
pub struct MemoryPeer {
    inbound: channel::Sender<Inbound>,
    outbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
    link: Arc<Link>,
}

impl MemoryPeer {
    /// Next frame written by the client. `None` once the client closed its
    /// transport and everything it wrote has been read.
    pub async fn recv_frame(&self) -> Option<String> {
        let mut outbound = self.outbound.lock().await;
        tokio::select! {
            biased;
            frame = outbound.recv() => return frame,
            _ = self.link.closed.cancelled() => {}
        }
        outbound.try_recv().ok()
    }

    /// Delivers a text frame to the client. Blocks while the inbound buffer is
    /// full.
    pub fn send_text(&self, frame: impl Into<String>) -> Result<(), TransportError> {
        self.deliver(Inbound::Text(frame.into()))
    }

    pub fn send_binary(&self, data: impl Into<Vec<u8>>) -> Result<(), TransportError> {
        self.deliver(Inbound::Binary(data.into()))
    }

    /// Simulates the remote end going away.
    pub fn disconnect(&self, reason: Option<&str>) -> Result<(), TransportError> {
        self.deliver(Inbound::Closed(reason.map(str::to_string)))
    }

    /// Makes subsequent connection attempts fail.
    pub fn refuse_connections(&self) {
        self.link.refuse.store(true, Ordering::SeqCst);
    }

    /// True once the client released its transport.
    pub fn is_closed(&self) -> bool {
        self.link.closed.is_cancelled()
    }

    /// Resolves once the client released its transport.
    pub async fn closed(&self) {
        self.link.closed.cancelled().await
    }

    pub fn connect_count(&self) -> usize {
        self.link.connects.load(Ordering::SeqCst)
    }

    fn deliver(&self, message: Inbound) -> Result<(), TransportError> {
        self.inbound
            .send(message)
            .map_err(|_| TransportError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn collecting_handler() -> (MessageHandler, mpsc::UnboundedReceiver<Inbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler: MessageHandler = Arc::new(move |message| {
            let _ = tx.send(message);
        });
        (handler, rx)
    }

    #[tokio::test]
    async fn frames_flow_both_ways() {
        let (connector, peer) = pair();
        let (handler, mut delivered) = collecting_handler();
        let transport = connector.connect("memory://", handler).await.unwrap();

        transport.send_text("hello".to_string()).await.unwrap();
        assert_eq!(peer.recv_frame().await.as_deref(), Some("hello"));

        peer.send_text("world").unwrap();
        peer.send_binary(vec![1, 2]).unwrap();
        let first = timeout(Duration::from_secs(1), delivered.recv()).await.unwrap();
        let second = timeout(Duration::from_secs(1), delivered.recv()).await.unwrap();
        assert_eq!(first, Some(Inbound::Text("world".to_string())));
        assert_eq!(second, Some(Inbound::Binary(vec![1, 2])));
    }

    #[tokio::test]
    async fn close_ends_peer_reads_and_fails_sends() {
        let (connector, peer) = pair();
        let (handler, _delivered) = collecting_handler();
        let transport = connector.connect("memory://", handler).await.unwrap();

        transport.send_text("last".to_string()).await.unwrap();
        transport.close();
        transport.close();

        assert!(peer.is_closed());
        assert_eq!(peer.recv_frame().await.as_deref(), Some("last"));
        assert_eq!(peer.recv_frame().await, None);
        assert_eq!(
            transport.send_text("late".to_string()).await,
            Err(TransportError::Closed)
        );
    }

    #[tokio::test]
    async fn refused_and_reused_links_fail_to_connect() {
        let (connector, peer) = pair();
        peer.refuse_connections();
        let (handler, _delivered) = collecting_handler();
        assert!(matches!(
            connector.connect("memory://", handler).await,
            Err(TransportError::Connect(_))
        ));
        assert_eq!(peer.connect_count(), 1);

        let (connector, _peer) = pair();
        let (handler, _delivered) = collecting_handler();
        connector.connect("memory://", handler.clone()).await.unwrap();
        assert!(connector.connect("memory://", handler).await.is_err());
    }
}
