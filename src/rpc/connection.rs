//! One session with the daemon: version handshake plus request/response
//! correlation over a single ordered frame stream.
//!
//! Inbound frames are handled on whatever context the transport delivers on,
//! concurrently with callers. The pending-response buffer and the waiter table
//! live under one mutex so that "scan the buffer, otherwise register" in
//! [`ReadResponse::poll`] is atomic with "append, then wake" in the inbound
//! path. Every response wakes every waiter; each one rescans the buffer and
//! only the owner of the matching syn removes it.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::task::{Context, Poll, Waker};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::protocol::{self, Handshake, Message, Response};
use crate::error::{Error, Result, TransportError};
use crate::transport::{Connector, Inbound, MessageHandler, Transport};

/// Lifecycle of a [`Connection`]. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connecting,
    Handshaking,
    Open,
    Closed,
}

struct State {
    phase: Phase,
    pending: VecDeque<Response>,
    waiters: HashMap<u64, Waker>,
    next_waiter: u64,
}

struct Inner {
    state: Mutex<State>,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    handshake_done: AtomicBool,
    handshake_tx: Mutex<Option<oneshot::Sender<Inbound>>>,
    next_syn: AtomicU64,
    daemon_version: OnceLock<String>,
}

impl Inner {
    fn new(handshake_tx: oneshot::Sender<Inbound>) -> Self {
        Self {
            state: Mutex::new(State {
                phase: Phase::Connecting,
                pending: VecDeque::new(),
                waiters: HashMap::new(),
                next_waiter: 0,
            }),
            transport: Mutex::new(None),
            handshake_done: AtomicBool::new(false),
            handshake_tx: Mutex::new(Some(handshake_tx)),
            next_syn: AtomicU64::new(0),
            daemon_version: OnceLock::new(),
        }
    }

    fn phase(&self) -> Phase {
        self.state.lock().phase
    }

    /// Moves to `phase` unless the connection was closed in the meantime.
    fn advance(&self, phase: Phase) -> Result<()> {
        let mut state = self.state.lock();
        if state.phase == Phase::Closed {
            return Err(Error::ConnectionClosed);
        }
        state.phase = phase;
        Ok(())
    }

    fn open_transport(&self) -> Result<Arc<dyn Transport>> {
        if self.phase() != Phase::Open {
            return Err(Error::ConnectionClosed);
        }
        self.transport.lock().clone().ok_or(Error::ConnectionClosed)
    }

    fn on_inbound(&self, message: Inbound) {
        if !self.handshake_done.swap(true, Ordering::AcqRel) {
            if let Some(tx) = self.handshake_tx.lock().take() {
                let _ = tx.send(message);
            }
            return;
        }

        match message {
            Inbound::Text(text) => self.on_text(&text),
            Inbound::Binary(data) => {
                warn!(len = data.len(), "Dropping unsupported WebSocket message type");
            }
            Inbound::Closed(reason) => {
                debug!(reason = ?reason, "Transport closed, ending session");
                self.close();
            }
        }
    }

    fn on_text(&self, text: &str) {
        match protocol::decode_frame(text) {
            Ok(Message::Response(response)) => self.push_response(response),
            Ok(Message::Failure { code, msg }) => {
                warn!(code, msg = %msg, "Daemon reported a failure");
            }
            Ok(Message::Request { syn, method, .. }) => {
                warn!(syn, method = %method, "Ignoring request sent by daemon");
            }
            Ok(Message::Subscription { id, name, .. }) => {
                debug!(id, name = %name, "Ignoring subscription event");
            }
            Err(e) => warn!(error = %e, "Dropping malformed frame"),
        }
    }

    fn push_response(&self, response: Response) {
        let waiters = {
            let mut state = self.state.lock();
            if state.phase == Phase::Closed {
                return;
            }
            trace!(syn = response.syn, code = response.code, "Response received");
            state.pending.push_back(response);
            mem::take(&mut state.waiters)
        };
        for waker in waiters.into_values() {
            waker.wake();
        }
    }

    fn close(&self) {
        let (waiters, transport) = {
            let mut state = self.state.lock();
            if state.phase == Phase::Closed {
                return;
            }
            state.phase = Phase::Closed;
            state.pending.clear();
            (mem::take(&mut state.waiters), self.transport.lock().take())
        };
        // Dropping the sender fails a handshake still in progress.
        drop(self.handshake_tx.lock().take());
        if let Some(transport) = transport {
            transport.close();
        }
        debug!(waiters = waiters.len(), "Connection closed");
        for waker in waiters.into_values() {
            waker.wake();
        }
    }
}

/// Closes a connection whose setup did not complete, including when the
/// `connect` future is dropped half way.
struct CloseGuard {
    inner: Option<Arc<Inner>>,
}

impl CloseGuard {
    fn disarm(mut self) {
        self.inner = None;
    }
}

impl Drop for CloseGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            inner.close();
        }
    }
}

/// An open session with the daemon.
///
/// Single use: once closed, a new connection has to be made. Dropping the
/// connection closes it.
pub struct Connection {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("phase", &self.state())
            .field("daemon_version", &self.daemon_version())
            .finish()
    }
}

impl Connection {
    /// Opens a transport to `url` and performs the version handshake.
    ///
    /// Fails with [`Error::Transport`] if the transport cannot be opened and
    /// with [`Error::HandshakeRejected`] if the first frame is not an accept
    /// or the transport goes away before one arrives.
    pub async fn connect(connector: &dyn Connector, url: &str) -> Result<Self> {
        let (handshake_tx, handshake_rx) = oneshot::channel();
        let inner = Arc::new(Inner::new(handshake_tx));
        let guard = CloseGuard {
            inner: Some(inner.clone()),
        };

        let weak: Weak<Inner> = Arc::downgrade(&inner);
        let handler: MessageHandler = Arc::new(move |message| {
            if let Some(inner) = weak.upgrade() {
                inner.on_inbound(message);
            }
        });

        let transport = connector.connect(url, handler).await?;
        *inner.transport.lock() = Some(transport.clone());
        inner.advance(Phase::Handshaking)?;
        debug!(url, "Transport open, sending handshake");

        transport
            .send_text(protocol::handshake_request())
            .await
            .map_err(|e| Error::HandshakeRejected(format!("failed to send handshake: {e}")))?;

        let reply = handshake_rx.await.map_err(|_| {
            Error::HandshakeRejected("connection closed during handshake".to_string())
        })?;
        let version = match reply {
            Inbound::Text(frame) => match Handshake::parse(&frame) {
                Handshake::Accepted(version) => version,
                Handshake::Rejected(reason) => return Err(Error::HandshakeRejected(reason)),
            },
            Inbound::Binary(_) => {
                return Err(Error::HandshakeRejected(
                    "binary frame instead of handshake reply".to_string(),
                ));
            }
            Inbound::Closed(reason) => {
                return Err(Error::HandshakeRejected(match reason {
                    Some(reason) => format!("connection closed during handshake: {reason}"),
                    None => "connection closed during handshake".to_string(),
                }));
            }
        };

        let _ = inner.daemon_version.set(version);
        inner
            .advance(Phase::Open)
            .map_err(|_| Error::HandshakeRejected("connection closed during handshake".to_string()))?;
        debug!(url, daemon_version = ?inner.daemon_version.get(), "Handshake accepted");

        guard.disarm();
        Ok(Self { inner })
    }

    /// Version string the daemon reported in the handshake.
    pub fn daemon_version(&self) -> &str {
        self.inner
            .daemon_version
            .get()
            .map(String::as_str)
            .unwrap_or_default()
    }

    pub fn state(&self) -> Phase {
        self.inner.phase()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == Phase::Closed
    }

    /// Writes a request frame and returns the syn it was tagged with.
    pub async fn send_request(&self, method: &str, params: Option<Value>) -> Result<u64> {
        let transport = self.inner.open_transport()?;
        let syn = self.inner.next_syn.fetch_add(1, Ordering::Relaxed);
        let frame = protocol::encode_request(syn, method, params)?;
        trace!(syn, method, "Sending request");
        transport.send_text(frame).await.map_err(|e| match e {
            TransportError::Closed => Error::ConnectionClosed,
            e => Error::Transport(e),
        })?;
        Ok(syn)
    }

    /// Waits for the response tagged with `syn`.
    ///
    /// A response that arrived before this call is returned immediately.
    /// Dropping the returned future abandons the wait; the request itself is
    /// not withdrawn from the daemon. A response that arrives after that stays
    /// buffered until a later `read_response(syn)` takes it or the connection
    /// closes.
    pub fn read_response(&self, syn: u64) -> ReadResponse {
        ReadResponse {
            inner: self.inner.clone(),
            syn,
            waiter: None,
            done: false,
        }
    }

    /// Like [`read_response`](Self::read_response), giving up with
    /// [`Error::Cancelled`] once `cancel` fires.
    pub async fn read_response_or_cancel(
        &self,
        syn: u64,
        cancel: &CancellationToken,
    ) -> Result<Response> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            response = self.read_response(syn) => response,
        }
    }

    /// Sends a request and waits for its response.
    pub async fn do_request(&self, method: &str, params: Option<Value>) -> Result<Response> {
        let syn = self.send_request(method, params).await?;
        self.read_response(syn).await
    }

    /// Closes the connection. Idempotent. Every pending and later call fails
    /// with [`Error::ConnectionClosed`].
    pub fn close(&self) {
        self.inner.close();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.inner.close();
    }
}

/// Future returned by [`Connection::read_response`].
#[must_use = "futures do nothing unless polled"]
pub struct ReadResponse {
    inner: Arc<Inner>,
    syn: u64,
    waiter: Option<u64>,
    done: bool,
}

impl Future for ReadResponse {
    type Output = Result<Response>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(Err(Error::ConnectionClosed));
        }

        let mut state = this.inner.state.lock();
        if let Some(pos) = state.pending.iter().position(|r| r.syn == this.syn) {
            let response = state.pending.remove(pos);
            if let Some(id) = this.waiter.take() {
                state.waiters.remove(&id);
            }
            this.done = true;
            return Poll::Ready(response.ok_or(Error::ConnectionClosed));
        }
        if state.phase == Phase::Closed {
            if let Some(id) = this.waiter.take() {
                state.waiters.remove(&id);
            }
            this.done = true;
            return Poll::Ready(Err(Error::ConnectionClosed));
        }

        let id = match this.waiter {
            Some(id) => id,
            None => {
                state.next_waiter += 1;
                let id = state.next_waiter;
                this.waiter = Some(id);
                id
            }
        };
        state.waiters.insert(id, cx.waker().clone());
        Poll::Pending
    }
}

impl Drop for ReadResponse {
    fn drop(&mut self) {
        if let Some(id) = self.waiter.take() {
            self.inner.state.lock().waiters.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::{self, MemoryPeer};
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    async fn open() -> (Connection, MemoryPeer) {
        let (connector, peer) = memory::pair();
        let (conn, hello) = tokio::join!(Connection::connect(&connector, "memory://daemon"), async {
            let hello = peer.recv_frame().await;
            peer.send_text("WinMount accept v0.1.0").unwrap();
            hello
        });
        assert_eq!(hello, Some(protocol::handshake_request()));
        (conn.unwrap(), peer)
    }

    fn response(syn: u64, data: &str) -> String {
        format!(r#"{{"type":"response","syn":{syn},"code":0,"msg":"","data":{data}}}"#)
    }

    #[tokio::test]
    async fn handshake_moves_to_open() {
        let (conn, _peer) = open().await;
        assert_eq!(conn.state(), Phase::Open);
        assert_eq!(conn.daemon_version(), "0.1.0");
    }

    #[tokio::test]
    async fn syns_start_at_zero_and_increase() {
        let (conn, peer) = open().await;
        assert_eq!(conn.send_request("list-fs", None).await.unwrap(), 0);
        assert_eq!(conn.send_request("list-fsp", None).await.unwrap(), 1);
        let first: Value = serde_json::from_str(&peer.recv_frame().await.unwrap()).unwrap();
        assert_eq!(first["syn"], 0);
        assert_eq!(first["method"], "list-fs");
        assert!(first.get("params").is_none());
    }

    #[tokio::test]
    async fn buffered_response_is_returned_immediately() {
        let (conn, peer) = open().await;
        let syn = conn.send_request("list-fs", None).await.unwrap();
        peer.send_text(response(syn, "7")).unwrap();

        // Give the delivery thread time to buffer the frame first.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let got = timeout(WAIT, conn.read_response(syn)).await.unwrap().unwrap();
        assert_eq!(got.data, Value::from(7));
    }

    #[tokio::test]
    async fn out_of_order_responses_reach_their_callers() {
        let (conn, peer) = open().await;
        let a = conn.send_request("start-fs", None).await.unwrap();
        let b = conn.send_request("stop-fs", None).await.unwrap();

        let (ra, rb, _) = tokio::join!(conn.read_response(a), conn.read_response(b), async {
            peer.send_text(response(b, r#""b""#)).unwrap();
            peer.send_text(response(a, r#""a""#)).unwrap();
        });
        assert_eq!(ra.unwrap().data, Value::from("a"));
        assert_eq!(rb.unwrap().data, Value::from("b"));
    }

    #[tokio::test]
    async fn close_fails_pending_and_later_calls() {
        let (conn, _peer) = open().await;
        let syn = conn.send_request("list-fs", None).await.unwrap();
        let (waited, _) = tokio::join!(conn.read_response(syn), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            conn.close();
        });
        assert!(matches!(waited, Err(Error::ConnectionClosed)));
        assert!(matches!(
            conn.send_request("list-fs", None).await,
            Err(Error::ConnectionClosed)
        ));
        assert!(matches!(conn.read_response(syn).await, Err(Error::ConnectionClosed)));
        conn.close();
        assert_eq!(conn.state(), Phase::Closed);
    }

    #[tokio::test]
    async fn remote_close_ends_session() {
        let (conn, peer) = open().await;
        let syn = conn.send_request("list-fs", None).await.unwrap();
        peer.disconnect(Some("bye")).unwrap();
        let waited = timeout(WAIT, conn.read_response(syn)).await.unwrap();
        assert!(matches!(waited, Err(Error::ConnectionClosed)));
        assert!(conn.is_closed());
        assert!(peer.is_closed());
    }

    #[tokio::test]
    async fn cancelled_wait_reports_cancelled() {
        let (conn, _peer) = open().await;
        let syn = conn.send_request("list-fs", None).await.unwrap();
        let token = CancellationToken::new();
        token.cancel();
        let result = conn.read_response_or_cancel(syn, &token).await;
        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(conn.state(), Phase::Open);
    }

    async fn wait_buffered(conn: &Connection, count: usize) {
        timeout(WAIT, async {
            while conn.inner.state.lock().pending.len() != count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("response never buffered");
    }

    #[tokio::test]
    async fn late_response_is_kept_for_a_second_read() {
        let (conn, peer) = open().await;
        let syn = conn.send_request("start-fs", None).await.unwrap();
        let gave_up = timeout(Duration::from_millis(30), conn.read_response(syn)).await;
        assert!(gave_up.is_err());

        peer.send_text(response(syn, r#""late""#)).unwrap();
        wait_buffered(&conn, 1).await;

        let mut again = conn.read_response(syn);
        let got = match futures::poll!(&mut again) {
            Poll::Ready(got) => got.unwrap(),
            Poll::Pending => panic!("buffered response was not returned immediately"),
        };
        assert_eq!(got.data, Value::from("late"));
        assert!(conn.inner.state.lock().pending.is_empty());
    }

    #[tokio::test]
    async fn dropping_woken_reader_leaves_no_waiter_behind() {
        let (conn, peer) = open().await;
        let syn = conn.send_request("stop-fs", None).await.unwrap();

        let mut first = conn.read_response(syn);
        assert!(futures::poll!(&mut first).is_pending());
        assert_eq!(conn.inner.state.lock().waiters.len(), 1);

        peer.send_text(response(syn, "1")).unwrap();
        wait_buffered(&conn, 1).await;
        drop(first);
        assert!(conn.inner.state.lock().waiters.is_empty());

        let got = timeout(WAIT, conn.read_response(syn)).await.unwrap().unwrap();
        assert_eq!(got.data, Value::from(1));
        let state = conn.inner.state.lock();
        assert!(state.pending.is_empty());
        assert!(state.waiters.is_empty());
    }

    #[tokio::test]
    async fn reader_dropped_before_polling_registers_nothing() {
        let (conn, peer) = open().await;
        let syn = conn.send_request("list-fs", None).await.unwrap();
        drop(conn.read_response(syn));
        assert!(conn.inner.state.lock().waiters.is_empty());

        peer.send_text(response(syn, "[]")).unwrap();
        let got = timeout(WAIT, conn.read_response(syn)).await.unwrap().unwrap();
        assert_eq!(got.syn, syn);
        assert!(conn.inner.state.lock().pending.is_empty());
    }

    #[tokio::test]
    async fn binary_frames_are_ignored() {
        let (conn, peer) = open().await;
        let syn = conn.send_request("list-fs", None).await.unwrap();
        peer.send_binary(vec![0xde, 0xad]).unwrap();
        peer.send_text(response(syn, "null")).unwrap();
        let got = timeout(WAIT, conn.read_response(syn)).await.unwrap().unwrap();
        assert_eq!(got.syn, syn);
    }

    #[tokio::test]
    async fn dropping_connection_closes_transport() {
        let (conn, peer) = open().await;
        drop(conn);
        assert!(peer.is_closed());
    }
}
