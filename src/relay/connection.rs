//! One WebSocket link: read, write, and dispatch tasks plus heartbeat.
//!
//! ## Tasks
//!
//! Each [`Connection`] runs three tokio tasks for its whole life:
//!
//! - **read**: pulls frames off the socket, resets the heartbeat counter on
//!   every successful read, and queues data frames (capacity
//!   [`QUEUE_CAPACITY`]) for dispatch.
//! - **write**: a `select!` loop over the outbound queue, the ping ticker,
//!   the heartbeat deadline, and shutdown. Every socket write goes through
//!   the sink mutex so pings and data never interleave.
//! - **dispatch**: drains the inbound queue into
//!   [`ConnectionHandler::on_data`] in arrival order, then fires
//!   [`ConnectionHandler::on_disconnect`] exactly once after teardown.
//!
//! ## Teardown
//!
//! [`Connection::close`] is idempotent and safe to call from any task. The
//! first caller cancels the shutdown token, closes the socket, and releases
//! the link permit; every caller gets the same result. Messages that were
//! already queued for dispatch are still delivered before `on_disconnect`.
//!
//! A panic inside any task is caught, logged with a backtrace, recorded as
//! [`RelayError::UnexpectedFault`], and the connection is closed.

use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use bytes::Bytes;
use futures::{FutureExt, Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, Mutex, OnceCell};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::classify::{classify, close_frame_error};
use super::links::LinkPermit;
use crate::config::{MessageType, RelayConfig};
use crate::error::RelayError;

/// Capacity of the inbound and outbound message queues.
pub const QUEUE_CAPACITY: usize = 64;

/// Write half of a socket.
pub type FrameSink = Pin<Box<dyn Sink<Message, Error = axum::Error> + Send>>;
/// Read half of a socket.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Message, axum::Error>> + Send>>;

/// An upgraded socket that has not been given a role yet.
pub struct Transport {
    id: String,
    sink: FrameSink,
    stream: FrameStream,
}

impl Transport {
    /// Wrap an upgraded axum socket. The remote address becomes the identity.
    pub fn from_socket(socket: WebSocket, remote: SocketAddr) -> Self {
        let (sink, stream) = socket.split();
        Self::new(remote.to_string(), Box::pin(sink), Box::pin(stream))
    }

    pub fn new(id: impl Into<String>, sink: FrameSink, stream: FrameStream) -> Self {
        Self {
            id: id.into(),
            sink,
            stream,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Send a close frame and release the socket without starting any tasks.
    pub async fn reject(mut self, code: u16, reason: &str) {
        let frame = CloseFrame {
            code,
            reason: reason.to_string().into(),
        };
        if let Err(e) = self.sink.send(Message::Close(Some(frame))).await {
            debug!(conn = %self.id, "close frame not delivered: {e}");
        }
        let _ = self.sink.close().await;
    }
}

/// Per-connection timing and framing parameters.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub ping_period: Duration,
    /// Missed pongs tolerated before [`RelayError::HeartbeatTimeout`].
    pub max_missed_pongs: u32,
    pub message_type: MessageType,
    pub read_deadline: Duration,
    pub write_deadline: Duration,
}

impl ConnectionOptions {
    /// The read deadline is raised to cover a full heartbeat window plus one
    /// period, so a peer that answers pings is never cut off by it.
    pub fn from_config(relay: &RelayConfig) -> Self {
        let ping_period = relay.ping_period();
        let max_missed_pongs = relay.ping_timeout.max(1);
        let heartbeat_floor = ping_period
            .checked_mul(max_missed_pongs.saturating_add(1))
            .unwrap_or(Duration::MAX);
        Self {
            ping_period,
            max_missed_pongs,
            message_type: relay.message_type().unwrap_or_default(),
            read_deadline: relay.read_deadline().max(heartbeat_floor),
            write_deadline: relay.write_deadline(),
        }
    }

    /// Window after which an unanswered heartbeat ends the connection.
    pub fn heartbeat_timeout(&self) -> Duration {
        self.ping_period * self.max_missed_pongs
    }
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self::from_config(&RelayConfig::default())
    }
}

/// Callbacks a [`Connection`] delivers to its owner.
///
/// Injected at construction, so they are fixed before any task starts. All
/// callbacks for one connection run on its dispatch task and never overlap.
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    async fn on_connect(&self, conn: &Connection) {
        info!(conn = %conn.id(), "[OnConnect] connected");
    }

    async fn on_data(&self, conn: &Connection, message: Bytes) {
        let _ = (conn, message);
    }

    /// `error` is the terminal error, or `None` after a graceful close.
    async fn on_disconnect(&self, conn: &Connection, error: Option<RelayError>) {
        match error {
            Some(e) => info!(conn = %conn.id(), error = %e, "[OnDisconnect] disconnected"),
            None => info!(conn = %conn.id(), "[OnDisconnect] disconnected"),
        }
    }
}

/// Handler that only logs lifecycle events and ignores data.
pub struct LoggingHandler;

#[async_trait]
impl ConnectionHandler for LoggingHandler {}

/// Handle to a live (or closed) link. Cheap to clone.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

struct Inner {
    id: String,
    options: ConnectionOptions,
    outbound: mpsc::Sender<Bytes>,
    sink: Mutex<FrameSink>,
    /// Pings sent since the last successful read.
    heart: AtomicU32,
    shutdown: CancellationToken,
    /// Cancelled once `on_disconnect` has returned.
    finished: CancellationToken,
    fatal: OnceLock<RelayError>,
    close_result: OnceCell<Result<(), RelayError>>,
    permit: std::sync::Mutex<Option<LinkPermit>>,
    connected_at: Instant,
}

impl Connection {
    /// Take ownership of `transport` and start the read, write, and dispatch
    /// tasks. `permit` is released when the connection is torn down.
    pub fn open(
        transport: Transport,
        options: ConnectionOptions,
        handler: Arc<dyn ConnectionHandler>,
        permit: Option<LinkPermit>,
    ) -> Self {
        let Transport { id, sink, stream } = transport;
        let (outbound_tx, outbound_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(QUEUE_CAPACITY);

        let conn = Self {
            inner: Arc::new(Inner {
                id,
                options,
                outbound: outbound_tx,
                sink: Mutex::new(sink),
                heart: AtomicU32::new(0),
                shutdown: CancellationToken::new(),
                finished: CancellationToken::new(),
                fatal: OnceLock::new(),
                close_result: OnceCell::new(),
                permit: std::sync::Mutex::new(permit),
                connected_at: Instant::now(),
            }),
        };
        let span = info_span!("conn", id = %conn.id());

        let c = conn.clone();
        tokio::spawn(
            async move {
                guarded(&c, "read", read_loop(c.clone(), stream, inbound_tx)).await;
                let _ = c.close().await;
            }
            .instrument(span.clone()),
        );

        let c = conn.clone();
        tokio::spawn(
            async move {
                guarded(&c, "write", write_loop(c.clone(), outbound_rx)).await;
                let _ = c.close().await;
            }
            .instrument(span.clone()),
        );

        let c = conn.clone();
        tokio::spawn(
            async move {
                guarded(&c, "dispatch", dispatch_loop(c.clone(), handler.clone(), inbound_rx))
                    .await;
                let _ = c.close().await;
                let error = c.terminal_error();
                guarded(&c, "disconnect", handler.on_disconnect(&c, error)).await;
                c.inner.finished.cancel();
            }
            .instrument(span),
        );

        conn
    }

    /// Identity of the link (the peer's socket address).
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.inner.options
    }

    /// Whether both handles refer to the same link.
    pub fn ptr_eq(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Queue `data` for delivery, waiting while the outbound queue is full.
    ///
    /// Returns once the message is queued; delivery is not confirmed.
    pub async fn send(&self, data: Bytes) -> Result<(), RelayError> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        tokio::select! {
            () = self.inner.shutdown.cancelled() => Err(self.closed_error()),
            res = self.inner.outbound.send(data) => res.map_err(|_| self.closed_error()),
        }
    }

    /// Queue `data` without waiting. Fails with [`RelayError::QueueFull`] when
    /// the outbound queue has no room.
    pub fn try_send(&self, data: Bytes) -> Result<(), RelayError> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        match self.inner.outbound.try_send(data) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(RelayError::QueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(self.closed_error()),
        }
    }

    /// Queue `data`, waiting at most `wait` for room. A zero `wait` behaves
    /// like [`Connection::try_send`].
    pub async fn send_timeout(&self, data: Bytes, wait: Duration) -> Result<(), RelayError> {
        if wait.is_zero() {
            return self.try_send(data);
        }
        match tokio::time::timeout(wait, self.send(data)).await {
            Ok(res) => res,
            Err(_) => Err(RelayError::QueueFull),
        }
    }

    /// Tear the connection down. Idempotent; concurrent callers all observe
    /// the result of the single teardown.
    pub async fn close(&self) -> Result<(), RelayError> {
        self.inner
            .close_result
            .get_or_init(|| self.teardown())
            .await
            .clone()
    }

    /// Whether teardown has started.
    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Wait until teardown has finished and `on_disconnect` has returned.
    pub async fn closed(&self) {
        self.inner.finished.cancelled().await;
    }

    /// The error that ended the connection, if any.
    pub fn terminal_error(&self) -> Option<RelayError> {
        self.inner.fatal.get().cloned()
    }

    /// Pings sent since the last frame was received.
    pub fn missed_pongs(&self) -> u32 {
        self.inner.heart.load(Ordering::Acquire)
    }

    /// Messages waiting in the outbound queue.
    pub fn queued(&self) -> usize {
        QUEUE_CAPACITY - self.inner.outbound.capacity()
    }

    pub fn age(&self) -> Duration {
        self.inner.connected_at.elapsed()
    }

    /// First writer wins. Errors seen after teardown started are its
    /// consequence, not its cause, and are dropped.
    fn record_fatal(&self, err: RelayError) {
        if self.is_closed() {
            return;
        }
        let _ = self.inner.fatal.set(err);
    }

    fn closed_error(&self) -> RelayError {
        self.terminal_error()
            .unwrap_or_else(|| RelayError::ConnectionClosed("connection closed".to_string()))
    }

    async fn teardown(&self) -> Result<(), RelayError> {
        self.inner.shutdown.cancel();

        let result = {
            let mut sink = self.inner.sink.lock().await;
            match tokio::time::timeout(self.inner.options.write_deadline, sink.close()).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => match classify(&e) {
                    // The peer beat us to it.
                    RelayError::ConnectionClosed(_) => Ok(()),
                    other => Err(other),
                },
                Err(_) => Err(RelayError::ConnectionClosed("i/o timeout".to_string())),
            }
        };

        let permit = match self.inner.permit.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(permit);

        match self.terminal_error() {
            Some(e) => debug!(conn = %self.id(), error = %e, "teardown complete"),
            None => debug!(conn = %self.id(), "teardown complete"),
        }
        result
    }

    fn encode(&self, data: Bytes) -> Result<Message, RelayError> {
        match self.inner.options.message_type {
            MessageType::Binary => Ok(Message::Binary(data)),
            MessageType::Text => String::from_utf8(data.to_vec())
                .map(|text| Message::Text(text.into()))
                .map_err(|e| RelayError::TransientIo(format!("text frame is not UTF-8: {e}"))),
        }
    }

    async fn write_frame(&self, frame: Message) -> Result<(), RelayError> {
        let mut sink = self.inner.sink.lock().await;
        let write = tokio::time::timeout(self.inner.options.write_deadline, sink.send(frame));
        tokio::select! {
            // A stuck write must not hold the sink while teardown waits for it.
            () = self.inner.shutdown.cancelled() => Err(self.closed_error()),
            res = write => match res {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(classify(&e)),
                Err(_) => Err(RelayError::ConnectionClosed("write: i/o timeout".to_string())),
            },
        }
    }
}

/// Run `fut`, converting a panic into a logged [`RelayError::UnexpectedFault`].
async fn guarded<F>(conn: &Connection, task: &'static str, fut: F)
where
    F: Future<Output = ()>,
{
    if let Err(panic) = AssertUnwindSafe(fut).catch_unwind().await {
        let message = if let Some(s) = panic.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = panic.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        let backtrace = std::backtrace::Backtrace::force_capture();
        error!(
            conn = %conn.id(),
            task,
            panic = %message,
            "[OnPanic] connection task panicked\n{backtrace}"
        );
        conn.record_fatal(RelayError::UnexpectedFault(message));
    }
}

async fn read_loop(conn: Connection, mut stream: FrameStream, inbound: mpsc::Sender<Bytes>) {
    let read_deadline = conn.inner.options.read_deadline;

    loop {
        let next = tokio::select! {
            () = conn.inner.shutdown.cancelled() => break,
            next = tokio::time::timeout(read_deadline, stream.next()) => next,
        };

        let frame = match next {
            Err(_) => {
                conn.record_fatal(RelayError::ConnectionClosed("read: i/o timeout".to_string()));
                break;
            }
            Ok(None) => {
                conn.record_fatal(RelayError::ConnectionClosed("unexpected EOF".to_string()));
                break;
            }
            Ok(Some(Err(e))) => {
                let err = classify(&e);
                if err.is_terminal() {
                    conn.record_fatal(err);
                    break;
                }
                debug!(conn = %conn.id(), error = %err, "read error, continuing");
                continue;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        conn.inner.heart.store(0, Ordering::Release);

        let data = match frame {
            Message::Binary(data) => data,
            Message::Text(text) => Bytes::copy_from_slice(text.as_str().as_bytes()),
            // Pings are answered by the transport; both only prove liveness.
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(frame) => {
                conn.record_fatal(close_frame_error(frame.as_ref()));
                break;
            }
        };

        tokio::select! {
            () = conn.inner.shutdown.cancelled() => break,
            res = inbound.send(data) => {
                if res.is_err() {
                    break;
                }
            }
        }
    }
}

async fn write_loop(conn: Connection, mut outbound: mpsc::Receiver<Bytes>) {
    let period = conn.inner.options.ping_period;
    let max_missed = conn.inner.options.max_missed_pongs;
    let timeout = conn.inner.options.heartbeat_timeout();

    let mut ping = tokio::time::interval_at(Instant::now() + period, period);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    loop {
        let result = tokio::select! {
            // The last ping of a window counts before the deadline checks it.
            biased;
            () = conn.inner.shutdown.cancelled() => break,
            _ = ping.tick() => {
                conn.inner.heart.fetch_add(1, Ordering::AcqRel);
                conn.write_frame(Message::Ping(Bytes::new())).await
            }
            () = &mut deadline => {
                deadline.as_mut().reset(Instant::now() + timeout);
                if conn.inner.heart.load(Ordering::Acquire) >= max_missed {
                    warn!(conn = %conn.id(), missed = max_missed, "heartbeat timeout");
                    conn.record_fatal(RelayError::HeartbeatTimeout);
                    break;
                }
                Ok(())
            }
            msg = outbound.recv() => {
                let Some(data) = msg else { break };
                match conn.encode(data) {
                    Ok(frame) => conn.write_frame(frame).await,
                    Err(e) => Err(e),
                }
            }
        };

        if let Err(err) = result {
            if err.is_terminal() {
                conn.record_fatal(err);
                break;
            }
            debug!(conn = %conn.id(), error = %err, "write error, continuing");
        }
    }
}

async fn dispatch_loop(
    conn: Connection,
    handler: Arc<dyn ConnectionHandler>,
    mut inbound: mpsc::Receiver<Bytes>,
) {
    handler.on_connect(&conn).await;
    while let Some(data) = inbound.recv().await {
        handler.on_data(&conn, data).await;
    }
}

/// In-memory transports for driving connections in tests.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use futures::channel::mpsc as fmpsc;

    /// The remote end of an in-memory [`Transport`].
    pub(crate) struct Peer {
        pub inbox: Pin<Box<dyn Stream<Item = Message> + Send>>,
        pub outbox: fmpsc::UnboundedSender<Result<Message, axum::Error>>,
    }

    /// A transport whose writes land in the peer's unbounded inbox.
    pub(crate) fn transport(id: &str) -> (Transport, Peer) {
        let (to_peer, inbox) = fmpsc::unbounded::<Message>();
        let sink = to_peer.sink_map_err(axum::Error::new);
        build(id, Box::pin(sink), Box::pin(inbox))
    }

    /// A transport whose writes block once `buffer` frames are unread, to
    /// simulate a consumer that has stopped reading.
    pub(crate) fn stalled_transport(id: &str, buffer: usize) -> (Transport, Peer) {
        let (to_peer, inbox) = fmpsc::channel::<Message>(buffer);
        let sink = to_peer.sink_map_err(axum::Error::new);
        build(id, Box::pin(sink), Box::pin(inbox))
    }

    fn build(
        id: &str,
        sink: FrameSink,
        inbox: Pin<Box<dyn Stream<Item = Message> + Send>>,
    ) -> (Transport, Peer) {
        let (outbox, from_peer) = fmpsc::unbounded::<Result<Message, axum::Error>>();
        let transport = Transport::new(id, sink, Box::pin(from_peer));
        (transport, Peer { inbox, outbox })
    }

    impl Peer {
        pub fn send_binary(&self, data: &[u8]) {
            let _ = self
                .outbox
                .unbounded_send(Ok(Message::Binary(Bytes::copy_from_slice(data))));
        }

        pub fn send_frame(&self, frame: Message) {
            let _ = self.outbox.unbounded_send(Ok(frame));
        }

        pub fn send_error(&self, err: std::io::Error) {
            let _ = self.outbox.unbounded_send(Err(axum::Error::new(err)));
        }

        /// Next data frame written by the server, skipping pings. `None` once
        /// the server has closed the socket.
        pub async fn next_data(&mut self) -> Option<Message> {
            while let Some(frame) = self.inbox.next().await {
                match frame {
                    Message::Ping(_) | Message::Pong(_) => continue,
                    other => return Some(other),
                }
            }
            None
        }

        /// Answer every ping until the server closes the socket.
        pub async fn answer_pings(mut self) {
            while let Some(frame) = self.inbox.next().await {
                if let Message::Ping(payload) = frame {
                    self.send_frame(Message::Pong(payload));
                }
            }
        }
    }
}
