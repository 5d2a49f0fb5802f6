//! Transport-agnostic client session.
//!
//! A [`Session`] wraps a framed, bidirectional transport (an upgraded
//! WebSocket or an in-process channel pair) behind a cancellation token and
//! a monotonically increasing id. Reads happen on one background task
//! started by [`Session::await_close`] or [`Session::await_message`]; writes
//! from any number of tasks are serialised through a single async mutex.
//!
//! Close codes 1000 and 1001 are treated as clean by default. Anything else,
//! a transport error, or the peer vanishing without a close frame cancels
//! the session and is logged.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use futures::channel::mpsc as local;
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::Serialize;
use tokio::sync::{OnceCell, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{Instrument, Span, debug, info_span, warn};

use crate::tty::config::CLOSE_HANDSHAKE_TIMEOUT;
use crate::tty::error::{SessionError, TransportError};

pub const NORMAL_CLOSURE: u16 = 1000;
pub const GOING_AWAY: u16 = 1001;

/// Close codes treated as a clean shutdown by the peer.
pub const CLEAN_CLOSE_CODES: &[u16] = &[NORMAL_CLOSURE, GOING_AWAY];

/// Capacity of the channel returned by [`Session::await_message`].
const MESSAGE_BUFFER: usize = 16;

/// Close frame payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub reason: String,
}

impl CloseReason {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

/// A frame on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close(Option<CloseReason>),
}

/// Data message delivered to the session owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Vec<u8>),
}

impl Message {
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Self::Text(text) => text.into_bytes(),
            Self::Binary(data) => data,
        }
    }
}

/// How a session ended. Recorded once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseOutcome {
    /// Peer closed with an accepted code.
    Clean(u16),
    /// Peer closed with a code outside the accepted set.
    Abnormal(u16),
    /// Transport ended without a close frame.
    Dropped,
    Error(String),
    /// Closed from this side.
    Local,
}

type FrameSink = Pin<Box<dyn Sink<Frame, Error = TransportError> + Send>>;
type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, TransportError>> + Send>>;

/// Sink and stream halves of a framed connection.
pub struct Transport {
    sink: FrameSink,
    stream: FrameStream,
}

impl Transport {
    pub fn new<S, R>(sink: S, stream: R) -> Self
    where
        S: Sink<Frame, Error = TransportError> + Send + 'static,
        R: Stream<Item = Result<Frame, TransportError>> + Send + 'static,
    {
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }
}

/// The far end of an in-process transport.
pub struct LocalPeer {
    tx: local::Sender<Frame>,
    rx: local::Receiver<Frame>,
}

impl LocalPeer {
    pub async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        self.tx
            .send(frame)
            .await
            .map_err(|e| TransportError(e.to_string()))
    }

    /// Next frame written by the session, `None` once its sink is closed.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.next().await
    }

    pub async fn close(&mut self, code: u16) -> Result<(), TransportError> {
        self.send(Frame::Close(Some(CloseReason::new(code, "")))).await
    }
}

/// Build an in-process transport and the peer driving it.
///
/// Each direction buffers up to `buffer` frames.
pub fn local_pair(buffer: usize) -> (Transport, LocalPeer) {
    let (to_peer, from_session) = local::channel(buffer);
    let (to_session, from_peer) = local::channel(buffer);

    let transport = Transport::new(
        to_peer.sink_map_err(|e| TransportError(e.to_string())),
        from_peer.map(Ok),
    );
    let peer = LocalPeer {
        tx: to_session,
        rx: from_session,
    };
    (transport, peer)
}

/// Hands out sessions derived from one root cancellation token.
pub struct SessionHub {
    next_id: AtomicU64,
    root: CancellationToken,
    span: Span,
}

impl SessionHub {
    pub fn new(root: CancellationToken, span: Span) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            root,
            span,
        }
    }

    pub fn root(&self) -> &CancellationToken {
        &self.root
    }

    /// Wrap `transport` in a new session.
    ///
    /// The session's token is a child of the hub's root token.
    pub fn handle_connect(&self, transport: Transport) -> Arc<Session> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let span = info_span!(parent: &self.span, "session", id);
        span.in_scope(|| debug!("Session {} connected", id));

        Arc::new(Session {
            id,
            token: self.root.child_token(),
            sink: tokio::sync::Mutex::new(transport.sink),
            stream: Mutex::new(Some(transport.stream)),
            reader: Mutex::new(None),
            outcome: OnceLock::new(),
            peer_closed: AtomicBool::new(false),
            exited: OnceCell::new(),
            span,
        })
    }
}

/// One client connection.
pub struct Session {
    id: u64,
    token: CancellationToken,
    sink: tokio::sync::Mutex<FrameSink>,
    stream: Mutex<Option<FrameStream>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    outcome: OnceLock<CloseOutcome>,
    peer_closed: AtomicBool,
    exited: OnceCell<()>,
    span: Span,
}

impl Session {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Span of this session; per-session work nests under it.
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Resolves once the session context is cancelled.
    pub fn done(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    pub fn is_done(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn outcome(&self) -> Option<CloseOutcome> {
        self.outcome.get().cloned()
    }

    /// Start the background reader, discarding data frames.
    ///
    /// A close frame with a code in `accepted` cancels the session quietly;
    /// any other code, a read error, or the end of the stream cancels it with
    /// a warning.
    pub fn await_close(self: &Arc<Self>, accepted: &[u16]) -> Result<(), SessionError> {
        let stream = self.take_stream()?;
        self.spawn_reader(stream, accepted.to_vec(), None);
        Ok(())
    }

    /// Start the background reader, forwarding data frames to the returned
    /// channel. Close handling is the same as [`Session::await_close`].
    pub fn await_message(
        self: &Arc<Self>,
        accepted: &[u16],
    ) -> Result<mpsc::Receiver<Message>, SessionError> {
        let stream = self.take_stream()?;
        let (tx, rx) = mpsc::channel(MESSAGE_BUFFER);
        self.spawn_reader(stream, accepted.to_vec(), Some(tx));
        Ok(rx)
    }

    /// Wait for the background reader, if one was started.
    pub async fn join_reader(&self) {
        let handle = self
            .reader
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub async fn write_bytes(&self, data: &[u8]) -> Result<(), SessionError> {
        self.write_frame(Frame::Binary(data.to_vec())).await
    }

    pub async fn write_text(&self, text: &str) -> Result<(), SessionError> {
        self.write_frame(Frame::Text(text.to_string())).await
    }

    pub async fn write_json<T: Serialize>(&self, value: &T) -> Result<(), SessionError> {
        let text = serde_json::to_string(value).map_err(|e| SessionError::Encode(e.to_string()))?;
        self.write_frame(Frame::Text(text)).await
    }

    /// Close the session. Idempotent and safe to call from many tasks.
    ///
    /// Cancels the context, sends a normal-closure frame unless the peer
    /// already closed, then closes the transport.
    pub async fn exit(&self) {
        self.exited
            .get_or_init(|| async {
                self.token.cancel();
                self.record(CloseOutcome::Local);

                let mut sink = self.sink.lock().await;
                if !self.peer_closed.load(Ordering::SeqCst) {
                    let close = Frame::Close(Some(CloseReason::new(NORMAL_CLOSURE, "")));
                    match tokio::time::timeout(CLOSE_HANDSHAKE_TIMEOUT, sink.send(close)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => debug!(parent: &self.span, "close frame not sent: {}", e),
                        Err(_) => debug!(parent: &self.span, "close frame timed out"),
                    }
                }
                if let Ok(Err(e)) = tokio::time::timeout(CLOSE_HANDSHAKE_TIMEOUT, sink.close()).await {
                    debug!(parent: &self.span, "transport close: {}", e);
                }
                debug!(parent: &self.span, "Session {} exited", self.id);
            })
            .await;
    }

    async fn write_frame(&self, frame: Frame) -> Result<(), SessionError> {
        if self.token.is_cancelled() {
            return Err(SessionError::Closed(self.id));
        }

        let mut sink = self.sink.lock().await;
        let result = tokio::select! {
            biased;
            _ = self.token.cancelled() => return Err(SessionError::Closed(self.id)),
            result = sink.send(frame) => result,
        };

        result.map_err(|e| {
            warn!(parent: &self.span, "Session {} write failed: {}", self.id, e);
            self.record(CloseOutcome::Error(e.to_string()));
            self.token.cancel();
            SessionError::Transport(e.to_string())
        })
    }

    fn record(&self, outcome: CloseOutcome) {
        let _ = self.outcome.set(outcome);
    }

    fn take_stream(&self) -> Result<FrameStream, SessionError> {
        self.stream
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(SessionError::ReaderTaken(self.id))
    }

    fn spawn_reader(
        self: &Arc<Self>,
        stream: FrameStream,
        accepted: Vec<u16>,
        forward: Option<mpsc::Sender<Message>>,
    ) {
        let session = self.clone();
        let handle = tokio::spawn(
            session
                .read_frames(stream, accepted, forward)
                .instrument(self.span.clone()),
        );
        *self.reader.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    async fn read_frames(
        self: Arc<Self>,
        mut stream: FrameStream,
        accepted: Vec<u16>,
        forward: Option<mpsc::Sender<Message>>,
    ) {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                next = stream.next() => next,
            };

            let message = match next {
                Some(Ok(Frame::Text(text))) => Message::Text(text),
                Some(Ok(Frame::Binary(data))) => Message::Binary(data),
                Some(Ok(Frame::Ping(_))) | Some(Ok(Frame::Pong(_))) => continue,
                Some(Ok(Frame::Close(reason))) => {
                    self.peer_closed.store(true, Ordering::SeqCst);
                    let code = reason.as_ref().map_or(NORMAL_CLOSURE, |r| r.code);
                    if accepted.contains(&code) {
                        debug!("Session {} closed by peer ({})", self.id, code);
                        self.record(CloseOutcome::Clean(code));
                    } else {
                        warn!(
                            "Session {} closed by peer with unexpected code {} {:?}",
                            self.id,
                            code,
                            reason.map(|r| r.reason).unwrap_or_default()
                        );
                        self.record(CloseOutcome::Abnormal(code));
                    }
                    break;
                }
                Some(Err(e)) => {
                    warn!("Session {} read failed: {}", self.id, e);
                    self.record(CloseOutcome::Error(e.to_string()));
                    break;
                }
                None => {
                    warn!("Session {} transport dropped without close", self.id);
                    self.record(CloseOutcome::Dropped);
                    break;
                }
            };

            let Some(tx) = &forward else {
                continue;
            };
            let delivered = tokio::select! {
                biased;
                _ = self.token.cancelled() => false,
                sent = tx.send(message) => sent.is_ok(),
            };
            if !delivered {
                break;
            }
        }

        self.token.cancel();
    }
}
