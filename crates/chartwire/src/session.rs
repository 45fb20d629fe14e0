//! Chart session: one streaming connection shared by every chart, series,
//! study and quote session created on it.
//!
//! A single reader task owns the transport. Per read it splits frames,
//! echoes heartbeats inline, completes the handshake on the protocol
//! descriptor and dispatches every other event through the router; all
//! listeners for one frame finish before the next frame is looked at.
//! Writes from callers are queued and interleaved by the same task.
//!
//! Lifecycle: `Connecting -> Open -> Closing -> Closed`.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, trace, warn};

use crate::config::SessionConfig;
use crate::error::{FrameError, SessionError, TransportError};
use crate::framing::{self, Frame, Framer};
use crate::message::{heartbeat_frame, Command, Event, Inbound, ProtocolDescriptor, ERROR_CHANNEL};
use crate::metrics::{self, FrameKind};
use crate::router::{EventRouter, Lease, Subscription};
use crate::transport::Transport;
use crate::websocket::WebSocketTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Why a session ended
#[derive(Debug, Clone, PartialEq)]
pub enum CloseReason {
    /// `close()` was called
    Requested,
    /// Idle reaper: no listeners and no live resources left
    Idle,
    /// Every session handle was dropped
    Dropped,
    /// The protocol descriptor did not arrive in time
    HandshakeTimeout,
    /// The remote ended the stream
    RemoteClosed,
    Transport(String),
    Frame(FrameError),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Requested => write!(f, "close requested"),
            CloseReason::Idle => write!(f, "idle"),
            CloseReason::Dropped => write!(f, "all handles dropped"),
            CloseReason::HandshakeTimeout => write!(f, "handshake timed out"),
            CloseReason::RemoteClosed => write!(f, "remote closed the stream"),
            CloseReason::Transport(e) => write!(f, "transport error: {e}"),
            CloseReason::Frame(e) => write!(f, "framing error: {e}"),
        }
    }
}

impl CloseReason {
    fn to_error(&self) -> SessionError {
        match self {
            CloseReason::Frame(e) => SessionError::Frame(e.clone()),
            CloseReason::Transport(e) => {
                SessionError::Transport(TransportError::ConnectionFailed(e.clone()))
            }
            _ => SessionError::Closed,
        }
    }
}

enum Outbound {
    Frame(String),
    Close,
}

/// Handle to an open session. Cheap to clone; the connection closes once
/// every handle is gone, on `close()`, or via the idle reaper.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    descriptor: ProtocolDescriptor,
    config: SessionConfig,
    router: Arc<EventRouter>,
    outbound: mpsc::UnboundedSender<Outbound>,
    state: Arc<watch::Sender<SessionState>>,
    reason: Arc<OnceLock<CloseReason>>,
    next_id: AtomicU64,
}

impl SessionInner {
    fn request_close(&self, reason: CloseReason) {
        let changed = self.state.send_if_modified(|state| match state {
            SessionState::Connecting | SessionState::Open => {
                *state = SessionState::Closing;
                true
            }
            _ => false,
        });
        if changed {
            info!(session_id = %self.descriptor.session_id, reason = %reason, "Closing session");
            let _ = self.reason.set(reason);
            let _ = self.outbound.send(Outbound::Close);
        }
    }
}

impl Session {
    /// Connect over WebSocket and complete the handshake.
    pub async fn connect(config: SessionConfig) -> Result<Self, SessionError> {
        let transport = WebSocketTransport::connect(&config).await?;
        Self::open(transport, config).await
    }

    /// Run the handshake over an established transport.
    ///
    /// Queues `set_auth_token` and `set_locale`, starts the reader and waits
    /// until the remote delivers its protocol descriptor. Without a
    /// `handshake_timeout_secs` the wait is unbounded.
    pub async fn open<T: Transport>(transport: T, config: SessionConfig) -> Result<Self, SessionError> {
        let router = EventRouter::new();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let state = Arc::new(watch::channel(SessionState::Connecting).0);
        let reason = Arc::new(OnceLock::new());
        let (descriptor_tx, descriptor_rx) = oneshot::channel();

        for command in [
            Command::set_auth_token(config.token()),
            Command::set_locale(&config.language, &config.region),
        ] {
            outbound_tx
                .send(Outbound::Frame(command.encode()))
                .map_err(|_| SessionError::Closed)?;
        }

        let reader = Reader {
            transport,
            framer: Framer::new(),
            router: Arc::clone(&router),
            outbound: outbound_rx,
            state: Arc::clone(&state),
            reason: Arc::clone(&reason),
            descriptor: Some(descriptor_tx),
            opened: false,
        };
        tokio::spawn(reader.run());

        let received = match config.handshake_timeout() {
            Some(limit) => match tokio::time::timeout(limit, descriptor_rx).await {
                Ok(received) => received,
                Err(_) => {
                    warn!(timeout_secs = limit.as_secs(), "No protocol descriptor received");
                    let _ = reason.set(CloseReason::HandshakeTimeout);
                    state.send_replace(SessionState::Closing);
                    let _ = outbound_tx.send(Outbound::Close);
                    return Err(SessionError::Timeout(limit.as_secs()));
                }
            },
            None => descriptor_rx.await,
        };
        let descriptor = received.map_err(|_| SessionError::Closed)??;

        info!(
            session_id = %descriptor.session_id,
            protocol = %descriptor.protocol,
            "Session open"
        );

        let session = Self {
            inner: Arc::new(SessionInner {
                descriptor,
                config,
                router,
                outbound: outbound_tx,
                state,
                reason,
                next_id: AtomicU64::new(0),
            }),
        };
        if session.inner.config.idle_close {
            spawn_idle_reaper(&session.inner);
        }
        Ok(session)
    }

    /// Protocol descriptor received during the handshake
    pub fn protocol(&self) -> &ProtocolDescriptor {
        &self.inner.descriptor
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    /// Why the session ended, once it has
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.inner.reason.get().cloned()
    }

    /// Queue a command for writing. Success means enqueued, not processed.
    pub fn send(&self, command: Command) -> Result<(), SessionError> {
        if self.state() != SessionState::Open {
            return Err(SessionError::Closed);
        }
        debug!(event = %command.name, "Sending command");
        self.inner
            .outbound
            .send(Outbound::Frame(command.encode()))
            .map_err(|_| SessionError::Closed)
    }

    /// Mint a session-unique identifier `<prefix>_<n>`. Never reused.
    pub fn mint_id(&self, prefix: &str) -> String {
        let n = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        format!("{prefix}_{n}")
    }

    pub fn router(&self) -> &Arc<EventRouter> {
        &self.inner.router
    }

    /// Listen to every event with this exact name
    pub fn on<F>(&self, event: &str, callback: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.inner.router.subscribe(event, Arc::new(callback))
    }

    /// Listen to every error-suffixed event the remote pushes
    pub fn on_error<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.on(ERROR_CHANNEL, callback)
    }

    /// Keep the session out of idle while the lease is held
    pub(crate) fn lease(&self) -> Lease {
        self.inner.router.lease()
    }

    /// Write the close frame and shut the transport. Idempotent.
    pub fn close(&self) {
        self.inner.request_close(CloseReason::Requested);
    }

    /// Wait until the session has fully closed.
    pub async fn closed(&self) -> CloseReason {
        let mut state = self.inner.state.subscribe();
        let _ = state.wait_for(|s| *s == SessionState::Closed).await;
        self.close_reason().unwrap_or(CloseReason::Dropped)
    }

    /// Await a reply under the configured timeout policy, failing with
    /// `Closed` if the session ends first.
    pub(crate) async fn await_reply<T, F>(&self, reply: F) -> Result<T, SessionError>
    where
        F: Future<Output = Result<T, SessionError>>,
    {
        let guarded = async {
            tokio::select! {
                result = reply => result,
                _ = self.closed() => Err(SessionError::Closed),
            }
        };
        with_timeout(self.inner.config.request_timeout(), guarded).await
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.inner.descriptor.session_id)
            .field("state", &self.state())
            .finish()
    }
}

/// Close the session when the router goes idle.
fn spawn_idle_reaper(inner: &Arc<SessionInner>) {
    let weak: Weak<SessionInner> = Arc::downgrade(inner);
    let router = Arc::clone(&inner.router);
    let mut state = inner.state.subscribe();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = router.idle() => {
                    if !router.is_idle() {
                        continue;
                    }
                    if let Some(inner) = weak.upgrade() {
                        inner.request_close(CloseReason::Idle);
                    }
                    break;
                }
                _ = wait_closed(&mut state) => break,
            }
        }
        trace!("Idle reaper stopped");
    });
}

async fn wait_closed(state: &mut watch::Receiver<SessionState>) {
    let _ = state.wait_for(|s| *s == SessionState::Closed).await;
}

/// The single task owning the transport.
struct Reader<T: Transport> {
    transport: T,
    framer: Framer,
    router: Arc<EventRouter>,
    outbound: mpsc::UnboundedReceiver<Outbound>,
    state: Arc<watch::Sender<SessionState>>,
    reason: Arc<OnceLock<CloseReason>>,
    descriptor: Option<oneshot::Sender<Result<ProtocolDescriptor, SessionError>>>,
    opened: bool,
}

impl<T: Transport> Reader<T> {
    async fn run(mut self) {
        let exit = self.pump().await;
        let _ = self.reason.set(exit);
        let reason = self.reason.get().cloned().unwrap_or(CloseReason::Dropped);

        if let Some(tx) = self.descriptor.take() {
            let _ = tx.send(Err(reason.to_error()));
        }

        // pending waits held by listeners fail instead of hanging
        self.router.clear();
        if self.opened {
            metrics::session_closed();
        }
        self.state.send_replace(SessionState::Closed);
        info!(reason = %reason, "Session closed");
    }

    async fn pump(&mut self) -> CloseReason {
        loop {
            tokio::select! {
                outbound = self.outbound.recv() => match outbound {
                    Some(Outbound::Frame(text)) => {
                        if let Err(e) = self.write(text).await {
                            error!(error = %e, "Failed to write frame");
                            return CloseReason::Transport(e.to_string());
                        }
                    }
                    Some(Outbound::Close) => {
                        self.shutdown().await;
                        return CloseReason::Requested;
                    }
                    None => {
                        self.shutdown().await;
                        return CloseReason::Dropped;
                    }
                },
                chunk = self.transport.recv() => match chunk {
                    Some(Ok(text)) => {
                        if let Err(reason) = self.on_chunk(&text).await {
                            let _ = self.transport.close().await;
                            return reason;
                        }
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "Transport error, closing session");
                        return CloseReason::Transport(e.to_string());
                    }
                    None => {
                        info!("Remote closed the stream");
                        return CloseReason::RemoteClosed;
                    }
                },
            }
        }
    }

    async fn on_chunk(&mut self, chunk: &str) -> Result<(), CloseReason> {
        let frames = self.framer.push(chunk).map_err(|e| {
            metrics::inc_framing_error();
            error!(error = %e, "Malformed frame, closing session");
            CloseReason::Frame(e)
        })?;
        for frame in frames {
            self.on_frame(frame).await?;
        }
        Ok(())
    }

    async fn on_frame(&mut self, frame: Frame) -> Result<(), CloseReason> {
        match Inbound::parse(frame.payload()) {
            Ok(Inbound::Heartbeat(token)) => {
                metrics::inc_frame_received(FrameKind::Heartbeat);
                trace!(token = %token, "Heartbeat received, echoing");
                self.write(heartbeat_frame(&token))
                    .await
                    .map_err(|e| CloseReason::Transport(e.to_string()))?;
            }
            Ok(Inbound::Descriptor(descriptor)) => {
                metrics::inc_frame_received(FrameKind::Descriptor);
                match self.descriptor.take() {
                    Some(tx) => {
                        self.state.send_if_modified(|state| {
                            if *state == SessionState::Connecting {
                                *state = SessionState::Open;
                                true
                            } else {
                                false
                            }
                        });
                        self.opened = true;
                        metrics::session_opened();
                        let _ = tx.send(Ok(descriptor));
                    }
                    None => warn!(session_id = %descriptor.session_id, "Ignoring repeated protocol descriptor"),
                }
            }
            Ok(Inbound::Event(event)) => {
                metrics::inc_frame_received(FrameKind::Event);
                self.router.dispatch(&event);
            }
            Err(e) => {
                metrics::inc_frame_received(FrameKind::Unparsed);
                if frame.is_empty() {
                    debug!("Empty frame received");
                } else {
                    warn!(error = %e, payload = %frame.payload(), "Dropping unparseable frame");
                }
            }
        }
        Ok(())
    }

    async fn write(&mut self, text: String) -> Result<(), TransportError> {
        self.transport.send(text).await?;
        metrics::inc_frame_sent();
        Ok(())
    }

    /// Close frame, then close the transport
    async fn shutdown(&mut self) {
        if let Err(e) = self.write(framing::encode("")).await {
            debug!(error = %e, "Failed to write close frame");
        }
        if let Err(e) = self.transport.close().await {
            debug!(error = %e, "Failed to close transport");
        }
    }
}

/// Single-use reply slot filled by a listener and awaited by the caller.
pub(crate) struct ReplySlot<T> {
    tx: Mutex<Option<oneshot::Sender<T>>>,
}

impl<T> ReplySlot<T> {
    pub(crate) fn new() -> (Arc<Self>, oneshot::Receiver<T>) {
        let (tx, rx) = oneshot::channel();
        let slot = Arc::new(Self {
            tx: Mutex::new(Some(tx)),
        });
        (slot, rx)
    }

    /// Deliver `value` unless a reply was already delivered.
    pub(crate) fn fill(&self, value: T) -> bool {
        let tx = self
            .tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        match tx {
            Some(tx) => tx.send(value).is_ok(),
            None => false,
        }
    }
}

async fn with_timeout<T, F>(limit: Option<Duration>, fut: F) -> Result<T, SessionError>
where
    F: Future<Output = Result<T, SessionError>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| SessionError::Timeout(limit.as_secs()))?,
        None => fut.await,
    }
}
