//! Connection actor
//!
//! A [`Client`] owns one physical connection. Two tasks serve it: the inbound
//! loop reads frames, decodes messages and forwards them to the hub; the
//! outbound loop drains the bounded queue, coalescing everything pending into
//! a single write, and emits liveness pings on a fixed interval.
//!
//! Sending never blocks: a full queue sheds the message and a closed client
//! rejects it. Closing is one-way and idempotent.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::ConnectionConfig;
use crate::hub::{HubError, HubHandle};
use crate::metrics::Metrics;
use crate::net::framing::{self, FrameKind, FramingError, DELIMITER};
use crate::net::protocol::{self, InboundMessage, OutboundMessage, Payload};
use crate::participant::{ConnectionId, Correspondent, GroupId, Identity, Profile};
use crate::util::vec2::Vec2;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Why a send did not reach the outbound queue
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("connection closed")]
    Closed,
    #[error("outbound queue full")]
    Full,
    #[error("message of {0} bytes exceeds the frame limit")]
    TooLarge(usize),
    #[error(transparent)]
    Encode(#[from] protocol::EncodeError),
}

/// Why the inbound loop stopped
#[derive(Debug)]
enum Disconnect {
    Local,
    Deadline,
    PeerClosed,
    Transport(FramingError),
}

/// One live connection
pub struct Client {
    id: ConnectionId,
    remote_addr: Option<SocketAddr>,
    connected_at: Instant,
    max_payload: usize,
    /// `None` once closed; dropping the sender ends the outbound loop
    outbound: Mutex<Option<mpsc::Sender<Payload>>>,
    closed: AtomicBool,
    close_signal: Notify,
    profile: RwLock<Profile>,
    correspondent: RwLock<Option<Correspondent>>,
    metrics: Arc<Metrics>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("closed", &self.is_closed())
            .field("profile", &*self.profile.read())
            .finish()
    }
}

impl Client {
    /// Create a client and the receiving end of its outbound queue.
    ///
    /// The receiver is normally handed to [`Client::run_outbound`] by
    /// [`spawn`]; holding it directly is useful when no physical connection
    /// exists (load tests, bots).
    pub fn new(
        remote_addr: Option<SocketAddr>,
        config: &ConnectionConfig,
        metrics: Arc<Metrics>,
    ) -> (Arc<Self>, mpsc::Receiver<Payload>) {
        let (tx, rx) = mpsc::channel(config.outbound_queue_capacity.max(1));
        let client = Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            remote_addr,
            connected_at: Instant::now(),
            // kind byte
            max_payload: config.max_frame_size.saturating_sub(1),
            outbound: Mutex::new(Some(tx)),
            closed: AtomicBool::new(false),
            close_signal: Notify::new(),
            profile: RwLock::new(Profile::default()),
            correspondent: RwLock::new(None),
            metrics,
        });
        (client, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn connected_for(&self) -> std::time::Duration {
        self.connected_at.elapsed()
    }

    // === Profile (written by the hub only) ===

    pub fn profile(&self) -> Profile {
        self.profile.read().clone()
    }

    pub fn identity(&self) -> Option<Identity> {
        self.profile.read().identity.clone()
    }

    pub fn name(&self) -> Option<String> {
        self.profile.read().name().map(str::to_string)
    }

    pub fn group(&self) -> Option<GroupId> {
        self.profile.read().group.clone()
    }

    pub fn position(&self) -> Option<Vec2> {
        self.profile.read().position
    }

    pub(crate) fn update_profile(&self, update: impl FnOnce(&mut Profile)) {
        update(&mut self.profile.write());
    }

    // === Correspondent ===

    pub fn correspondent(&self) -> Option<Correspondent> {
        self.correspondent.read().clone()
    }

    pub fn set_correspondent(&self, correspondent: Correspondent) {
        *self.correspondent.write() = Some(correspondent);
    }

    pub fn clear_correspondent(&self) -> Option<Correspondent> {
        self.correspondent.write().take()
    }

    // === Outbound ===

    /// Enqueue an encoded message without waiting
    pub fn send(&self, payload: Payload) -> Result<(), SendError> {
        if payload.len() > self.max_payload {
            return Err(SendError::TooLarge(payload.len()));
        }

        let result = {
            let guard = self.outbound.lock();
            match guard.as_ref() {
                Some(tx) => tx.try_send(payload),
                None => {
                    self.metrics.dropped_closed.fetch_add(1, Ordering::Relaxed);
                    return Err(SendError::Closed);
                }
            }
        };

        match result {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.metrics.dropped_full.fetch_add(1, Ordering::Relaxed);
                debug!(conn_id = self.id, "outbound queue full, message dropped");
                Err(SendError::Full)
            }
            Err(TrySendError::Closed(_)) => {
                // Outbound loop is gone
                self.metrics.dropped_closed.fetch_add(1, Ordering::Relaxed);
                self.close();
                Err(SendError::Closed)
            }
        }
    }

    /// Encode and enqueue a typed message
    pub fn send_message(&self, message: &OutboundMessage) -> Result<(), SendError> {
        self.send(protocol::encode(message)?)
    }

    /// Close the outbound queue. Returns `true` for the call that closed it.
    pub fn close(&self) -> bool {
        let mut guard = self.outbound.lock();
        if guard.take().is_none() {
            return false;
        }
        self.closed.store(true, Ordering::Release);
        drop(guard);

        self.close_signal.notify_one();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Reply to this connection with a typed error; failures are ignored
    fn reply_error(&self, code: &str, message: impl Into<String>) {
        if let Err(e) = self.send_message(&OutboundMessage::error(code, message)) {
            debug!(conn_id = self.id, "error reply not queued: {}", e);
        }
    }

    // === Loops ===

    /// Drain the outbound queue to `writer` until the queue closes or a write fails
    pub async fn run_outbound<W>(
        self: Arc<Self>,
        mut writer: W,
        mut rx: mpsc::Receiver<Payload>,
        config: ConnectionConfig,
    ) where
        W: AsyncWrite + Unpin,
    {
        let start = tokio::time::Instant::now() + config.ping_interval;
        let mut ping = interval_at(start, config.ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut buf = Vec::with_capacity(4096);

        loop {
            buf.clear();
            let mut closing = false;

            tokio::select! {
                item = rx.recv() => match item {
                    Some(first) => {
                        let count = self.coalesce(&mut buf, first, &mut rx, config.max_frame_size);
                        self.metrics.messages_sent.fetch_add(count, Ordering::Relaxed);
                    }
                    None => {
                        closing = true;
                        let _ = framing::encode_frame(&mut buf, FrameKind::Close, &[], config.max_frame_size);
                        self.metrics.frames_sent.fetch_add(1, Ordering::Relaxed);
                    }
                },
                _ = ping.tick() => {
                    let _ = framing::encode_frame(&mut buf, FrameKind::Ping, &[], config.max_frame_size);
                    self.metrics.frames_sent.fetch_add(1, Ordering::Relaxed);
                }
            }

            match timeout(config.write_timeout, write_flush(&mut writer, &buf)).await {
                Ok(Ok(())) => {
                    self.metrics.bytes_sent.fetch_add(buf.len() as u64, Ordering::Relaxed);
                }
                Ok(Err(e)) => {
                    debug!(conn_id = self.id, "write failed: {}", e);
                    break;
                }
                Err(_) => {
                    warn!(conn_id = self.id, "write timed out after {:?}", config.write_timeout);
                    break;
                }
            }

            if closing {
                break;
            }
        }

        let _ = timeout(config.write_timeout, writer.shutdown()).await;
        self.close();
        debug!(conn_id = self.id, "outbound loop finished");
    }

    /// Pack `first` and everything already queued into data frames.
    /// Returns the number of messages packed.
    fn coalesce(
        &self,
        out: &mut Vec<u8>,
        first: Payload,
        rx: &mut mpsc::Receiver<Payload>,
        max_frame_size: usize,
    ) -> u64 {
        let mut body: Vec<u8> = Vec::with_capacity(first.len());
        body.extend_from_slice(&first);
        let mut count = 1;
        let mut frames = 0;

        while let Ok(next) = rx.try_recv() {
            // kind byte + delimiter
            if body.len() + next.len() + 2 > max_frame_size {
                if framing::encode_frame(out, FrameKind::Data, &body, max_frame_size).is_ok() {
                    frames += 1;
                }
                body.clear();
            } else {
                body.push(DELIMITER);
            }
            body.extend_from_slice(&next);
            count += 1;
        }

        if framing::encode_frame(out, FrameKind::Data, &body, max_frame_size).is_ok() {
            frames += 1;
        }
        self.metrics.frames_sent.fetch_add(frames, Ordering::Relaxed);
        count
    }

    /// Read frames from `reader` until the peer goes away, then unregister
    pub async fn run_inbound<R>(self: Arc<Self>, mut reader: R, hub: HubHandle, config: ConnectionConfig)
    where
        R: AsyncRead + Unpin,
    {
        let mut deadline = tokio::time::Instant::now() + config.read_timeout;

        let reason = loop {
            if self.is_closed() {
                break Disconnect::Local;
            }

            let frame = tokio::select! {
                biased;
                _ = self.close_signal.notified() => break Disconnect::Local,
                _ = sleep_until(deadline) => break Disconnect::Deadline,
                frame = framing::read_frame(&mut reader, config.max_frame_size) => frame,
            };

            match frame {
                Ok(frame) => {
                    self.metrics.frames_received.fetch_add(1, Ordering::Relaxed);
                    self.metrics
                        .bytes_received
                        .fetch_add(frame.body.len() as u64 + 5, Ordering::Relaxed);

                    match frame.kind {
                        FrameKind::Data => self.handle_data(&hub, &frame.body).await,
                        FrameKind::Ping | FrameKind::Pong => {
                            deadline = tokio::time::Instant::now() + config.read_timeout;
                        }
                        FrameKind::Close => break Disconnect::PeerClosed,
                    }
                }
                Err(e) if e.is_recoverable() => {
                    self.metrics.decode_errors.fetch_add(1, Ordering::Relaxed);
                    self.reply_error("bad_frame", e.to_string());
                }
                Err(e) => break Disconnect::Transport(e),
            }
        };

        match &reason {
            Disconnect::Deadline => {
                self.metrics.liveness_timeouts.fetch_add(1, Ordering::Relaxed);
                info!(conn_id = self.id, "no liveness within {:?}, dropping", config.read_timeout);
            }
            Disconnect::Transport(FramingError::ConnectionClosed) | Disconnect::PeerClosed => {
                debug!(conn_id = self.id, "peer disconnected");
            }
            Disconnect::Transport(e) => {
                debug!(conn_id = self.id, "read failed: {}", e);
            }
            Disconnect::Local => {}
        }

        if let Err(e) = hub.unregister(&self).await {
            debug!(conn_id = self.id, "unregister after {:?}: {}", reason, e);
            self.close();
        }
    }

    async fn handle_data(self: &Arc<Self>, hub: &HubHandle, body: &[u8]) {
        let mut seen = false;

        for document in framing::documents(body) {
            seen = true;
            match protocol::decode(document) {
                Ok(message) => {
                    self.metrics.messages_received.fetch_add(1, Ordering::Relaxed);
                    if let Err(e) = hub.route_inbound(self.clone(), message).await {
                        debug!(conn_id = self.id, "inbound message not routed: {}", e);
                    }
                }
                Err(e) => {
                    self.metrics.decode_errors.fetch_add(1, Ordering::Relaxed);
                    self.reply_error("bad_request", e.0);
                }
            }
        }

        if !seen {
            self.metrics.decode_errors.fetch_add(1, Ordering::Relaxed);
            self.reply_error("bad_request", "empty message");
        }
    }
}

async fn write_flush<W: AsyncWrite + Unpin>(writer: &mut W, buf: &[u8]) -> std::io::Result<()> {
    writer.write_all(buf).await?;
    writer.flush().await
}

/// The two tasks serving one registered client
pub struct RunningClient {
    pub client: Arc<Client>,
    inbound: JoinHandle<()>,
    outbound: JoinHandle<()>,
}

impl RunningClient {
    /// Wait until both loops have exited
    pub async fn wait(self) {
        let _ = self.inbound.await;
        let _ = self.outbound.await;
    }
}

/// Register a new physical connection with the hub and start its loops.
///
/// If the hub refuses the registration the halves are dropped, which tears
/// down the physical connection.
pub async fn spawn<R, W>(
    hub: &HubHandle,
    config: &ConnectionConfig,
    reader: R,
    writer: W,
    remote_addr: Option<SocketAddr>,
) -> Result<RunningClient, HubError>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (client, rx) = Client::new(remote_addr, config, hub.metrics().clone());
    hub.register(client.clone()).await?;

    debug!(conn_id = client.id(), remote = ?remote_addr, "connection registered");

    let outbound = tokio::spawn(client.clone().run_outbound(writer, rx, config.clone()));
    let inbound = tokio::spawn(client.clone().run_inbound(reader, hub.clone(), config.clone()));

    Ok(RunningClient {
        client,
        inbound,
        outbound,
    })
}
