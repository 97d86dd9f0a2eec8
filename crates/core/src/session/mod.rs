//! RTSP session management (RFC 2326 §3, §12.37).
//!
//! An RTSP session is a server-side state object created during SETUP and
//! destroyed by TEARDOWN, connection loss, eviction or transport failure.
//! It tracks:
//!
//! - A unique session ID (random hex string, returned in the `Session` header).
//! - The playback state, see [`SessionState`].
//! - The negotiated [`Transport`] and the socket media is written to.
//! - Its own RTP packetizer (SSRC, sequence numbers).
//! - A bounded inbox drained by the session's delivery worker.
//! - A liveness timestamp refreshed by requests and RTCP.
//!
//! ## Session lifecycle (RFC 2326 §A.1)
//!
//! ```text
//! (connection)  Init
//! SETUP         -> Ready
//! PLAY          -> Playing
//! PAUSE         -> Paused   (from Playing)
//! PLAY          -> Playing  (from Paused)
//! TEARDOWN      -> TornDown (removed)
//! disconnect, eviction, transport failure -> TornDown (removed)
//! ```

pub mod delivery;
pub mod transport;

use std::collections::HashMap;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use crate::error::{Result, RtspError};
use crate::media::rtp::RtpPacket;
use crate::media::{AccessUnit, CodecConfig, Packetizer};
use crate::protocol::Method;
use crate::transport::MediaSink;
use delivery::Outbound;
pub use transport::{Transport, TransportHeader};

/// RTSP session state machine (RFC 2326 §A.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No SETUP yet. This is the state of a connection without a session.
    Init,
    /// Transport negotiated via SETUP, not yet playing.
    Ready,
    /// Media is being delivered.
    Playing,
    /// Delivery suspended; can resume via PLAY.
    Paused,
    /// Released. Terminal.
    TornDown,
}

impl SessionState {
    /// State after a successful `method`, or 455 if `method` is not
    /// allowed here.
    ///
    /// ```
    /// use rtsp::protocol::Method;
    /// use rtsp::session::SessionState;
    ///
    /// assert_eq!(SessionState::Ready.next(&Method::Play).unwrap(), SessionState::Playing);
    /// assert!(SessionState::Init.next(&Method::Play).is_err());
    /// ```
    pub fn next(self, method: &Method) -> Result<SessionState> {
        use SessionState::*;

        let next = match (self, method) {
            (TornDown, _) => None,
            (state, Method::Options | Method::Describe | Method::GetParameter) => Some(state),
            (_, Method::Teardown) => Some(TornDown),
            (Init | Ready, Method::Setup) => Some(Ready),
            (Ready | Playing | Paused, Method::Play) => Some(Playing),
            (Playing | Paused, Method::Pause) => Some(Paused),
            _ => None,
        };

        next.ok_or_else(|| RtspError::MethodNotValidInState {
            method: method.to_string(),
            state: self,
        })
    }
}

/// Why a session is being released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseReason {
    /// Client sent TEARDOWN.
    Teardown,
    /// The owning RTSP connection went away.
    ConnectionClosed,
    /// No request, RTCP or interleaved data within the session timeout.
    Stale,
    /// Inbox stayed full for too many consecutive access units.
    Stalled,
    /// Media could not be written.
    TransportFailure,
    /// [`Server::stop`](crate::Server::stop).
    ServerShutdown,
}

impl ReleaseReason {
    /// Server-initiated removal of a live client.
    pub fn is_eviction(self) -> bool {
        matches!(self, Self::Stale | Self::Stalled | Self::TransportFailure)
    }

    /// The owning RTSP connection is shut down along with the session.
    pub fn closes_connection(self) -> bool {
        self.is_eviction() || self == Self::ServerShutdown
    }
}

/// Everything SETUP negotiated for a new session.
#[derive(Debug)]
pub struct SessionSetup {
    pub uri: String,
    pub connection_id: u64,
    pub peer_addr: SocketAddr,
    pub transport: Transport,
    pub sink: MediaSink,
    pub packetizer: Packetizer,
    /// Handle to the owning RTSP connection, used to close it on eviction.
    pub control: Option<TcpStream>,
    pub timeout: Duration,
    pub queue_depth: usize,
}

/// Result of offering an access unit to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    Queued,
    /// Held back until the next keyframe.
    Skipped,
    /// Inbox full; `consecutive` drops so far.
    Dropped { consecutive: u32 },
    /// The session has been released.
    Closed,
}

/// A single RTSP session (RFC 2326 §3).
///
/// Shared between the control connection, the fan-out path and the
/// session's delivery worker. Interior mutability throughout.
pub struct Session {
    /// Unique session identifier (16-char hex string).
    pub id: String,
    /// The RTSP URI this session was created for (from the SETUP request).
    pub uri: String,
    /// RTSP connection that created the session.
    pub connection_id: u64,
    pub peer_addr: SocketAddr,
    transport: Transport,
    sink: MediaSink,
    control: Option<TcpStream>,
    state: RwLock<SessionState>,
    packetizer: Mutex<Packetizer>,
    ssrc: u32,
    timeout: Duration,
    created_at: Instant,
    last_activity: Mutex<Instant>,
    outbox: Mutex<Option<SyncSender<Outbound>>>,
    /// Bumped on every PLAY; media queued under an older value is stale.
    play_epoch: AtomicU32,
    awaiting_keyframe: AtomicBool,
    consecutive_drops: AtomicU32,
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state())
            .field("transport", &self.transport)
            .field("ssrc", &format_args!("{:08X}", self.ssrc))
            .finish_non_exhaustive()
    }
}

impl Session {
    fn new(id: String, setup: SessionSetup) -> (Self, Receiver<Outbound>) {
        let (outbox, inbox) = mpsc::sync_channel(setup.queue_depth.max(1));
        let now = Instant::now();
        let ssrc = setup.packetizer.ssrc();
        let session = Session {
            id,
            uri: setup.uri,
            connection_id: setup.connection_id,
            peer_addr: setup.peer_addr,
            transport: setup.transport,
            sink: setup.sink,
            control: setup.control,
            state: RwLock::new(SessionState::Ready),
            packetizer: Mutex::new(setup.packetizer),
            ssrc,
            timeout: setup.timeout,
            created_at: now,
            last_activity: Mutex::new(now),
            outbox: Mutex::new(Some(outbox)),
            play_epoch: AtomicU32::new(0),
            awaiting_keyframe: AtomicBool::new(true),
            consecutive_drops: AtomicU32::new(0),
            packets_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
        };
        (session, inbox)
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    pub fn set_state(&self, state: SessionState) {
        let mut current = self.state.write();
        if *current == SessionState::TornDown {
            return;
        }
        tracing::debug!(session_id = %self.id, old_state = ?*current, new_state = ?state, "state transition");
        *current = state;
    }

    pub fn is_playing(&self) -> bool {
        self.state() == SessionState::Playing
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Sequence number the next RTP packet will carry.
    pub fn next_sequence(&self) -> u16 {
        self.packetizer.lock().next_sequence()
    }

    /// Format the `Session` response header value per RFC 2326 §12.37.
    ///
    /// Example: `"1A2B3C4D5E6F7081;timeout=60"`
    pub fn header_value(&self) -> String {
        format!("{};timeout={}", self.id, self.timeout.as_secs().max(1))
    }

    /// `Transport` header for SETUP responses.
    pub fn transport_header(&self) -> String {
        self.transport.response_header(self.ssrc)
    }

    /// Refresh liveness.
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    pub fn is_stale(&self) -> bool {
        self.idle_for() > self.timeout
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    /// Queue an access unit for the delivery worker without blocking.
    ///
    /// With `wait_for_keyframe`, units are skipped until a keyframe arrives
    /// after PLAY or after a drop.
    pub(crate) fn offer(&self, unit: &Arc<AccessUnit>, wait_for_keyframe: bool) -> Offer {
        if wait_for_keyframe && self.awaiting_keyframe.load(Ordering::Acquire) && !unit.is_keyframe() {
            return Offer::Skipped;
        }

        let outbox = self.outbox.lock();
        let Some(tx) = outbox.as_ref() else {
            return Offer::Closed;
        };

        let epoch = self.play_epoch.load(Ordering::Acquire);
        match tx.try_send(Outbound::Media {
            unit: unit.clone(),
            epoch,
        }) {
            Ok(()) => {
                self.awaiting_keyframe.store(false, Ordering::Release);
                self.consecutive_drops.store(0, Ordering::Relaxed);
                Offer::Queued
            }
            Err(TrySendError::Full(_)) => {
                self.awaiting_keyframe.store(true, Ordering::Release);
                let consecutive = self.consecutive_drops.fetch_add(1, Ordering::Relaxed) + 1;
                Offer::Dropped { consecutive }
            }
            Err(TrySendError::Disconnected(_)) => Offer::Closed,
        }
    }

    /// Enter `Playing`. Parameter sets, when known, are queued ahead of any
    /// media so the decoder can start on the next keyframe. Media still
    /// queued from before a PAUSE becomes stale.
    pub(crate) fn start_playing(&self, config: Option<Arc<CodecConfig>>, timestamp: u32) {
        if self.state() == SessionState::TornDown {
            return;
        }
        {
            // Held across the bump so no new-epoch media lands ahead of the
            // parameter sets.
            let outbox = self.outbox.lock();
            self.play_epoch.fetch_add(1, Ordering::AcqRel);
            if let Some(config) = config
                && let Some(tx) = outbox.as_ref()
                && tx
                    .try_send(Outbound::ParameterSets { config, timestamp })
                    .is_err()
            {
                tracing::debug!(session_id = %self.id, "inbox full, parameter sets not queued");
            }
        }
        self.awaiting_keyframe.store(true, Ordering::Release);
        self.set_state(SessionState::Playing);
    }

    /// Whether media queued under `epoch` may still be sent.
    pub(crate) fn accepts_media(&self, epoch: u32) -> bool {
        self.is_playing() && self.play_epoch.load(Ordering::Acquire) == epoch
    }

    pub(crate) fn packetize(&self, unit: &AccessUnit) -> Vec<RtpPacket> {
        self.packetizer.lock().packetize(unit)
    }

    pub(crate) fn packetize_config(&self, config: &CodecConfig, timestamp: u32) -> Vec<RtpPacket> {
        self.packetizer
            .lock()
            .packetize_config(config.codec, &config.parameter_sets, timestamp)
    }

    pub(crate) fn sink(&self) -> &MediaSink {
        &self.sink
    }

    pub(crate) fn record_sent(&self, bytes: usize) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Mark torn down and close the inbox so the worker exits.
    fn close(&self, reason: ReleaseReason) {
        *self.state.write() = SessionState::TornDown;
        self.outbox.lock().take();
        if reason.closes_connection()
            && let Some(control) = &self.control
        {
            let _ = control.shutdown(Shutdown::Both);
        }
    }

    pub fn viewer(&self) -> Viewer {
        Viewer {
            session_id: self.id.clone(),
            peer_addr: self.peer_addr,
            state: self.state(),
            transport: self.transport.clone(),
            packets_sent: self.packets_sent(),
            bytes_sent: self.bytes_sent(),
            connected_for: self.created_at.elapsed(),
            idle_for: self.idle_for(),
        }
    }
}

/// Point-in-time view of one session, for operators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Viewer {
    pub session_id: String,
    pub peer_addr: SocketAddr,
    pub state: SessionState,
    pub transport: Transport,
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub connected_for: Duration,
    pub idle_for: Duration,
}

/// Thread-safe registry of active sessions.
///
/// Backed by `parking_lot::RwLock` for fast concurrent reads. Session
/// lookups happen on every fan-out cycle; the lock is held only long
/// enough to clone `Arc`s.
#[derive(Clone, Default)]
pub struct SessionManager {
    sessions: Arc<RwLock<HashMap<String, Arc<Session>>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session unless `limit` (0 = unlimited) is reached.
    ///
    /// Returns the session and the inbox its delivery worker drains.
    pub(crate) fn create(
        &self,
        setup: SessionSetup,
        limit: usize,
    ) -> Result<(Arc<Session>, Receiver<Outbound>)> {
        let mut sessions = self.sessions.write();
        if limit > 0 && sessions.len() >= limit {
            return Err(RtspError::TooManyClients { limit });
        }

        let id = loop {
            let candidate = format!("{:016X}", rand::random::<u64>());
            if !sessions.contains_key(&candidate) {
                break candidate;
            }
        };

        let (session, inbox) = Session::new(id.clone(), setup);
        let session = Arc::new(session);
        sessions.insert(id.clone(), session.clone());

        tracing::debug!(session_id = %id, uri = %session.uri, total_sessions = sessions.len(), "session created");
        Ok((session, inbox))
    }

    /// Look up a session by ID.
    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().get(id).cloned()
    }

    /// Remove a session, mark it torn down and stop its worker.
    ///
    /// Every path that ends a session goes through here. Releasing an
    /// unknown or already released id returns `None`.
    pub fn release(&self, id: &str, reason: ReleaseReason) -> Option<Arc<Session>> {
        let (session, remaining) = {
            let mut sessions = self.sessions.write();
            let session = sessions.remove(id)?;
            (session, sessions.len())
        };
        session.close(reason);

        if reason.is_eviction() {
            tracing::warn!(session_id = %id, peer = %session.peer_addr, ?reason, "session evicted");
        } else {
            tracing::debug!(session_id = %id, ?reason, total_sessions = remaining, "session released");
        }
        Some(session)
    }

    /// Returns all sessions currently in the [`SessionState::Playing`] state.
    pub fn playing_sessions(&self) -> Vec<Arc<Session>> {
        self.sessions
            .read()
            .values()
            .filter(|s| s.is_playing())
            .cloned()
            .collect()
    }

    /// Sessions silent for longer than their timeout.
    pub fn stale_sessions(&self) -> Vec<Arc<Session>> {
        self.sessions
            .read()
            .values()
            .filter(|s| s.is_stale())
            .cloned()
            .collect()
    }

    pub fn all(&self) -> Vec<Arc<Session>> {
        self.sessions.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}
