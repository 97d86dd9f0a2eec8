use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::ServerConfig;
use crate::error::{Result, RtspError};
use crate::media::nal::strip_start_code;
use crate::media::{AccessUnit, Codec, CodecConfig, CodecConfigStore, ParameterSets};
use crate::session::{Offer, ReleaseReason, SessionManager, Viewer};
use crate::stats::{Counters, ServerStats};
use crate::transport::PortAllocator;
use crate::transport::tcp::{self, ConnectionRegistry};

/// Granularity of the reaper's sleep, so `stop()` is not held up by a
/// long reap interval.
const REAPER_TICK: Duration = Duration::from_millis(50);

/// State shared by the accept loop, connection threads, delivery workers
/// and the reaper.
pub(crate) struct Shared {
    pub config: ServerConfig,
    pub sessions: SessionManager,
    pub codec: CodecConfigStore,
    pub counters: Counters,
    pub ports: PortAllocator,
    pub connections: ConnectionRegistry,
    max_clients: AtomicUsize,
    running: AtomicBool,
    last_timestamp: AtomicU32,
}

impl Shared {
    fn new(config: ServerConfig) -> Self {
        Self {
            sessions: SessionManager::new(),
            codec: CodecConfigStore::new(),
            counters: Counters::default(),
            ports: PortAllocator::new(config.udp_port_range.clone()),
            connections: ConnectionRegistry::default(),
            max_clients: AtomicUsize::new(config.max_clients),
            running: AtomicBool::new(false),
            last_timestamp: AtomicU32::new(0),
            config,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Current client ceiling, 0 = unlimited.
    pub fn max_clients(&self) -> usize {
        self.max_clients.load(Ordering::Relaxed)
    }

    /// RTP timestamp of the most recent access unit, for `RTP-Info`.
    pub fn last_timestamp(&self) -> u32 {
        self.last_timestamp.load(Ordering::Relaxed)
    }

    /// Release a session and account for evictions. Returns `false` when
    /// the session was already gone.
    pub fn release(&self, id: &str, reason: ReleaseReason) -> bool {
        let released = self.sessions.release(id, reason).is_some();
        if released && reason.is_eviction() {
            self.counters.sessions_evicted.fetch_add(1, Ordering::Relaxed);
        }
        released
    }

    fn reap_stale(&self) -> usize {
        self.sessions
            .stale_sessions()
            .iter()
            .filter(|session| self.release(&session.id, ReleaseReason::Stale))
            .count()
    }
}

/// High-level RTSP server orchestrator.
///
/// Owns the session table, the codec config snapshot and the listener
/// threads. Media enters through [`on_access_unit`](Self::on_access_unit)
/// (or [`push_annexb`](Self::push_annexb)) and is offered to every playing
/// session without blocking the caller.
///
/// ```no_run
/// use rtsp::{Server, ServerConfig};
///
/// let mut server = Server::new(ServerConfig::default().bind("0.0.0.0:8554"));
/// server.start()?;
/// // feed access units with server.push_annexb(...)
/// server.stop();
/// # Ok::<(), rtsp::RtspError>(())
/// ```
pub struct Server {
    shared: Arc<Shared>,
    local_addr: Option<SocketAddr>,
    started_at: Option<Instant>,
    threads: Vec<JoinHandle<()>>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            shared: Arc::new(Shared::new(config)),
            local_addr: None,
            started_at: None,
            threads: Vec::new(),
        }
    }

    /// Bind the listener and start the accept loop and the reaper.
    pub fn start(&mut self) -> Result<()> {
        if self.shared.is_running() {
            return Err(RtspError::AlreadyRunning);
        }

        let listener = TcpListener::bind(&self.shared.config.bind_addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        self.shared.running.store(true, Ordering::SeqCst);
        self.local_addr = Some(local_addr);
        self.started_at = Some(Instant::now());

        tracing::info!(
            addr = %local_addr,
            max_clients = self.shared.max_clients(),
            session_timeout_secs = self.shared.config.session_timeout.as_secs(),
            "RTSP server listening"
        );

        let shared = self.shared.clone();
        let accept = thread::Builder::new()
            .name("rtsp-accept".into())
            .spawn(move || tcp::accept_loop(listener, shared));

        let shared = self.shared.clone();
        let reaper = thread::Builder::new()
            .name("rtsp-reaper".into())
            .spawn(move || reaper_loop(&shared));

        match (accept, reaper) {
            (Ok(accept), Ok(reaper)) => {
                self.threads = vec![accept, reaper];
                Ok(())
            }
            (accept, reaper) => {
                self.shared.running.store(false, Ordering::SeqCst);
                let spawned = [accept, reaper];
                let mut error = None;
                for handle in spawned {
                    match handle {
                        Ok(handle) => {
                            let _ = handle.join();
                        }
                        Err(e) => error = Some(e),
                    }
                }
                self.local_addr = None;
                Err(error.map_or(RtspError::NotStarted, RtspError::Io))
            }
        }
    }

    /// Stop accepting, release every session and close every connection.
    pub fn stop(&mut self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::info!("server stopping");

        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }

        let released = self
            .shared
            .sessions
            .all()
            .iter()
            .filter(|session| self.shared.release(&session.id, ReleaseReason::ServerShutdown))
            .count();
        self.shared.connections.shutdown_all();

        tracing::info!(released, "server stopped");
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Address the listener is bound to (resolves port 0).
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.local_addr.ok_or(RtspError::NotStarted)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    /// Publish one access unit.
    ///
    /// Parameter sets in the unit update the codec config first. The unit
    /// is then offered to every playing session; sessions whose queue is
    /// full drop it. Returns the number of sessions it was queued to.
    pub fn on_access_unit(&self, unit: AccessUnit) -> usize {
        let shared = &self.shared;
        shared.counters.units_received.fetch_add(1, Ordering::Relaxed);
        shared.codec.observe(unit.codec, &unit.nal_units);

        if unit.is_empty() {
            return 0;
        }
        shared.last_timestamp.store(unit.rtp_timestamp(), Ordering::Relaxed);

        let unit = Arc::new(unit);
        let wait_for_keyframe = shared.config.wait_for_keyframe;
        let max_drops = shared.config.max_consecutive_drops.max(1);
        let mut queued = 0;

        for session in shared.sessions.playing_sessions() {
            match session.offer(&unit, wait_for_keyframe) {
                Offer::Queued => queued += 1,
                Offer::Skipped | Offer::Closed => {}
                Offer::Dropped { consecutive } => {
                    shared.counters.units_dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(session_id = %session.id, consecutive, "session queue full, access unit dropped");
                    if consecutive >= max_drops {
                        shared.release(&session.id, ReleaseReason::Stalled);
                    }
                }
            }
        }

        tracing::trace!(
            pts_us = unit.presentation_time_us,
            nal_count = unit.nal_units.len(),
            keyframe = unit.is_keyframe(),
            queued,
            "access unit published"
        );
        queued
    }

    /// Split an Annex-B buffer into NAL units and publish them as one
    /// access unit. A buffer without start codes publishes nothing.
    pub fn push_annexb(&self, codec: Codec, presentation_time_us: i64, data: &[u8]) -> usize {
        let unit = AccessUnit::from_annexb(codec, presentation_time_us, data);
        if unit.is_empty() {
            tracing::trace!(len = data.len(), "no NAL units in buffer");
            return 0;
        }
        self.on_access_unit(unit)
    }

    /// Replace the codec config out of band ("codec ready").
    ///
    /// Parameter sets may carry a leading start code. `vps` is only used
    /// for H.265.
    pub fn update_codec_config(&self, codec: Codec, sps: &[u8], pps: &[u8], vps: Option<&[u8]>) {
        let non_empty = |bytes: &[u8]| {
            let nal = strip_start_code(bytes);
            (!nal.is_empty()).then(|| nal.to_vec())
        };
        let config = CodecConfig {
            codec,
            parameter_sets: ParameterSets {
                vps: match codec {
                    Codec::H265 => vps.and_then(non_empty),
                    Codec::H264 => None,
                },
                sps: non_empty(sps),
                pps: non_empty(pps),
            },
        };
        self.shared.codec.replace(config);
    }

    /// Current codec config, if any parameter sets are known.
    pub fn codec_config(&self) -> Option<Arc<CodecConfig>> {
        self.shared.codec.snapshot()
    }

    /// Change the client ceiling at runtime. Existing clients are kept.
    pub fn set_max_clients(&self, max_clients: usize) {
        self.shared.max_clients.store(max_clients, Ordering::Relaxed);
        tracing::info!(max_clients, "client limit changed");
    }

    pub fn stats(&self) -> ServerStats {
        self.shared.counters.snapshot(
            self.shared.sessions.len(),
            self.shared.connections.len(),
            self.started_at,
        )
    }

    /// Every live session, ordered by session id.
    pub fn viewers(&self) -> Vec<Viewer> {
        let mut viewers: Vec<Viewer> = self
            .shared
            .sessions
            .all()
            .iter()
            .map(|session| session.viewer())
            .collect();
        viewers.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        viewers
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Evict sessions that have gone silent, every `reap_interval`.
fn reaper_loop(shared: &Shared) {
    let interval = shared.config.reap_interval.max(REAPER_TICK);
    let mut last_reap = Instant::now();

    while shared.is_running() {
        thread::sleep(REAPER_TICK.min(interval));
        if last_reap.elapsed() < interval {
            continue;
        }
        last_reap = Instant::now();

        let evicted = shared.reap_stale();
        if evicted > 0 {
            tracing::info!(evicted, remaining = shared.sessions.len(), "stale sessions evicted");
        }
    }
    tracing::debug!("reaper exited");
}
