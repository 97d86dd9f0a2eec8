//! Server-wide counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Snapshot returned by [`Server::stats`](crate::Server::stats).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    /// Sessions currently holding a transport (SETUP done, not torn down).
    pub active_connections: usize,
    /// Open RTSP control connections.
    pub open_connections: usize,
    /// RTP packets written to any transport.
    pub total_packets_sent: u64,
    /// Bytes of RTP written to any transport (RTP header included,
    /// interleaved framing excluded).
    pub total_bytes_sent: u64,
    /// Access units handed to the server.
    pub access_units_received: u64,
    /// Per-session access unit drops caused by full queues.
    pub access_units_dropped: u64,
    /// Sessions torn down by the server (stale, stalled or failed).
    pub sessions_evicted: u64,
    /// Time since the server was started.
    pub uptime: Duration,
}

/// Lock-free counters shared by the fan-out path and delivery workers.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub packets_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub units_received: AtomicU64,
    pub units_dropped: AtomicU64,
    pub sessions_evicted: AtomicU64,
}

impl Counters {
    pub fn record_sent(&self, bytes: usize) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn snapshot(
        &self,
        active_connections: usize,
        open_connections: usize,
        started_at: Option<Instant>,
    ) -> ServerStats {
        ServerStats {
            active_connections,
            open_connections,
            total_packets_sent: self.packets_sent.load(Ordering::Relaxed),
            total_bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            access_units_received: self.units_received.load(Ordering::Relaxed),
            access_units_dropped: self.units_dropped.load(Ordering::Relaxed),
            sessions_evicted: self.sessions_evicted.load(Ordering::Relaxed),
            uptime: started_at.map(|t| t.elapsed()).unwrap_or_default(),
        }
    }
}
