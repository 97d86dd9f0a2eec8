//! Network transport layer for RTSP signaling and RTP media delivery.
//!
//! RTSP uses a split transport model:
//!
//! - **TCP** ([`tcp`]): carries RTSP request/response signaling. One TCP
//!   connection per client, with a thread per connection. Media may be
//!   interleaved on the same connection using `$` framing (RFC 2326 §10.12).
//!
//! - **UDP** ([`udp`]): carries RTP media packets from a per-session
//!   even/odd server port pair.

pub mod tcp;
pub mod udp;

use std::io;

pub use tcp::InterleavedSink;
pub use udp::{PortAllocator, UdpSink};

/// Where a session's RTP packets are written.
#[derive(Debug)]
pub enum MediaSink {
    Udp(UdpSink),
    Interleaved(InterleavedSink),
}

impl MediaSink {
    pub fn send(&self, packet: &[u8]) -> io::Result<()> {
        match self {
            MediaSink::Udp(sink) => sink.send(packet),
            MediaSink::Interleaved(sink) => sink.send(packet),
        }
    }

    /// A single failed write ends the session. Interleaved streams cannot
    /// skip a packet without corrupting the framing.
    pub fn failure_is_fatal(&self) -> bool {
        matches!(self, MediaSink::Interleaved(_))
    }

    /// Count of RTCP datagrams received since the last call. Interleaved
    /// RTCP is consumed by the connection reader instead.
    pub fn drain_feedback(&self) -> usize {
        match self {
            MediaSink::Udp(sink) => sink.drain_rtcp(),
            MediaSink::Interleaved(_) => 0,
        }
    }
}
