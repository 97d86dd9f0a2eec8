use std::ops::RangeInclusive;
use std::time::Duration;

use crate::media::packetizer::DEFAULT_MAX_PACKET_SIZE;

/// Default RTSP control port (RFC 2326 §3.2 uses 554; 8554 avoids needing root).
pub const DEFAULT_RTSP_PORT: u16 = 8554;

/// Default session timeout (RFC 2326 §12.37).
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(60);

/// Server configuration.
///
/// Built with [`Default`] plus chained setters:
///
/// ```
/// use std::time::Duration;
/// use rtsp::ServerConfig;
///
/// let config = ServerConfig::default()
///     .bind("127.0.0.1:8554")
///     .max_clients(4)
///     .session_timeout(Duration::from_secs(30));
/// assert_eq!(config.max_clients, 4);
/// ```
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the RTSP listener binds to. Port 0 picks a free port.
    pub bind_addr: String,
    /// Maximum concurrent RTSP connections, also the session ceiling.
    /// 0 means unlimited.
    pub max_clients: usize,
    /// Sessions silent for longer than this are evicted.
    pub session_timeout: Duration,
    /// How often the reaper scans for stale sessions.
    pub reap_interval: Duration,
    /// Upper bound for one serialized RTP packet, header included.
    pub max_packet_size: usize,
    /// Dynamic RTP payload type announced in SDP.
    pub payload_type: u8,
    /// Server-side UDP ports handed out as even/odd RTP/RTCP pairs.
    pub udp_port_range: RangeInclusive<u16>,
    /// Access units a session may have queued before new ones are dropped.
    pub session_queue_depth: usize,
    /// Consecutive dropped access units after which a session is torn down.
    pub max_consecutive_drops: u32,
    /// Consecutive failed UDP sends after which a session is torn down.
    pub max_consecutive_write_failures: u32,
    /// Write timeout for the RTSP socket, bounding interleaved media writes.
    pub tcp_write_timeout: Duration,
    /// Hold back media for a new viewer until the next keyframe.
    pub wait_for_keyframe: bool,
    /// Public host advertised in SDP `o=` and `c=` lines.
    /// When `None`, host is inferred from request URI/client address.
    pub public_host: Option<String>,
    /// SDP origin username field (`o=<username> ...`).
    pub sdp_username: String,
    /// SDP origin session id field (`o=... <session-id> ...`).
    pub sdp_session_id: String,
    /// SDP origin session version field (`o=... ... <session-version> ...`).
    pub sdp_session_version: String,
    /// SDP session name (`s=`).
    pub sdp_session_name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: format!("0.0.0.0:{DEFAULT_RTSP_PORT}"),
            max_clients: 32,
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            reap_interval: Duration::from_secs(5),
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            payload_type: 96,
            udp_port_range: 5000..=65534,
            session_queue_depth: 32,
            max_consecutive_drops: 16,
            max_consecutive_write_failures: 8,
            tcp_write_timeout: Duration::from_secs(2),
            wait_for_keyframe: true,
            public_host: None,
            sdp_username: "-".to_string(),
            sdp_session_id: "0".to_string(),
            sdp_session_version: "0".to_string(),
            sdp_session_name: "Stream".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn bind(mut self, addr: &str) -> Self {
        self.bind_addr = addr.to_string();
        self
    }

    pub fn max_clients(mut self, max: usize) -> Self {
        self.max_clients = max;
        self
    }

    pub fn session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    pub fn reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = interval;
        self
    }

    pub fn max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size;
        self
    }

    pub fn udp_port_range(mut self, range: RangeInclusive<u16>) -> Self {
        self.udp_port_range = range;
        self
    }

    pub fn session_queue_depth(mut self, depth: usize) -> Self {
        self.session_queue_depth = depth.max(1);
        self
    }

    pub fn wait_for_keyframe(mut self, wait: bool) -> Self {
        self.wait_for_keyframe = wait;
        self
    }

    pub fn public_host(mut self, host: &str) -> Self {
        self.public_host = Some(host.to_string());
        self
    }

    pub fn session_name(mut self, name: &str) -> Self {
        self.sdp_session_name = name.to_string();
        self
    }
}
