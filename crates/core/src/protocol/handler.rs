use std::sync::Arc;

use crate::error::{Result, RtspError};
use crate::media::Packetizer;
use crate::protocol::request::{Method, RtspRequest};
use crate::protocol::response::RtspResponse;
use crate::protocol::sdp;
use crate::server::Shared;
use crate::session::transport::{LowerTransport, TransportHeader};
use crate::session::{ReleaseReason, Session, SessionSetup, SessionState, Transport, delivery};
use crate::transport::tcp::ConnectionContext;
use crate::transport::{InterleavedSink, MediaSink, UdpSink};

/// Side effect that must wait until the response has been written.
#[derive(Debug)]
enum Pending {
    /// Start media after the PLAY response so it reaches the client first.
    Play(Arc<Session>),
}

/// Handles RTSP method requests for a single TCP connection.
///
/// Tracks which sessions were created on this connection so they
/// can be released when the connection drops.
pub struct MethodHandler {
    shared: Arc<Shared>,
    conn: ConnectionContext,
    /// Session IDs created during this connection, for cleanup on disconnect.
    session_ids: Vec<String>,
    /// Next free interleaved channel pair when the client does not pick one.
    next_channel: u8,
    pending: Option<Pending>,
}

impl MethodHandler {
    pub(crate) fn new(shared: Arc<Shared>, conn: ConnectionContext) -> Self {
        MethodHandler {
            shared,
            conn,
            session_ids: Vec::new(),
            next_channel: 0,
            pending: None,
        }
    }

    /// Returns session IDs owned by this connection (for cleanup on disconnect).
    pub fn session_ids(&self) -> &[String] {
        &self.session_ids
    }

    pub fn has_sessions(&self) -> bool {
        !self.session_ids.is_empty()
    }

    pub fn handle(&mut self, request: &RtspRequest) -> RtspResponse {
        let cseq = request.cseq().unwrap_or("0");

        let result = match &request.method {
            Method::Options => self.handle_options(request),
            Method::Describe => self.handle_describe(request),
            Method::Setup => self.handle_setup(request),
            Method::Play => self.handle_play(request),
            Method::Pause => self.handle_pause(request),
            Method::Teardown => self.handle_teardown(request),
            Method::GetParameter => self.handle_get_parameter(request),
            Method::Other(name) => {
                tracing::warn!(method = %name, %cseq, "unsupported RTSP method");
                Ok(RtspResponse::not_implemented().add_header("Public", Method::SUPPORTED))
            }
        };

        let response = result.unwrap_or_else(|e| {
            tracing::warn!(method = %request.method, %cseq, error = %e, "request failed");
            RtspResponse::from_error(&e)
        });
        response.with_cseq(cseq)
    }

    /// Apply deferred work once the response is on the wire.
    pub fn commit(&mut self) {
        if let Some(Pending::Play(session)) = self.pending.take() {
            let config = self.shared.codec.snapshot();
            session.start_playing(config, self.shared.last_timestamp());
            tracing::info!(session_id = %session.id, peer = %self.conn.peer_addr, "playback started");
        }
    }

    /// Inbound traffic on the connection keeps its sessions alive.
    pub fn touch_sessions(&self) {
        for id in &self.session_ids {
            if let Some(session) = self.shared.sessions.get(id) {
                session.touch();
            }
        }
    }

    /// Release every session this connection created. Returns how many
    /// were still live.
    pub fn release_all(&mut self, reason: ReleaseReason) -> usize {
        self.session_ids
            .drain(..)
            .filter(|id| self.shared.release(id, reason))
            .count()
    }

    fn handle_options(&self, request: &RtspRequest) -> Result<RtspResponse> {
        tracing::debug!(cseq = request.cseq(), "OPTIONS");
        let response = RtspResponse::ok().add_header("Public", Method::SUPPORTED);
        match self.session_from_header(request)? {
            Some(session) => Ok(response.add_header("Session", &session.header_value())),
            None => Ok(response),
        }
    }

    /// Parses host from an RTSP URI (e.g. rtsp://host:8554/path -> host). Falls back to the local address if invalid.
    fn host_from_uri_or_local(&self, uri: &str) -> String {
        if let Some(host) = &self.shared.config.public_host {
            return host.clone();
        }

        if let Some(after_scheme) = uri
            .strip_prefix("rtsp://")
            .or_else(|| uri.strip_prefix("rtsps://"))
        {
            let authority = after_scheme.split('/').next().unwrap_or("");
            let authority = authority.rsplit('@').next().unwrap_or(authority);
            let host = match authority.strip_prefix('[') {
                Some(v6) => v6.split(']').next().unwrap_or(""),
                None => authority.split(':').next().unwrap_or(""),
            }
            .trim();
            if !host.is_empty() {
                return host.to_string();
            }
        }
        self.conn.local_addr.ip().to_string()
    }

    fn handle_describe(&self, request: &RtspRequest) -> Result<RtspResponse> {
        tracing::debug!(cseq = request.cseq(), uri = %request.uri, "DESCRIBE");
        self.session_from_header(request)?;

        let config = self.shared.codec.ready().ok_or(RtspError::CodecNotReady)?;
        let host = self.host_from_uri_or_local(&request.uri);
        let sdp = sdp::generate_sdp(&config, &host, &self.shared.config)?;

        let base = if request.uri.ends_with('/') {
            request.uri.clone()
        } else {
            format!("{}/", request.uri)
        };

        Ok(RtspResponse::ok()
            .add_header("Content-Type", "application/sdp")
            .add_header("Content-Base", &base)
            .with_body(sdp))
    }

    fn handle_setup(&mut self, request: &RtspRequest) -> Result<RtspResponse> {
        if let Some(session) = self.session_from_header(request)? {
            session.state().next(&Method::Setup)?;
            return Ok(RtspResponse::ok()
                .add_header("Transport", &session.transport_header())
                .add_header("Session", &session.header_value()));
        }

        self.shared.codec.ready().ok_or(RtspError::CodecNotReady)?;

        let transport_header = request
            .get_header("Transport")
            .ok_or(RtspError::MissingHeader("Transport"))?;
        let requested = TransportHeader::parse(transport_header)?;

        let limit = self.shared.max_clients();
        if limit > 0 && self.shared.sessions.len() >= limit {
            return Err(RtspError::TooManyClients { limit });
        }

        let shared = self.shared.clone();
        let config = &shared.config;
        let packetizer = Packetizer::with_random_state(config.payload_type, config.max_packet_size);
        let (transport, sink) = self.negotiate(&requested)?;

        let setup = SessionSetup {
            uri: request.uri.clone(),
            connection_id: self.conn.id,
            peer_addr: self.conn.peer_addr,
            transport,
            sink,
            packetizer,
            control: Some(self.conn.control.try_clone()?),
            timeout: config.session_timeout,
            queue_depth: config.session_queue_depth,
        };

        let (session, inbox) = shared.sessions.create(setup, limit)?;
        if let Err(e) = delivery::spawn(session.clone(), inbox, shared.clone()) {
            shared.release(&session.id, ReleaseReason::TransportFailure);
            return Err(e.into());
        }
        self.session_ids.push(session.id.clone());

        tracing::info!(
            session_id = %session.id,
            uri = %request.uri,
            peer = %self.conn.peer_addr,
            transport = ?session.transport(),
            "session created via SETUP"
        );

        Ok(RtspResponse::ok()
            .add_header("Transport", &session.transport_header())
            .add_header("Session", &session.header_value()))
    }

    /// Bind the media path for the requested transport.
    fn negotiate(&mut self, requested: &TransportHeader) -> Result<(Transport, MediaSink)> {
        match requested.lower {
            LowerTransport::Udp => {
                let (client_rtp_port, client_rtcp_port) = requested
                    .client_port
                    .ok_or_else(|| RtspError::UnsupportedTransport("missing client_port".into()))?;
                let client_ip = self.conn.peer_addr.ip();
                let (rtp, rtcp) = self.shared.ports.bind_pair(self.conn.local_addr.ip())?;
                let sink = UdpSink::new(
                    rtp,
                    rtcp,
                    std::net::SocketAddr::new(client_ip, client_rtp_port),
                )?;
                let (server_rtp_port, server_rtcp_port) = sink.server_ports()?;

                Ok((
                    Transport::Udp {
                        client_ip,
                        client_rtp_port,
                        client_rtcp_port,
                        server_rtp_port,
                        server_rtcp_port,
                    },
                    MediaSink::Udp(sink),
                ))
            }
            LowerTransport::Tcp => {
                let (rtp_channel, rtcp_channel) = match requested.interleaved {
                    Some(pair) => pair,
                    None => {
                        let rtp = self.next_channel;
                        let rtcp = rtp.checked_add(1).ok_or_else(|| {
                            RtspError::UnsupportedTransport("interleaved channels exhausted".into())
                        })?;
                        (rtp, rtcp)
                    }
                };
                if self.channels_in_use(rtp_channel, rtcp_channel) {
                    return Err(RtspError::UnsupportedTransport(format!(
                        "interleaved channels {rtp_channel}-{rtcp_channel} already in use"
                    )));
                }
                self.next_channel = self.next_channel.max(rtcp_channel.saturating_add(1));

                Ok((
                    Transport::Interleaved {
                        rtp_channel,
                        rtcp_channel,
                    },
                    MediaSink::Interleaved(InterleavedSink::new(self.conn.writer.clone(), rtp_channel)),
                ))
            }
        }
    }

    /// Whether another session on this connection already carries either
    /// channel.
    fn channels_in_use(&self, rtp: u8, rtcp: u8) -> bool {
        self.session_ids
            .iter()
            .filter_map(|id| self.shared.sessions.get(id))
            .any(|session| match *session.transport() {
                Transport::Interleaved {
                    rtp_channel,
                    rtcp_channel,
                } => [rtp_channel, rtcp_channel]
                    .iter()
                    .any(|ch| *ch == rtp || *ch == rtcp),
                Transport::Udp { .. } => false,
            })
    }

    fn handle_play(&mut self, request: &RtspRequest) -> Result<RtspResponse> {
        let session = self.require_session(request, &Method::Play)?;
        let state = session.state();
        state.next(&Method::Play)?;

        if state != SessionState::Playing {
            self.pending = Some(Pending::Play(session.clone()));
        }

        let rtp_info = format!(
            "url={};seq={};rtptime={}",
            session.uri,
            session.next_sequence(),
            self.shared.last_timestamp()
        );

        Ok(RtspResponse::ok()
            .add_header("Session", &session.header_value())
            .add_header("Range", "npt=0.000-")
            .add_header("RTP-Info", &rtp_info))
    }

    fn handle_pause(&mut self, request: &RtspRequest) -> Result<RtspResponse> {
        let session = self.require_session(request, &Method::Pause)?;
        let next = session.state().next(&Method::Pause)?;
        session.set_state(next);

        tracing::info!(session_id = %session.id, "playback paused");

        Ok(RtspResponse::ok().add_header("Session", &session.header_value()))
    }

    fn handle_teardown(&mut self, request: &RtspRequest) -> Result<RtspResponse> {
        let session = match self.require_session(request, &Method::Teardown) {
            Ok(session) => session,
            // Nothing set up on this connection: Init -> TornDown is a no-op.
            Err(RtspError::MethodNotValidInState { .. }) => return Ok(RtspResponse::ok()),
            Err(e) => return Err(e),
        };
        session.state().next(&Method::Teardown)?;

        self.shared.release(&session.id, ReleaseReason::Teardown);
        self.session_ids.retain(|id| *id != session.id);

        tracing::info!(session_id = %session.id, "session torn down via TEARDOWN");

        Ok(RtspResponse::ok())
    }

    /// Keepalive (RFC 2326 §10.8). Parameter queries are not supported,
    /// so the body is always empty.
    fn handle_get_parameter(&self, request: &RtspRequest) -> Result<RtspResponse> {
        tracing::trace!(cseq = request.cseq(), body_len = request.body.len(), "GET_PARAMETER");
        match self.session_from_header(request)? {
            Some(session) => Ok(RtspResponse::ok().add_header("Session", &session.header_value())),
            None => Ok(RtspResponse::ok()),
        }
    }

    /// Session named by the `Session` header; 454 when it is unknown.
    /// Refreshes liveness.
    fn session_from_header(&self, request: &RtspRequest) -> Result<Option<Arc<Session>>> {
        let Some(id) = request.session_id() else {
            return Ok(None);
        };
        let session = self
            .shared
            .sessions
            .get(id)
            .ok_or_else(|| RtspError::SessionNotFound(id.to_string()))?;
        session.touch();
        Ok(Some(session))
    }

    /// Session for a method that needs one: the `Session` header, or the
    /// only session this connection owns. Without either the connection is
    /// still in `Init`.
    fn require_session(&self, request: &RtspRequest, method: &Method) -> Result<Arc<Session>> {
        if let Some(session) = self.session_from_header(request)? {
            return Ok(session);
        }

        if let [only] = self.session_ids.as_slice()
            && let Some(session) = self.shared.sessions.get(only)
        {
            session.touch();
            return Ok(session);
        }

        Err(RtspError::MethodNotValidInState {
            method: method.to_string(),
            state: SessionState::Init,
        })
    }
}
