use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{ParseErrorKind, RtspError};
use crate::protocol::request::scan_cseq;
use crate::protocol::{MethodHandler, RtspRequest, RtspResponse};
use crate::server::Shared;
use crate::session::ReleaseReason;

/// Largest accepted request head (request line plus headers).
pub const MAX_HEAD_LEN: usize = 16 * 1024;
/// Largest accepted request body.
pub const MAX_BODY_LEN: usize = 64 * 1024;

/// How often a blocked connection read wakes up to check for shutdown.
const READ_POLL: Duration = Duration::from_millis(250);
/// Bound on waiting for a rejected client's first request.
const REJECT_READ_TIMEOUT: Duration = Duration::from_millis(500);
/// Over-limit connections answered with 453 at once; beyond this they are
/// closed without a response.
pub const MAX_PENDING_REJECTS: usize = 8;

/// Write half of an RTSP connection, shared between the request loop
/// (responses) and delivery workers (interleaved media).
pub type SharedWriter = Arc<Mutex<TcpStream>>;

/// Frame an RTP/RTCP packet for interleaved delivery (RFC 2326 §10.12):
/// `'$'`, channel, 16-bit big-endian length, packet.
pub fn interleaved_frame(channel: u8, packet: &[u8]) -> io::Result<Vec<u8>> {
    let len = u16::try_from(packet.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "packet too large to interleave"))?;
    let mut frame = Vec::with_capacity(4 + packet.len());
    frame.push(b'$');
    frame.push(channel);
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(packet);
    Ok(frame)
}

/// RTP sink writing `$`-framed packets onto an RTSP connection.
#[derive(Debug)]
pub struct InterleavedSink {
    writer: SharedWriter,
    channel: u8,
}

impl InterleavedSink {
    pub fn new(writer: SharedWriter, channel: u8) -> Self {
        Self { writer, channel }
    }

    pub fn send(&self, packet: &[u8]) -> io::Result<()> {
        let frame = interleaved_frame(self.channel, packet)?;
        self.writer.lock().write_all(&frame)
    }
}

/// Open RTSP connections, counted against `max_clients` at accept time.
///
/// Keeps a handle to each socket so [`shutdown_all`](Self::shutdown_all)
/// can unblock every connection thread on server stop.
#[derive(Debug, Clone, Default)]
pub(crate) struct ConnectionRegistry {
    streams: Arc<Mutex<HashMap<u64, TcpStream>>>,
    next_id: Arc<AtomicU64>,
    rejecting: Arc<AtomicUsize>,
}

impl ConnectionRegistry {
    /// Register `stream` unless `limit` (0 = unlimited) is reached.
    pub fn register(&self, stream: &TcpStream, limit: usize) -> io::Result<Option<ConnectionGuard>> {
        let mut streams = self.streams.lock();
        if limit > 0 && streams.len() >= limit {
            return Ok(None);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        streams.insert(id, stream.try_clone()?);
        Ok(Some(ConnectionGuard {
            registry: self.clone(),
            id,
        }))
    }

    pub fn len(&self) -> usize {
        self.streams.lock().len()
    }

    /// Slot for answering one over-limit client, `None` when
    /// [`MAX_PENDING_REJECTS`] are already in flight.
    pub fn try_reject(&self) -> Option<RejectPermit> {
        self.rejecting
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < MAX_PENDING_REJECTS).then_some(n + 1)
            })
            .ok()?;
        Some(RejectPermit {
            rejecting: self.rejecting.clone(),
        })
    }

    pub fn shutdown_all(&self) {
        for stream in self.streams.lock().values() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

/// Removes its connection from the registry when dropped.
#[derive(Debug)]
pub(crate) struct ConnectionGuard {
    registry: ConnectionRegistry,
    id: u64,
}

impl ConnectionGuard {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.registry.streams.lock().remove(&self.id);
    }
}

/// Frees a reject slot when dropped.
#[derive(Debug)]
pub(crate) struct RejectPermit {
    rejecting: Arc<AtomicUsize>,
}

impl Drop for RejectPermit {
    fn drop(&mut self) {
        self.rejecting.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Non-blocking TCP accept loop.
///
/// Checks the `running` flag between accepts with a 50ms poll interval
/// so that [`Server::stop`](crate::Server::stop) can terminate it promptly.
/// Connections beyond `max_clients` are answered with 453 and closed.
pub(crate) fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    while shared.is_running() {
        match listener.accept() {
            Ok((stream, peer_addr)) => {
                if stream.set_nonblocking(false).is_err() {
                    continue;
                }

                let limit = shared.max_clients();
                let guard = match shared.connections.register(&stream, limit) {
                    Ok(Some(guard)) => guard,
                    Ok(None) => {
                        tracing::warn!(%peer_addr, limit, "connection rejected, client limit reached");
                        spawn_reject(stream, peer_addr, limit, &shared.connections);
                        continue;
                    }
                    Err(e) => {
                        tracing::warn!(%peer_addr, error = %e, "failed to register connection");
                        continue;
                    }
                };

                let s = shared.clone();
                let spawned = thread::Builder::new()
                    .name(format!("rtsp-conn-{}", guard.id()))
                    .spawn(move || Connection::handle(stream, guard, s));
                if let Err(e) = spawned {
                    tracing::error!(%peer_addr, error = %e, "failed to spawn connection thread");
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                if shared.is_running() {
                    tracing::warn!(error = %e, "TCP accept error");
                }
            }
        }
    }
    tracing::debug!("accept loop exited");
}

/// Answer an over-limit client on its own thread, or close it at once when
/// too many rejections are already pending.
fn spawn_reject(stream: TcpStream, peer_addr: SocketAddr, limit: usize, connections: &ConnectionRegistry) {
    let Some(permit) = connections.try_reject() else {
        tracing::debug!(%peer_addr, "reject backlog full, closing without response");
        let _ = stream.shutdown(Shutdown::Both);
        return;
    };
    let spawned = thread::Builder::new()
        .name("rtsp-reject".into())
        .spawn(move || {
            reject(stream, limit);
            drop(permit);
        });
    if let Err(e) = spawned {
        tracing::warn!(%peer_addr, error = %e, "failed to spawn reject thread");
    }
}

/// Answer the first request of an over-limit client with 453, then close.
fn reject(mut stream: TcpStream, limit: usize) {
    let _ = stream.set_read_timeout(Some(REJECT_READ_TIMEOUT));
    let mut buf = [0u8; 2048];
    let n = stream.read(&mut buf).unwrap_or(0);
    let head = String::from_utf8_lossy(&buf[..n]);
    let cseq = scan_cseq(&head).unwrap_or("0");

    let response = RtspResponse::from_error(&RtspError::TooManyClients { limit }).with_cseq(cseq);
    let _ = stream.write_all(response.serialize().as_bytes());
    let _ = stream.shutdown(Shutdown::Both);
}

/// One message read off an RTSP connection.
#[derive(Debug)]
pub(crate) enum Inbound {
    Request(RtspRequest),
    /// A `$`-framed packet from the client (usually RTCP), already consumed.
    Interleaved { channel: u8, len: usize },
    /// A message that could not be parsed. `fatal` when the stream can no
    /// longer be resynchronized.
    Invalid {
        error: RtspError,
        cseq: Option<String>,
        fatal: bool,
    },
}

/// Splits an RTSP byte stream into requests and interleaved frames.
///
/// Bytes survive read timeouts, so a request arriving in several TCP
/// segments is reassembled.
pub(crate) struct MessageReader<R> {
    inner: R,
    buf: Vec<u8>,
}

impl<R: Read> MessageReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::with_capacity(4096),
        }
    }

    /// Next complete message, `Ok(None)` on EOF.
    ///
    /// Read timeouts surface as `Err` with `WouldBlock`/`TimedOut`; any
    /// partial message is kept for the next call.
    pub fn next_message(&mut self) -> io::Result<Option<Inbound>> {
        loop {
            if let Some(message) = self.take_message() {
                return Ok(Some(message));
            }

            let mut chunk = [0u8; 4096];
            match self.inner.read(&mut chunk) {
                Ok(0) => return Ok(None),
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn take_message(&mut self) -> Option<Inbound> {
        let blank = self
            .buf
            .iter()
            .take_while(|b| **b == b'\r' || **b == b'\n')
            .count();
        self.buf.drain(..blank);

        if self.buf.first() == Some(&b'$') {
            return self.take_interleaved();
        }

        let Some(head_end) = find_head_end(&self.buf) else {
            if self.buf.len() > MAX_HEAD_LEN {
                return Some(self.overflow());
            }
            return None;
        };
        if head_end > MAX_HEAD_LEN {
            return Some(self.overflow());
        }

        let head = match std::str::from_utf8(&self.buf[..head_end]) {
            Ok(head) => head.to_owned(),
            Err(_) => {
                self.buf.drain(..head_end);
                return Some(Inbound::Invalid {
                    error: RtspError::Parse {
                        kind: ParseErrorKind::InvalidEncoding,
                    },
                    cseq: None,
                    fatal: false,
                });
            }
        };

        let invalid = |error: RtspError| Inbound::Invalid {
            cseq: scan_cseq(&head).map(str::to_owned),
            error,
            fatal: false,
        };

        let mut request = match RtspRequest::parse(&head) {
            Ok(request) => request,
            Err(e) => {
                self.buf.drain(..head_end);
                return Some(invalid(e));
            }
        };

        let body_len = match request.content_length() {
            Ok(len) => len,
            Err(e) => {
                self.buf.drain(..head_end);
                return Some(invalid(e));
            }
        };
        if body_len > MAX_BODY_LEN {
            self.buf.clear();
            return Some(Inbound::Invalid {
                error: RtspError::Parse {
                    kind: ParseErrorKind::MessageTooLarge,
                },
                cseq: request.cseq().map(str::to_owned),
                fatal: true,
            });
        }
        if self.buf.len() < head_end + body_len {
            return None;
        }

        request.body = self.buf[head_end..head_end + body_len].to_vec();
        self.buf.drain(..head_end + body_len);
        Some(Inbound::Request(request))
    }

    fn take_interleaved(&mut self) -> Option<Inbound> {
        if self.buf.len() < 4 {
            return None;
        }
        let channel = self.buf[1];
        let len = usize::from(u16::from_be_bytes([self.buf[2], self.buf[3]]));
        if self.buf.len() < 4 + len {
            return None;
        }
        self.buf.drain(..4 + len);
        Some(Inbound::Interleaved { channel, len })
    }

    fn overflow(&mut self) -> Inbound {
        let cseq = scan_cseq(&String::from_utf8_lossy(&self.buf[..self.buf.len().min(MAX_HEAD_LEN)]))
            .map(str::to_owned);
        self.buf.clear();
        Inbound::Invalid {
            error: RtspError::Parse {
                kind: ParseErrorKind::MessageTooLarge,
            },
            cseq,
            fatal: true,
        }
    }
}

/// Offset just past the blank line ending the head, CRLF or bare LF.
fn find_head_end(buf: &[u8]) -> Option<usize> {
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4);
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|p| p + 2);
    match (crlf, lf) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// Per-connection context handed to the [`MethodHandler`].
#[derive(Debug)]
pub(crate) struct ConnectionContext {
    pub id: u64,
    pub peer_addr: SocketAddr,
    pub local_addr: SocketAddr,
    pub writer: SharedWriter,
    /// Clone of the socket used only to shut it down.
    pub control: TcpStream,
}

/// A single RTSP client connection with its own lifecycle.
struct Connection {
    reader: MessageReader<TcpStream>,
    writer: SharedWriter,
    handler: MethodHandler,
    peer_addr: SocketAddr,
    shared: Arc<Shared>,
}

impl Connection {
    /// Entry point: set up a connection and run its request loop.
    fn handle(stream: TcpStream, guard: ConnectionGuard, shared: Arc<Shared>) {
        let (peer_addr, local_addr) = match (stream.peer_addr(), stream.local_addr()) {
            (Ok(peer), Ok(local)) => (peer, local),
            _ => return,
        };

        tracing::info!(%peer_addr, connection_id = guard.id(), "client connected");

        let configured = stream
            .set_read_timeout(Some(READ_POLL))
            .and_then(|()| stream.set_write_timeout(Some(shared.config.tcp_write_timeout)))
            .and_then(|()| stream.set_nodelay(true));
        let clones = stream.try_clone().and_then(|r| Ok((r, stream.try_clone()?)));
        let (reader_stream, control) = match configured.and(clones) {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(%peer_addr, error = %e, "failed to configure connection");
                return;
            }
        };

        let writer: SharedWriter = Arc::new(Mutex::new(stream));
        let handler = MethodHandler::new(
            shared.clone(),
            ConnectionContext {
                id: guard.id(),
                peer_addr,
                local_addr,
                writer: writer.clone(),
                control,
            },
        );

        let mut conn = Connection {
            reader: MessageReader::new(reader_stream),
            writer,
            handler,
            peer_addr,
            shared,
        };

        let reason = conn.run();
        let released = conn.handler.release_all(ReleaseReason::ConnectionClosed);
        if released > 0 {
            tracing::info!(peer = %peer_addr, released, "cleaned up sessions on disconnect");
        }
        drop(guard);

        tracing::info!(%peer_addr, reason, "client disconnected");
    }

    /// RTSP request/response loop. Returns the reason for exiting.
    fn run(&mut self) -> &'static str {
        let idle_limit = self.shared.config.session_timeout;
        let mut last_inbound = Instant::now();

        while self.shared.is_running() {
            match self.reader.next_message() {
                Ok(None) => return "connection closed by client",
                Ok(Some(Inbound::Interleaved { channel, len })) => {
                    tracing::trace!(peer = %self.peer_addr, channel, len, "interleaved frame from client");
                    last_inbound = Instant::now();
                    self.handler.touch_sessions();
                }
                Ok(Some(Inbound::Request(request))) => {
                    last_inbound = Instant::now();
                    self.handler.touch_sessions();
                    tracing::debug!(
                        peer = %self.peer_addr,
                        method = %request.method,
                        uri = %request.uri,
                        cseq = request.cseq().unwrap_or("-"),
                        "request"
                    );

                    let response = self.handler.handle(&request);

                    tracing::debug!(
                        peer = %self.peer_addr,
                        status = response.status_code,
                        "response"
                    );

                    if self.write_response(&response).is_err() {
                        return "write error";
                    }
                    self.handler.commit();
                }
                Ok(Some(Inbound::Invalid { error, cseq, fatal })) => {
                    last_inbound = Instant::now();
                    tracing::warn!(peer = %self.peer_addr, error = %error, fatal, "malformed request");
                    let response = RtspResponse::from_error(&error).with_cseq(cseq.as_deref().unwrap_or("0"));
                    if self.write_response(&response).is_err() {
                        return "write error";
                    }
                    if fatal {
                        return "oversized request";
                    }
                }
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                    if !self.handler.has_sessions() && last_inbound.elapsed() >= idle_limit {
                        return "idle timeout";
                    }
                }
                Err(_) => return "read error",
            }
        }

        "server shutting down"
    }

    fn write_response(&self, response: &RtspResponse) -> io::Result<()> {
        self.writer.lock().write_all(response.serialize().as_bytes())
    }
}
