use std::io;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::ops::RangeInclusive;

use parking_lot::Mutex;

use crate::error::{Result, RtspError};

/// Hands out even/odd server port pairs for UDP sessions (RFC 3550 §11).
///
/// Ports are probed by binding, starting where the previous allocation
/// left off and wrapping at the end of the range. A pair is only
/// returned once both sockets are bound, so two sessions never share a
/// port.
#[derive(Debug)]
pub struct PortAllocator {
    range: RangeInclusive<u16>,
    cursor: Mutex<u16>,
}

impl PortAllocator {
    pub fn new(range: RangeInclusive<u16>) -> Self {
        let start = even_at_or_above(*range.start());
        Self {
            range,
            cursor: Mutex::new(start),
        }
    }

    /// Bind the next free (RTP, RTCP) pair on `ip`.
    pub fn bind_pair(&self, ip: IpAddr) -> Result<(UdpSocket, UdpSocket)> {
        let first = even_at_or_above(*self.range.start());
        let last = *self.range.end();
        if first >= last {
            return Err(RtspError::PortRangeExhausted);
        }

        let pairs = usize::from((last - first) / 2) + 1;
        let mut cursor = self.cursor.lock();

        for _ in 0..pairs {
            let rtp_port = *cursor;
            *cursor = match rtp_port.checked_add(2) {
                Some(next) if next < last => next,
                _ => first,
            };

            if rtp_port >= last {
                continue;
            }

            match bind_two(ip, rtp_port) {
                Ok(pair) => {
                    tracing::trace!(rtp_port, rtcp_port = rtp_port + 1, "allocated server ports");
                    return Ok(pair);
                }
                Err(e) => {
                    tracing::trace!(rtp_port, error = %e, "server port pair busy");
                }
            }
        }

        tracing::warn!(range = ?self.range, "no free UDP port pair");
        Err(RtspError::PortRangeExhausted)
    }
}

fn even_at_or_above(port: u16) -> u16 {
    if port % 2 == 0 { port } else { port.saturating_add(1) }
}

fn bind_two(ip: IpAddr, rtp_port: u16) -> io::Result<(UdpSocket, UdpSocket)> {
    let rtp = UdpSocket::bind(SocketAddr::new(ip, rtp_port))?;
    let rtcp = UdpSocket::bind(SocketAddr::new(ip, rtp_port + 1))?;
    Ok((rtp, rtcp))
}

/// Per-session UDP endpoint: RTP goes out of the even socket, RTCP
/// receiver reports arrive on the odd one.
///
/// This layer is address-only. It does not know about sessions; the
/// delivery worker decides what to do with send failures.
#[derive(Debug)]
pub struct UdpSink {
    rtp: UdpSocket,
    rtcp: UdpSocket,
    rtp_dest: SocketAddr,
}

impl UdpSink {
    pub fn new(rtp: UdpSocket, rtcp: UdpSocket, rtp_dest: SocketAddr) -> Result<Self> {
        rtcp.set_nonblocking(true)?;
        Ok(Self {
            rtp,
            rtcp,
            rtp_dest,
        })
    }

    pub fn server_ports(&self) -> Result<(u16, u16)> {
        Ok((self.rtp.local_addr()?.port(), self.rtcp.local_addr()?.port()))
    }

    pub fn send(&self, packet: &[u8]) -> io::Result<()> {
        let sent = self.rtp.send_to(packet, self.rtp_dest)?;
        if sent != packet.len() {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "short datagram write"));
        }
        Ok(())
    }

    /// Drain pending RTCP datagrams. Returns how many arrived.
    pub fn drain_rtcp(&self) -> usize {
        let mut buf = [0u8; 1500];
        let mut received = 0;
        loop {
            match self.rtcp.recv_from(&mut buf) {
                Ok(_) => received += 1,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    tracing::trace!(error = %e, "RTCP receive error");
                    break;
                }
            }
        }
        received
    }
}
