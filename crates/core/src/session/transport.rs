use std::net::{IpAddr, SocketAddr};

use crate::error::{Result, RtspError};

/// Lower transport requested by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LowerTransport {
    /// `RTP/AVP` or `RTP/AVP/UDP`.
    Udp,
    /// `RTP/AVP/TCP`, media interleaved on the RTSP connection.
    Tcp,
}

/// One acceptable transport parsed from the client's `Transport` header
/// (RFC 2326 §12.39).
///
/// The header may list several comma-separated alternatives in order of
/// preference; [`parse`](Self::parse) returns the first one this server
/// can serve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportHeader {
    pub lower: LowerTransport,
    /// Client's RTP/RTCP receive ports (UDP only).
    pub client_port: Option<(u16, u16)>,
    /// Requested interleaved channel pair (TCP only).
    pub interleaved: Option<(u8, u8)>,
}

impl TransportHeader {
    /// Parse the `Transport` header value.
    ///
    /// Multicast alternatives and UDP alternatives without `client_port`
    /// are skipped.
    ///
    /// ## Examples
    ///
    /// ```
    /// use rtsp::session::transport::{LowerTransport, TransportHeader};
    ///
    /// let th = TransportHeader::parse("RTP/AVP;unicast;client_port=8000-8001").unwrap();
    /// assert_eq!(th.lower, LowerTransport::Udp);
    /// assert_eq!(th.client_port, Some((8000, 8001)));
    ///
    /// let th = TransportHeader::parse("RTP/AVP/TCP;unicast;interleaved=0-1").unwrap();
    /// assert_eq!(th.interleaved, Some((0, 1)));
    ///
    /// assert!(TransportHeader::parse("RTP/AVP;multicast").is_err());
    /// ```
    pub fn parse(header: &str) -> Result<Self> {
        header
            .split(',')
            .find_map(parse_alternative)
            .ok_or_else(|| RtspError::UnsupportedTransport(header.trim().to_string()))
    }
}

fn parse_alternative(offer: &str) -> Option<TransportHeader> {
    let mut params = offer.split(';').map(str::trim);

    let mut lower = match params.next()? {
        p if p.eq_ignore_ascii_case("RTP/AVP") || p.eq_ignore_ascii_case("RTP/AVP/UDP") => {
            LowerTransport::Udp
        }
        p if p.eq_ignore_ascii_case("RTP/AVP/TCP") => LowerTransport::Tcp,
        _ => return None,
    };

    let mut client_port = None;
    let mut interleaved = None;

    for param in params {
        if param.eq_ignore_ascii_case("multicast") {
            return None;
        } else if let Some(ports) = param.strip_prefix("client_port=") {
            client_port = Some(parse_pair::<u16>(ports)?);
        } else if let Some(channels) = param.strip_prefix("interleaved=") {
            interleaved = Some(parse_pair::<u8>(channels)?);
        }
    }

    if interleaved.is_some() {
        lower = LowerTransport::Tcp;
    }

    match lower {
        LowerTransport::Udp if client_port.is_none() => None,
        LowerTransport::Udp => Some(TransportHeader {
            lower,
            client_port,
            interleaved: None,
        }),
        LowerTransport::Tcp => Some(TransportHeader {
            lower,
            client_port: None,
            interleaved,
        }),
    }
}

/// `a-b` or a single `a`, which implies `a+1`.
fn parse_pair<T>(value: &str) -> Option<(T, T)>
where
    T: std::str::FromStr + Copy + TryFrom<u32>,
    u32: From<T>,
{
    match value.split_once('-') {
        Some((a, b)) => Some((a.trim().parse().ok()?, b.trim().parse().ok()?)),
        None => {
            let a: T = value.trim().parse().ok()?;
            let b = T::try_from(u32::from(a) + 1).ok()?;
            Some((a, b))
        }
    }
}

/// Transport negotiated during SETUP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    /// RTP over UDP to the client's port pair, from a bound server pair.
    Udp {
        client_ip: IpAddr,
        client_rtp_port: u16,
        client_rtcp_port: u16,
        server_rtp_port: u16,
        server_rtcp_port: u16,
    },
    /// RTP framed with `$` on the RTSP connection.
    Interleaved { rtp_channel: u8, rtcp_channel: u8 },
}

impl Transport {
    /// `Transport` header value echoed in the SETUP response.
    ///
    /// ```text
    /// RTP/AVP;unicast;client_port=8000-8001;server_port=5000-5001;ssrc=1A2B3C4D
    /// RTP/AVP/TCP;unicast;interleaved=0-1;ssrc=1A2B3C4D
    /// ```
    pub fn response_header(&self, ssrc: u32) -> String {
        match self {
            Transport::Udp {
                client_rtp_port,
                client_rtcp_port,
                server_rtp_port,
                server_rtcp_port,
                ..
            } => format!(
                "RTP/AVP;unicast;client_port={client_rtp_port}-{client_rtcp_port};\
                 server_port={server_rtp_port}-{server_rtcp_port};ssrc={ssrc:08X}"
            ),
            Transport::Interleaved {
                rtp_channel,
                rtcp_channel,
            } => format!("RTP/AVP/TCP;unicast;interleaved={rtp_channel}-{rtcp_channel};ssrc={ssrc:08X}"),
        }
    }

    /// Where RTP for this transport goes, if it leaves the RTSP connection.
    pub fn rtp_destination(&self) -> Option<SocketAddr> {
        match self {
            Transport::Udp {
                client_ip,
                client_rtp_port,
                ..
            } => Some(SocketAddr::new(*client_ip, *client_rtp_port)),
            Transport::Interleaved { .. } => None,
        }
    }

    pub fn is_interleaved(&self) -> bool {
        matches!(self, Transport::Interleaved { .. })
    }
}
