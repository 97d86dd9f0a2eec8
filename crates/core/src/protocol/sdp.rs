//! SDP (Session Description Protocol) generation (RFC 4566 / RFC 8866).
//!
//! Produces the SDP body returned by DESCRIBE responses. The format:
//!
//! ```text
//! v=0                                          ← protocol version
//! o=<user> <sess-id> <sess-ver> IN IP4 <addr>  ← origin
//! s=<session-name>                              ← session name
//! c=IN IP4 <addr>                               ← connection address
//! t=0 0                                         ← timing (live stream)
//! a=tool:rtsp-live                              ← server software (§6)
//! a=sendonly                                    ← direction (§6)
//! a=control:*                                   ← aggregate control
//! m=video 0 RTP/AVP 96                          ← media description
//! a=rtpmap:96 H264/90000                        ← codec/clock rate
//! a=fmtp:96 packetization-mode=1;...            ← codec parameters
//! a=control:track1                              ← track control URL
//! ```
//!
//! Origin and session fields come from [`ServerConfig`] so nothing is
//! hardcoded. Output depends only on the inputs.

use std::net::IpAddr;

use crate::config::ServerConfig;
use crate::error::{Result, RtspError};
use crate::media::{Codec, CodecConfig, VIDEO_CLOCK_RATE, h264, h265};

/// Control URL suffix of the single video track.
pub const TRACK_CONTROL: &str = "track1";

/// Generate an SDP session description for the current codec config.
///
/// `host` is the address advertised in `o=` and `c=`. Returns
/// [`RtspError::CodecNotReady`] when the parameter sets are incomplete.
pub fn generate_sdp(config: &CodecConfig, host: &str, options: &ServerConfig) -> Result<String> {
    if !config.is_complete() {
        return Err(RtspError::CodecNotReady);
    }
    let fmtp = match config.codec {
        Codec::H264 => h264::fmtp_parameters(&config.parameter_sets),
        Codec::H265 => h265::fmtp_parameters(&config.parameter_sets),
    }
    .ok_or(RtspError::CodecNotReady)?;

    let pt = options.payload_type;
    let addr_type = match host.parse::<IpAddr>() {
        Ok(IpAddr::V6(_)) => "IP6",
        _ => "IP4",
    };

    let sdp = [
        "v=0".to_string(),
        format!(
            "o={} {} {} IN {addr_type} {host}",
            options.sdp_username, options.sdp_session_id, options.sdp_session_version
        ),
        format!("s={}", options.sdp_session_name),
        format!("c=IN {addr_type} {host}"),
        "t=0 0".to_string(),
        "a=tool:rtsp-live".to_string(),
        "a=sendonly".to_string(),
        "a=control:*".to_string(),
        format!("m=video 0 RTP/AVP {pt}"),
        format!("a=rtpmap:{pt} {}/{VIDEO_CLOCK_RATE}", config.codec.encoding_name()),
        format!("a=fmtp:{pt} {fmtp}"),
        format!("a=control:{TRACK_CONTROL}"),
    ];

    tracing::debug!("SDP: {}", sdp.join("\r\n"));

    Ok(format!("{}\r\n", sdp.join("\r\n")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::ParameterSets;

    fn h264_config() -> CodecConfig {
        CodecConfig {
            codec: Codec::H264,
            parameter_sets: ParameterSets {
                vps: None,
                sps: Some(vec![0x67, 0x42, 0xc0, 0x1f, 0xda]),
                pps: Some(vec![0x68, 0xce, 0x3c, 0x80]),
            },
        }
    }

    fn options() -> ServerConfig {
        ServerConfig {
            sdp_username: "server".into(),
            sdp_session_id: "1234567890".into(),
            sdp_session_version: "1".into(),
            sdp_session_name: "Test Session".into(),
            ..ServerConfig::default()
        }
    }

    #[test]
    fn generates_h264_sdp() {
        let sdp = generate_sdp(&h264_config(), "192.168.1.100", &options()).unwrap();
        assert!(sdp.starts_with("v=0\r\n"));
        assert!(sdp.contains("o=server 1234567890 1 IN IP4 192.168.1.100\r\n"));
        assert!(sdp.contains("s=Test Session\r\n"));
        assert!(
            sdp.contains("c=IN IP4 192.168.1.100\r\n"),
            "c= must use configured IP, not 0.0.0.0"
        );
        assert!(sdp.contains("a=tool:rtsp-live\r\n"));
        assert!(sdp.contains("a=sendonly\r\n"));
        assert!(sdp.contains("a=control:*\r\n"));
        assert!(sdp.contains("a=rtpmap:96 H264/90000\r\n"));
        assert!(sdp.contains(
            "a=fmtp:96 packetization-mode=1;profile-level-id=42c01f;\
             sprop-parameter-sets=Z0LAH9o=,aM48gA==\r\n"
        ));
        assert!(sdp.contains("a=control:track1\r\n"));

        // Verify ordering: rtpmap must come before fmtp (RFC 6184 §8.2.1)
        let rtpmap_idx = sdp.find("a=rtpmap").expect("SDP must include rtpmap");
        let fmtp_idx = sdp.find("a=fmtp").expect("SDP must include fmtp");
        assert!(rtpmap_idx < fmtp_idx, "a=rtpmap must precede a=fmtp per RFC 6184");

        // Session-level attrs must come before media section
        let sendonly_idx = sdp.find("a=sendonly").expect("SDP must include sendonly");
        let m_idx = sdp.find("m=video").expect("SDP must include media section");
        assert!(sendonly_idx < m_idx, "session-level attrs must precede m= line");

        assert!(fmtp_idx > m_idx, "media attributes must follow m=video");
        assert!(sdp.ends_with("\r\n"), "SDP must end with CRLF");
        assert!(sdp.lines().all(|l| !l.is_empty()), "no blank lines in SDP body");
    }

    #[test]
    fn generates_h265_sdp() {
        let config = CodecConfig {
            codec: Codec::H265,
            parameter_sets: ParameterSets {
                vps: Some(vec![0x40, 0x01, 0x0c]),
                sps: Some(vec![0x42, 0x01, 0x01]),
                pps: Some(vec![0x44, 0x01, 0xc1]),
            },
        };
        let sdp = generate_sdp(&config, "10.0.0.1", &options()).unwrap();
        assert!(sdp.contains("a=rtpmap:96 H265/90000\r\n"));
        assert!(sdp.contains("a=fmtp:96 sprop-vps=QAEM;sprop-sps=QgEB;sprop-pps=RAHB\r\n"));
    }

    #[test]
    fn ipv6_host_uses_ip6() {
        let sdp = generate_sdp(&h264_config(), "::1", &options()).unwrap();
        assert!(sdp.contains(" IN IP6 ::1\r\n"));
        assert!(sdp.contains("c=IN IP6 ::1\r\n"));
    }

    #[test]
    fn incomplete_config_is_not_ready() {
        let mut config = h264_config();
        config.parameter_sets.pps = None;
        assert!(matches!(
            generate_sdp(&config, "127.0.0.1", &options()),
            Err(RtspError::CodecNotReady)
        ));
    }

    #[test]
    fn output_is_deterministic() {
        let a = generate_sdp(&h264_config(), "127.0.0.1", &options()).unwrap();
        let b = generate_sdp(&h264_config(), "127.0.0.1", &options()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn custom_payload_type() {
        let opts = ServerConfig {
            payload_type: 102,
            ..options()
        };
        let sdp = generate_sdp(&h264_config(), "127.0.0.1", &opts).unwrap();
        assert!(sdp.contains("m=video 0 RTP/AVP 102\r\n"));
        assert!(sdp.contains("a=rtpmap:102 H264/90000\r\n"));
    }
}
