//! Error types for the RTSP server core.

use std::fmt;

use crate::session::SessionState;

/// Errors that can occur in the RTSP server core.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Protocol**: [`Parse`](Self::Parse), [`MissingHeader`](Self::MissingHeader),
///   [`UnsupportedTransport`](Self::UnsupportedTransport).
/// - **Sequencing**: [`SessionNotFound`](Self::SessionNotFound),
///   [`MethodNotValidInState`](Self::MethodNotValidInState).
/// - **Resources**: [`TooManyClients`](Self::TooManyClients),
///   [`PortRangeExhausted`](Self::PortRangeExhausted).
/// - **Media**: [`CodecNotReady`](Self::CodecNotReady).
/// - **Transport**: [`Io`](Self::Io): socket/network failures.
/// - **Server**: [`NotStarted`](Self::NotStarted),
///   [`AlreadyRunning`](Self::AlreadyRunning).
///
/// Errors raised while handling a request are turned into an RTSP response
/// through [`status`](Self::status).
#[derive(Debug, thiserror::Error)]
pub enum RtspError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No session with the given ID exists in the [`SessionManager`](crate::session::SessionManager).
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// The method is not allowed in the session's current state (e.g. PLAY before SETUP).
    #[error("{method} not valid in state {state:?}")]
    MethodNotValidInState {
        method: String,
        state: SessionState,
    },

    /// No complete set of parameter sets has been observed yet.
    #[error("codec configuration not ready")]
    CodecNotReady,

    /// None of the transports offered in the `Transport` header can be served.
    #[error("unsupported transport: {0}")]
    UnsupportedTransport(String),

    /// A required request header is absent.
    #[error("missing header: {0}")]
    MissingHeader(&'static str),

    /// The configured client ceiling has been reached.
    #[error("client limit reached ({limit})")]
    TooManyClients { limit: usize },

    /// [`Server::start`](crate::Server::start) has not been called yet.
    #[error("server not started")]
    NotStarted,

    /// [`Server::start`](crate::Server::start) was called while already running.
    #[error("server already running")]
    AlreadyRunning,

    /// Failed to parse an RTSP request message (RFC 2326 §6).
    #[error("RTSP parse error: {kind}")]
    Parse { kind: ParseErrorKind },

    /// No free even/odd UDP port pair could be bound in the configured range.
    #[error("UDP port range exhausted")]
    PortRangeExhausted,
}

impl RtspError {
    /// RTSP status code and reason phrase for this error (RFC 2326 §7.1.1).
    pub fn status(&self) -> (u16, &'static str) {
        match self {
            Self::Parse { .. } | Self::MissingHeader(_) => (400, "Bad Request"),
            Self::TooManyClients { .. } => (453, "Not Enough Bandwidth"),
            Self::SessionNotFound(_) => (454, "Session Not Found"),
            Self::MethodNotValidInState { .. } => (455, "Method Not Valid in This State"),
            Self::UnsupportedTransport(_) => (461, "Unsupported Transport"),
            Self::CodecNotReady | Self::PortRangeExhausted => (503, "Service Unavailable"),
            Self::Io(_) | Self::NotStarted | Self::AlreadyRunning => {
                (500, "Internal Server Error")
            }
        }
    }
}

/// Specific kind of RTSP parse failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseErrorKind {
    /// Input was empty (no request line).
    EmptyRequest,
    /// Request line did not have the expected `Method URI Version` format.
    InvalidRequestLine,
    /// A header line did not contain a colon separator.
    InvalidHeader,
    /// `Content-Length` was not a non-negative integer.
    InvalidContentLength,
    /// Message head or body exceeded the configured limit.
    MessageTooLarge,
    /// Message head was not valid UTF-8.
    InvalidEncoding,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyRequest => write!(f, "empty request"),
            Self::InvalidRequestLine => write!(f, "invalid request line"),
            Self::InvalidHeader => write!(f, "invalid header"),
            Self::InvalidContentLength => write!(f, "invalid content length"),
            Self::MessageTooLarge => write!(f, "message too large"),
            Self::InvalidEncoding => write!(f, "message is not valid UTF-8"),
        }
    }
}

/// Convenience alias for `Result<T, RtspError>`.
pub type Result<T> = std::result::Result<T, RtspError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequencing_errors_have_distinct_statuses() {
        let not_found = RtspError::SessionNotFound("abc".into()).status();
        let bad_state = RtspError::MethodNotValidInState {
            method: "PLAY".into(),
            state: SessionState::Init,
        }
        .status();
        assert_eq!(not_found.0, 454);
        assert_eq!(bad_state.0, 455);
    }

    #[test]
    fn resource_and_readiness_errors() {
        assert_eq!(RtspError::TooManyClients { limit: 2 }.status().0, 453);
        assert_eq!(RtspError::CodecNotReady.status().0, 503);
        assert_eq!(
            RtspError::UnsupportedTransport("RTP/SAVP".into()).status().0,
            461
        );
    }

    #[test]
    fn parse_errors_are_client_errors() {
        let err = RtspError::Parse {
            kind: ParseErrorKind::InvalidRequestLine,
        };
        assert_eq!(err.status(), (400, "Bad Request"));
        assert_eq!(err.to_string(), "RTSP parse error: invalid request line");
    }
}
