use std::fmt::Write as _;

use crate::error::RtspError;

/// Value of the `Server` header on every response.
pub const SERVER_AGENT: &str = "rtsp-live/0.1";

/// Methods that never fail with 455, advertised in `Allow` on a 455.
const ALLOWED_IN_ANY_STATE: &str = "OPTIONS, DESCRIBE, SETUP, TEARDOWN, GET_PARAMETER";

/// An RTSP response (RFC 2326 §7).
///
/// Built by chaining [`add_header`](Self::add_header) and
/// [`with_body`](Self::with_body); the connection stamps the echoed
/// `CSeq` with [`with_cseq`](Self::with_cseq) before writing.
///
/// ```text
/// RTSP/1.0 200 OK\r\n
/// CSeq: 2\r\n
/// Server: rtsp-live/0.1\r\n
/// Content-Type: application/sdp\r\n
/// Content-Length: 142\r\n
/// \r\n
/// v=0\r\n...
/// ```
#[must_use]
#[derive(Debug)]
pub struct RtspResponse {
    pub status_code: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl RtspResponse {
    pub fn new(status_code: u16, status_text: &str) -> Self {
        Self {
            status_code,
            status_text: status_text.to_owned(),
            headers: vec![("Server".to_owned(), SERVER_AGENT.to_owned())],
            body: None,
        }
    }

    pub fn ok() -> Self {
        Self::new(200, "OK")
    }

    pub fn not_implemented() -> Self {
        Self::new(501, "Not Implemented")
    }

    /// Error response carrying the status mapped from `err`.
    ///
    /// 503 for a missing codec config asks the client to retry shortly;
    /// 455 lists the methods accepted in every state.
    pub fn from_error(err: &RtspError) -> Self {
        let (code, text) = err.status();
        let response = Self::new(code, text);
        match err {
            RtspError::CodecNotReady => response.add_header("Retry-After", "1"),
            RtspError::MethodNotValidInState { .. } => response.add_header("Allow", ALLOWED_IN_ANY_STATE),
            _ => response,
        }
    }

    pub fn add_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_owned(), value.to_owned()));
        self
    }

    /// Prepend the echoed `CSeq`.
    pub fn with_cseq(mut self, cseq: &str) -> Self {
        self.headers.insert(0, ("CSeq".to_owned(), cseq.to_owned()));
        self
    }

    pub fn with_body(mut self, body: String) -> Self {
        self.body = Some(body);
        self
    }

    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Render the wire form. `Content-Length` is derived from the body.
    pub fn serialize(&self) -> String {
        let body = self.body.as_deref().unwrap_or_default();
        let mut out = String::with_capacity(64 + body.len());

        let _ = write!(out, "RTSP/1.0 {} {}\r\n", self.status_code, self.status_text);
        for (name, value) in &self.headers {
            let _ = write!(out, "{name}: {value}\r\n");
        }
        if self.body.is_some() {
            let _ = write!(out, "Content-Length: {}\r\n", body.len());
        }
        out.push_str("\r\n");
        out.push_str(body);
        out
    }
}
