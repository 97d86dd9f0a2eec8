//! RTSP control channel (RFC 2326).
//!
//! [`request`] parses what the connection reader hands over,
//! [`handler::MethodHandler`] runs one connection's methods against the
//! shared session table, [`response`] renders the reply and [`sdp`]
//! describes the single video track served at every URL.
//!
//! | Method | Session needed | Effect |
//! |--------|----------------|--------|
//! | OPTIONS | no | Lists `Public` methods, refreshes a named session |
//! | DESCRIBE | no | SDP for the current codec config, 503 until it is known |
//! | SETUP | no | Creates a session bound to UDP ports or interleaved channels |
//! | PLAY | yes | Starts delivery, parameter sets first |
//! | PAUSE | yes | Stops forwarding, keeps transport and sequence |
//! | TEARDOWN | yes | Releases the session |
//! | GET_PARAMETER | no | Keepalive |
//!
//! Anything else is answered with 501.

pub mod handler;
pub mod request;
pub mod response;
pub mod sdp;

pub use handler::MethodHandler;
pub use request::{Method, RtspRequest};
pub use response::RtspResponse;
