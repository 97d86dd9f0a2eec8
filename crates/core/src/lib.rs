//! Live H.264/H.265 RTSP server core.
//!
//! Feed encoded access units into a [`Server`]; every client that has
//! completed SETUP and PLAY receives them as RTP over UDP or interleaved
//! on its RTSP connection.

pub mod config;
pub mod error;
pub mod media;
pub mod protocol;
pub mod server;
pub mod session;
pub mod stats;
pub mod transport;

pub use config::ServerConfig;
pub use error::{Result, RtspError};
pub use media::{AccessUnit, Codec, CodecConfig, NalKind, NalUnit, Packetizer, ParameterSets};
pub use server::Server;
pub use session::{SessionState, Viewer};
pub use stats::ServerStats;
