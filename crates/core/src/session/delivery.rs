//! Per-session delivery worker.
//!
//! Each session owns one worker thread that drains its bounded inbox,
//! packetizes and writes. Only the worker touches the session's packetizer
//! during playback, so packets leave in order and the fan-out path never
//! blocks on a slow client.

use std::io;
use std::sync::Arc;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use super::{ReleaseReason, Session};
use crate::media::rtp::RtpPacket;
use crate::media::{AccessUnit, CodecConfig};
use crate::server::Shared;

/// How often an idle worker wakes to drain RTCP.
const FEEDBACK_POLL: Duration = Duration::from_millis(200);

/// Work item for a delivery worker.
#[derive(Debug)]
pub enum Outbound {
    Media {
        unit: Arc<AccessUnit>,
        /// PLAY epoch the unit was queued under.
        epoch: u32,
    },
    /// In-band parameter sets sent when playback starts.
    ParameterSets {
        config: Arc<CodecConfig>,
        timestamp: u32,
    },
}

/// Start the worker for `session`.
pub(crate) fn spawn(session: Arc<Session>, inbox: Receiver<Outbound>, shared: Arc<Shared>) -> io::Result<()> {
    thread::Builder::new()
        .name(format!("rtp-{}", session.id))
        .spawn(move || run(&session, &inbox, &shared))?;
    Ok(())
}

fn run(session: &Session, inbox: &Receiver<Outbound>, shared: &Shared) {
    let mut writer = PacketWriter {
        session,
        shared,
        failures: 0,
        max_failures: shared.config.max_consecutive_write_failures.max(1),
    };

    tracing::trace!(session_id = %session.id, "delivery worker started");

    let outcome = loop {
        let result = match inbox.recv_timeout(FEEDBACK_POLL) {
            Ok(Outbound::Media { unit, epoch }) => {
                // Units queued before a PAUSE are discarded, even after a
                // later PLAY.
                if session.accepts_media(epoch) {
                    writer.write(&session.packetize(&unit))
                } else {
                    Ok(())
                }
            }
            Ok(Outbound::ParameterSets { config, timestamp }) => {
                writer.write(&session.packetize_config(&config, timestamp))
            }
            Err(RecvTimeoutError::Timeout) => Ok(()),
            Err(RecvTimeoutError::Disconnected) => break None,
        };

        if session.sink().drain_feedback() > 0 {
            session.touch();
        }

        if let Err(e) = result {
            break Some(e);
        }
    };

    if let Some(error) = outcome {
        tracing::warn!(session_id = %session.id, error = %error, "media transport failed");
        shared.release(&session.id, ReleaseReason::TransportFailure);
    }

    tracing::trace!(session_id = %session.id, "delivery worker exited");
}

/// Applies the write-failure policy while sending one batch of packets.
struct PacketWriter<'a> {
    session: &'a Session,
    shared: &'a Shared,
    failures: u32,
    max_failures: u32,
}

impl PacketWriter<'_> {
    fn write(&mut self, packets: &[RtpPacket]) -> io::Result<()> {
        let sink = self.session.sink();
        let mut buf = Vec::with_capacity(self.shared.config.max_packet_size);

        for packet in packets {
            buf.clear();
            packet.write_to(&mut buf);

            match sink.send(&buf) {
                Ok(()) => {
                    self.failures = 0;
                    self.session.record_sent(buf.len());
                    self.shared.counters.record_sent(buf.len());
                }
                Err(e) if sink.failure_is_fatal() => return Err(e),
                Err(e) => {
                    self.failures += 1;
                    tracing::debug!(
                        session_id = %self.session.id,
                        seq = packet.sequence_number,
                        failures = self.failures,
                        error = %e,
                        "RTP send failed"
                    );
                    if self.failures >= self.max_failures {
                        return Err(e);
                    }
                }
            }
        }
        Ok(())
    }
}
