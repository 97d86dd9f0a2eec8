//! Publishes an Annex-B elementary stream file at a fixed frame rate.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use rtsp::media::nal;
use rtsp::{AccessUnit, Codec, NalUnit, Server};

/// Group NAL units into access units. A unit closes after each picture
/// (VCL) NAL, so parameter sets and SEI travel with the picture that
/// follows them.
pub fn group_access_units(nal_units: Vec<NalUnit>) -> Vec<Vec<NalUnit>> {
    let mut units = Vec::new();
    let mut current = Vec::new();
    for nal in nal_units {
        let closes = nal.is_vcl();
        current.push(nal);
        if closes {
            units.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        units.push(current);
    }
    units
}

pub struct Feeder {
    pub codec: Codec,
    pub fps: f64,
    pub looping: bool,
    pub frames: Vec<Vec<NalUnit>>,
}

impl Feeder {
    pub fn from_annexb(codec: Codec, data: &[u8], fps: f64, looping: bool) -> Self {
        Self {
            codec,
            fps,
            looping,
            frames: group_access_units(nal::extract(codec, data)),
        }
    }

    /// Publish frames until `stop` is set or the file ends without looping.
    pub fn run(&self, server: &Server, stop: &AtomicBool) {
        if self.frames.is_empty() {
            tracing::warn!("input contains no NAL units");
            return;
        }

        let interval = Duration::from_secs_f64(1.0 / self.fps.max(1.0));
        let frame_us = interval.as_micros() as i64;
        let started = Instant::now();
        let mut index: u32 = 0;

        tracing::info!(frames = self.frames.len(), fps = self.fps, codec = %self.codec, "publishing");

        'outer: loop {
            for frame in &self.frames {
                if stop.load(Ordering::Relaxed) {
                    break 'outer;
                }

                let pts_us = i64::from(index) * frame_us;
                server.on_access_unit(AccessUnit::new(self.codec, pts_us, frame.clone()));
                index = index.wrapping_add(1);

                let due = started + interval * index;
                if let Some(wait) = due.checked_duration_since(Instant::now()) {
                    thread::sleep(wait);
                }
            }
            if !self.looping {
                tracing::info!("end of input");
                break;
            }
            tracing::debug!("looping input");
        }
    }

    pub fn spawn(self, server: Arc<Server>, stop: Arc<AtomicBool>) -> std::io::Result<thread::JoinHandle<()>> {
        thread::Builder::new()
            .name("feeder".into())
            .spawn(move || self.run(&server, &stop))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream() -> Vec<u8> {
        [
            &[0, 0, 0, 1, 0x67, 0x42, 0xc0, 0x1f][..],
            &[0, 0, 0, 1, 0x68, 0xce, 0x3c, 0x80],
            &[0, 0, 1, 0x65, 0x88, 0x84],
            &[0, 0, 1, 0x41, 0x9a, 0x02],
            &[0, 0, 1, 0x06, 0x05],
            &[0, 0, 1, 0x41, 0x9a, 0x03],
        ]
        .concat()
    }

    #[test]
    fn units_close_after_each_picture() {
        let units = group_access_units(nal::extract(Codec::H264, &stream()));
        let sizes: Vec<usize> = units.iter().map(Vec::len).collect();
        assert_eq!(sizes, [3, 1, 2]);
        assert!(units[0][2].is_keyframe());
    }

    #[test]
    fn trailing_non_picture_nal_forms_a_unit() {
        let mut data = stream();
        data.extend_from_slice(&[0, 0, 1, 0x06, 0x01]);
        let units = group_access_units(nal::extract(Codec::H264, &data));
        assert_eq!(units.len(), 4);
    }

    #[test]
    fn run_without_loop_publishes_every_frame() {
        let server = Server::new(rtsp::ServerConfig::default().bind("127.0.0.1:0"));
        let feeder = Feeder::from_annexb(Codec::H264, &stream(), 1000.0, false);
        feeder.run(&server, &AtomicBool::new(false));

        assert_eq!(server.stats().access_units_received, 3);
        assert!(server.codec_config().unwrap().is_complete());
    }
}
