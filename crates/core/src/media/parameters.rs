use std::sync::Arc;

use arc_swap::ArcSwapOption;

use super::{Codec, CodecConfig, NalKind, NalUnit, ParameterSets};

/// Shared holder of the current [`CodecConfig`].
///
/// Readers get an immutable `Arc` snapshot and never observe a half-updated
/// config. Writers build a new config and swap it in; updates that would not
/// change anything are skipped so a parameter set repeated on every keyframe
/// does not churn the snapshot.
#[derive(Debug, Default)]
pub struct CodecConfigStore {
    current: ArcSwapOption<CodecConfig>,
}

impl CodecConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current snapshot, if any parameter set has been seen.
    pub fn snapshot(&self) -> Option<Arc<CodecConfig>> {
        self.current.load_full()
    }

    /// Current snapshot only when it is complete enough for SDP and SETUP.
    pub fn ready(&self) -> Option<Arc<CodecConfig>> {
        self.snapshot().filter(|c| c.is_complete())
    }

    /// Replace the whole config (the out-of-band "codec ready" event).
    pub fn replace(&self, config: CodecConfig) {
        tracing::info!(
            codec = %config.codec,
            complete = config.is_complete(),
            "codec config replaced"
        );
        self.current.store(Some(Arc::new(config)));
    }

    /// Fold parameter-set NAL units seen in the stream into the config.
    ///
    /// Last write wins per slot. A codec different from the current one
    /// starts a fresh config. Returns `true` when the snapshot changed.
    pub fn observe(&self, codec: Codec, nal_units: &[NalUnit]) -> bool {
        if !nal_units.iter().any(NalUnit::is_parameter_set) {
            return false;
        }

        let mut changed = false;
        self.current.rcu(|current| {
            let mut next = match current.as_deref() {
                Some(cfg) if cfg.codec == codec => cfg.clone(),
                _ => CodecConfig::new(codec),
            };
            merge(&mut next.parameter_sets, nal_units);

            if current.as_deref() == Some(&next) {
                changed = false;
                current.clone()
            } else {
                changed = true;
                Some(Arc::new(next))
            }
        });

        if changed {
            tracing::debug!(%codec, "parameter sets updated from stream");
        }
        changed
    }
}

fn merge(sets: &mut ParameterSets, nal_units: &[NalUnit]) {
    for nal in nal_units {
        let slot = match nal.kind {
            NalKind::Vps => &mut sets.vps,
            NalKind::Sps => &mut sets.sps,
            NalKind::Pps => &mut sets.pps,
            _ => continue,
        };
        if slot.as_deref() != Some(nal.data.as_slice()) {
            *slot = Some(nal.data.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nal(codec: Codec, bytes: &[u8]) -> NalUnit {
        NalUnit::new(codec, bytes.to_vec())
    }

    #[test]
    fn empty_store_is_not_ready() {
        let store = CodecConfigStore::new();
        assert!(store.snapshot().is_none());
        assert!(store.ready().is_none());
    }

    #[test]
    fn observe_collects_parameter_sets() {
        let store = CodecConfigStore::new();
        assert!(store.observe(Codec::H264, &[nal(Codec::H264, &[0x67, 0x42])]));
        assert!(store.ready().is_none(), "PPS still missing");

        assert!(store.observe(Codec::H264, &[nal(Codec::H264, &[0x68, 0xce])]));
        let cfg = store.ready().unwrap();
        assert_eq!(cfg.parameter_sets.sps.as_deref(), Some(&[0x67, 0x42][..]));
        assert_eq!(cfg.parameter_sets.pps.as_deref(), Some(&[0x68, 0xce][..]));
    }

    #[test]
    fn repeated_sets_do_not_swap() {
        let store = CodecConfigStore::new();
        let sets = [nal(Codec::H264, &[0x67, 0x42]), nal(Codec::H264, &[0x68, 0xce])];
        assert!(store.observe(Codec::H264, &sets));
        let before = store.snapshot().unwrap();
        assert!(!store.observe(Codec::H264, &sets));
        assert!(Arc::ptr_eq(&before, &store.snapshot().unwrap()));
    }

    #[test]
    fn last_write_wins() {
        let store = CodecConfigStore::new();
        store.observe(Codec::H264, &[nal(Codec::H264, &[0x67, 0x42, 0x00, 0x1e])]);
        store.observe(Codec::H264, &[nal(Codec::H264, &[0x67, 0x64, 0x00, 0x28])]);
        let cfg = store.snapshot().unwrap();
        assert_eq!(
            cfg.parameter_sets.sps.as_deref(),
            Some(&[0x67, 0x64, 0x00, 0x28][..])
        );
    }

    #[test]
    fn old_snapshot_survives_replacement() {
        let store = CodecConfigStore::new();
        store.observe(Codec::H264, &[nal(Codec::H264, &[0x67, 0x01])]);
        let old = store.snapshot().unwrap();
        store.observe(Codec::H264, &[nal(Codec::H264, &[0x67, 0x02])]);
        assert_eq!(old.parameter_sets.sps.as_deref(), Some(&[0x67, 0x01][..]));
    }

    #[test]
    fn codec_change_starts_fresh() {
        let store = CodecConfigStore::new();
        store.observe(
            Codec::H264,
            &[nal(Codec::H264, &[0x67, 0x42]), nal(Codec::H264, &[0x68, 0xce])],
        );
        store.observe(Codec::H265, &[nal(Codec::H265, &[0x40, 0x01])]);
        let cfg = store.snapshot().unwrap();
        assert_eq!(cfg.codec, Codec::H265);
        assert!(cfg.parameter_sets.sps.is_none());
        assert!(cfg.parameter_sets.vps.is_some());
    }

    #[test]
    fn non_parameter_units_are_ignored() {
        let store = CodecConfigStore::new();
        assert!(!store.observe(Codec::H264, &[nal(Codec::H264, &[0x65, 0x88])]));
        assert!(store.snapshot().is_none());
    }

    #[test]
    fn replace_sets_whole_config() {
        let store = CodecConfigStore::new();
        let mut cfg = CodecConfig::new(Codec::H264);
        cfg.parameter_sets.sps = Some(vec![0x67]);
        cfg.parameter_sets.pps = Some(vec![0x68]);
        store.replace(cfg.clone());
        assert_eq!(*store.ready().unwrap(), cfg);
    }
}
