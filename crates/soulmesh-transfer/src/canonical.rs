//! Audio variants, transcode detection and canonical selection.

use serde::{Deserialize, Serialize};

/// Lossless sources declaring less than this share of their implied PCM
/// bitrate are transcode suspects.
pub const TRANSCODE_BITRATE_RATIO: f64 = 0.35;

const DEFAULT_CHANNELS: u8 = 2;
const DEFAULT_BIT_DEPTH: u8 = 16;

pub fn is_lossless_codec(codec: &str) -> bool {
    matches!(
        codec.to_ascii_lowercase().as_str(),
        "flac" | "alac" | "wav" | "pcm" | "aiff" | "ape" | "wavpack" | "wv"
    )
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioVariant {
    pub variant_id: String,
    pub recording_id: String,
    pub codec: String,
    pub sample_rate_hz: u32,
    pub bit_depth: Option<u8>,
    pub channels: Option<u8>,
    pub bitrate_kbps: u32,
    /// 0..=1
    pub quality_score: f64,
    pub seen_count: u64,
    pub transcode_suspect: bool,
    pub transcode_reason: Option<String>,
}

impl AudioVariant {
    /// Build a variant and assess it: transcode check, then quality.
    pub fn new(
        variant_id: impl Into<String>,
        recording_id: impl Into<String>,
        codec: impl Into<String>,
        sample_rate_hz: u32,
        bit_depth: Option<u8>,
        bitrate_kbps: u32,
    ) -> Self {
        let mut v = Self {
            variant_id: variant_id.into(),
            recording_id: recording_id.into(),
            codec: codec.into(),
            sample_rate_hz,
            bit_depth,
            channels: None,
            bitrate_kbps,
            quality_score: 0.0,
            seen_count: 1,
            transcode_suspect: false,
            transcode_reason: None,
        };
        v.assess();
        v
    }

    pub fn with_channels(mut self, channels: u8) -> Self {
        self.channels = Some(channels);
        self.assess();
        self
    }

    pub fn with_seen_count(mut self, seen: u64) -> Self {
        self.seen_count = seen;
        self
    }

    /// Override the assessed quality, e.g. with an external scorer's value.
    pub fn with_quality(mut self, quality: f64) -> Self {
        self.quality_score = quality.clamp(0.0, 1.0);
        self
    }

    fn assess(&mut self) {
        self.transcode_reason = detect_transcode(self);
        self.transcode_suspect = self.transcode_reason.is_some();
        self.quality_score = estimate_quality(self);
    }

    /// Bitrate implied by uncompressed PCM at the declared format.
    pub fn pcm_kbps(&self) -> f64 {
        let depth = self.bit_depth.unwrap_or(DEFAULT_BIT_DEPTH) as f64;
        let channels = self.channels.unwrap_or(DEFAULT_CHANNELS) as f64;
        self.sample_rate_hz as f64 * depth * channels / 1000.0
    }

    pub fn is_lossless(&self) -> bool {
        is_lossless_codec(&self.codec)
    }
}

/// Reason string when `variant` looks re-encoded from a lossy source.
pub fn detect_transcode(variant: &AudioVariant) -> Option<String> {
    if !variant.is_lossless() || variant.bitrate_kbps == 0 || variant.sample_rate_hz == 0 {
        return None;
    }
    let pcm = variant.pcm_kbps();
    let floor = pcm * TRANSCODE_BITRATE_RATIO;
    (f64::from(variant.bitrate_kbps) < floor).then(|| {
        format!(
            "declared bitrate {} kbps is below {:.0} kbps ({}% of {:.0} kbps PCM) for {}",
            variant.bitrate_kbps,
            floor,
            (TRANSCODE_BITRATE_RATIO * 100.0) as u32,
            pcm,
            variant.codec
        )
    })
}

/// Heuristic 0..=1 quality.
pub fn estimate_quality(variant: &AudioVariant) -> f64 {
    let kbps = f64::from(variant.bitrate_kbps);
    if variant.is_lossless() && detect_transcode(variant).is_none() {
        let pcm = variant.pcm_kbps();
        let density = if pcm > 0.0 && kbps > 0.0 {
            (kbps / (0.5 * pcm)).min(1.0)
        } else {
            0.5
        };
        let hires = if variant.bit_depth.unwrap_or(DEFAULT_BIT_DEPTH) >= 24 || variant.sample_rate_hz >= 88_200 {
            0.05
        } else {
            0.0
        };
        return (0.85 + 0.1 * density + hires).min(1.0);
    }
    if variant.is_lossless() {
        // Suspect: worth about what its bitrate would be as lossy.
        return 0.5 * (kbps / 320.0).min(1.0);
    }
    let (reference, ceiling) = match variant.codec.to_ascii_lowercase().as_str() {
        "opus" => (192.0, 0.8),
        "aac" | "m4a" | "vorbis" | "ogg" => (256.0, 0.78),
        _ => (320.0, 0.75),
    };
    ceiling * (kbps / reference).min(1.0)
}

/// Most prevalent non-suspect variant, ties broken by quality then id.
pub fn select_canonical(variants: &[AudioVariant]) -> Option<&AudioVariant> {
    variants
        .iter()
        .filter(|v| !v.transcode_suspect)
        .max_by(|a, b| {
            a.seen_count
                .cmp(&b.seen_count)
                .then_with(|| a.quality_score.total_cmp(&b.quality_score))
                .then_with(|| b.variant_id.cmp(&a.variant_id))
        })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalStats {
    pub recording_id: String,
    pub variant_count: usize,
    pub transcode_suspects: usize,
    pub canonical: Option<AudioVariant>,
}

impl CanonicalStats {
    pub fn compute(recording_id: impl Into<String>, variants: &[AudioVariant]) -> Self {
        Self {
            recording_id: recording_id.into(),
            variant_count: variants.len(),
            transcode_suspects: variants.iter().filter(|v| v.transcode_suspect).count(),
            canonical: select_canonical(variants).cloned(),
        }
    }
}

/// Whole-library summary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LibraryHealth {
    pub recordings: usize,
    pub variants: usize,
    pub transcode_suspects: usize,
    pub lossless_variants: usize,
    /// Recordings with no usable canonical variant.
    pub recordings_without_canonical: usize,
    /// 0..=1; 0 for an empty library.
    pub lossless_share: f64,
}

impl LibraryHealth {
    /// `recordings` yields each recording's variants.
    pub fn summarize<'a, I>(recordings: I) -> Self
    where
        I: IntoIterator<Item = &'a [AudioVariant]>,
    {
        let mut health = LibraryHealth::default();
        for variants in recordings {
            health.recordings += 1;
            health.variants += variants.len();
            health.transcode_suspects += variants.iter().filter(|v| v.transcode_suspect).count();
            health.lossless_variants += variants
                .iter()
                .filter(|v| v.is_lossless() && !v.transcode_suspect)
                .count();
            if select_canonical(variants).is_none() {
                health.recordings_without_canonical += 1;
            }
        }
        if health.variants > 0 {
            health.lossless_share = health.lossless_variants as f64 / health.variants as f64;
        }
        health
    }
}
