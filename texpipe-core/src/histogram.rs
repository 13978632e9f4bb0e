//! Histogram range normalization.
//!
//! Stretches the `[lo, hi]` percentile range of a texture to `[0, 1]` before
//! encoding so the encoder spends its quantization budget on values that
//! actually occur. The hard clamp variant is linear and can be undone on the
//! GPU with `original = sampled * scale + offset`; the soft knee variant
//! bends the ends of the range and cannot.

use crate::mipmaps::MipChain;
use crate::texture::FloatImage;
use crate::validation::{check_range, Issue, Validate};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Rec. 709 luma weights
const LUMA: [f32; 3] = [0.2126, 0.7152, 0.0722];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HistogramMode {
    #[default]
    Off,
    /// Linear remap with a hard clamp outside the percentile bounds
    Percentile,
    /// Linear remap with exponential roll-off near the bounds
    PercentileWithKnee,
    /// Reserved; rejected by validation
    LocalOutlier,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChannelAnalysis {
    /// One range from Rec. 709 luminance, shared by all color lanes
    #[default]
    Luminance,
    /// One range per color lane
    PerChannel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistogramSettings {
    pub mode: HistogramMode,
    pub channel_mode: ChannelAnalysis,
    pub percentile_low: f32,
    pub percentile_high: f32,
    /// Fraction of the output range given to each knee
    pub knee_width: f32,
    /// Ranges narrower than this are left alone
    pub min_range_threshold: f32,
    /// Ranges covering at least `1 - tail_fraction` are left alone
    pub tail_fraction: f32,
    /// Record the ranges without touching any texel
    pub metadata_only: bool,
}

impl Default for HistogramSettings {
    fn default() -> Self {
        Self {
            mode: HistogramMode::Off,
            channel_mode: ChannelAnalysis::Luminance,
            percentile_low: 5.0,
            percentile_high: 95.0,
            knee_width: 0.05,
            min_range_threshold: 0.02,
            tail_fraction: 0.02,
            metadata_only: false,
        }
    }
}

impl HistogramSettings {
    pub fn percentile() -> Self {
        Self {
            mode: HistogramMode::Percentile,
            ..Self::default()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.mode != HistogramMode::Off
    }
}

impl Validate for HistogramSettings {
    fn collect_issues(&self, issues: &mut Vec<Issue>) {
        if self.mode == HistogramMode::LocalOutlier {
            issues.push(Issue::new("mode", "local_outlier is reserved and not supported"));
        }
        if !self.is_enabled() {
            return;
        }

        check_range(issues, "percentile_low", self.percentile_low, 0.0, 100.0);
        check_range(issues, "percentile_high", self.percentile_high, 0.0, 100.0);
        if self.percentile_low >= self.percentile_high {
            issues.push(Issue::new(
                "percentile_low",
                "must be lower than percentile_high",
            ));
        }
        check_range(issues, "min_range_threshold", self.min_range_threshold, 0.0, 1.0);
        check_range(issues, "tail_fraction", self.tail_fraction, 0.0, 0.5);

        if self.mode == HistogramMode::PercentileWithKnee {
            if !(self.knee_width > 0.0 && self.knee_width < 0.5) {
                issues.push(Issue::new("knee_width", "must be in (0, 0.5)"));
            }
            if self.metadata_only {
                issues.push(Issue::new(
                    "metadata_only",
                    "soft knee is not linearly invertible; use percentile mode",
                ));
            }
        }
    }
}

/// Range of one analyzed channel and its GPU inversion parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelNormalization {
    pub lo: f32,
    pub hi: f32,
    pub scale: f32,
    pub offset: f32,
}

impl ChannelNormalization {
    fn identity(lo: f32, hi: f32) -> Self {
        Self {
            lo,
            hi,
            scale: 1.0,
            offset: 0.0,
        }
    }

    fn remap(lo: f32, hi: f32) -> Self {
        Self {
            lo,
            hi,
            scale: hi - lo,
            offset: lo,
        }
    }

    fn is_identity(&self) -> bool {
        self.scale == 1.0 && self.offset == 0.0
    }
}

/// Ranges found by [`analyze`]
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelRanges {
    pub channel_mode: ChannelAnalysis,
    /// One entry for luminance, one per color lane otherwise
    pub channels: Vec<ChannelNormalization>,
}

/// What normalization did to a texture
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizationMetadata {
    pub mode: HistogramMode,
    pub channel_mode: ChannelAnalysis,
    pub channels: Vec<ChannelNormalization>,
    /// Texels were rewritten
    pub remapped: bool,
    /// `sampled * scale + offset` restores the original inside `[lo, hi]`
    pub invertible: bool,
}

impl NormalizationMetadata {
    pub fn for_channel(&self, channel: usize) -> &ChannelNormalization {
        let i = channel.min(self.channels.len().saturating_sub(1));
        &self.channels[i]
    }

    /// GPU side inversion of one sampled value.
    pub fn denormalize(&self, channel: usize, sampled: f32) -> f32 {
        let n = self.for_channel(channel);
        sampled * n.scale + n.offset
    }
}

/// Exact percentile (`0..=100`) with linear interpolation between ranks.
pub fn percentile(sorted: &[f32], p: f32) -> f32 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        n => {
            let rank = (p.clamp(0.0, 100.0) / 100.0) as f64 * (n - 1) as f64;
            let below = rank.floor() as usize;
            let above = (below + 1).min(n - 1);
            let t = (rank - below as f64) as f32;
            sorted[below] + (sorted[above] - sorted[below]) * t
        }
    }
}

fn sorted_range(mut values: Vec<f32>, settings: &HistogramSettings) -> (f32, f32) {
    values.sort_by(f32::total_cmp);
    (
        percentile(&values, settings.percentile_low),
        percentile(&values, settings.percentile_high),
    )
}

fn worth_remapping(lo: f32, hi: f32, settings: &HistogramSettings) -> bool {
    let range = hi - lo;
    range >= settings.min_range_threshold && range < 1.0 - settings.tail_fraction
}

/// Computes the percentile ranges of `image`; `None` when nothing would change.
pub fn analyze(image: &FloatImage, settings: &HistogramSettings) -> Option<ChannelRanges> {
    if !settings.is_enabled() || image.pixel_count() == 0 {
        return None;
    }
    let color = image.color_channels();
    let ch = image.channels;

    let channels = match settings.channel_mode {
        ChannelAnalysis::Luminance => {
            let luma: Vec<f32> = image
                .data
                .chunks_exact(ch)
                .map(|px| {
                    if color >= 3 {
                        px[0] * LUMA[0] + px[1] * LUMA[1] + px[2] * LUMA[2]
                    } else {
                        px[0]
                    }
                })
                .collect();
            let (lo, hi) = sorted_range(luma, settings);
            if !worth_remapping(lo, hi, settings) {
                return None;
            }
            vec![ChannelNormalization::remap(lo, hi)]
        }
        ChannelAnalysis::PerChannel => {
            let ranges: Vec<ChannelNormalization> = (0..color)
                .map(|c| {
                    let values = image.data.chunks_exact(ch).map(|px| px[c]).collect();
                    let (lo, hi) = sorted_range(values, settings);
                    if worth_remapping(lo, hi, settings) {
                        ChannelNormalization::remap(lo, hi)
                    } else {
                        ChannelNormalization::identity(lo, hi)
                    }
                })
                .collect();
            if ranges.iter().all(ChannelNormalization::is_identity) {
                return None;
            }
            ranges
        }
    };

    Some(ChannelRanges {
        channel_mode: settings.channel_mode,
        channels,
    })
}

/// Exponential roll-off keeping slope 1 where it meets the linear part.
fn soft_knee(t: f32, knee: f32) -> f32 {
    if t < knee {
        knee * ((t - knee) / knee).exp()
    } else if t > 1.0 - knee {
        1.0 - knee * ((1.0 - knee - t) / knee).exp()
    } else {
        t
    }
}

fn remap_image(image: &mut FloatImage, ranges: &ChannelRanges, settings: &HistogramSettings) {
    let color = image.color_channels();
    let ch = image.channels;
    for px in image.data.chunks_exact_mut(ch) {
        for (c, v) in px[..color].iter_mut().enumerate() {
            let n = &ranges.channels[c.min(ranges.channels.len() - 1)];
            if n.is_identity() {
                continue;
            }
            let t = (*v - n.offset) / n.scale;
            *v = match settings.mode {
                HistogramMode::PercentileWithKnee => soft_knee(t, settings.knee_width),
                _ => t,
            }
            .clamp(0.0, 1.0);
        }
    }
}

/// Normalizes every level with the ranges of the base level.
pub fn normalize_chain(
    chain: &mut MipChain,
    settings: &HistogramSettings,
) -> Option<NormalizationMetadata> {
    let ranges = analyze(chain.levels.first()?, settings)?;

    if settings.metadata_only {
        let channels = ranges
            .channels
            .iter()
            .map(|n| ChannelNormalization::identity(n.lo, n.hi))
            .collect();
        return Some(NormalizationMetadata {
            mode: settings.mode,
            channel_mode: ranges.channel_mode,
            channels,
            remapped: false,
            invertible: true,
        });
    }

    for level in &mut chain.levels {
        remap_image(level, &ranges, settings);
    }
    debug!(
        channels = ranges.channels.len(),
        mode = ?settings.mode,
        "Normalized texture range"
    );

    Some(NormalizationMetadata {
        mode: settings.mode,
        channel_mode: ranges.channel_mode,
        channels: ranges.channels,
        remapped: true,
        invertible: settings.mode == HistogramMode::Percentile,
    })
}

/// Path of the metadata sidecar written next to `output`.
pub fn sidecar_path(output: &Path) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    output.with_file_name(format!("{}.histogram.json", stem))
}

/// Writes `<output stem>.histogram.json` for the GPU inversion.
pub fn write_sidecar(output: &Path, metadata: &NormalizationMetadata) -> Result<PathBuf> {
    let path = sidecar_path(output);
    let json = serde_json::to_string_pretty(metadata)?;
    std::fs::write(&path, json)?;
    Ok(path)
}
