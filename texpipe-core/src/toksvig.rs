//! Toksvig gloss correction.
//!
//! Averaging many differently oriented normals into one texel shortens the
//! averaged vector. That loss of length measures how rough the surface looks
//! from a distance, so coarser mip levels of a gloss (or roughness) map are
//! made less glossy accordingly. This suppresses specular sparkle.

use crate::image_loading::ImageLoader;
use crate::mipmaps::{renormalize, MipChain};
use crate::resample::{resample, ResampleFilter, WrapMode};
use crate::texture::FloatImage;
use crate::validation::{check_range, Issue, Validate};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, warn};

/// Scale from normal variance to gloss loss
pub const VARIANCE_SCALE: f32 = 2.0;

/// Variance estimation strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ToksvigMode {
    /// 3x3 window (Gaussian weighted when smoothing), power curve
    #[default]
    Classic,
    /// Pre-normalized normals, 2x2 window, dead zone, linear curve
    Simplified,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToksvigSettings {
    pub enabled: bool,
    /// Exponent (classic) or slope (simplified) of the correction, 0.5..=8.0
    pub composite_power: f32,
    /// First mip level that gets corrected
    pub min_mip_level: u32,
    pub smooth_variance: bool,
    pub mode: ToksvigMode,
    /// Simplified mode treats variance below this as zero, 0.0..=1.0
    pub variance_threshold: f32,
}

impl Default for ToksvigSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            composite_power: 1.0,
            min_mip_level: 1,
            smooth_variance: true,
            mode: ToksvigMode::Classic,
            variance_threshold: 0.002,
        }
    }
}

impl ToksvigSettings {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Gloss multiplier for a normal variance in [0, 1].
    pub fn gloss_factor(&self, variance: f32) -> f32 {
        let variance = variance.clamp(0.0, 1.0);
        match self.mode {
            ToksvigMode::Classic => (1.0 - VARIANCE_SCALE * variance)
                .max(0.0)
                .powf(self.composite_power),
            ToksvigMode::Simplified => {
                let variance = if variance < self.variance_threshold {
                    0.0
                } else {
                    variance
                };
                (1.0 - VARIANCE_SCALE * variance * self.composite_power).clamp(0.0, 1.0)
            }
        }
    }
}

impl Validate for ToksvigSettings {
    fn collect_issues(&self, issues: &mut Vec<Issue>) {
        check_range(issues, "composite_power", self.composite_power, 0.5, 8.0);
        check_range(
            issues,
            "variance_threshold",
            self.variance_threshold,
            0.0,
            1.0,
        );
    }
}

/// Applies [`ToksvigSettings`] to a gloss or roughness mip chain
#[derive(Debug, Clone)]
pub struct ToksvigCorrector {
    settings: ToksvigSettings,
}

impl ToksvigCorrector {
    pub fn new(settings: ToksvigSettings) -> crate::Result<Self> {
        settings.validate()?;
        Ok(Self { settings })
    }

    pub fn settings(&self) -> &ToksvigSettings {
        &self.settings
    }

    /// Loads a normal map for correction. Failures are logged and yield `None`
    /// so the caller passes its chain through unchanged.
    pub fn load_normal_map(path: &Path) -> Option<FloatImage> {
        match ImageLoader::load_texture(path) {
            Ok(map) => Some(FloatImage::from_texture(&map, 3)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Normal map unreadable, skipping Toksvig correction");
                None
            }
        }
    }

    /// Corrects every level at or beyond `min_mip_level` in place.
    ///
    /// `normal` is the full-resolution encoded normal map (RGB in [0, 1]).
    /// Returns whether any level was touched.
    pub fn apply(&self, chain: &mut MipChain, normal: &FloatImage, is_gloss: bool) -> bool {
        if !self.settings.enabled || normal.channels < 3 {
            return false;
        }

        let decoded = self.decode(normal);
        let mut applied = false;

        for (level, image) in chain.levels.iter_mut().enumerate() {
            if (level as u32) < self.settings.min_mip_level {
                continue;
            }
            let variance = self.variance_map(&decoded, image.width, image.height);
            let color = image.color_channels();
            let ch = image.channels;

            for (px, &v) in image.data.chunks_exact_mut(ch).zip(variance.iter()) {
                let factor = self.settings.gloss_factor(v);
                for value in &mut px[..color] {
                    *value = if is_gloss {
                        (*value * factor).clamp(0.0, 1.0)
                    } else {
                        (1.0 - (1.0 - *value) * factor).clamp(0.0, 1.0)
                    };
                }
            }
            applied = true;
        }

        if applied {
            debug!(
                levels = chain.len(),
                mode = ?self.settings.mode,
                "Applied Toksvig correction"
            );
        }
        applied
    }

    /// Decodes RGB into xyz in [-1, 1]; only simplified mode renormalizes.
    fn decode(&self, normal: &FloatImage) -> FloatImage {
        let mut out = FloatImage::new(normal.width, normal.height, 3);
        for (dst, src) in out
            .data
            .chunks_exact_mut(3)
            .zip(normal.data.chunks_exact(normal.channels))
        {
            for c in 0..3 {
                dst[c] = src[c] * 2.0 - 1.0;
            }
        }
        if self.settings.mode == ToksvigMode::Simplified {
            renormalize(&mut out);
        }
        out
    }

    /// Per-texel variance `1 - |avg normal|` at `width` x `height`.
    fn variance_map(&self, decoded: &FloatImage, width: u32, height: u32) -> Vec<f32> {
        let level = resample(decoded, width, height, ResampleFilter::Box, 1.0, WrapMode::Clamp);

        let window: &[(i64, i64, f32)] = match (self.settings.mode, self.settings.smooth_variance) {
            (ToksvigMode::Simplified, _) => &[(0, 0, 1.0), (1, 0, 1.0), (0, 1, 1.0), (1, 1, 1.0)],
            (ToksvigMode::Classic, true) => &GAUSSIAN_3X3,
            (ToksvigMode::Classic, false) => &BOX_3X3,
        };
        let total: f32 = window.iter().map(|w| w.2).sum();

        let mut variance = Vec::with_capacity(level.pixel_count());
        for y in 0..height {
            for x in 0..width {
                let mut avg = [0.0f32; 3];
                for &(dx, dy, w) in window {
                    let sx = WrapMode::Clamp.resolve(x as i64 + dx, width) as u32;
                    let sy = WrapMode::Clamp.resolve(y as i64 + dy, height) as u32;
                    for (c, a) in avg.iter_mut().enumerate() {
                        *a += level.get(sx, sy, c) * w;
                    }
                }
                let len = (avg[0] * avg[0] + avg[1] * avg[1] + avg[2] * avg[2]).sqrt() / total;
                variance.push((1.0 - len).clamp(0.0, 1.0));
            }
        }
        variance
    }
}

const BOX_3X3: [(i64, i64, f32); 9] = [
    (-1, -1, 1.0),
    (0, -1, 1.0),
    (1, -1, 1.0),
    (-1, 0, 1.0),
    (0, 0, 1.0),
    (1, 0, 1.0),
    (-1, 1, 1.0),
    (0, 1, 1.0),
    (1, 1, 1.0),
];

const GAUSSIAN_3X3: [(i64, i64, f32); 9] = [
    (-1, -1, 1.0),
    (0, -1, 2.0),
    (1, -1, 1.0),
    (-1, 0, 2.0),
    (0, 0, 4.0),
    (1, 0, 2.0),
    (-1, 1, 1.0),
    (0, 1, 2.0),
    (1, 1, 1.0),
];
