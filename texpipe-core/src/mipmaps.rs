//! Mip generation profiles.
//!
//! A [`MipGenerationProfile`] carries the resampling policy of one texture
//! type. [`generate_chain`] turns a base image into a full mip chain under
//! that policy:
//!
//! - **Gamma**: color lanes are linearized (`v^gamma`) before filtering
//! - **Normals**: decoded to [-1, 1], filtered, renormalized, re-encoded
//! - **Energy preserving**: roughness (or `1 - gloss`) is averaged squared
//! - **Modifiers**: applied in order to every level below the base

use crate::compression::CompressionSettings;
use crate::image_loading::TextureType;
use crate::resample::{resample, ResampleFilter, WrapMode};
use crate::texture::FloatImage;
use crate::validation::{check_range, Issue, Validate};
use serde::{Deserialize, Serialize};

/// Post-resample modifier, applied to mip levels 1 and below
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MipModifier {
    /// Unsharp mask against a 3x3 box blur (strength 0..=2)
    Sharpen { strength: f32 },
    /// Clamp every color lane into [min, max]
    Clamp { min: f32, max: f32 },
    /// Fade color lanes towards `value`, fully reached at `end_level`
    FadeTo {
        value: f32,
        start_level: u32,
        end_level: u32,
    },
}

/// Per-texture-type resampling policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MipGenerationProfile {
    pub texture_type: TextureType,
    pub filter: ResampleFilter,
    pub apply_gamma_correction: bool,
    pub gamma: f32,
    /// Kernel width multiplier (1.0 = nominal)
    pub blur_radius: f32,
    /// Only honored for normal maps
    pub normalize_normals: bool,
    /// Only honored for roughness / gloss
    pub use_energy_preserving: bool,
    pub is_gloss: bool,
    pub min_mip_size: u32,
    pub modifiers: Vec<MipModifier>,
}

impl Default for MipGenerationProfile {
    fn default() -> Self {
        Self::for_type(TextureType::Generic)
    }
}

impl MipGenerationProfile {
    /// Profile with the policy appropriate to `texture_type`.
    pub fn for_type(texture_type: TextureType) -> Self {
        let base = Self {
            texture_type,
            filter: ResampleFilter::Kaiser,
            apply_gamma_correction: false,
            gamma: 2.2,
            blur_radius: 1.0,
            normalize_normals: false,
            use_energy_preserving: false,
            is_gloss: false,
            min_mip_size: 1,
            modifiers: Vec::new(),
        };

        match texture_type {
            TextureType::Albedo | TextureType::Emissive => Self {
                apply_gamma_correction: true,
                ..base
            },
            TextureType::Normal => Self {
                normalize_normals: true,
                ..base
            },
            TextureType::Roughness => Self {
                use_energy_preserving: true,
                ..base
            },
            TextureType::Gloss => Self {
                use_energy_preserving: true,
                is_gloss: true,
                ..base
            },
            // Metalness is mostly binary; a wide kernel would invent mid values
            TextureType::Metallic => Self {
                filter: ResampleFilter::Box,
                ..base
            },
            TextureType::AmbientOcclusion | TextureType::Generic => base,
        }
    }

    pub fn with_filter(mut self, filter: ResampleFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_modifier(mut self, modifier: MipModifier) -> Self {
        self.modifiers.push(modifier);
        self
    }

    fn gamma_active(&self) -> bool {
        self.apply_gamma_correction && self.texture_type != TextureType::Normal
    }

    fn normalizes_normals(&self) -> bool {
        self.normalize_normals && self.texture_type == TextureType::Normal
    }

    fn energy_preserving(&self) -> bool {
        self.use_energy_preserving
            && matches!(self.texture_type, TextureType::Roughness | TextureType::Gloss)
    }
}

impl Validate for MipGenerationProfile {
    fn collect_issues(&self, issues: &mut Vec<Issue>) {
        if self.apply_gamma_correction {
            check_range(issues, "gamma", self.gamma, 1.0, 3.0);
        }
        check_range(issues, "blur_radius", self.blur_radius, 0.25, 4.0);
        if self.min_mip_size == 0 {
            issues.push(Issue::new("min_mip_size", "must be at least 1"));
        }
        for (i, modifier) in self.modifiers.iter().enumerate() {
            let field = format!("modifiers[{}]", i);
            match *modifier {
                MipModifier::Sharpen { strength } => {
                    check_range(issues, &field, strength, 0.0, 2.0)
                }
                MipModifier::Clamp { min, max } => {
                    if !(0.0..=1.0).contains(&min) || !(0.0..=1.0).contains(&max) || min > max {
                        issues.push(Issue::new(field, "clamp needs 0 <= min <= max <= 1"));
                    }
                }
                MipModifier::FadeTo {
                    value,
                    start_level,
                    end_level,
                } => {
                    check_range(issues, &field, value, 0.0, 1.0);
                    if start_level > end_level {
                        issues.push(Issue::new(field, "fade start_level is after end_level"));
                    }
                }
            }
        }
    }
}

/// Number of mip levels for a `width` x `height` base.
///
/// The full chain drills down to 1x1. `include_last_level == false` drops
/// the final level. Levels whose larger side falls below `smallest_dimension`
/// are dropped afterwards, so the floor wins when both constrain.
pub fn mip_level_count(
    width: u32,
    height: u32,
    include_last_level: bool,
    smallest_dimension: u32,
) -> u32 {
    let largest = width.max(height).max(1);
    let full = 32 - largest.leading_zeros();
    let mut count = if include_last_level { full } else { full - 1 };

    let floor = smallest_dimension.max(1);
    while count > 1 && (largest >> (count - 1)).max(1) < floor {
        count -= 1;
    }
    count.max(1)
}

/// Mip level decisions taken from the compression settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MipLevelPolicy {
    pub enabled: bool,
    pub include_last_level: bool,
    pub smallest_dimension: u32,
}

impl MipLevelPolicy {
    pub fn from_settings(settings: &CompressionSettings) -> Self {
        Self {
            enabled: settings.mipmaps_enabled(),
            include_last_level: settings.include_last_level,
            smallest_dimension: settings.mip_smallest_dimension,
        }
    }

    /// Level count honoring the profile's own minimum size as well.
    pub fn level_count(&self, width: u32, height: u32, min_mip_size: u32) -> u32 {
        if !self.enabled {
            return 1;
        }
        mip_level_count(
            width,
            height,
            self.include_last_level,
            self.smallest_dimension.max(min_mip_size),
        )
    }
}

/// A base image plus its successively halved levels
#[derive(Debug, Clone, PartialEq)]
pub struct MipChain {
    pub levels: Vec<FloatImage>,
}

impl MipChain {
    pub fn single(base: FloatImage) -> Self {
        Self { levels: vec![base] }
    }

    pub fn base(&self) -> &FloatImage {
        &self.levels[0]
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }
}

pub(crate) fn next_level_size(width: u32, height: u32) -> (u32, u32) {
    ((width >> 1).max(1), (height >> 1).max(1))
}

/// Builds `level_count` levels from `base` under `profile`.
pub fn generate_chain(
    base: &FloatImage,
    profile: &MipGenerationProfile,
    wrap: WrapMode,
    level_count: u32,
) -> MipChain {
    let mut levels = Vec::with_capacity(level_count.max(1) as usize);
    levels.push(base.clone());

    let mut work = to_working(base, profile);
    for level in 1..level_count {
        let (w, h) = next_level_size(work.width, work.height);
        if w == work.width && h == work.height {
            break;
        }
        work = resample(&work, w, h, profile.filter, profile.blur_radius, wrap);
        clamp_working(&mut work, profile);

        let mut stored = from_working(&work, profile);
        apply_modifiers(&mut stored, &profile.modifiers, level);
        levels.push(stored);
    }

    MipChain { levels }
}

/// Moves an image into the space it is filtered in.
fn to_working(img: &FloatImage, profile: &MipGenerationProfile) -> FloatImage {
    let mut out = img.clone();
    let color = out.color_channels();
    let ch = out.channels;

    if profile.texture_type == TextureType::Normal {
        for px in out.data.chunks_exact_mut(ch) {
            for v in &mut px[..color.min(3)] {
                *v = *v * 2.0 - 1.0;
            }
        }
        if profile.normalizes_normals() {
            renormalize(&mut out);
        }
    } else if profile.energy_preserving() {
        for px in out.data.chunks_exact_mut(ch) {
            for v in &mut px[..color] {
                let roughness = if profile.is_gloss { 1.0 - *v } else { *v };
                *v = roughness * roughness;
            }
        }
    } else if profile.gamma_active() {
        for px in out.data.chunks_exact_mut(ch) {
            for v in &mut px[..color] {
                *v = v.max(0.0).powf(profile.gamma);
            }
        }
    }
    out
}

fn clamp_working(img: &mut FloatImage, profile: &MipGenerationProfile) {
    if profile.texture_type == TextureType::Normal {
        let color = img.color_channels().min(3);
        let ch = img.channels;
        for px in img.data.chunks_exact_mut(ch) {
            for v in &mut px[..color] {
                *v = v.clamp(-1.0, 1.0);
            }
            for v in &mut px[color..] {
                *v = v.clamp(0.0, 1.0);
            }
        }
        if profile.normalizes_normals() {
            renormalize(img);
        }
    } else {
        img.clamp_unit();
    }
}

/// Inverse of [`to_working`].
fn from_working(work: &FloatImage, profile: &MipGenerationProfile) -> FloatImage {
    let mut out = work.clone();
    let color = out.color_channels();
    let ch = out.channels;

    if profile.texture_type == TextureType::Normal {
        for px in out.data.chunks_exact_mut(ch) {
            for v in &mut px[..color.min(3)] {
                *v = (*v * 0.5 + 0.5).clamp(0.0, 1.0);
            }
        }
    } else if profile.energy_preserving() {
        for px in out.data.chunks_exact_mut(ch) {
            for v in &mut px[..color] {
                let roughness = v.max(0.0).sqrt();
                *v = if profile.is_gloss { 1.0 - roughness } else { roughness };
            }
        }
    } else if profile.gamma_active() {
        let inv = 1.0 / profile.gamma;
        for px in out.data.chunks_exact_mut(ch) {
            for v in &mut px[..color] {
                *v = v.max(0.0).powf(inv);
            }
        }
    }
    out.clamp_unit();
    out
}

/// Rescales the xyz lanes of a decoded normal map to unit length.
pub(crate) fn renormalize(img: &mut FloatImage) {
    let ch = img.channels;
    if ch < 3 {
        return;
    }
    for px in img.data.chunks_exact_mut(ch) {
        let len = (px[0] * px[0] + px[1] * px[1] + px[2] * px[2]).sqrt();
        if len > 1e-6 {
            px[0] /= len;
            px[1] /= len;
            px[2] /= len;
        } else {
            px[0] = 0.0;
            px[1] = 0.0;
            px[2] = 1.0;
        }
    }
}

fn apply_modifiers(img: &mut FloatImage, modifiers: &[MipModifier], level: u32) {
    for modifier in modifiers {
        match *modifier {
            MipModifier::Sharpen { strength } => sharpen(img, strength),
            MipModifier::Clamp { min, max } => {
                let color = img.color_channels();
                let ch = img.channels;
                for px in img.data.chunks_exact_mut(ch) {
                    for v in &mut px[..color] {
                        *v = v.clamp(min, max);
                    }
                }
            }
            MipModifier::FadeTo {
                value,
                start_level,
                end_level,
            } => {
                let t = if end_level == start_level {
                    if level >= start_level {
                        1.0
                    } else {
                        0.0
                    }
                } else {
                    ((level as f32 - start_level as f32) / (end_level - start_level) as f32)
                        .clamp(0.0, 1.0)
                };
                if t > 0.0 {
                    let color = img.color_channels();
                    let ch = img.channels;
                    for px in img.data.chunks_exact_mut(ch) {
                        for v in &mut px[..color] {
                            *v += (value - *v) * t;
                        }
                    }
                }
            }
        }
    }
}

fn sharpen(img: &mut FloatImage, strength: f32) {
    if strength <= 0.0 || img.width < 3 || img.height < 3 {
        return;
    }
    let src = img.clone();
    let color = img.color_channels();
    for y in 0..img.height {
        for x in 0..img.width {
            for c in 0..color {
                let mut sum = 0.0;
                for dy in -1i64..=1 {
                    for dx in -1i64..=1 {
                        let sx = WrapMode::Clamp.resolve(x as i64 + dx, src.width) as u32;
                        let sy = WrapMode::Clamp.resolve(y as i64 + dy, src.height) as u32;
                        sum += src.get(sx, sy, c);
                    }
                }
                let v = src.get(x, y, c);
                let sharpened = v + strength * (v - sum / 9.0);
                img.set(x, y, c, sharpened.clamp(0.0, 1.0));
            }
        }
    }
}
