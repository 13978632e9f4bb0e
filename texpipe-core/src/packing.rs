//! Channel packing.
//!
//! Combines up to four grayscale maps into the lanes of one RGBA texture:
//!
//! | Mode   | R  | G     | B        | A      |
//! |--------|----|-------|----------|--------|
//! | `Og`   | AO | Gloss | -        | -      |
//! | `Ogm`  | AO | Gloss | Metallic | -      |
//! | `Ogmh` | AO | Gloss | Metallic | Height |
//!
//! Every channel keeps its own mip profile, so AO and gloss can be filtered
//! differently. Channels are aligned to the largest source resolution before
//! any level is generated.

use crate::histogram::percentile;
use crate::image_loading::{find_paired_normal_map, ImageLoader, TextureType};
use crate::mipmaps::{generate_chain, MipChain, MipGenerationProfile, MipLevelPolicy};
use crate::resample::{resample, WrapMode};
use crate::texture::FloatImage;
use crate::toksvig::{ToksvigCorrector, ToksvigSettings};
use crate::validation::{check_range, collect_nested, Issue, Validate};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PackingMode {
    #[default]
    None,
    Og,
    Ogm,
    Ogmh,
}

impl PackingMode {
    /// Lanes the mode fills, with the channel type each one must carry.
    pub fn required_lanes(&self) -> &'static [(Lane, ChannelType)] {
        const OGMH: [(Lane, ChannelType); 4] = [
            (Lane::Red, ChannelType::AmbientOcclusion),
            (Lane::Green, ChannelType::Gloss),
            (Lane::Blue, ChannelType::Metallic),
            (Lane::Alpha, ChannelType::Height),
        ];
        match self {
            PackingMode::None => &[],
            PackingMode::Og => &OGMH[..2],
            PackingMode::Ogm => &OGMH[..3],
            PackingMode::Ogmh => &OGMH,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "none" => Some(PackingMode::None),
            "og" => Some(PackingMode::Og),
            "ogm" | "orm" => Some(PackingMode::Ogm),
            "ogmh" | "ormh" => Some(PackingMode::Ogmh),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    Red,
    Green,
    Blue,
    Alpha,
}

impl Lane {
    pub const ALL: [Lane; 4] = [Lane::Red, Lane::Green, Lane::Blue, Lane::Alpha];

    pub fn index(&self) -> usize {
        match self {
            Lane::Red => 0,
            Lane::Green => 1,
            Lane::Blue => 2,
            Lane::Alpha => 3,
        }
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Lane::Red => "red",
            Lane::Green => "green",
            Lane::Blue => "blue",
            Lane::Alpha => "alpha",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    AmbientOcclusion,
    Gloss,
    Metallic,
    Height,
}

impl ChannelType {
    /// Texture type whose mip profile the channel uses by default
    pub fn texture_type(&self) -> TextureType {
        match self {
            ChannelType::AmbientOcclusion => TextureType::AmbientOcclusion,
            ChannelType::Gloss => TextureType::Gloss,
            ChannelType::Metallic => TextureType::Metallic,
            ChannelType::Height => TextureType::Generic,
        }
    }

    /// Neutral value used when no source image is configured
    pub fn neutral_value(&self) -> f32 {
        match self {
            ChannelType::AmbientOcclusion => 1.0,
            ChannelType::Gloss | ChannelType::Height => 0.5,
            ChannelType::Metallic => 0.0,
        }
    }
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelType::AmbientOcclusion => "ambient_occlusion",
            ChannelType::Gloss => "gloss",
            ChannelType::Metallic => "metallic",
            ChannelType::Height => "height",
        };
        f.write_str(name)
    }
}

/// How AO mips are darkened relative to a plain average
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AoProcessingMode {
    #[default]
    None,
    /// `lerp(mean, min, bias)` over the footprint
    BiasedDarkening,
    /// `lerp(mean, percentile, bias)` over the footprint
    Percentile,
}

/// One packed lane's source and processing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSourceSettings {
    pub channel_type: ChannelType,
    #[serde(default)]
    pub source_path: Option<PathBuf>,
    /// Broadcast over the whole image when there is no source
    pub default_value: f32,
    #[serde(default)]
    pub apply_toksvig: bool,
    #[serde(default)]
    pub toksvig: ToksvigSettings,
    /// Overrides the normal map found by naming convention
    #[serde(default)]
    pub normal_map_path: Option<PathBuf>,
    #[serde(default)]
    pub ao_processing: AoProcessingMode,
    #[serde(default = "default_ao_bias")]
    pub ao_bias: f32,
    #[serde(default = "default_ao_percentile")]
    pub ao_percentile: f32,
    #[serde(default)]
    pub mip_profile: Option<MipGenerationProfile>,
}

fn default_ao_bias() -> f32 {
    0.5
}

fn default_ao_percentile() -> f32 {
    10.0
}

impl ChannelSourceSettings {
    pub fn new(channel_type: ChannelType) -> Self {
        Self {
            channel_type,
            source_path: None,
            default_value: channel_type.neutral_value(),
            apply_toksvig: false,
            toksvig: ToksvigSettings::default(),
            normal_map_path: None,
            ao_processing: AoProcessingMode::None,
            ao_bias: default_ao_bias(),
            ao_percentile: default_ao_percentile(),
            mip_profile: None,
        }
    }

    pub fn with_source(mut self, path: impl Into<PathBuf>) -> Self {
        self.source_path = Some(path.into());
        self
    }

    pub fn with_default(mut self, value: f32) -> Self {
        self.default_value = value;
        self
    }

    pub fn with_toksvig(mut self, settings: ToksvigSettings) -> Self {
        self.apply_toksvig = true;
        self.toksvig = settings;
        self
    }

    pub fn with_ao_processing(mut self, mode: AoProcessingMode, bias: f32) -> Self {
        self.ao_processing = mode;
        self.ao_bias = bias;
        self
    }

    pub fn profile(&self) -> MipGenerationProfile {
        self.mip_profile
            .clone()
            .unwrap_or_else(|| MipGenerationProfile::for_type(self.channel_type.texture_type()))
    }

    fn collect_issues(&self, lane: Lane, issues: &mut Vec<Issue>) {
        let field = |name: &str| format!("{}.{}", lane, name);

        check_range(issues, &field("default_value"), self.default_value, 0.0, 1.0);

        if self.apply_toksvig {
            if self.channel_type == ChannelType::Gloss {
                collect_nested(&self.toksvig, &field("toksvig"), issues);
            } else {
                issues.push(Issue::new(
                    field("apply_toksvig"),
                    format!("Toksvig correction only applies to gloss, not {}", self.channel_type),
                ));
            }
        }

        if self.ao_processing != AoProcessingMode::None {
            if self.channel_type == ChannelType::AmbientOcclusion {
                check_range(issues, &field("ao_bias"), self.ao_bias, 0.0, 1.0);
                check_range(issues, &field("ao_percentile"), self.ao_percentile, 0.0, 100.0);
            } else {
                issues.push(Issue::new(
                    field("ao_processing"),
                    format!("AO processing only applies to ambient occlusion, not {}", self.channel_type),
                ));
            }
        }

        if let Some(path) = &self.source_path {
            if !path.is_file() {
                issues.push(Issue::new(
                    field("source_path"),
                    format!("{} does not exist", path.display()),
                ));
            }
        }

        if let Some(profile) = &self.mip_profile {
            collect_nested(profile, &field("mip_profile"), issues);
        }
    }
}

/// Lane assignment for a packed texture
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelPackingSettings {
    pub mode: PackingMode,
    pub red: Option<ChannelSourceSettings>,
    pub green: Option<ChannelSourceSettings>,
    pub blue: Option<ChannelSourceSettings>,
    pub alpha: Option<ChannelSourceSettings>,
    /// Working resolution when no channel has a source image
    pub fallback_size: u32,
}

impl Default for ChannelPackingSettings {
    fn default() -> Self {
        Self {
            mode: PackingMode::None,
            red: None,
            green: None,
            blue: None,
            alpha: None,
            fallback_size: 256,
        }
    }
}

impl ChannelPackingSettings {
    /// Settings filling exactly the lanes `mode` requires with neutral defaults.
    pub fn for_mode(mode: PackingMode) -> Self {
        let mut settings = Self {
            mode,
            ..Self::default()
        };
        for &(lane, channel_type) in mode.required_lanes() {
            *settings.slot_mut(lane) = Some(ChannelSourceSettings::new(channel_type));
        }
        settings
    }

    pub fn slot(&self, lane: Lane) -> Option<&ChannelSourceSettings> {
        match lane {
            Lane::Red => self.red.as_ref(),
            Lane::Green => self.green.as_ref(),
            Lane::Blue => self.blue.as_ref(),
            Lane::Alpha => self.alpha.as_ref(),
        }
    }

    pub fn slot_mut(&mut self, lane: Lane) -> &mut Option<ChannelSourceSettings> {
        match lane {
            Lane::Red => &mut self.red,
            Lane::Green => &mut self.green,
            Lane::Blue => &mut self.blue,
            Lane::Alpha => &mut self.alpha,
        }
    }

    pub fn with_slot(mut self, lane: Lane, source: ChannelSourceSettings) -> Self {
        *self.slot_mut(lane) = Some(source);
        self
    }

    /// Occupied lanes in RGBA order
    pub fn occupied(&self) -> impl Iterator<Item = (Lane, &ChannelSourceSettings)> {
        Lane::ALL
            .into_iter()
            .filter_map(move |lane| self.slot(lane).map(|s| (lane, s)))
    }
}

impl Validate for ChannelPackingSettings {
    fn collect_issues(&self, issues: &mut Vec<Issue>) {
        let required = self.mode.required_lanes();

        for lane in Lane::ALL {
            let expected = required.iter().find(|(l, _)| *l == lane).map(|(_, t)| *t);
            match (expected, self.slot(lane)) {
                (Some(channel_type), None) => issues.push(Issue::new(
                    lane.to_string(),
                    format!("{:?} packing requires a {} channel", self.mode, channel_type),
                )),
                (Some(channel_type), Some(source)) if source.channel_type != channel_type => {
                    issues.push(Issue::new(
                        format!("{}.channel_type", lane),
                        format!(
                            "{:?} packing expects {}, found {}",
                            self.mode, channel_type, source.channel_type
                        ),
                    ))
                }
                (None, Some(_)) => issues.push(Issue::new(
                    lane.to_string(),
                    format!("{:?} packing does not use this lane", self.mode),
                )),
                _ => {}
            }
        }

        for (lane, source) in self.occupied() {
            source.collect_issues(lane, issues);
        }

        if self.fallback_size == 0 {
            issues.push(Issue::new("fallback_size", "must be at least 1"));
        }
    }
}

/// Per-channel mip chains, aligned and processed, ready to be interleaved
#[derive(Debug, Clone)]
pub struct PreparedChannels {
    pub width: u32,
    pub height: u32,
    pub channels: Vec<(Lane, MipChain)>,
    pub toksvig_applied: bool,
    pub warnings: Vec<String>,
}

impl PreparedChannels {
    pub fn level_count(&self) -> usize {
        self.channels.first().map(|(_, c)| c.len()).unwrap_or(1)
    }
}

/// Interleaved RGBA mip chain
#[derive(Debug, Clone)]
pub struct PackedTexture {
    pub chain: MipChain,
    pub toksvig_applied: bool,
    pub warnings: Vec<String>,
}

/// Builds packed RGBA textures from [`ChannelPackingSettings`]
#[derive(Debug, Clone)]
pub struct ChannelPacker {
    settings: ChannelPackingSettings,
}

impl ChannelPacker {
    /// Validates the settings; no image is read.
    pub fn new(settings: ChannelPackingSettings) -> Result<Self> {
        Self::validate(&settings)?;
        Ok(Self { settings })
    }

    pub fn validate(settings: &ChannelPackingSettings) -> Result<()> {
        let mut issues = settings.issues();
        if settings.mode == PackingMode::None {
            issues.insert(0, Issue::new("mode", "packing mode none has nothing to pack"));
        }
        if issues.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation(issues))
        }
    }

    pub fn settings(&self) -> &ChannelPackingSettings {
        &self.settings
    }

    /// Loads, aligns and mips every occupied channel.
    pub fn prepare(&self, policy: MipLevelPolicy, wrap: WrapMode) -> Result<PreparedChannels> {
        let mut sources = Vec::new();
        for (lane, source) in self.settings.occupied() {
            let image = match &source.source_path {
                Some(path) => {
                    let map = ImageLoader::load_texture(path)?;
                    Some(FloatImage::from_texture(&map, 1))
                }
                None => None,
            };
            sources.push((lane, source, image));
        }

        let (width, height) = sources
            .iter()
            .filter_map(|(_, _, img)| img.as_ref().map(|i| (i.width, i.height)))
            .reduce(|a, b| (a.0.max(b.0), a.1.max(b.1)))
            .unwrap_or((self.settings.fallback_size, self.settings.fallback_size));

        let min_mip_size = sources
            .iter()
            .map(|(_, s, _)| s.profile().min_mip_size)
            .max()
            .unwrap_or(1);
        let level_count = policy.level_count(width, height, min_mip_size);

        debug!(
            width,
            height,
            level_count,
            mode = ?self.settings.mode,
            "Preparing packed channels"
        );

        let mut prepared = PreparedChannels {
            width,
            height,
            channels: Vec::with_capacity(sources.len()),
            toksvig_applied: false,
            warnings: Vec::new(),
        };

        for (lane, source, image) in sources {
            let profile = source.profile();
            let base = match image {
                Some(img) if img.width != width || img.height != height => {
                    resample(&img, width, height, profile.filter, 1.0, wrap)
                }
                Some(img) => img,
                None => FloatImage::filled(width, height, 1, source.default_value),
            };

            let mut chain = generate_chain(&base, &profile, wrap, level_count);

            if source.ao_processing != AoProcessingMode::None {
                darken_ao(&mut chain, &base, source);
            }

            if source.apply_toksvig {
                let applied = self.apply_toksvig(lane, source, &mut chain, &mut prepared.warnings)?;
                prepared.toksvig_applied |= applied;
            }

            prepared.channels.push((lane, chain));
        }

        Ok(prepared)
    }

    fn apply_toksvig(
        &self,
        lane: Lane,
        source: &ChannelSourceSettings,
        chain: &mut MipChain,
        warnings: &mut Vec<String>,
    ) -> Result<bool> {
        let normal_path = source
            .normal_map_path
            .clone()
            .or_else(|| source.source_path.as_deref().and_then(find_paired_normal_map));

        let Some(path) = normal_path else {
            warn!(%lane, "No paired normal map found, skipping Toksvig correction");
            warnings.push(format!(
                "{}: no paired normal map found, Toksvig correction skipped",
                lane
            ));
            return Ok(false);
        };

        let Some(normal) = ToksvigCorrector::load_normal_map(&path) else {
            warnings.push(format!(
                "{}: normal map {} unreadable, Toksvig correction skipped",
                lane,
                path.display()
            ));
            return Ok(false);
        };

        let corrector = ToksvigCorrector::new(source.toksvig.clone())?;
        Ok(corrector.apply(chain, &normal, true))
    }

    /// Interleaves prepared channels; unused color lanes are 0, unused alpha is 1.
    pub fn pack(&self, prepared: PreparedChannels) -> PackedTexture {
        let mut levels = Vec::with_capacity(prepared.level_count());

        for level in 0..prepared.level_count() {
            let (w, h) = prepared
                .channels
                .first()
                .map(|(_, c)| (c.levels[level].width, c.levels[level].height))
                .unwrap_or((prepared.width, prepared.height));

            let mut out = FloatImage::new(w, h, 4);
            for px in out.data.chunks_exact_mut(4) {
                px[3] = 1.0;
            }
            for (lane, chain) in &prepared.channels {
                let src = &chain.levels[level];
                let i = lane.index();
                for (px, &v) in out.data.chunks_exact_mut(4).zip(src.data.iter()) {
                    px[i] = v;
                }
            }
            levels.push(out);
        }

        PackedTexture {
            chain: MipChain { levels },
            toksvig_applied: prepared.toksvig_applied,
            warnings: prepared.warnings,
        }
    }

    /// [`prepare`](Self::prepare) followed by [`pack`](Self::pack).
    pub fn build(&self, policy: MipLevelPolicy, wrap: WrapMode) -> Result<PackedTexture> {
        let prepared = self.prepare(policy, wrap)?;
        Ok(self.pack(prepared))
    }
}

/// Rewrites AO levels below the base from the footprint of the full-resolution map.
fn darken_ao(chain: &mut MipChain, full: &FloatImage, source: &ChannelSourceSettings) {
    let bias = source.ao_bias.clamp(0.0, 1.0);

    for level in chain.levels.iter_mut().skip(1) {
        let sx = full.width as f64 / level.width as f64;
        let sy = full.height as f64 / level.height as f64;

        for y in 0..level.height {
            let y0 = (y as f64 * sy).floor() as u32;
            let y1 = (((y + 1) as f64 * sy).ceil() as u32).clamp(y0 + 1, full.height);
            for x in 0..level.width {
                let x0 = (x as f64 * sx).floor() as u32;
                let x1 = (((x + 1) as f64 * sx).ceil() as u32).clamp(x0 + 1, full.width);

                let mut window = Vec::with_capacity(((x1 - x0) * (y1 - y0)) as usize);
                for wy in y0..y1 {
                    for wx in x0..x1 {
                        window.push(full.get(wx, wy, 0));
                    }
                }

                let mean = window.iter().map(|&v| v as f64).sum::<f64>() / window.len() as f64;
                let target = match source.ao_processing {
                    AoProcessingMode::Percentile => {
                        window.sort_by(f32::total_cmp);
                        percentile(&window, source.ao_percentile)
                    }
                    _ => window.iter().copied().fold(f32::INFINITY, f32::min),
                };
                let mean = mean as f32;
                let value = mean + (target - mean) * bias;

                for c in 0..level.color_channels() {
                    level.set(x, y, c, value.clamp(0.0, 1.0));
                }
            }
        }
    }
}
