//! Encoder tunables.
//!
//! [`CompressionSettings`] describes what the external encoder should
//! produce. Fields that belong to one compression family are ignored when
//! the other family is active, both by validation and by the argument
//! builder.

use crate::image_loading::TextureType;
use crate::resample::ResampleFilter;
use crate::validation::{check_range, Issue, Validate};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub use crate::resample::WrapMode;

/// Internal compression family of the encoder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompressionFormat {
    /// Small and fast to transcode (BasisLZ)
    #[default]
    Etc1s,
    /// Higher fidelity, larger
    Uastc,
}

impl CompressionFormat {
    /// Value of the encoder's `--encode` flag
    pub fn encoder_name(&self) -> &'static str {
        match self {
            CompressionFormat::Etc1s => "basis-lz",
            CompressionFormat::Uastc => "uastc",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "etc1s" | "basis-lz" | "basislz" => Some(CompressionFormat::Etc1s),
            "uastc" => Some(CompressionFormat::Uastc),
            _ => None,
        }
    }
}

/// Output container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Ktx2,
    Basis,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Ktx2 => "ktx2",
            OutputFormat::Basis => "basis",
        }
    }

    /// The encoder picks the container from the extension, so force it.
    pub fn apply_extension(&self, path: &Path) -> PathBuf {
        path.with_extension(self.extension())
    }
}

/// Generic compression layered over the GPU format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Supercompression {
    #[default]
    None,
    Zstandard,
}

/// Transfer function hint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ColorSpace {
    /// sRGB for albedo/emissive, linear for data maps
    #[default]
    Auto,
    Linear,
    Srgb,
}

impl ColorSpace {
    /// Whether the texture is encoded with the sRGB transfer function.
    pub fn is_srgb_for(&self, texture_type: TextureType) -> bool {
        match self {
            ColorSpace::Auto => texture_type.is_color(),
            ColorSpace::Linear => false,
            ColorSpace::Srgb => true,
        }
    }
}

/// Alpha channel policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AlphaPolicy {
    /// Always encode an alpha channel
    Force,
    /// Drop alpha
    Remove,
    /// Keep alpha only when the source has any non-opaque texel
    #[default]
    Leave,
}

impl AlphaPolicy {
    pub fn keeps_alpha(&self, source_has_alpha: bool) -> bool {
        match self {
            AlphaPolicy::Force => true,
            AlphaPolicy::Remove => false,
            AlphaPolicy::Leave => source_has_alpha,
        }
    }
}

/// Who produces the mip levels for a conversion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MipmapMode {
    /// Encoder generates them from the base image (`--generate-mipmap`)
    Encoder,
    /// This pipeline generates them and passes every level explicitly
    Pipeline,
    /// Base level only
    Disabled,
}

/// Target encoder tunables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionSettings {
    pub format: CompressionFormat,
    pub output_format: OutputFormat,

    /// ETC1S compression effort (0..=5)
    pub compression_level: u32,
    /// ETC1S quality (1..=255)
    pub quality_level: u32,

    /// UASTC quality (0..=4)
    pub uastc_quality: u32,
    /// UASTC rate-distortion optimization
    pub uastc_rdo: bool,
    /// UASTC RDO lambda (0.001..=10.0)
    pub rdo_lambda: f32,

    pub supercompression: Supercompression,
    /// Zstandard level (1..=22)
    pub zstd_level: u32,

    pub generate_mipmaps: bool,
    pub use_custom_mipmaps: bool,
    pub mip_filter: ResampleFilter,
    /// Drill the mip chain down to the last (1 texel) level
    pub include_last_level: bool,
    /// Levels whose larger side is below this are dropped
    pub mip_smallest_dimension: u32,

    pub color_space: ColorSpace,
    pub wrap_mode: WrapMode,
    pub alpha_policy: AlphaPolicy,
    pub threads: Option<u32>,

    pub remove_temporary_mipmaps: bool,
}

impl Default for CompressionSettings {
    fn default() -> Self {
        Self {
            format: CompressionFormat::Etc1s,
            output_format: OutputFormat::Ktx2,
            compression_level: 1,
            quality_level: 128,
            uastc_quality: 2,
            uastc_rdo: false,
            rdo_lambda: 1.0,
            supercompression: Supercompression::None,
            zstd_level: 18,
            generate_mipmaps: true,
            use_custom_mipmaps: false,
            mip_filter: ResampleFilter::Kaiser,
            include_last_level: true,
            mip_smallest_dimension: 1,
            color_space: ColorSpace::Auto,
            wrap_mode: WrapMode::Clamp,
            alpha_policy: AlphaPolicy::Leave,
            threads: None,
            remove_temporary_mipmaps: true,
        }
    }
}

impl CompressionSettings {
    pub fn etc1s() -> Self {
        Self::default()
    }

    pub fn uastc() -> Self {
        Self {
            format: CompressionFormat::Uastc,
            ..Self::default()
        }
    }

    pub fn mipmap_mode(&self) -> MipmapMode {
        if self.use_custom_mipmaps {
            MipmapMode::Pipeline
        } else if self.generate_mipmaps {
            MipmapMode::Encoder
        } else {
            MipmapMode::Disabled
        }
    }

    pub fn mipmaps_enabled(&self) -> bool {
        self.mipmap_mode() != MipmapMode::Disabled
    }

    /// Zstandard only applies to UASTC in a KTX2 container; ETC1S carries
    /// BasisLZ already.
    pub fn zstd_active(&self) -> bool {
        self.supercompression == Supercompression::Zstandard
            && self.format == CompressionFormat::Uastc
            && self.output_format == OutputFormat::Ktx2
    }
}

impl Validate for CompressionSettings {
    fn collect_issues(&self, issues: &mut Vec<Issue>) {
        match self.format {
            CompressionFormat::Etc1s => {
                check_range(issues, "compression_level", self.compression_level, 0, 5);
                check_range(issues, "quality_level", self.quality_level, 1, 255);
            }
            CompressionFormat::Uastc => {
                check_range(issues, "uastc_quality", self.uastc_quality, 0, 4);
                if self.uastc_rdo {
                    check_range(issues, "rdo_lambda", self.rdo_lambda, 0.001, 10.0);
                }
                if self.zstd_active() {
                    check_range(issues, "zstd_level", self.zstd_level, 1, 22);
                }
            }
        }

        if self.generate_mipmaps && self.use_custom_mipmaps {
            issues.push(Issue::new(
                "generate_mipmaps",
                "generate_mipmaps and use_custom_mipmaps are mutually exclusive",
            ));
        }
        if self.mip_smallest_dimension == 0 {
            issues.push(Issue::new("mip_smallest_dimension", "must be at least 1"));
        }
        if self.threads == Some(0) {
            issues.push(Issue::new("threads", "must be at least 1 when set"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid_etc1s() {
        let settings = CompressionSettings::default();
        assert_eq!(settings.format, CompressionFormat::Etc1s);
        assert!(settings.validate().is_ok());
        assert_eq!(settings.mipmap_mode(), MipmapMode::Encoder);
    }

    #[test]
    fn inactive_family_fields_are_ignored() {
        let mut settings = CompressionSettings::etc1s();
        settings.uastc_quality = 99;
        settings.rdo_lambda = -5.0;
        assert!(settings.validate().is_ok());

        let mut settings = CompressionSettings::uastc();
        settings.quality_level = 0;
        settings.compression_level = 42;
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn active_family_fields_are_range_checked() {
        let mut settings = CompressionSettings::etc1s();
        settings.quality_level = 0;
        let issues = settings.issues();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].field, "quality_level");

        let mut settings = CompressionSettings::uastc();
        settings.uastc_rdo = true;
        settings.rdo_lambda = 20.0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn mip_flags_are_mutually_exclusive() {
        let settings = CompressionSettings {
            generate_mipmaps: true,
            use_custom_mipmaps: true,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn zstd_only_for_uastc_ktx2() {
        let mut settings = CompressionSettings::etc1s();
        settings.supercompression = Supercompression::Zstandard;
        assert!(!settings.zstd_active());
        settings.format = CompressionFormat::Uastc;
        assert!(settings.zstd_active());
        settings.output_format = OutputFormat::Basis;
        assert!(!settings.zstd_active());
    }

    #[test]
    fn auto_color_space_follows_texture_type() {
        assert!(ColorSpace::Auto.is_srgb_for(TextureType::Albedo));
        assert!(!ColorSpace::Auto.is_srgb_for(TextureType::Normal));
        assert!(ColorSpace::Srgb.is_srgb_for(TextureType::Roughness));
    }

    #[test]
    fn partial_toml_uses_defaults() {
        let settings: CompressionSettings = toml::from_str("format = \"uastc\"\nuastc_quality = 4").unwrap();
        assert_eq!(settings.format, CompressionFormat::Uastc);
        assert_eq!(settings.uastc_quality, 4);
        assert!(settings.generate_mipmaps);
    }
}
