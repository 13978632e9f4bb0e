//! Per-conversion configuration.
//!
//! [`PipelineConfig`] is assembled once (from a preset, a TOML file or in
//! code), validated, and then shared read-only by every conversion.

use crate::compression::CompressionSettings;
use crate::histogram::HistogramSettings;
use crate::image_loading::TextureType;
use crate::mipmaps::MipGenerationProfile;
use crate::presets::PresetRegistry;
use crate::toksvig::ToksvigSettings;
use crate::validation::{collect_nested, Issue, Validate};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// External encoder invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// Executable name or path
    pub program: PathBuf,
    /// Kill the encoder after this many seconds
    pub timeout_secs: Option<u64>,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("ktx"),
            timeout_secs: None,
        }
    }
}

impl EncoderConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Preset the settings came from, for reporting
    pub preset_name: Option<String>,
    pub compression: CompressionSettings,
    pub histogram: HistogramSettings,
    /// Default Toksvig settings for gloss / roughness textures
    pub toksvig: ToksvigSettings,
    /// Per-texture overrides keyed by full path or file name
    pub toksvig_overrides: BTreeMap<String, ToksvigSettings>,
    /// Replace the factory profile of a texture type
    pub profile_overrides: Vec<MipGenerationProfile>,
    /// Also write every mip level as PNG next to the output
    pub save_separate_mipmaps: bool,
    /// Parent directory for temporary mip files (system default when unset)
    pub temp_dir: Option<PathBuf>,
    pub encoder: EncoderConfig,
    /// Conversions run at once by a batch
    pub max_concurrent: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            preset_name: None,
            compression: CompressionSettings::default(),
            histogram: HistogramSettings::default(),
            toksvig: ToksvigSettings::default(),
            toksvig_overrides: BTreeMap::new(),
            profile_overrides: Vec::new(),
            save_separate_mipmaps: false,
            temp_dir: None,
            encoder: EncoderConfig::default(),
            max_concurrent: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
        }
    }
}

impl PipelineConfig {
    /// Default configuration carrying the settings of preset `id`.
    pub fn from_preset(registry: &PresetRegistry, id: &str) -> Result<Self> {
        let preset = registry.require(id)?;
        Ok(Self {
            preset_name: Some(preset.id.clone()),
            compression: preset.compression.clone(),
            histogram: preset.histogram.clone(),
            ..Self::default()
        })
    }

    /// Reads a TOML configuration file; missing keys take their defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn compression_settings(&self) -> &CompressionSettings {
        &self.compression
    }

    pub fn histogram_settings(&self) -> &HistogramSettings {
        &self.histogram
    }

    /// Toksvig settings for `path`: exact path override, then file name
    /// override, then the default.
    pub fn toksvig_settings(&self, path: &Path) -> &ToksvigSettings {
        let by_path = self.toksvig_overrides.get(path.to_string_lossy().as_ref());
        let by_name = || {
            path.file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| self.toksvig_overrides.get(n))
        };
        by_path.or_else(by_name).unwrap_or(&self.toksvig)
    }

    /// Mip profile for `texture_type`, honoring overrides.
    pub fn profile_for(&self, texture_type: TextureType) -> MipGenerationProfile {
        self.profile_overrides
            .iter()
            .find(|p| p.texture_type == texture_type)
            .cloned()
            .unwrap_or_else(|| MipGenerationProfile::for_type(texture_type))
    }
}

impl Validate for PipelineConfig {
    fn collect_issues(&self, issues: &mut Vec<Issue>) {
        collect_nested(&self.compression, "compression", issues);
        collect_nested(&self.histogram, "histogram", issues);
        collect_nested(&self.toksvig, "toksvig", issues);
        for (key, settings) in &self.toksvig_overrides {
            collect_nested(settings, &format!("toksvig_overrides[{}]", key), issues);
        }
        for profile in &self.profile_overrides {
            collect_nested(
                profile,
                &format!("profile_overrides[{}]", profile.texture_type.label()),
                issues,
            );
        }
        if self.encoder.program.as_os_str().is_empty() {
            issues.push(Issue::new("encoder.program", "must not be empty"));
        }
        if self.max_concurrent == 0 {
            issues.push(Issue::new("max_concurrent", "must be at least 1"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::CompressionFormat;
    use crate::resample::ResampleFilter;

    #[test]
    fn from_preset_copies_settings() {
        let registry = PresetRegistry::builtin();
        let config = PipelineConfig::from_preset(&registry, "uastc-rdo").unwrap();
        assert_eq!(config.preset_name.as_deref(), Some("uastc-rdo"));
        assert_eq!(config.compression.format, CompressionFormat::Uastc);
        assert!(config.compression.uastc_rdo);
        assert!(config.validate().is_ok());

        assert!(PipelineConfig::from_preset(&PresetRegistry::empty(), "uastc-rdo").is_err());
    }

    #[test]
    fn toksvig_override_lookup() {
        let mut config = PipelineConfig::default();
        let strong = ToksvigSettings {
            composite_power: 4.0,
            ..Default::default()
        };
        config
            .toksvig_overrides
            .insert("brick_gloss.png".into(), strong.clone());

        assert_eq!(
            config.toksvig_settings(Path::new("/assets/brick_gloss.png")),
            &strong
        );
        assert_eq!(
            config.toksvig_settings(Path::new("/assets/stone_gloss.png")),
            &ToksvigSettings::default()
        );
    }

    #[test]
    fn profile_override_replaces_factory() {
        let mut config = PipelineConfig::default();
        config.profile_overrides.push(
            MipGenerationProfile::for_type(TextureType::Albedo).with_filter(ResampleFilter::Mitchell),
        );
        assert_eq!(config.profile_for(TextureType::Albedo).filter, ResampleFilter::Mitchell);
        assert_eq!(config.profile_for(TextureType::Normal).filter, ResampleFilter::Kaiser);
    }

    #[test]
    fn toml_config_with_nested_sections() {
        let config = PipelineConfig::from_toml_str(
            r#"
save_separate_mipmaps = true
max_concurrent = 2

[compression]
format = "uastc"
uastc_quality = 3

[histogram]
mode = "percentile"

[encoder]
program = "/opt/ktx/bin/ktx"
timeout_secs = 30

[toksvig_overrides."rock_gloss.png"]
composite_power = 2.0
mode = "simplified"
"#,
        )
        .unwrap();

        assert!(config.save_separate_mipmaps);
        assert_eq!(config.compression.uastc_quality, 3);
        assert_eq!(config.encoder.timeout(), Some(Duration::from_secs(30)));
        assert_eq!(
            config.toksvig_settings(Path::new("rock_gloss.png")).composite_power,
            2.0
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn nested_issues_carry_prefix() {
        let mut config = PipelineConfig::default();
        config.toksvig.composite_power = 0.1;
        config.max_concurrent = 0;
        let fields: Vec<_> = config.issues().into_iter().map(|i| i.field).collect();
        assert!(fields.contains(&"toksvig.composite_power".to_string()));
        assert!(fields.contains(&"max_concurrent".to_string()));
    }
}
