//! Conversion presets.
//!
//! A [`PresetRegistry`] is an ordinary value: start from
//! [`PresetRegistry::builtin`] or [`PresetRegistry::empty`], add presets from
//! JSON/TOML files, then hand it to [`PipelineConfig::from_preset`].
//!
//! Preset files hold a list of presets:
//!
//! ```toml
//! [[presets]]
//! id = "mobile-albedo"
//! name = "Mobile albedo"
//! compression = { format = "etc1s", quality_level = 96 }
//! ```
//!
//! [`PipelineConfig::from_preset`]: crate::config::PipelineConfig::from_preset

use crate::compression::{ColorSpace, CompressionFormat, CompressionSettings, Supercompression};
use crate::histogram::HistogramSettings;
use crate::packing::PackingMode;
use crate::validation::{collect_nested, Issue, Validate};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preset {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub compression: CompressionSettings,
    #[serde(default)]
    pub histogram: HistogramSettings,
    /// Packing the preset is meant for; `none` for single textures
    #[serde(default)]
    pub packing_mode: PackingMode,
}

impl Preset {
    fn new(id: &str, name: &str, description: &str, compression: CompressionSettings) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            compression,
            histogram: HistogramSettings::default(),
            packing_mode: PackingMode::None,
        }
    }

    fn packed(mut self, mode: PackingMode) -> Self {
        self.packing_mode = mode;
        self
    }
}

impl Validate for Preset {
    fn collect_issues(&self, issues: &mut Vec<Issue>) {
        if self.id.trim().is_empty() {
            issues.push(Issue::new("id", "must not be empty"));
        }
        collect_nested(&self.compression, "compression", issues);
        collect_nested(&self.histogram, "histogram", issues);
    }
}

/// File layout accepted by [`PresetRegistry::load_file`]
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PresetFile {
    #[serde(default)]
    presets: Vec<Preset>,
}

/// Presets keyed by id
#[derive(Debug, Clone, Default)]
pub struct PresetRegistry {
    presets: BTreeMap<String, Preset>,
}

impl PresetRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Built-in presets for single textures and ORM packing
    pub fn builtin() -> Self {
        let mut registry = Self::empty();

        registry.insert(Preset::new(
            "etc1s-default",
            "ETC1S default",
            "Small BasisLZ textures, encoder generated mipmaps",
            CompressionSettings::etc1s(),
        ));
        registry.insert(Preset::new(
            "etc1s-high",
            "ETC1S high quality",
            "BasisLZ with maximum effort and quality",
            CompressionSettings {
                compression_level: 5,
                quality_level: 255,
                ..CompressionSettings::etc1s()
            },
        ));
        registry.insert(Preset::new(
            "uastc-normal",
            "UASTC normal map",
            "UASTC in linear space for tangent-space normal maps",
            CompressionSettings {
                uastc_quality: 3,
                color_space: ColorSpace::Linear,
                supercompression: Supercompression::Zstandard,
                ..CompressionSettings::uastc()
            },
        ));
        registry.insert(Preset::new(
            "uastc-rdo",
            "UASTC RDO",
            "UASTC with rate-distortion optimization and Zstandard",
            CompressionSettings {
                uastc_rdo: true,
                rdo_lambda: 1.0,
                supercompression: Supercompression::Zstandard,
                zstd_level: 18,
                ..CompressionSettings::uastc()
            },
        ));

        let orm = CompressionSettings {
            format: CompressionFormat::Uastc,
            color_space: ColorSpace::Linear,
            generate_mipmaps: false,
            use_custom_mipmaps: true,
            supercompression: Supercompression::Zstandard,
            ..CompressionSettings::uastc()
        };
        registry.insert(
            Preset::new(
                "orm-packed",
                "ORM packed",
                "AO / Gloss / Metallic packed into RGB with per-channel mipmaps",
                orm.clone(),
            )
            .packed(PackingMode::Ogm),
        );
        registry.insert(
            Preset::new(
                "orm-height",
                "ORM + height",
                "AO / Gloss / Metallic / Height packed into RGBA",
                orm,
            )
            .packed(PackingMode::Ogmh),
        );

        registry
    }

    /// Adds or replaces a preset, returning the one it replaced.
    pub fn insert(&mut self, preset: Preset) -> Option<Preset> {
        self.presets.insert(preset.id.clone(), preset)
    }

    pub fn get(&self, id: &str) -> Option<&Preset> {
        self.presets.get(id)
    }

    pub fn require(&self, id: &str) -> Result<&Preset> {
        self.get(id)
            .ok_or_else(|| Error::Other(format!("Unknown preset: {}", id)))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Preset> {
        self.presets.values()
    }

    pub fn len(&self) -> usize {
        self.presets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.presets.is_empty()
    }

    /// Loads every preset of a `.json` or `.toml` file. Invalid presets
    /// fail the whole file.
    pub fn load_file<P: AsRef<Path>>(&mut self, path: P) -> Result<usize> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let file: PresetFile = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&text)?,
            Some("toml") => toml::from_str(&text)?,
            _ => {
                return Err(Error::Other(format!(
                    "Unsupported preset file {}: use .json or .toml",
                    path.display()
                )))
            }
        };

        for preset in &file.presets {
            preset.validate()?;
        }
        let count = file.presets.len();
        for preset in file.presets {
            if let Some(old) = self.insert(preset) {
                debug!(id = %old.id, "Preset overridden");
            }
        }
        Ok(count)
    }

    /// Loads every preset file directly inside `dir`. Unreadable files are
    /// logged and skipped.
    pub fn load_dir<P: AsRef<Path>>(&mut self, dir: P) -> usize {
        let dir = dir.as_ref();
        let Ok(entries) = std::fs::read_dir(dir) else {
            return 0;
        };

        let mut files: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| {
                p.is_file()
                    && matches!(p.extension().and_then(|e| e.to_str()), Some("json" | "toml"))
            })
            .collect();
        files.sort();

        let mut loaded = 0;
        for file in files {
            match self.load_file(&file) {
                Ok(n) => loaded += n,
                Err(e) => warn!(path = %file.display(), error = %e, "Skipping preset file"),
            }
        }
        loaded
    }

    /// Standard lookup: `./.texpipe/presets`, `$XDG_CONFIG_HOME/texpipe/presets`
    /// and every directory listed in `TEXPIPE_PRESETS`.
    pub fn default_dirs() -> Vec<PathBuf> {
        let mut dirs = Vec::new();
        if let Ok(cwd) = std::env::current_dir() {
            dirs.push(cwd.join(".texpipe").join("presets"));
        }
        if let Ok(home) = std::env::var("HOME") {
            let config = std::env::var("XDG_CONFIG_HOME")
                .unwrap_or_else(|_| format!("{}/.config", home));
            dirs.push(PathBuf::from(config).join("texpipe").join("presets"));
        }
        if let Ok(list) = std::env::var("TEXPIPE_PRESETS") {
            dirs.extend(std::env::split_paths(&list).filter(|p| !p.as_os_str().is_empty()));
        }
        dirs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_presets_are_valid() {
        let registry = PresetRegistry::builtin();
        assert!(registry.len() >= 6);
        for preset in registry.iter() {
            assert!(preset.validate().is_ok(), "{}", preset.id);
        }
        assert_eq!(
            registry.get("orm-packed").map(|p| p.packing_mode),
            Some(PackingMode::Ogm)
        );
    }

    #[test]
    fn empty_registry_accepts_custom_presets() {
        let mut registry = PresetRegistry::empty();
        assert!(registry.get("etc1s-default").is_none());
        registry.insert(Preset::new("mine", "Mine", "", CompressionSettings::uastc()));
        assert_eq!(registry.require("mine").unwrap().compression.format, CompressionFormat::Uastc);
        assert!(registry.require("other").is_err());
    }

    #[test]
    fn load_toml_and_json_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("mobile.toml"),
            r#"
[[presets]]
id = "mobile"
name = "Mobile"
compression = { format = "etc1s", quality_level = 96 }
"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("hq.json"),
            r#"{ "presets": [ { "id": "hq", "name": "HQ", "compression": { "format": "uastc", "uastc_quality": 4 } } ] }"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let mut registry = PresetRegistry::empty();
        assert_eq!(registry.load_dir(dir.path()), 2);
        assert_eq!(registry.get("mobile").unwrap().compression.quality_level, 96);
        assert_eq!(registry.get("hq").unwrap().compression.uastc_quality, 4);
    }

    #[test]
    fn invalid_preset_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(
            &path,
            "[[presets]]\nid = \"bad\"\nname = \"Bad\"\ncompression = { quality_level = 0 }\n",
        )
        .unwrap();
        let mut registry = PresetRegistry::empty();
        assert!(matches!(registry.load_file(&path), Err(Error::Validation(_))));
        assert!(registry.is_empty());
    }
}
