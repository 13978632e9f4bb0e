//! Image loading and texture metadata.
//!
//! Loads PNG, JPG, TGA and EXR files as RGBA8, detects the texture type from
//! common filename suffixes and resolves the normal map paired with a
//! gloss/roughness/albedo texture by naming convention.

use crate::texture::TextureMap;
use crate::Result;
use image::GenericImageView;
use image::{DynamicImage, ImageFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Texture-type tag driving mip generation and encoder flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TextureType {
    Albedo,
    Normal,
    Roughness,
    Metallic,
    AmbientOcclusion,
    Emissive,
    Gloss,
    #[default]
    Generic,
}

impl TextureType {
    pub const ALL: [TextureType; 8] = [
        TextureType::Albedo,
        TextureType::Normal,
        TextureType::Roughness,
        TextureType::Metallic,
        TextureType::AmbientOcclusion,
        TextureType::Emissive,
        TextureType::Gloss,
        TextureType::Generic,
    ];

    /// Common filename suffixes for this type (without extension)
    pub fn common_suffixes(&self) -> &[&'static str] {
        match self {
            TextureType::Albedo => &["albedo", "basecolor", "diffuse", "color", "col"],
            TextureType::Normal => &["normal", "nrm", "norm"],
            TextureType::Roughness => &["roughness", "rough"],
            TextureType::Metallic => &["metallic", "metalness", "metal"],
            TextureType::AmbientOcclusion => &["ao", "occlusion", "ambientocclusion"],
            TextureType::Emissive => &["emissive", "emission"],
            TextureType::Gloss => &["gloss", "glossiness", "smoothness"],
            TextureType::Generic => &[],
        }
    }

    /// Color data authored in sRGB space
    pub fn is_color(&self) -> bool {
        matches!(self, TextureType::Albedo | TextureType::Emissive)
    }

    pub fn label(&self) -> &'static str {
        match self {
            TextureType::Albedo => "albedo",
            TextureType::Normal => "normal",
            TextureType::Roughness => "roughness",
            TextureType::Metallic => "metallic",
            TextureType::AmbientOcclusion => "ambient_occlusion",
            TextureType::Emissive => "emissive",
            TextureType::Gloss => "gloss",
            TextureType::Generic => "generic",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.to_lowercase();
        if name == "generic" {
            return Some(TextureType::Generic);
        }
        Self::ALL
            .into_iter()
            .find(|t| t.label() == name || t.common_suffixes().contains(&name.as_str()))
    }
}

/// Supported image formats for loading
pub const SUPPORTED_FORMATS: &[ImageFormat] = &[
    ImageFormat::Png,
    ImageFormat::Jpeg,
    ImageFormat::Tga,
    ImageFormat::OpenExr,
];

/// Extensions probed when resolving paired textures
const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "tga", "exr"];

/// Suffixes a paired normal map may carry
const NORMAL_SUFFIXES: &[&str] = &["normal", "nrm", "norm", "n"];

/// A loaded texture image with pixel data
#[derive(Debug, Clone)]
pub struct LoadedImage {
    /// Image width in pixels
    pub width: u32,
    /// Image height in pixels
    pub height: u32,
    /// RGBA pixel data (4 bytes per pixel, row-major)
    pub data: Vec<u8>,
    /// Source format used when loading
    pub format: ImageFormat,
    /// Detected channel/color info
    pub color_type: String,
}

impl LoadedImage {
    fn from_dynamic(image: DynamicImage, format: ImageFormat) -> Self {
        let (width, height) = image.dimensions();
        let color_type = format!("{:?}", image.color());
        let data = image.to_rgba8().into_raw();

        Self {
            width,
            height,
            data,
            format,
            color_type,
        }
    }
}

/// Loads source textures
pub struct ImageLoader;

impl ImageLoader {
    /// Load an image from a file path (PNG, JPG, TGA, EXR)
    pub fn load<P: AsRef<Path>>(path: P) -> Result<LoadedImage> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(crate::Error::MissingSource {
                what: "image".into(),
                path: path.display().to_string(),
            });
        }

        let reader = image::ImageReader::open(path)?.with_guessed_format()?;
        let format = reader.format().unwrap_or(ImageFormat::Png);

        if !SUPPORTED_FORMATS.contains(&format) {
            return Err(crate::Error::Other(format!(
                "Unsupported format: {:?}. Use PNG, JPG, TGA or EXR.",
                format
            )));
        }

        let image = reader.decode()?;
        Ok(LoadedImage::from_dynamic(image, format))
    }

    /// Load straight into a [`TextureMap`] that remembers its path
    pub fn load_texture<P: AsRef<Path>>(path: P) -> Result<TextureMap> {
        let path = path.as_ref();
        let image = Self::load(path)?;
        Ok(TextureMap::from_loaded(image, Some(path.to_path_buf())))
    }

    /// Attempt to detect the texture type from a filename
    pub fn detect_type_from_path<P: AsRef<Path>>(path: P) -> Option<TextureType> {
        let stem = path.as_ref().file_stem()?.to_str()?.to_lowercase();
        let tokens: Vec<&str> = stem.split(is_name_separator).collect();

        // Later tokens win: "rock_normal_ao" is an AO map
        tokens.iter().rev().find_map(|token| {
            TextureType::ALL
                .into_iter()
                .find(|t| t.common_suffixes().contains(token))
        })
    }
}

fn is_name_separator(c: char) -> bool {
    matches!(c, '_' | '-' | '.' | ' ')
}

/// Strips a trailing texture-type suffix from a file stem (`brick_gloss` -> `brick`).
fn base_name(stem: &str) -> &str {
    if let Some(pos) = stem.rfind(is_name_separator) {
        let suffix = stem[pos + 1..].to_lowercase();
        let known = TextureType::ALL
            .iter()
            .any(|t| t.common_suffixes().contains(&suffix.as_str()));
        if known && pos > 0 {
            return &stem[..pos];
        }
    }
    stem
}

/// Resolves the normal map belonging to `texture_path` by naming convention:
/// `<base>_normal`, `<base>_nrm`, `<base>_norm` or `<base>_n` next to it, with
/// any supported extension.
pub fn find_paired_normal_map<P: AsRef<Path>>(texture_path: P) -> Option<PathBuf> {
    let path = texture_path.as_ref();
    let stem = path.file_stem()?.to_str()?;
    let dir = path.parent().unwrap_or_else(|| Path::new(""));
    let base = base_name(stem);

    for suffix in NORMAL_SUFFIXES {
        for sep in ["_", "-"] {
            for ext in IMAGE_EXTENSIONS {
                let candidate = dir.join(format!("{}{}{}.{}", base, sep, suffix, ext));
                if candidate.is_file() && candidate != path {
                    return Some(candidate);
                }
            }
        }
    }
    None
}
