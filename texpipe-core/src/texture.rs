//! Texel buffers.
//!
//! [`TextureMap`] holds 8-bit RGBA data as loaded from disk. [`FloatImage`]
//! is the interleaved `f32` working format used by every processing stage.

use crate::image_loading::LoadedImage;
use crate::Result;
use image::{ImageBuffer, RgbaImage};
use std::path::{Path, PathBuf};

/// A texture map with resolution and pixel data
#[derive(Debug, Clone)]
pub struct TextureMap {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// RGBA pixel data (4 bytes per pixel, row-major)
    pub data: Vec<u8>,
    /// Source path when loaded from file
    pub path: Option<PathBuf>,
}

impl TextureMap {
    pub fn from_loaded(image: LoadedImage, path: Option<PathBuf>) -> Self {
        Self {
            width: image.width,
            height: image.height,
            data: image.data,
            path,
        }
    }

    /// Get pixel at (x, y) as [R, G, B, A]
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = (y as usize * self.width as usize + x as usize) * 4;
        if i + 4 > self.data.len() {
            return None;
        }
        Some([
            self.data[i],
            self.data[i + 1],
            self.data[i + 2],
            self.data[i + 3],
        ])
    }

    /// True when any texel is not fully opaque.
    pub fn has_alpha(&self) -> bool {
        self.data.chunks_exact(4).any(|p| p[3] != 255)
    }

    /// Saves the texture; format is inferred from the file extension.
    pub fn save<P: AsRef<Path>>(&self, output_path: P) -> Result<()> {
        let img: RgbaImage = ImageBuffer::from_raw(self.width, self.height, self.data.clone())
            .ok_or_else(|| crate::Error::Other("Invalid texture dimensions".into()))?;
        img.save(output_path.as_ref())?;
        Ok(())
    }
}

/// Quantizes a normalized value to 8 bits (`round(v * 255)`).
#[inline]
pub fn quantize(value: f32) -> u8 {
    (value.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// Interleaved floating point image, values nominally in [0, 1].
#[derive(Debug, Clone, PartialEq)]
pub struct FloatImage {
    pub width: u32,
    pub height: u32,
    /// Interleaved channels per texel (1..=4)
    pub channels: usize,
    pub data: Vec<f32>,
}

impl FloatImage {
    pub fn new(width: u32, height: u32, channels: usize) -> Self {
        Self::filled(width, height, channels, 0.0)
    }

    /// Image with every sample set to `value`.
    pub fn filled(width: u32, height: u32, channels: usize, value: f32) -> Self {
        let len = width as usize * height as usize * channels;
        Self {
            width,
            height,
            channels,
            data: vec![value; len],
        }
    }

    /// Converts the first `channels` lanes of an RGBA8 texture.
    pub fn from_texture(map: &TextureMap, channels: usize) -> Self {
        let channels = channels.clamp(1, 4);
        let mut data = Vec::with_capacity(map.width as usize * map.height as usize * channels);
        for px in map.data.chunks_exact(4) {
            for &v in &px[..channels] {
                data.push(v as f32 / 255.0);
            }
        }
        Self {
            width: map.width,
            height: map.height,
            channels,
            data,
        }
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    #[inline]
    pub fn index(&self, x: u32, y: u32, channel: usize) -> usize {
        (y as usize * self.width as usize + x as usize) * self.channels + channel
    }

    #[inline]
    pub fn get(&self, x: u32, y: u32, channel: usize) -> f32 {
        self.data[self.index(x, y, channel)]
    }

    #[inline]
    pub fn set(&mut self, x: u32, y: u32, channel: usize, value: f32) {
        let i = self.index(x, y, channel);
        self.data[i] = value;
    }

    /// Number of leading color lanes; a trailing alpha lane exists for 2 and 4 channels.
    pub fn color_channels(&self) -> usize {
        match self.channels {
            2 | 4 => self.channels - 1,
            n => n,
        }
    }

    pub fn alpha_channel(&self) -> Option<usize> {
        matches!(self.channels, 2 | 4).then(|| self.channels - 1)
    }

    /// Copies one lane into a single-channel image.
    pub fn extract_channel(&self, channel: usize) -> FloatImage {
        let data = self
            .data
            .chunks_exact(self.channels)
            .map(|px| px[channel])
            .collect();
        FloatImage {
            width: self.width,
            height: self.height,
            channels: 1,
            data,
        }
    }

    pub fn clamp_unit(&mut self) {
        for v in &mut self.data {
            *v = v.clamp(0.0, 1.0);
        }
    }

    /// Expands to 8-bit RGBA: one lane is broadcast as gray, two lanes are
    /// gray + alpha, missing alpha is opaque.
    pub fn to_texture(&self) -> TextureMap {
        let mut data = Vec::with_capacity(self.pixel_count() * 4);
        for px in self.data.chunks_exact(self.channels) {
            let rgba = match self.channels {
                1 => [px[0], px[0], px[0], 1.0],
                2 => [px[0], px[0], px[0], px[1]],
                3 => [px[0], px[1], px[2], 1.0],
                _ => [px[0], px[1], px[2], px[3]],
            };
            data.extend(rgba.iter().map(|&v| quantize(v)));
        }
        TextureMap {
            width: self.width,
            height: self.height,
            data,
            path: None,
        }
    }

    pub fn save_png<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.to_texture().save(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantize_rounds_half_up() {
        assert_eq!(quantize(0.5), 128);
        assert_eq!(quantize(1.0), 255);
        assert_eq!(quantize(-0.2), 0);
    }

    #[test]
    fn from_texture_takes_leading_lanes() {
        let map = TextureMap {
            width: 1,
            height: 1,
            data: vec![255, 0, 51, 255],
            path: None,
        };
        let img = FloatImage::from_texture(&map, 3);
        assert_eq!(img.channels, 3);
        assert_eq!(img.data, vec![1.0, 0.0, 0.2]);
        assert!(!map.has_alpha());
    }

    #[test]
    fn single_lane_expands_to_gray() {
        let img = FloatImage::filled(2, 1, 1, 0.5);
        let tex = img.to_texture();
        assert_eq!(tex.pixel(1, 0), Some([128, 128, 128, 255]));
    }

    #[test]
    fn alpha_lane_layout() {
        assert_eq!(FloatImage::new(1, 1, 4).alpha_channel(), Some(3));
        assert_eq!(FloatImage::new(1, 1, 3).alpha_channel(), None);
        assert_eq!(FloatImage::new(1, 1, 2).color_channels(), 1);
    }
}
