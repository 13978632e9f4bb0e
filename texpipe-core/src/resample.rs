//! Separable image resampling.
//!
//! Kernels are evaluated in `f64` and normalized per output texel, so a
//! constant image stays exactly constant through any number of resamples.
//! Results are not clamped: callers decide the valid value domain.

use crate::texture::FloatImage;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Kaiser window shape parameter
const KAISER_ALPHA: f64 = 4.0;

/// Resampling kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResampleFilter {
    /// Plain average of the footprint
    Box,
    /// Tent / bilinear
    Triangle,
    /// Kaiser windowed sinc
    #[default]
    Kaiser,
    Lanczos3,
    /// Mitchell-Netravali (B = C = 1/3)
    Mitchell,
    Gaussian,
}

impl ResampleFilter {
    pub const ALL: [ResampleFilter; 6] = [
        ResampleFilter::Box,
        ResampleFilter::Triangle,
        ResampleFilter::Kaiser,
        ResampleFilter::Lanczos3,
        ResampleFilter::Mitchell,
        ResampleFilter::Gaussian,
    ];

    /// Kernel radius in source texels at scale 1
    pub fn support(&self) -> f64 {
        match self {
            ResampleFilter::Box => 0.5,
            ResampleFilter::Triangle => 1.0,
            ResampleFilter::Kaiser | ResampleFilter::Lanczos3 => 3.0,
            ResampleFilter::Mitchell | ResampleFilter::Gaussian => 2.0,
        }
    }

    pub fn weight(&self, t: f64) -> f64 {
        let a = t.abs();
        match self {
            ResampleFilter::Box => {
                if (-0.5..0.5).contains(&t) {
                    1.0
                } else {
                    0.0
                }
            }
            ResampleFilter::Triangle => (1.0 - a).max(0.0),
            ResampleFilter::Kaiser => {
                let support = self.support();
                if a >= support {
                    return 0.0;
                }
                let r = a / support;
                sinc(t) * bessel_i0(KAISER_ALPHA * (1.0 - r * r).sqrt()) / bessel_i0(KAISER_ALPHA)
            }
            ResampleFilter::Lanczos3 => {
                if a >= 3.0 {
                    0.0
                } else {
                    sinc(t) * sinc(t / 3.0)
                }
            }
            ResampleFilter::Mitchell => {
                const B: f64 = 1.0 / 3.0;
                const C: f64 = 1.0 / 3.0;
                if a < 1.0 {
                    ((12.0 - 9.0 * B - 6.0 * C) * a * a * a
                        + (-18.0 + 12.0 * B + 6.0 * C) * a * a
                        + (6.0 - 2.0 * B))
                        / 6.0
                } else if a < 2.0 {
                    ((-B - 6.0 * C) * a * a * a
                        + (6.0 * B + 30.0 * C) * a * a
                        + (-12.0 * B - 48.0 * C) * a
                        + (8.0 * B + 24.0 * C))
                        / 6.0
                } else {
                    0.0
                }
            }
            ResampleFilter::Gaussian => {
                if a >= 2.0 {
                    0.0
                } else {
                    (-2.0 * t * t).exp()
                }
            }
        }
    }

    /// Name understood by the encoder's `--mipmap-filter`
    pub fn encoder_name(&self) -> &'static str {
        match self {
            ResampleFilter::Box => "box",
            ResampleFilter::Triangle => "tent",
            ResampleFilter::Kaiser => "kaiser",
            ResampleFilter::Lanczos3 => "lanczos3",
            ResampleFilter::Mitchell => "mitchell",
            ResampleFilter::Gaussian => "gaussian",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "box" => Some(ResampleFilter::Box),
            "tent" | "triangle" | "bilinear" => Some(ResampleFilter::Triangle),
            "kaiser" => Some(ResampleFilter::Kaiser),
            "lanczos" | "lanczos3" => Some(ResampleFilter::Lanczos3),
            "mitchell" => Some(ResampleFilter::Mitchell),
            "gaussian" => Some(ResampleFilter::Gaussian),
            _ => None,
        }
    }
}

/// Texture addressing at image borders
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WrapMode {
    #[default]
    Clamp,
    Wrap,
    Reflect,
}

impl WrapMode {
    pub fn encoder_name(&self) -> &'static str {
        match self {
            WrapMode::Clamp => "clamp",
            WrapMode::Wrap => "wrap",
            WrapMode::Reflect => "reflect",
        }
    }

    /// Maps any integer coordinate into `0..len`.
    pub fn resolve(&self, i: i64, len: u32) -> usize {
        let len = len as i64;
        let idx = match self {
            WrapMode::Clamp => i.clamp(0, len - 1),
            WrapMode::Wrap => i.rem_euclid(len),
            WrapMode::Reflect => {
                let period = 2 * len;
                let m = i.rem_euclid(period);
                if m >= len {
                    period - 1 - m
                } else {
                    m
                }
            }
        };
        idx as usize
    }
}

fn sinc(t: f64) -> f64 {
    if t.abs() < 1e-9 {
        1.0
    } else {
        let x = PI * t;
        x.sin() / x
    }
}

/// Zeroth order modified Bessel function of the first kind (power series).
fn bessel_i0(x: f64) -> f64 {
    let mut sum = 1.0;
    let mut term = 1.0;
    let half = x / 2.0;
    for k in 1..32 {
        term *= half / k as f64;
        let t2 = term * term;
        sum += t2;
        if t2 < sum * 1e-16 {
            break;
        }
    }
    sum
}

/// Normalized taps `(source index, weight)` for every destination texel of one axis.
fn contributions(
    src_len: u32,
    dst_len: u32,
    filter: ResampleFilter,
    blur: f64,
    wrap: WrapMode,
) -> Vec<Vec<(usize, f64)>> {
    let scale = src_len as f64 / dst_len as f64;
    let filter_scale = scale.max(1.0) * blur.max(0.01);
    let support = filter.support() * filter_scale;

    (0..dst_len)
        .map(|d| {
            let center = (d as f64 + 0.5) * scale - 0.5;
            let lo = (center - support).floor() as i64;
            let hi = (center + support).ceil() as i64;

            let mut taps = Vec::with_capacity((hi - lo + 1) as usize);
            let mut total = 0.0;
            for i in lo..=hi {
                let w = filter.weight((i as f64 - center) / filter_scale);
                if w != 0.0 {
                    taps.push((wrap.resolve(i, src_len), w));
                    total += w;
                }
            }

            if total.abs() < 1e-12 {
                return vec![(wrap.resolve(center.round() as i64, src_len), 1.0)];
            }
            for tap in &mut taps {
                tap.1 /= total;
            }
            taps
        })
        .collect()
}

/// Resamples `src` to `width` x `height`.
///
/// `blur` widens (> 1) or narrows (< 1) the kernel relative to the scale factor.
pub fn resample(
    src: &FloatImage,
    width: u32,
    height: u32,
    filter: ResampleFilter,
    blur: f32,
    wrap: WrapMode,
) -> FloatImage {
    let width = width.max(1);
    let height = height.max(1);
    if width == src.width && height == src.height && blur == 1.0 {
        return src.clone();
    }

    let ch = src.channels;
    let blur = blur as f64;

    // Horizontal pass: src.width -> width, rows unchanged
    let x_taps = contributions(src.width, width, filter, blur, wrap);
    let mut tmp = vec![0.0f32; width as usize * src.height as usize * ch];
    let src_row_len = src.width as usize * ch;
    tmp.par_chunks_mut(width as usize * ch)
        .enumerate()
        .for_each(|(y, row)| {
            let src_row = &src.data[y * src_row_len..(y + 1) * src_row_len];
            for (x, taps) in x_taps.iter().enumerate() {
                for c in 0..ch {
                    let sum: f64 = taps
                        .iter()
                        .map(|&(sx, w)| src_row[sx * ch + c] as f64 * w)
                        .sum();
                    row[x * ch + c] = sum as f32;
                }
            }
        });

    // Vertical pass: src.height -> height
    let y_taps = contributions(src.height, height, filter, blur, wrap);
    let row_len = width as usize * ch;
    let mut out = vec![0.0f32; row_len * height as usize];
    out.par_chunks_mut(row_len)
        .zip(y_taps.par_iter())
        .for_each(|(row, taps)| {
            for (i, value) in row.iter_mut().enumerate() {
                let sum: f64 = taps
                    .iter()
                    .map(|&(sy, w)| tmp[sy * row_len + i] as f64 * w)
                    .sum();
                *value = sum as f32;
            }
        });

    FloatImage {
        width,
        height,
        channels: ch,
        data: out,
    }
}
