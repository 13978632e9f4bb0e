//! # texpipe core
//!
//! Texture conversion pipeline: turns source textures into GPU-ready
//! KTX2 / Basis containers through an external encoder process.
//!
//! ## Architecture
//!
//! - [`image_loading`] - Image loading, texture-type detection and normal-map pairing
//! - [`texture`] - RGBA8 and floating point texel buffers
//! - [`compression`] - Encoder tunables (ETC1S / UASTC, container, color space)
//! - [`resample`] - Separable resampling kernels
//! - [`mipmaps`] - Per-texture-type mip generation profiles and mip chains
//! - [`toksvig`] - Variance based gloss correction against a paired normal map
//! - [`histogram`] - Optional percentile range normalization with GPU inversion metadata
//! - [`packing`] - AO / Gloss / Metallic / Height channel packing
//! - [`encoder_args`] - Deterministic encoder argument vector
//! - [`encoder`] - External encoder process with cancellation
//! - [`pipeline`] - Per-texture conversion state machine and batch runner
//! - [`presets`] / [`config`] - Preset registry and the per-conversion configuration
//! - [`report`] - Conversion results and batch reports
//! - [`validation`] - Cross-field settings validation

pub mod compression;
pub mod config;
pub mod encoder;
pub mod encoder_args;
pub mod histogram;
pub mod image_loading;
pub mod mipmaps;
pub mod packing;
pub mod pipeline;
pub mod presets;
pub mod report;
pub mod resample;
pub mod texture;
pub mod toksvig;
pub mod validation;

// Re-export main types for convenient access
pub use compression::{
    AlphaPolicy, ColorSpace, CompressionFormat, CompressionSettings, MipmapMode, OutputFormat,
    Supercompression,
};
pub use config::{EncoderConfig, PipelineConfig};
pub use encoder::{EncoderOutput, ProcessEncoder, TextureEncoder};
pub use encoder_args::{EncodeRequest, EncoderArg, EncoderArgs};
pub use histogram::{
    ChannelAnalysis, ChannelNormalization, HistogramMode, HistogramSettings,
    NormalizationMetadata,
};
pub use image_loading::{find_paired_normal_map, ImageLoader, LoadedImage, TextureType};
pub use mipmaps::{
    generate_chain, mip_level_count, MipChain, MipGenerationProfile, MipLevelPolicy, MipModifier,
};
pub use packing::{
    AoProcessingMode, ChannelPacker, ChannelPackingSettings, ChannelSourceSettings, ChannelType,
    Lane, PackedTexture, PackingMode, PreparedChannels,
};
pub use pipeline::{ConversionJob, ConversionState, Converter, StateObserver, TextureSource};
pub use presets::{Preset, PresetRegistry};
pub use report::{BatchReport, ConversionResult};
pub use resample::{ResampleFilter, WrapMode};
pub use texture::{FloatImage, TextureMap};
pub use toksvig::{ToksvigCorrector, ToksvigMode, ToksvigSettings};
pub use validation::{Issue, Validate};

/// Common result type for pipeline operations
pub type Result<T> = std::result::Result<T, Error>;

/// Library-wide error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid settings: {}", validation::join_issues(.0))]
    Validation(Vec<Issue>),

    #[error("Missing source image for {what}: {path}")]
    MissingSource { what: String, path: String },

    #[error("Failed to start encoder {program}: {source}")]
    EncoderSpawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Encoder failed (exit code {}): {output}", exit_code_label(.code))]
    Encoder { code: Option<i32>, output: String },

    #[error("Conversion cancelled")]
    Cancelled,

    #[error("Worker task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("{0}")]
    Other(String),
}

fn exit_code_label(code: &Option<i32>) -> String {
    code.map(|c| c.to_string())
        .unwrap_or_else(|| "none".to_string())
}
