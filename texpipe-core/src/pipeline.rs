//! Conversion orchestration.
//!
//! A [`Converter`] takes one [`ConversionJob`] through
//!
//! ```text
//! Idle -> Resampling -> (Normalizing) -> (Packing) -> Encoding -> Done | Failed
//! ```
//!
//! Image work runs on the blocking pool, the encoder is awaited
//! asynchronously. The cancellation token is checked on entry to every stage
//! and raced against the encoder process. Temporary mip files live in a
//! scoped directory that is removed on every exit path unless
//! `remove_temporary_mipmaps` is turned off.

use crate::compression::{CompressionSettings, MipmapMode};
use crate::config::PipelineConfig;
use crate::encoder::TextureEncoder;
use crate::encoder_args::{EncodeRequest, EncoderArgs};
use crate::histogram::{normalize_chain, write_sidecar, NormalizationMetadata};
use crate::image_loading::{find_paired_normal_map, ImageLoader, TextureType};
use crate::mipmaps::{generate_chain, mip_level_count, MipChain, MipLevelPolicy};
use crate::packing::{ChannelPacker, ChannelPackingSettings, PreparedChannels};
use crate::report::{BatchReport, ConversionResult};
use crate::texture::FloatImage;
use crate::toksvig::ToksvigCorrector;
use crate::validation::{Issue, Validate};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What a job converts
#[derive(Debug, Clone)]
pub enum TextureSource {
    /// A single image; the type is detected from the file name when unset
    Image {
        path: PathBuf,
        texture_type: Option<TextureType>,
    },
    /// Several grayscale maps packed into one texture
    Packed(ChannelPackingSettings),
}

#[derive(Debug, Clone)]
pub struct ConversionJob {
    pub source: TextureSource,
    /// Output file; the extension follows the configured container
    pub output: PathBuf,
}

impl ConversionJob {
    pub fn image(path: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            source: TextureSource::Image {
                path: path.into(),
                texture_type: None,
            },
            output: output.into(),
        }
    }

    pub fn packed(settings: ChannelPackingSettings, output: impl Into<PathBuf>) -> Self {
        Self {
            source: TextureSource::Packed(settings),
            output: output.into(),
        }
    }

    pub fn with_texture_type(mut self, texture_type: TextureType) -> Self {
        if let TextureSource::Image {
            texture_type: ref mut t,
            ..
        } = self.source
        {
            *t = Some(texture_type);
        }
        self
    }

    /// Short human readable description of the input
    pub fn describe(&self) -> String {
        match &self.source {
            TextureSource::Image { path, .. } => path.display().to_string(),
            TextureSource::Packed(settings) => {
                let lanes: Vec<String> = settings
                    .occupied()
                    .map(|(lane, source)| match &source.source_path {
                        Some(path) => format!("{}={}", lane, path.display()),
                        None => format!("{}={}", lane, source.default_value),
                    })
                    .collect();
                format!("packed {:?} [{}]", settings.mode, lanes.join(", "))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversionState {
    Idle,
    Resampling,
    Normalizing,
    Packing,
    Encoding,
    Done,
    Failed,
}

impl fmt::Display for ConversionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConversionState::Idle => "idle",
            ConversionState::Resampling => "resampling",
            ConversionState::Normalizing => "normalizing",
            ConversionState::Packing => "packing",
            ConversionState::Encoding => "encoding",
            ConversionState::Done => "done",
            ConversionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Called on every state transition
pub type StateObserver = Arc<dyn Fn(&ConversionJob, ConversionState) + Send + Sync>;

/// Mutable bookkeeping of one conversion
#[derive(Debug, Default)]
struct Progress {
    toksvig_applied: bool,
    normalization: Option<NormalizationMetadata>,
    warnings: Vec<String>,
}

/// Image data handed from the CPU stages to the encoder stage
struct Prepared {
    chain: MipChain,
    texture_type: TextureType,
    has_alpha: bool,
    settings: CompressionSettings,
}

/// Runs conversions with one configuration and one encoder
pub struct Converter<E> {
    config: Arc<PipelineConfig>,
    encoder: E,
    observer: Option<StateObserver>,
}

impl<E: TextureEncoder> Converter<E> {
    /// Validates `config` once; every conversion shares it read-only.
    pub fn new(config: PipelineConfig, encoder: E) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            encoder,
            observer: None,
        })
    }

    pub fn with_observer(mut self, observer: StateObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn encoder(&self) -> &E {
        &self.encoder
    }

    fn enter(&self, job: &ConversionJob, state: ConversionState) {
        debug!(source = %job.describe(), %state, "Conversion state");
        if let Some(observer) = &self.observer {
            observer(job, state);
        }
    }

    /// Enters `state` unless the conversion has been cancelled.
    fn advance(
        &self,
        job: &ConversionJob,
        state: ConversionState,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.enter(job, state);
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    /// Converts one job. Never panics or errors; failures are in the result.
    pub async fn convert(&self, job: ConversionJob, cancel: &CancellationToken) -> ConversionResult {
        self.enter(&job, ConversionState::Idle);
        let mut progress = Progress::default();

        match self.run(&job, cancel, &mut progress).await {
            Ok((output, mip_levels)) => {
                self.enter(&job, ConversionState::Done);
                info!(source = %job.describe(), output = %output.display(), mip_levels, "Converted");
                let mut result = ConversionResult::succeeded(job.describe(), output, mip_levels)
                    .with_warnings(progress.warnings);
                result.toksvig_applied = progress.toksvig_applied;
                result.normalization = progress.normalization;
                result
            }
            Err(e) => {
                self.enter(&job, ConversionState::Failed);
                warn!(source = %job.describe(), error = %e, "Conversion failed");
                let mut result = ConversionResult::failed(job.describe(), e.to_string())
                    .with_warnings(progress.warnings);
                result.toksvig_applied = progress.toksvig_applied;
                result
            }
        }
    }

    async fn run(
        &self,
        job: &ConversionJob,
        cancel: &CancellationToken,
        progress: &mut Progress,
    ) -> Result<(PathBuf, u32)> {
        let prepared = match &job.source {
            TextureSource::Image { path, texture_type } => {
                if !path.is_file() {
                    return Err(Error::MissingSource {
                        what: "texture".into(),
                        path: path.display().to_string(),
                    });
                }
                let texture_type = texture_type
                    .or_else(|| ImageLoader::detect_type_from_path(path))
                    .unwrap_or_default();

                self.advance(job, ConversionState::Resampling, cancel)?;
                let (mut prepared, toksvig_applied, warnings) =
                    self.prepare_image(path.clone(), texture_type).await?;
                progress.toksvig_applied = toksvig_applied;
                progress.warnings.extend(warnings);

                if self.config.histogram.is_enabled() && texture_type == TextureType::Normal {
                    debug!("Histogram normalization does not apply to normal maps");
                } else if self.config.histogram.is_enabled() {
                    self.advance(job, ConversionState::Normalizing, cancel)?;
                    let histogram = self.config.histogram.clone();
                    let mut chain = prepared.chain;
                    let (chain, metadata) = tokio::task::spawn_blocking(move || {
                        let metadata = normalize_chain(&mut chain, &histogram);
                        (chain, metadata)
                    })
                    .await?;
                    prepared.chain = chain;
                    progress.normalization = metadata;
                }
                prepared
            }
            TextureSource::Packed(packing) => {
                // Validation only checks that configured files exist
                let packer = ChannelPacker::new(packing.clone())?;
                let alpha_policy = self.config.compression.alpha_policy;
                if packing.alpha.is_some() && !alpha_policy.keeps_alpha(true) {
                    return Err(Error::Validation(vec![Issue::new(
                        "compression.alpha_policy",
                        format!(
                            "{:?} packing stores height in alpha; alpha_policy remove would drop it",
                            packing.mode
                        ),
                    )]));
                }
                if self.config.histogram.is_enabled() {
                    debug!("Histogram normalization does not apply to packed textures");
                }

                self.advance(job, ConversionState::Resampling, cancel)?;
                let channels = self.prepare_packed(packer.clone()).await?;
                progress.toksvig_applied = channels.toksvig_applied;

                self.advance(job, ConversionState::Packing, cancel)?;
                let packed = tokio::task::spawn_blocking(move || packer.pack(channels)).await?;
                progress.warnings.extend(packed.warnings);

                let mut settings = self.config.compression.clone();
                if settings.mipmaps_enabled() {
                    // Per-channel profiles only exist in pipeline made mips
                    settings.generate_mipmaps = false;
                    settings.use_custom_mipmaps = true;
                }
                Prepared {
                    chain: packed.chain,
                    texture_type: TextureType::Generic,
                    has_alpha: packing.alpha.is_some(),
                    settings,
                }
            }
        };

        self.advance(job, ConversionState::Encoding, cancel)?;
        let (output, mip_levels) = self.encode(job, prepared, cancel).await?;

        if let Some(metadata) = &progress.normalization {
            if metadata.invertible {
                let sidecar = write_sidecar(&output, metadata)?;
                debug!(path = %sidecar.display(), "Wrote normalization metadata");
            } else {
                progress.warnings.push(
                    "soft knee normalization is not invertible; no metadata written".to_string(),
                );
            }
        }

        Ok((output, mip_levels))
    }

    /// Loads an image and builds its chain (base only when the encoder makes the mips).
    async fn prepare_image(
        &self,
        path: PathBuf,
        texture_type: TextureType,
    ) -> Result<(Prepared, bool, Vec<String>)> {
        let config = Arc::clone(&self.config);

        tokio::task::spawn_blocking(move || -> Result<(Prepared, bool, Vec<String>)> {
            let map = ImageLoader::load_texture(&path)?;
            let has_alpha = map.has_alpha();
            let mut settings = config.compression.clone();
            let channels = if settings.alpha_policy.keeps_alpha(has_alpha) { 4 } else { 3 };
            let base = FloatImage::from_texture(&map, channels);
            let profile = config.profile_for(texture_type);
            let mut warnings = Vec::new();

            // Toksvig needs every level, so it promotes the conversion to pipeline mips
            let toksvig = config.toksvig_settings(&path).clone();
            let normal = if toksvig.enabled
                && settings.mipmaps_enabled()
                && matches!(texture_type, TextureType::Gloss | TextureType::Roughness)
            {
                match find_paired_normal_map(&path) {
                    Some(normal_path) => {
                        let normal = ToksvigCorrector::load_normal_map(&normal_path);
                        if normal.is_none() {
                            warnings.push(format!(
                                "normal map {} unreadable, Toksvig correction skipped",
                                normal_path.display()
                            ));
                        }
                        normal
                    }
                    None => {
                        warn!(path = %path.display(), "No paired normal map found, skipping Toksvig correction");
                        warnings.push("no paired normal map found, Toksvig correction skipped".into());
                        None
                    }
                }
            } else {
                None
            };

            if normal.is_some() && settings.mipmap_mode() == MipmapMode::Encoder {
                settings.generate_mipmaps = false;
                settings.use_custom_mipmaps = true;
            }

            // The encoder always builds the full chain down to 1x1
            if settings.mipmap_mode() == MipmapMode::Encoder {
                let policy = MipLevelPolicy::from_settings(&settings);
                let wanted = policy.level_count(base.width, base.height, profile.min_mip_size);
                let full = mip_level_count(base.width, base.height, true, 1);
                if wanted < full {
                    debug!(wanted, full, "Truncated mip chain, generating levels in the pipeline");
                    settings.generate_mipmaps = false;
                    settings.use_custom_mipmaps = true;
                }
            }

            let mut chain = if settings.mipmap_mode() == MipmapMode::Pipeline {
                let policy = MipLevelPolicy::from_settings(&settings);
                let levels = policy.level_count(base.width, base.height, profile.min_mip_size);
                generate_chain(&base, &profile, settings.wrap_mode, levels)
            } else {
                MipChain::single(base)
            };

            let mut toksvig_applied = false;
            if let Some(normal) = normal {
                let corrector = ToksvigCorrector::new(toksvig)?;
                toksvig_applied =
                    corrector.apply(&mut chain, &normal, texture_type == TextureType::Gloss);
            }

            Ok((
                Prepared {
                    chain,
                    texture_type,
                    has_alpha,
                    settings,
                },
                toksvig_applied,
                warnings,
            ))
        })
        .await?
    }

    async fn prepare_packed(&self, packer: ChannelPacker) -> Result<PreparedChannels> {
        let policy = MipLevelPolicy::from_settings(&self.config.compression);
        let wrap = self.config.compression.wrap_mode;
        tokio::task::spawn_blocking(move || packer.prepare(policy, wrap)).await?
    }

    /// Writes the levels to a scoped temp dir and runs the encoder.
    async fn encode(
        &self,
        job: &ConversionJob,
        prepared: Prepared,
        cancel: &CancellationToken,
    ) -> Result<(PathBuf, u32)> {
        let settings = &prepared.settings;
        let output = settings.output_format.apply_extension(&job.output);
        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let (base_width, base_height) = (prepared.chain.base().width, prepared.chain.base().height);
        let temp = self.temp_dir()?;
        let temp_path = temp.path().to_path_buf();
        let chain = prepared.chain;
        let inputs = tokio::task::spawn_blocking(move || write_levels(&chain, &temp_path)).await??;

        if self.config.save_separate_mipmaps {
            let dir = separate_mips_dir(&output);
            copy_levels(&inputs, &dir).await?;
            debug!(dir = %dir.display(), levels = inputs.len(), "Saved separate mipmaps");
        }

        let args = EncoderArgs::build(&EncodeRequest {
            settings,
            texture_type: prepared.texture_type,
            inputs: &inputs,
            output: &output,
            has_alpha: prepared.has_alpha,
        })?;

        let result = self.encoder.encode(&args, cancel).await;
        self.finish_temp(temp);
        result?;

        if !output.is_file() {
            return Err(Error::Other(format!(
                "Encoder exited successfully but {} was not written",
                output.display()
            )));
        }

        let mip_levels = match settings.mipmap_mode() {
            MipmapMode::Encoder => {
                let profile = self.config.profile_for(prepared.texture_type);
                MipLevelPolicy::from_settings(settings).level_count(
                    base_width,
                    base_height,
                    profile.min_mip_size,
                )
            }
            _ => inputs.len() as u32,
        };

        Ok((output, mip_levels))
    }

    fn temp_dir(&self) -> Result<TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("texpipe-");
        let dir = match &self.config.temp_dir {
            Some(parent) => {
                std::fs::create_dir_all(parent)?;
                builder.tempdir_in(parent)?
            }
            None => builder.tempdir()?,
        };
        Ok(dir)
    }

    fn finish_temp(&self, temp: TempDir) {
        if self.config.compression.remove_temporary_mipmaps {
            // Drop removes the directory
            drop(temp);
        } else {
            let kept = temp.keep();
            info!(dir = %kept.display(), "Kept temporary mipmaps");
        }
    }
}

impl<E: TextureEncoder + 'static> Converter<E> {
    /// Converts every job with at most `max_concurrent` in flight. Results
    /// keep job order; one failure never stops the others.
    pub async fn convert_batch(
        self: Arc<Self>,
        jobs: Vec<ConversionJob>,
        cancel: CancellationToken,
    ) -> BatchReport {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent.max(1)));
        let descriptions: Vec<String> = jobs.iter().map(ConversionJob::describe).collect();
        let mut set = JoinSet::new();

        for (index, job) in jobs.into_iter().enumerate() {
            let converter = Arc::clone(&self);
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            set.spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => converter.convert(job, &cancel).await,
                    Err(_) => ConversionResult::failed(job.describe(), "worker pool closed"),
                };
                (index, result)
            });
        }

        let mut results: Vec<Option<ConversionResult>> = vec![None; descriptions.len()];
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, result)) => results[index] = Some(result),
                Err(e) => warn!(error = %e, "Conversion task failed"),
            }
        }

        let results = results
            .into_iter()
            .zip(descriptions)
            .map(|(result, source)| {
                result.unwrap_or_else(|| ConversionResult::failed(source, "conversion task aborted"))
            })
            .collect();

        BatchReport::new(self.config.preset_name.clone(), results)
    }
}

/// Saves every level as `mip_NN.png` and returns the paths in level order.
fn write_levels(chain: &MipChain, dir: &Path) -> Result<Vec<PathBuf>> {
    chain
        .levels
        .iter()
        .enumerate()
        .map(|(level, image)| {
            let path = dir.join(format!("mip_{:02}.png", level));
            image.save_png(&path)?;
            Ok(path)
        })
        .collect()
}

/// `<output dir>/<stem>_mips`
fn separate_mips_dir(output: &Path) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "texture".to_string());
    output.with_file_name(format!("{}_mips", stem))
}

async fn copy_levels(levels: &[PathBuf], dir: &Path) -> Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    for level in levels {
        if let Some(name) = level.file_name() {
            tokio::fs::copy(level, dir.join(name)).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packing::{ChannelSourceSettings, ChannelType, Lane, PackingMode};

    #[test]
    fn describe_image_and_packed_jobs() {
        let job = ConversionJob::image("assets/brick_albedo.png", "out/brick_albedo.ktx2");
        assert_eq!(job.describe(), "assets/brick_albedo.png");

        let settings = ChannelPackingSettings::for_mode(PackingMode::Og).with_slot(
            Lane::Red,
            ChannelSourceSettings::new(ChannelType::AmbientOcclusion).with_source("rock_ao.png"),
        );
        let job = ConversionJob::packed(settings, "out/rock_orm.ktx2");
        assert_eq!(job.describe(), "packed Og [red=rock_ao.png, green=0.5]");
    }

    #[test]
    fn separate_mips_live_next_to_output() {
        assert_eq!(
            separate_mips_dir(Path::new("out/brick.ktx2")),
            PathBuf::from("out/brick_mips")
        );
    }

    #[test]
    fn texture_type_override_only_for_images() {
        let job = ConversionJob::image("a.png", "a.ktx2").with_texture_type(TextureType::Normal);
        assert!(matches!(
            job.source,
            TextureSource::Image {
                texture_type: Some(TextureType::Normal),
                ..
            }
        ));
    }

    #[test]
    fn levels_are_written_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let chain = MipChain {
            levels: vec![FloatImage::filled(4, 4, 3, 0.5), FloatImage::filled(2, 2, 3, 0.5)],
        };
        let paths = write_levels(&chain, dir.path()).unwrap();
        assert_eq!(paths[0], dir.path().join("mip_00.png"));
        assert_eq!(image::image_dimensions(&paths[1]).unwrap(), (2, 2));
    }
}
