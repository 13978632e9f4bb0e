//! Texture conversion pipeline CLI

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use texpipe_core::mip_level_count;
use texpipe_core::{
    AoProcessingMode, ChannelPacker, ChannelPackingSettings, ChannelSourceSettings, ChannelType,
    CompressionFormat, ConversionJob, ConversionResult, ConversionState, Converter, EncodeRequest,
    EncoderArgs, ImageLoader, Lane, MipLevelPolicy, MipmapMode, PackingMode, PipelineConfig,
    PresetRegistry, ProcessEncoder, TextureType, Validate,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Source extensions picked up by `batch`
const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "tga", "exr"];

#[derive(Parser)]
#[command(name = "texpipe")]
#[command(about = "Convert source textures into KTX2 / Basis GPU textures.")]
#[command(version = concat!("v", env!("CARGO_PKG_VERSION")))]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Pipeline configuration file (TOML)
    #[arg(long, global = true, env = "TEXPIPE_CONFIG")]
    config: Option<PathBuf>,

    /// Extra preset directory (or set TEXPIPE_PRESETS)
    #[arg(long, global = true)]
    presets_dir: Option<PathBuf>,

    /// Encoder executable, overrides the configuration
    #[arg(long, global = true, env = "TEXPIPE_ENCODER")]
    encoder: Option<PathBuf>,

    /// Conversions run at once
    #[arg(short, long, global = true)]
    jobs: Option<usize>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Compression overrides shared by the converting commands
#[derive(Args, Debug, Default)]
struct EncodeOptions {
    /// Preset id (see `texpipe presets`)
    #[arg(long)]
    preset: Option<String>,
    /// Block compression: etc1s or uastc
    #[arg(long)]
    format: Option<String>,
    /// Generate mip levels in the pipeline instead of the encoder
    #[arg(long, conflicts_with = "no_mipmaps")]
    custom_mipmaps: bool,
    /// Base level only
    #[arg(long)]
    no_mipmaps: bool,
    /// Also write every mip level as PNG next to the output
    #[arg(long)]
    keep_mipmaps: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert one texture
    Convert {
        /// Source image
        input: PathBuf,
        /// Output file (default: next to the source)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Texture type; detected from the file name when omitted
        #[arg(long = "type")]
        texture_type: Option<String>,
        #[command(flatten)]
        options: EncodeOptions,
        /// Print the conversion result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Pack AO / Gloss / Metallic / Height maps into one texture
    Pack {
        /// Output file
        #[arg(short, long)]
        output: PathBuf,
        /// Packing mode: og, ogm or ogmh
        #[arg(long, default_value = "ogm")]
        mode: String,
        /// Ambient occlusion map (red)
        #[arg(long)]
        ao: Option<PathBuf>,
        /// Gloss map (green)
        #[arg(long)]
        gloss: Option<PathBuf>,
        /// Metallic map (blue)
        #[arg(long)]
        metallic: Option<PathBuf>,
        /// Height map (alpha)
        #[arg(long)]
        height: Option<PathBuf>,
        /// Toksvig-correct the gloss lane
        #[arg(long)]
        toksvig: bool,
        /// Normal map for Toksvig (default: found by naming convention)
        #[arg(long, requires = "toksvig")]
        normal: Option<PathBuf>,
        /// Darken AO mips toward the footprint minimum by this amount (0-1)
        #[arg(long)]
        ao_darkening: Option<f32>,
        /// Size used when no lane has a source image
        #[arg(long)]
        size: Option<u32>,
        #[command(flatten)]
        options: EncodeOptions,
        /// Print the conversion result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Recursively convert every texture under a folder
    Batch {
        /// Root folder to scan recursively
        #[arg(value_name = "ROOT-FOLDER")]
        root_folder: PathBuf,
        /// Output folder (default: next to each source)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Write the JSON batch report to file
        #[arg(long)]
        report: Option<PathBuf>,
        #[command(flatten)]
        options: EncodeOptions,
        /// Print the batch report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the encoder command line without converting
    Args {
        /// Source image
        input: PathBuf,
        /// Output file (default: next to the source)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Texture type; detected from the file name when omitted
        #[arg(long = "type")]
        texture_type: Option<String>,
        #[command(flatten)]
        options: EncodeOptions,
    },
    /// List available presets
    Presets {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Serialize)]
struct PresetEntry<'a> {
    id: &'a str,
    name: &'a str,
    description: &'a str,
    format: CompressionFormat,
    packing_mode: PackingMode,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;

    let registry = build_registry(cli.presets_dir.as_ref());

    match &cli.command {
        Commands::Convert {
            input,
            output,
            texture_type,
            options,
            json,
        } => {
            let config = load_config(&cli, &registry, options)?;
            cmd_convert(config, input, output.as_deref(), texture_type.as_deref(), *json).await
        }
        Commands::Pack {
            output,
            mode,
            ao,
            gloss,
            metallic,
            height,
            toksvig,
            normal,
            ao_darkening,
            size,
            options,
            json,
        } => {
            let config = load_config(&cli, &registry, options)?;
            let lanes = PackSources {
                ao: ao.clone(),
                gloss: gloss.clone(),
                metallic: metallic.clone(),
                height: height.clone(),
            };
            let mut settings = packing_settings(mode, lanes, *size)?;
            if *toksvig {
                if let Some(gloss) = settings.green.as_mut() {
                    gloss.apply_toksvig = true;
                    gloss.toksvig = config.toksvig.clone();
                    gloss.normal_map_path = normal.clone();
                }
            }
            if let (Some(bias), Some(ao)) = (ao_darkening, settings.red.as_mut()) {
                ao.ao_processing = AoProcessingMode::BiasedDarkening;
                ao.ao_bias = *bias;
            }
            ChannelPacker::validate(&settings)?;
            cmd_pack(config, settings, output, *json).await
        }
        Commands::Batch {
            root_folder,
            output,
            report,
            options,
            json,
        } => {
            let config = load_config(&cli, &registry, options)?;
            cmd_batch(config, root_folder, output.as_deref(), report.as_deref(), *json).await
        }
        Commands::Args {
            input,
            output,
            texture_type,
            options,
        } => {
            let config = load_config(&cli, &registry, options)?;
            cmd_args(&config, input, output.as_deref(), texture_type.as_deref())
        }
        Commands::Presets { json } => cmd_presets(&registry, *json),
    }
}

fn init_logging(verbose: bool) -> Result<(), Box<dyn std::error::Error>> {
    let directive = if verbose { "texpipe_core=debug" } else { "texpipe_core=info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(directive.parse()?))
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

fn build_registry(presets_dir: Option<&PathBuf>) -> PresetRegistry {
    let mut registry = PresetRegistry::builtin();
    let dirs = PresetRegistry::default_dirs()
        .into_iter()
        .chain(presets_dir.cloned());
    for dir in dirs {
        let loaded = registry.load_dir(&dir);
        if loaded > 0 {
            debug!(dir = %dir.display(), loaded, "Loaded presets");
        }
    }
    registry
}

/// Config file first, then the preset, then command-line overrides.
fn load_config(
    cli: &Cli,
    registry: &PresetRegistry,
    options: &EncodeOptions,
) -> Result<PipelineConfig, Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };

    if let Some(id) = &options.preset {
        let preset = registry.require(id)?;
        config.preset_name = Some(preset.id.clone());
        config.compression = preset.compression.clone();
        config.histogram = preset.histogram.clone();
    }

    if let Some(name) = &options.format {
        config.compression.format = CompressionFormat::from_name(name)
            .ok_or_else(|| format!("Unknown format: {} (use etc1s or uastc)", name))?;
    }
    if options.custom_mipmaps {
        config.compression.generate_mipmaps = false;
        config.compression.use_custom_mipmaps = true;
    }
    if options.no_mipmaps {
        config.compression.generate_mipmaps = false;
        config.compression.use_custom_mipmaps = false;
    }
    if options.keep_mipmaps {
        config.save_separate_mipmaps = true;
    }
    if let Some(program) = &cli.encoder {
        config.encoder.program = program.clone();
    }
    if let Some(jobs) = cli.jobs {
        config.max_concurrent = jobs;
    }

    config.validate()?;
    Ok(config)
}

fn build_converter(
    config: PipelineConfig,
) -> Result<Converter<ProcessEncoder>, Box<dyn std::error::Error>> {
    let encoder =
        ProcessEncoder::new(config.encoder.program.clone()).with_timeout(config.encoder.timeout());
    let converter = Converter::new(config, encoder)?.with_observer(Arc::new(
        |job: &ConversionJob, state: ConversionState| {
            debug!(job = %job.describe(), %state, "State changed");
        },
    ));
    Ok(converter)
}

/// Token cancelled on Ctrl-C
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling conversions");
            child.cancel();
        }
    });
    token
}

fn parse_texture_type(name: Option<&str>) -> Result<Option<TextureType>, Box<dyn std::error::Error>> {
    name.map(|n| TextureType::from_name(n).ok_or_else(|| format!("Unknown texture type: {}", n).into()))
        .transpose()
}

fn default_output(config: &PipelineConfig, input: &Path) -> PathBuf {
    config.compression.output_format.apply_extension(input)
}

async fn cmd_convert(
    config: PipelineConfig,
    input: &Path,
    output: Option<&Path>,
    texture_type: Option<&str>,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let output = output
        .map(Path::to_path_buf)
        .unwrap_or_else(|| default_output(&config, input));
    let mut job = ConversionJob::image(input, output);
    if let Some(texture_type) = parse_texture_type(texture_type)? {
        job = job.with_texture_type(texture_type);
    }

    let converter = build_converter(config)?;
    let result = converter.convert(job, &cancel_on_ctrl_c()).await;
    print_result(&result, json)
}

struct PackSources {
    ao: Option<PathBuf>,
    gloss: Option<PathBuf>,
    metallic: Option<PathBuf>,
    height: Option<PathBuf>,
}

/// Every lane the mode requires, filled from its map or the channel default.
fn packing_settings(
    mode: &str,
    sources: PackSources,
    size: Option<u32>,
) -> Result<ChannelPackingSettings, Box<dyn std::error::Error>> {
    let mode = PackingMode::from_name(mode)
        .filter(|m| *m != PackingMode::None)
        .ok_or_else(|| format!("Unknown packing mode: {} (use og, ogm or ogmh)", mode))?;

    let mut settings = ChannelPackingSettings::for_mode(mode);
    for (lane, channel_type) in mode.required_lanes() {
        let source = match channel_type {
            ChannelType::AmbientOcclusion => &sources.ao,
            ChannelType::Gloss => &sources.gloss,
            ChannelType::Metallic => &sources.metallic,
            ChannelType::Height => &sources.height,
        };
        let mut channel = ChannelSourceSettings::new(*channel_type);
        if let Some(path) = source {
            channel = channel.with_source(path);
        }
        *settings.slot_mut(*lane) = Some(channel);
    }

    if sources.height.is_some() && mode != PackingMode::Ogmh {
        warn!("Height map ignored: only ogmh packs an alpha lane");
    }
    if let Some(size) = size {
        settings.fallback_size = size;
    }
    Ok(settings)
}

async fn cmd_pack(
    config: PipelineConfig,
    settings: ChannelPackingSettings,
    output: &Path,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let lanes: Vec<String> = settings
        .occupied()
        .map(|(lane, source)| format!("{}={}", lane, source.channel_type))
        .collect();
    info!(mode = ?settings.mode, lanes = %lanes.join(" "), "Packing channels");

    let converter = build_converter(config)?;
    let result = converter
        .convert(ConversionJob::packed(settings, output), &cancel_on_ctrl_c())
        .await;
    print_result(&result, json)
}

fn print_result(result: &ConversionResult, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
    } else if let Some(output) = &result.output_path {
        println!("{} -> {} ({} mip levels)", result.source, output.display(), result.mip_levels);
        if result.toksvig_applied {
            println!("  toksvig: applied");
        }
        if let Some(normalization) = &result.normalization {
            for (i, channel) in normalization.channels.iter().enumerate() {
                println!(
                    "  range[{}]: {:.3}..{:.3} (scale {:.3}, offset {:.3})",
                    i, channel.lo, channel.hi, channel.scale, channel.offset
                );
            }
        }
    }
    for warning in &result.warnings {
        eprintln!("Warning: {}", warning);
    }

    match &result.error {
        Some(error) if !result.success => Err(format!("{}: {}", result.source, error).into()),
        _ => Ok(()),
    }
}

async fn cmd_batch(
    config: PipelineConfig,
    root: &Path,
    output_dir: Option<&Path>,
    report_path: Option<&Path>,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if !root.is_dir() {
        return Err(format!("Not a directory: {}", root.display()).into());
    }

    let mut textures = Vec::new();
    find_textures(root, &mut textures);
    textures.sort();
    if textures.is_empty() {
        println!("No textures found under {}", root.display());
        return Ok(());
    }

    let jobs: Vec<ConversionJob> = textures
        .iter()
        .map(|texture| {
            let output = batch_output(&config, root, texture, output_dir);
            ConversionJob::image(texture, output)
        })
        .collect();
    info!(count = jobs.len(), root = %root.display(), "Converting textures");

    let converter = Arc::new(build_converter(config)?);
    let report = converter.convert_batch(jobs, cancel_on_ctrl_c()).await;

    if let Some(path) = report_path {
        report.write_json(path)?;
        println!("Report written to {}", path.display());
    }

    if json {
        println!("{}", report.to_json()?);
    } else {
        for result in &report.results {
            if result.success {
                println!("  OK   {} ({} mips)", result.source, result.mip_levels);
            } else {
                println!(
                    "  FAIL {}: {}",
                    result.source,
                    result.error.as_deref().unwrap_or("unknown error")
                );
            }
        }
        println!(
            "\n{} textures: {} converted, {} failed",
            report.total, report.succeeded, report.failed
        );
    }

    if !report.all_succeeded() {
        std::process::exit(1);
    }
    Ok(())
}

/// Mirrors the source tree under `output_dir`, or writes next to the source.
fn batch_output(
    config: &PipelineConfig,
    root: &Path,
    texture: &Path,
    output_dir: Option<&Path>,
) -> PathBuf {
    let target = match output_dir {
        Some(dir) => dir.join(texture.strip_prefix(root).unwrap_or(texture)),
        None => texture.to_path_buf(),
    };
    default_output(config, &target)
}

fn find_textures(dir: &Path, results: &mut Vec<PathBuf>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return,
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            // Mip dumps from an earlier --keep-mipmaps run
            let is_mip_dump = path
                .file_name()
                .and_then(OsStr::to_str)
                .is_some_and(|n| n.ends_with("_mips"));
            if !is_mip_dump {
                find_textures(&path, results);
            }
        } else if is_texture_file(&path) {
            results.push(path);
        }
    }
}

fn is_texture_file(path: &Path) -> bool {
    path.extension()
        .and_then(OsStr::to_str)
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

fn cmd_args(
    config: &PipelineConfig,
    input: &Path,
    output: Option<&Path>,
    texture_type: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let texture_type = parse_texture_type(texture_type)?
        .or_else(|| ImageLoader::detect_type_from_path(input))
        .unwrap_or_default();
    let map = ImageLoader::load_texture(input)?;
    let output = output
        .map(Path::to_path_buf)
        .unwrap_or_else(|| default_output(config, input));

    let mut settings = config.compression.clone();
    let profile = config.profile_for(texture_type);
    let levels = MipLevelPolicy::from_settings(&settings).level_count(
        map.width,
        map.height,
        profile.min_mip_size,
    );
    // A truncated chain is generated by the pipeline, not the encoder
    if settings.mipmap_mode() == MipmapMode::Encoder
        && levels < mip_level_count(map.width, map.height, true, 1)
    {
        settings.generate_mipmaps = false;
        settings.use_custom_mipmaps = true;
    }

    let inputs: Vec<PathBuf> = if settings.mipmap_mode() == MipmapMode::Pipeline {
        (0..levels).map(|i| PathBuf::from(format!("mip_{:02}.png", i))).collect()
    } else {
        vec![input.to_path_buf()]
    };

    let args = EncoderArgs::build(&EncodeRequest {
        settings: &settings,
        texture_type,
        inputs: &inputs,
        output: &output,
        has_alpha: map.has_alpha(),
    })?;
    println!("{} {}", config.encoder.program.display(), args.to_command_line());
    Ok(())
}

fn cmd_presets(registry: &PresetRegistry, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let entries: Vec<PresetEntry> = registry
        .iter()
        .map(|p| PresetEntry {
            id: &p.id,
            name: &p.name,
            description: &p.description,
            format: p.compression.format,
            packing_mode: p.packing_mode,
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else {
        for entry in &entries {
            let packing = match entry.packing_mode {
                PackingMode::None => String::new(),
                mode => format!(" [packed {:?}]", mode),
            };
            println!("{:<16} {}{}", entry.id, entry.name, packing);
            if !entry.description.is_empty() {
                println!("  {}", entry.description);
            }
        }
        println!("\nSearch paths: ./.texpipe/presets, ~/.config/texpipe/presets, TEXPIPE_PRESETS");
    }
    Ok(())
}
