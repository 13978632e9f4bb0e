use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use texpipe_core::packing::{ChannelSourceSettings, ChannelType, Lane, PackingMode};
use texpipe_core::{
    AlphaPolicy, ChannelPackingSettings, CompressionSettings, ConversionJob, ConversionState, Converter,
    EncoderArgs, EncoderOutput, HistogramMode, PipelineConfig, Result, TextureEncoder,
    ToksvigSettings,
};
use tokio_util::sync::CancellationToken;

/// Records every argument vector and writes a placeholder output file.
#[derive(Default)]
struct RecordingEncoder {
    calls: AtomicUsize,
    args: Mutex<Vec<Vec<String>>>,
}

impl RecordingEncoder {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn last_args(&self) -> Vec<String> {
        self.args.lock().unwrap().last().cloned().unwrap_or_default()
    }
}

impl TextureEncoder for RecordingEncoder {
    async fn encode(&self, args: &EncoderArgs, _cancel: &CancellationToken) -> Result<EncoderOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.args.lock().unwrap().push(args.to_strings());
        for input in args.paths().take(args.paths().count() - 1) {
            assert!(input.is_file(), "missing encoder input {}", input.display());
        }
        if let Some(output) = args.paths().last() {
            std::fs::write(output, b"KTX2")?;
        }
        Ok(EncoderOutput::default())
    }
}

fn write_png(path: &Path, size: u32, rgba: [u8; 4]) {
    image::RgbaImage::from_pixel(size, size, image::Rgba(rgba))
        .save(path)
        .unwrap();
}

fn gradient_png(path: &Path, size: u32) {
    let img = image::RgbaImage::from_fn(size, size, |x, _| {
        let v = (40 + x * 120 / size) as u8;
        image::Rgba([v, v, v, 255])
    });
    img.save(path).unwrap();
}

fn converter(config: PipelineConfig) -> Converter<RecordingEncoder> {
    Converter::new(config, RecordingEncoder::default()).unwrap()
}

#[tokio::test]
async fn albedo_256_converts_with_nine_levels() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("brick_albedo.png");
    write_png(&source, 256, [180, 120, 90, 255]);

    let converter = converter(PipelineConfig::default());
    let result = converter
        .convert(
            ConversionJob::image(&source, dir.path().join("out/brick_albedo.ktx2")),
            &CancellationToken::new(),
        )
        .await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.state, ConversionState::Done);
    assert_eq!(result.mip_levels, 9);
    let output = result.output_path.unwrap();
    assert!(output.is_file());

    let args = converter.encoder().last_args();
    assert!(args.contains(&"--generate-mipmap".to_string()));
    assert!(args.contains(&"R8G8B8_SRGB".to_string()));
    assert!(!args.contains(&"--levels".to_string()));
}

#[tokio::test]
async fn pipeline_mips_pass_every_level() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("rock_normal.png");
    write_png(&source, 64, [128, 128, 255, 255]);

    let config = PipelineConfig {
        compression: CompressionSettings {
            generate_mipmaps: false,
            use_custom_mipmaps: true,
            ..CompressionSettings::uastc()
        },
        ..Default::default()
    };
    let converter = converter(config);
    let result = converter
        .convert(
            ConversionJob::image(&source, dir.path().join("rock_normal.ktx2")),
            &CancellationToken::new(),
        )
        .await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.mip_levels, 7);
    let args = converter.encoder().last_args();
    let levels = args.iter().position(|a| a == "--levels").unwrap();
    assert_eq!(args[levels + 1], "7");
    assert!(args.contains(&"--normal-mode".to_string()));
    // 7 inputs + output
    assert_eq!(args.iter().filter(|a| a.ends_with(".png")).count(), 7);
}

#[tokio::test]
async fn packed_ogm_constants_quantize_per_lane() {
    let dir = tempfile::tempdir().unwrap();
    let packing = ChannelPackingSettings {
        fallback_size: 32,
        ..ChannelPackingSettings::for_mode(PackingMode::Ogm)
    }
    .with_slot(
        Lane::Red,
        ChannelSourceSettings::new(ChannelType::AmbientOcclusion).with_default(1.0),
    )
    .with_slot(
        Lane::Green,
        ChannelSourceSettings::new(ChannelType::Gloss)
            .with_default(0.5)
            .with_toksvig(ToksvigSettings::default()),
    )
    .with_slot(
        Lane::Blue,
        ChannelSourceSettings::new(ChannelType::Metallic).with_default(0.0),
    );

    let config = PipelineConfig {
        save_separate_mipmaps: true,
        ..Default::default()
    };
    let converter = converter(config);
    let result = converter
        .convert(
            ConversionJob::packed(packing, dir.path().join("rock_orm.ktx2")),
            &CancellationToken::new(),
        )
        .await;

    assert!(result.success, "{:?}", result.error);
    assert!(!result.toksvig_applied);
    assert!(!result.warnings.is_empty());
    assert_eq!(result.mip_levels, 6);

    let mips = dir.path().join("rock_orm_mips");
    for level in 0..6 {
        let img = image::open(mips.join(format!("mip_{:02}.png", level)))
            .unwrap()
            .to_rgba8();
        assert!(img.pixels().all(|p| p.0 == [255, 128, 0, 255]), "level {}", level);
    }

    let args = converter.encoder().last_args();
    assert!(args.contains(&"--levels".to_string()));
    assert!(args.contains(&"R8G8B8_UNORM".to_string()));
}

#[tokio::test]
async fn cancellation_before_encoding_spawns_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("brick_albedo.png");
    write_png(&source, 64, [200, 200, 200, 255]);
    let scratch = dir.path().join("scratch");

    let cancel = CancellationToken::new();
    let states = Arc::new(Mutex::new(Vec::new()));
    let observer = {
        let cancel = cancel.clone();
        let states = Arc::clone(&states);
        Arc::new(move |_: &ConversionJob, state: ConversionState| {
            states.lock().unwrap().push(state);
            if state == ConversionState::Encoding {
                cancel.cancel();
            }
        })
    };

    let config = PipelineConfig {
        temp_dir: Some(scratch.clone()),
        compression: CompressionSettings {
            generate_mipmaps: false,
            use_custom_mipmaps: true,
            ..Default::default()
        },
        ..Default::default()
    };
    let converter = converter(config).with_observer(observer);
    let result = converter
        .convert(ConversionJob::image(&source, dir.path().join("brick.ktx2")), &cancel)
        .await;

    assert!(!result.success);
    assert_eq!(result.state, ConversionState::Failed);
    assert_eq!(result.error.as_deref(), Some("Conversion cancelled"));
    assert_eq!(converter.encoder().calls(), 0);
    assert!(!dir.path().join("brick.ktx2").exists());

    let leftovers = std::fs::read_dir(&scratch)
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(leftovers, 0);

    assert_eq!(
        *states.lock().unwrap(),
        vec![
            ConversionState::Idle,
            ConversionState::Resampling,
            ConversionState::Encoding,
            ConversionState::Failed
        ]
    );
}

#[tokio::test]
async fn truncated_chain_moves_mips_into_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("brick_albedo.png");
    write_png(&source, 256, [180, 120, 90, 255]);

    let config = PipelineConfig {
        compression: CompressionSettings {
            include_last_level: false,
            mip_smallest_dimension: 16,
            ..CompressionSettings::default()
        },
        ..Default::default()
    };
    let converter = converter(config);
    let result = converter
        .convert(
            ConversionJob::image(&source, dir.path().join("brick_albedo.ktx2")),
            &CancellationToken::new(),
        )
        .await;

    assert!(result.success, "{:?}", result.error);
    // 256..16, the 1x1 level is already below the floor
    assert_eq!(result.mip_levels, 5);
    let args = converter.encoder().last_args();
    assert!(!args.contains(&"--generate-mipmap".to_string()));
    let levels = args.iter().position(|a| a == "--levels").unwrap();
    assert_eq!(args[levels + 1], "5");
    assert_eq!(args.iter().filter(|a| a.ends_with(".png")).count(), 5);
}

#[tokio::test]
async fn dropping_last_level_alone_is_honoured() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("brick_albedo.png");
    write_png(&source, 64, [180, 120, 90, 255]);

    let config = PipelineConfig {
        compression: CompressionSettings {
            include_last_level: false,
            ..CompressionSettings::default()
        },
        ..Default::default()
    };
    let converter = converter(config);
    let result = converter
        .convert(
            ConversionJob::image(&source, dir.path().join("brick_albedo.ktx2")),
            &CancellationToken::new(),
        )
        .await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.mip_levels, 6);
    let args = converter.encoder().last_args();
    let levels = args.iter().position(|a| a == "--levels").unwrap();
    assert_eq!(args[levels + 1], "6");
}

#[tokio::test]
async fn height_lane_needs_alpha() {
    let dir = tempfile::tempdir().unwrap();
    let mut packing = ChannelPackingSettings {
        fallback_size: 16,
        ..ChannelPackingSettings::for_mode(PackingMode::Ogmh)
    };
    for (lane, channel_type) in PackingMode::Ogmh.required_lanes() {
        *packing.slot_mut(*lane) = Some(ChannelSourceSettings::new(*channel_type));
    }
    packing.alpha = Some(ChannelSourceSettings::new(ChannelType::Height).with_default(0.25));

    let mut config = PipelineConfig::default();
    config.compression.alpha_policy = AlphaPolicy::Remove;
    let converter = converter(config);
    let result = converter
        .convert(
            ConversionJob::packed(packing.clone(), dir.path().join("rock_ormh.ktx2")),
            &CancellationToken::new(),
        )
        .await;

    assert!(!result.success);
    assert!(result.error.unwrap().contains("alpha_policy"));
    assert_eq!(converter.encoder().calls(), 0);

    // Leave keeps the lane since the packed source has alpha
    let leave = self::converter(PipelineConfig::default());
    let result = leave
        .convert(
            ConversionJob::packed(packing, dir.path().join("rock_ormh.ktx2")),
            &CancellationToken::new(),
        )
        .await;
    assert!(result.success, "{:?}", result.error);
    assert!(leave.encoder().last_args().contains(&"R8G8B8A8_UNORM".to_string()));
}

#[tokio::test]
async fn normal_maps_skip_histogram_normalization() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("cliff_normal.png");
    gradient_png(&source, 64);

    let mut config = PipelineConfig::default();
    config.histogram.mode = HistogramMode::Percentile;
    let states = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&states);
    let converter = converter(config).with_observer(Arc::new(
        move |_job: &ConversionJob, state: ConversionState| seen.lock().unwrap().push(state),
    ));
    let result = converter
        .convert(
            ConversionJob::image(&source, dir.path().join("cliff_normal.ktx2")),
            &CancellationToken::new(),
        )
        .await;

    assert!(result.success, "{:?}", result.error);
    assert!(result.normalization.is_none());
    assert!(!states.lock().unwrap().contains(&ConversionState::Normalizing));
    assert!(!dir.path().join("cliff_normal.histogram.json").exists());
}

#[tokio::test]
async fn invalid_packing_fails_before_any_io() {
    let dir = tempfile::tempdir().unwrap();
    let mut packing = ChannelPackingSettings::for_mode(PackingMode::Og);
    packing.green = None;

    let converter = converter(PipelineConfig::default());
    let result = converter
        .convert(
            ConversionJob::packed(packing, dir.path().join("x.ktx2")),
            &CancellationToken::new(),
        )
        .await;

    assert!(!result.success);
    assert!(result.error.unwrap().contains("green"));
    assert_eq!(converter.encoder().calls(), 0);
}

#[tokio::test]
async fn gloss_with_paired_normal_map_gets_toksvig() {
    let dir = tempfile::tempdir().unwrap();
    let gloss = dir.path().join("brick_gloss.png");
    write_png(&gloss, 32, [230, 230, 230, 255]);

    // Stripes of two strongly tilted normals
    let normal = image::RgbaImage::from_fn(32, 32, |x, _| {
        if x % 2 == 0 {
            image::Rgba([230, 128, 160, 255])
        } else {
            image::Rgba([25, 128, 160, 255])
        }
    });
    normal.save(dir.path().join("brick_normal.png")).unwrap();

    let config = PipelineConfig {
        save_separate_mipmaps: true,
        ..Default::default()
    };
    let converter = converter(config);
    let result = converter
        .convert(
            ConversionJob::image(&gloss, dir.path().join("brick_gloss.ktx2")),
            &CancellationToken::new(),
        )
        .await;

    assert!(result.success, "{:?}", result.error);
    assert!(result.toksvig_applied);
    // Toksvig promotes the conversion to explicit levels
    assert!(converter.encoder().last_args().contains(&"--levels".to_string()));

    let level1 = image::open(dir.path().join("brick_gloss_mips/mip_01.png"))
        .unwrap()
        .to_rgba8();
    assert!(level1.pixels().all(|p| p.0[0] < 230));
}

#[tokio::test]
async fn percentile_normalization_writes_sidecar() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("cliff_roughness.png");
    gradient_png(&source, 64);

    let mut config = PipelineConfig::default();
    config.histogram.mode = HistogramMode::Percentile;
    let converter = converter(config);
    let result = converter
        .convert(
            ConversionJob::image(&source, dir.path().join("cliff_roughness.ktx2")),
            &CancellationToken::new(),
        )
        .await;

    assert!(result.success, "{:?}", result.error);
    let meta = result.normalization.unwrap();
    assert!(meta.invertible && meta.remapped);
    assert!(dir.path().join("cliff_roughness.histogram.json").is_file());
}

#[tokio::test]
async fn batch_isolates_failures_and_keeps_order() {
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("a_albedo.png");
    let c = dir.path().join("c_albedo.png");
    write_png(&a, 16, [10, 20, 30, 255]);
    write_png(&c, 16, [10, 20, 30, 255]);

    let config = PipelineConfig {
        max_concurrent: 2,
        preset_name: Some("test".into()),
        ..Default::default()
    };
    let converter = Arc::new(converter(config));
    let jobs = vec![
        ConversionJob::image(&a, dir.path().join("a.ktx2")),
        ConversionJob::image(dir.path().join("missing.png"), dir.path().join("b.ktx2")),
        ConversionJob::image(&c, dir.path().join("c.ktx2")),
    ];

    let report = Arc::clone(&converter)
        .convert_batch(jobs, CancellationToken::new())
        .await;

    assert_eq!(report.total, 3);
    assert_eq!(report.succeeded, 2);
    assert_eq!(report.failed, 1);
    assert!(report.results[0].success);
    assert!(!report.results[1].success);
    assert!(report.results[1].source.ends_with("missing.png"));
    assert!(report.results[2].success);
    assert_eq!(report.preset.as_deref(), Some("test"));
    assert_eq!(converter.encoder().calls(), 2);
}

#[tokio::test]
async fn kept_temporary_mipmaps_survive() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("moss_albedo.png");
    write_png(&source, 8, [50, 100, 50, 255]);
    let scratch = dir.path().join("scratch");

    let config = PipelineConfig {
        temp_dir: Some(scratch.clone()),
        compression: CompressionSettings {
            remove_temporary_mipmaps: false,
            ..Default::default()
        },
        ..Default::default()
    };
    let result = converter(config)
        .convert(
            ConversionJob::image(&source, dir.path().join("moss.ktx2")),
            &CancellationToken::new(),
        )
        .await;

    assert!(result.success);
    let kept: Vec<PathBuf> = std::fs::read_dir(&scratch)
        .unwrap()
        .flatten()
        .map(|e| e.path())
        .collect();
    assert_eq!(kept.len(), 1);
    assert!(kept[0].join("mip_00.png").is_file());
}

#[cfg(unix)]
mod process {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use texpipe_core::ProcessEncoder;

    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn shell_encoder_writes_output() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("tile_albedo.png");
        write_png(&source, 16, [90, 90, 90, 255]);
        // The last argument is the output path
        let encoder = script(
            dir.path(),
            "fake-ktx.sh",
            "for arg; do out=\"$arg\"; done\nprintf KTX2 > \"$out\"",
        );

        let config = PipelineConfig::default();
        let converter = Converter::new(config, ProcessEncoder::new(&encoder)).unwrap();
        let result = converter
            .convert(
                ConversionJob::image(&source, dir.path().join("tile.ktx2")),
                &CancellationToken::new(),
            )
            .await;

        assert!(result.success, "{:?}", result.error);
        assert_eq!(std::fs::read(dir.path().join("tile.ktx2")).unwrap(), b"KTX2");
    }

    #[tokio::test]
    async fn non_zero_exit_is_reported_with_output() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("tile_albedo.png");
        write_png(&source, 16, [90, 90, 90, 255]);
        let encoder = script(dir.path(), "broken-ktx.sh", "echo 'bad --qlevel' >&2\nexit 3");

        let converter = Converter::new(PipelineConfig::default(), ProcessEncoder::new(&encoder)).unwrap();
        let result = converter
            .convert(
                ConversionJob::image(&source, dir.path().join("tile.ktx2")),
                &CancellationToken::new(),
            )
            .await;

        assert!(!result.success);
        let error = result.error.unwrap();
        assert!(error.contains("exit code 3"), "{}", error);
        assert!(error.contains("bad --qlevel"), "{}", error);
    }
}
