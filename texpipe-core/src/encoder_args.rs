//! Encoder argument vector.
//!
//! [`EncoderArgs::build`] renders settings and input paths into the exact,
//! ordered arguments of a `ktx create` style encoder:
//!
//! ```text
//! create --format <vk format> <family flags> [--assign-tf ..] [--normal-mode]
//!        <mip flags> [--threads N] <inputs..> <output>
//! ```
//!
//! Nothing here touches the filesystem or spawns a process.

use crate::compression::{ColorSpace, CompressionFormat, CompressionSettings, MipmapMode, WrapMode};
use crate::image_loading::TextureType;
use crate::validation::{Issue, Validate};
use crate::{Error, Result};
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};

/// Everything the builder needs for one encoder run
#[derive(Debug, Clone, Copy)]
pub struct EncodeRequest<'a> {
    pub settings: &'a CompressionSettings,
    pub texture_type: TextureType,
    /// Base level first; one entry per level when the pipeline made the mips
    pub inputs: &'a [PathBuf],
    pub output: &'a Path,
    /// Whether the source has any non-opaque texel
    pub has_alpha: bool,
}

/// One argument, keeping paths distinguishable from plain values
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncoderArg {
    Flag(&'static str),
    Value(String),
    Path(PathBuf),
}

impl fmt::Display for EncoderArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncoderArg::Flag(flag) => f.write_str(flag),
            EncoderArg::Value(value) => f.write_str(value),
            EncoderArg::Path(path) => {
                let text = path.display().to_string().replace('"', "\\\"");
                write!(f, "\"{}\"", text)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EncoderArgs {
    args: Vec<EncoderArg>,
}

impl EncoderArgs {
    pub fn build(request: &EncodeRequest<'_>) -> Result<Self> {
        let settings = request.settings;
        settings.validate()?;
        let Some(base) = request.inputs.first() else {
            return Err(Error::Validation(vec![Issue::new(
                "inputs",
                "at least one input image is required",
            )]));
        };

        let mut args = Self::default();
        args.flag("create");

        let srgb = settings.color_space.is_srgb_for(request.texture_type);
        let alpha = settings.alpha_policy.keeps_alpha(request.has_alpha);
        args.option("--format", vk_format(alpha, srgb));

        match settings.format {
            CompressionFormat::Etc1s => {
                args.option("--encode", settings.format.encoder_name());
                args.option("--clevel", settings.compression_level);
                args.option("--qlevel", settings.quality_level);
            }
            CompressionFormat::Uastc => {
                args.option("--encode", settings.format.encoder_name());
                args.option("--uastc-quality", settings.uastc_quality);
                if settings.uastc_rdo {
                    args.flag("--uastc-rdo");
                    args.option("--uastc-rdo-l", settings.rdo_lambda);
                }
                if settings.zstd_active() {
                    args.option("--zstd", settings.zstd_level);
                }
            }
        }

        match settings.color_space {
            ColorSpace::Auto => {}
            ColorSpace::Srgb => args.option("--assign-tf", "srgb"),
            ColorSpace::Linear => args.option("--assign-tf", "linear"),
        }

        if request.texture_type == TextureType::Normal {
            args.flag("--normal-mode");
        }

        let inputs: &[PathBuf] = if settings.mipmap_mode() == MipmapMode::Encoder {
            args.flag("--generate-mipmap");
            args.option("--mipmap-filter", settings.mip_filter.encoder_name());
            if settings.wrap_mode != WrapMode::Clamp {
                args.option("--mipmap-wrap", settings.wrap_mode.encoder_name());
            }
            std::slice::from_ref(base)
        } else {
            args.option("--levels", request.inputs.len());
            request.inputs
        };

        if let Some(threads) = settings.threads {
            args.option("--threads", threads);
        }

        for input in inputs {
            args.args.push(EncoderArg::Path(input.clone()));
        }
        args.args
            .push(EncoderArg::Path(settings.output_format.apply_extension(request.output)));

        Ok(args)
    }

    fn flag(&mut self, flag: &'static str) {
        self.args.push(EncoderArg::Flag(flag));
    }

    fn option(&mut self, flag: &'static str, value: impl ToString) {
        self.args.push(EncoderArg::Flag(flag));
        self.args.push(EncoderArg::Value(value.to_string()));
    }

    pub fn iter(&self) -> impl Iterator<Item = &EncoderArg> {
        self.args.iter()
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Raw arguments for process spawning; paths are not quoted.
    pub fn to_argv(&self) -> Vec<OsString> {
        self.args
            .iter()
            .map(|arg| match arg {
                EncoderArg::Flag(flag) => OsString::from(*flag),
                EncoderArg::Value(value) => OsString::from(value),
                EncoderArg::Path(path) => path.clone().into_os_string(),
            })
            .collect()
    }

    /// Unquoted string form, convenient for assertions and logs.
    pub fn to_strings(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| match arg {
                EncoderArg::Path(path) => path.display().to_string(),
                other => other.to_string(),
            })
            .collect()
    }

    /// Single line with every path quoted.
    pub fn to_command_line(&self) -> String {
        self.args
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn contains_flag(&self, flag: &str) -> bool {
        self.args
            .iter()
            .any(|arg| matches!(arg, EncoderArg::Flag(f) if *f == flag))
    }

    /// Value following `flag`, if present.
    pub fn value_of(&self, flag: &str) -> Option<&str> {
        self.args.windows(2).find_map(|pair| match pair {
            [EncoderArg::Flag(f), EncoderArg::Value(v)] if *f == flag => Some(v.as_str()),
            _ => None,
        })
    }

    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.args.iter().filter_map(|arg| match arg {
            EncoderArg::Path(path) => Some(path.as_path()),
            _ => None,
        })
    }
}

fn vk_format(alpha: bool, srgb: bool) -> &'static str {
    match (alpha, srgb) {
        (true, true) => "R8G8B8A8_SRGB",
        (true, false) => "R8G8B8A8_UNORM",
        (false, true) => "R8G8B8_SRGB",
        (false, false) => "R8G8B8_UNORM",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::{AlphaPolicy, OutputFormat, Supercompression};
    use crate::resample::ResampleFilter;

    fn build(
        settings: &CompressionSettings,
        texture_type: TextureType,
        inputs: &[PathBuf],
    ) -> EncoderArgs {
        EncoderArgs::build(&EncodeRequest {
            settings,
            texture_type,
            inputs,
            output: Path::new("out/brick.ktx2"),
            has_alpha: false,
        })
        .unwrap()
    }

    fn two_levels() -> Vec<PathBuf> {
        vec![PathBuf::from("tmp/mip_00.png"), PathBuf::from("tmp/mip_01.png")]
    }

    #[test]
    fn manual_mips_pass_levels_and_every_input() {
        let settings = CompressionSettings {
            generate_mipmaps: false,
            ..Default::default()
        };
        let args = build(&settings, TextureType::Albedo, &two_levels());

        assert_eq!(args.value_of("--levels"), Some("2"));
        assert!(!args.contains_flag("--generate-mipmap"));
        assert_eq!(args.paths().count(), 3);
    }

    #[test]
    fn encoder_mips_pass_only_the_base() {
        let settings = CompressionSettings {
            generate_mipmaps: true,
            ..Default::default()
        };
        let args = build(&settings, TextureType::Albedo, &two_levels());

        assert!(args.contains_flag("--generate-mipmap"));
        assert!(!args.contains_flag("--levels"));
        assert_eq!(args.value_of("--mipmap-filter"), Some("kaiser"));
        assert!(!args.contains_flag("--mipmap-wrap"));
        let paths: Vec<_> = args.paths().collect();
        assert_eq!(paths, vec![Path::new("tmp/mip_00.png"), Path::new("out/brick.ktx2")]);
    }

    #[test]
    fn default_etc1s_argument_order() {
        let settings = CompressionSettings::default();
        let args = build(&settings, TextureType::Albedo, &two_levels()[..1]);
        assert_eq!(
            args.to_strings(),
            vec![
                "create",
                "--format",
                "R8G8B8_SRGB",
                "--encode",
                "basis-lz",
                "--clevel",
                "1",
                "--qlevel",
                "128",
                "--generate-mipmap",
                "--mipmap-filter",
                "kaiser",
                "tmp/mip_00.png",
                "out/brick.ktx2",
            ]
        );
    }

    #[test]
    fn uastc_flags_only_for_active_family() {
        let settings = CompressionSettings {
            uastc_rdo: true,
            rdo_lambda: 0.5,
            supercompression: Supercompression::Zstandard,
            zstd_level: 9,
            ..CompressionSettings::uastc()
        };
        let args = build(&settings, TextureType::Roughness, &two_levels()[..1]);

        assert_eq!(args.value_of("--encode"), Some("uastc"));
        assert_eq!(args.value_of("--uastc-quality"), Some("2"));
        assert!(args.contains_flag("--uastc-rdo"));
        assert_eq!(args.value_of("--uastc-rdo-l"), Some("0.5"));
        assert_eq!(args.value_of("--zstd"), Some("9"));
        assert!(!args.contains_flag("--qlevel"));
        assert!(!args.contains_flag("--clevel"));
        assert_eq!(args.value_of("--format"), Some("R8G8B8_UNORM"));

        let etc1s = CompressionSettings {
            supercompression: Supercompression::Zstandard,
            ..Default::default()
        };
        let args = build(&etc1s, TextureType::Roughness, &two_levels()[..1]);
        assert!(!args.contains_flag("--zstd"));
        assert!(!args.contains_flag("--uastc-quality"));
    }

    #[test]
    fn explicit_color_space_and_normal_mode() {
        let settings = CompressionSettings {
            color_space: ColorSpace::Linear,
            wrap_mode: WrapMode::Wrap,
            mip_filter: ResampleFilter::Lanczos3,
            alpha_policy: AlphaPolicy::Force,
            threads: Some(4),
            ..Default::default()
        };
        let args = build(&settings, TextureType::Normal, &two_levels()[..1]);

        assert_eq!(args.value_of("--format"), Some("R8G8B8A8_UNORM"));
        assert_eq!(args.value_of("--assign-tf"), Some("linear"));
        assert!(args.contains_flag("--normal-mode"));
        assert_eq!(args.value_of("--mipmap-filter"), Some("lanczos3"));
        assert_eq!(args.value_of("--mipmap-wrap"), Some("wrap"));
        assert_eq!(args.value_of("--threads"), Some("4"));
    }

    #[test]
    fn basis_output_forces_extension() {
        let settings = CompressionSettings {
            output_format: OutputFormat::Basis,
            ..Default::default()
        };
        let args = build(&settings, TextureType::Generic, &two_levels()[..1]);
        assert_eq!(args.paths().last(), Some(Path::new("out/brick.basis")));
    }

    #[test]
    fn command_line_quotes_paths_only() {
        let settings = CompressionSettings::default();
        let inputs = vec![PathBuf::from("my textures/base.png")];
        let args = build(&settings, TextureType::Albedo, &inputs);
        let line = args.to_command_line();
        assert!(line.starts_with("create --format R8G8B8_SRGB"));
        assert!(line.contains("\"my textures/base.png\""));
        assert!(line.ends_with("\"out/brick.ktx2\""));
        // argv keeps the raw path
        assert!(args.to_argv().contains(&OsString::from("my textures/base.png")));
    }

    #[test]
    fn no_inputs_is_a_validation_error() {
        let settings = CompressionSettings::default();
        let result = EncoderArgs::build(&EncodeRequest {
            settings: &settings,
            texture_type: TextureType::Albedo,
            inputs: &[],
            output: Path::new("x.ktx2"),
            has_alpha: false,
        });
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn build_is_deterministic() {
        let settings = CompressionSettings::uastc();
        let a = build(&settings, TextureType::Albedo, &two_levels());
        let b = build(&settings, TextureType::Albedo, &two_levels());
        assert_eq!(a, b);
    }
}
