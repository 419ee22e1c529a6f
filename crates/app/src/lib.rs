use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser};
use image::{DynamicImage, ImageFormat};
use tracing::{debug, info, warn};
use tracing_subscriber::prelude::*;

use tilescale_core::backend::{InferenceBackend, OrtModelProvider};
use tilescale_core::config::{AppConfig, DataDir};
use tilescale_core::logging::{
    self, CrashHook, FileSink, LogFilters, LoggingInitOptions, DEFAULT_LOG_FILTER,
};
use tilescale_core::types::{PixelSamples, SourceImage, UpscaledImage};
use tilescale_core::{InterruptFlag, Model, Progress, Upscaler};

#[derive(Parser)]
#[command(name = "tilescale", about = "Tile-based image upscaling and denoising")]
struct Cli {
    #[arg(help = "Image to upscale")]
    input: PathBuf,

    #[arg(short = 'o', long, help = "Where to write the PNG result")]
    output: PathBuf,

    #[arg(
        short = 'm',
        long,
        value_parser = parse_model,
        help = "Model tag, e.g. anime_noise1_scale2x (default from config)"
    )]
    model: Option<Model>,

    #[arg(long, help = "Inference backend override: cuda, tensorrt or cpu")]
    backend: Option<String>,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long)]
    data_dir: Option<PathBuf>,
}

fn parse_model(raw: &str) -> std::result::Result<Model, String> {
    raw.parse::<Model>().map_err(|e| {
        let known = Model::ALL
            .iter()
            .map(Model::tag)
            .collect::<Vec<_>>()
            .join(", ");
        format!("{e}; known models: {known}")
    })
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let data_dir = DataDir::resolve(cli.data_dir.as_deref());

    let runtime_libs = tilescale_core::runtime::setup_runtime_libs(&[data_dir.runtime_lib_dir()]);
    init_logging(Some(data_dir.path()), cli.verbose, cli.log_filter.as_deref());
    tilescale_core::runtime::log_runtime_lib_status(&runtime_libs);
    log_startup_metadata(&data_dir);

    let config = load_config(&data_dir);
    run_upscale(cli, config, data_dir).await
}

fn load_config(data_dir: &DataDir) -> AppConfig {
    match data_dir.ensure() {
        Ok(true) => info!(path = %data_dir.config_file().display(), "Wrote default config"),
        Ok(false) => {}
        Err(e) => warn!(error = %format!("{e:#}"), "Failed to initialize data directory"),
    }
    data_dir.load_config().unwrap_or_else(|err| {
        warn!(error = %format!("{err:#}"), "Failed to load config file, using defaults");
        AppConfig::default()
    })
}

async fn run_upscale(cli: Cli, config: AppConfig, data_dir: DataDir) -> Result<()> {
    if !cli.input.exists() {
        bail!("Input image does not exist: {}", cli.input.display());
    }

    let model = cli.model.unwrap_or(config.output.default_model);
    let backend = cli
        .backend
        .as_deref()
        .map(InferenceBackend::from_str_lossy)
        .unwrap_or(config.inference.backend);

    info!(input = %cli.input.display(), "Decoding input image");
    let decoded = image::open(&cli.input)
        .with_context(|| format!("Failed to decode image: {}", cli.input.display()))?;
    let source = source_from_dynamic(decoded)?;

    let provider = OrtModelProvider::new(data_dir.models_dir(&config), backend)
        .with_trt_cache_dir(data_dir.trt_cache_dir(&config));
    let upscaler = Upscaler::new(Arc::new(provider)).with_options(config.pipeline_options());
    spawn_ctrl_c_handler(upscaler.interrupt_flag());

    info!(
        model = %model,
        backend = %backend,
        width = source.width(),
        height = source.height(),
        channels = source.channels(),
        bit_depth = source.bit_depth(),
        "Upscaling"
    );

    let started = Instant::now();
    let Some(result) = upscaler
        .run(&source, model, move |progress| report_progress(progress, started))
        .await
    else {
        bail!("Upscale produced no result (interrupted or failed)");
    };

    write_png(&result, &cli.output)?;
    info!(
        output = %cli.output.display(),
        width = result.width,
        height = result.height,
        alpha = result.has_alpha(),
        elapsed = %format_duration(started.elapsed().as_secs_f64()),
        "Wrote output image"
    );
    Ok(())
}

fn spawn_ctrl_c_handler(flag: InterruptFlag) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received, interrupting upscale");
            flag.interrupt();
        }
    });
}

/// Convert a decoded image into a [`SourceImage`]. 8/16-bit RGB and RGBA keep their native
/// layout; everything else goes through RGBA8.
fn source_from_dynamic(decoded: DynamicImage) -> Result<SourceImage> {
    let (width, height) = (decoded.width(), decoded.height());
    match decoded {
        DynamicImage::ImageRgb8(buf) => SourceImage::from_rgb8(width, height, buf.into_raw()),
        DynamicImage::ImageRgba8(buf) => SourceImage::from_rgba8(width, height, buf.into_raw()),
        DynamicImage::ImageRgb16(buf) => {
            SourceImage::new(width, height, 3, PixelSamples::U16(buf.into_raw()))
        }
        DynamicImage::ImageRgba16(buf) => {
            SourceImage::new(width, height, 4, PixelSamples::U16(buf.into_raw()))
        }
        other => SourceImage::from_rgba8(width, height, other.to_rgba8().into_raw()),
    }
}

fn write_png(result: &UpscaledImage, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create output directory: {}", parent.display()))?;
    }

    let encoded = if result.has_alpha() {
        image::RgbaImage::from_raw(result.width, result.height, result.data.clone())
            .map(DynamicImage::ImageRgba8)
    } else {
        image::RgbImage::from_raw(result.width, result.height, result.to_rgb8())
            .map(DynamicImage::ImageRgb8)
    };
    let encoded = encoded.context("Output buffer does not match its dimensions")?;

    encoded
        .save_with_format(path, ImageFormat::Png)
        .with_context(|| format!("Failed to write PNG: {}", path.display()))
}

const PROGRESS_BAR_WIDTH: usize = 30;

fn report_progress(progress: Progress, started: Instant) {
    match progress {
        Progress::Percent(percent) => print_progress(percent, started.elapsed().as_secs_f64()),
        Progress::WaitAlpha => {
            eprintln!();
            info!("{progress}");
        }
        _ => info!("{progress}"),
    }
}

fn progress_bar(percent: u32) -> String {
    let fraction = (percent.min(100) as f64) / 100.0;
    let filled = (fraction * PROGRESS_BAR_WIDTH as f64).round() as usize;
    let empty = PROGRESS_BAR_WIDTH.saturating_sub(filled);
    "█".repeat(filled) + &"░".repeat(empty)
}

fn print_progress(percent: u32, elapsed: f64) {
    let eta = if percent > 0 && percent < 100 {
        let remaining = elapsed * f64::from(100 - percent) / f64::from(percent);
        format!(" | ETA: {}", format_duration(remaining))
    } else {
        String::new()
    };
    eprint!(
        "\r[{}] {:3}% | Elapsed: {}{}    ",
        progress_bar(percent),
        percent,
        format_duration(elapsed),
        eta,
    );
}

fn format_duration(secs: f64) -> String {
    let total = secs.round() as u64;
    let h = total / 3600;
    let m = (total % 3600) / 60;
    let s = total % 60;
    format!("{:02}:{:02}:{:02}", h, m, s)
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let crash_hook = logging::install_crash_hook(data_dir);
    let filters = LogFilters::select(&LoggingInitOptions {
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
    });

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(parse_env_filter_with_fallback(&filters.console, "console"));
    let (file_layer, console_only) = match FileSink::open(data_dir) {
        FileSink::Rolling { appender, .. } => {
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(appender)
                .with_filter(parse_env_filter_with_fallback(&filters.file, "file"));
            (Some(layer), None)
        }
        FileSink::ConsoleOnly {
            attempted_log_dir,
            reason,
        } => (None, Some((attempted_log_dir, reason))),
    };

    let subscriber = tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer);
    if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!(
            "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
        );
    }

    if let Some((attempted_log_dir, reason)) = console_only {
        warn!(
            attempted_log_dir = ?attempted_log_dir,
            reason = %reason,
            "Persistent file logging unavailable; continuing with console-only logging"
        );
    }
    match crash_hook {
        CrashHook::Installed { crash_dir } | CrashHook::AlreadyInstalled { crash_dir } => {
            debug!(crash_dir = %crash_dir.display(), "Crash artifacts enabled");
        }
        CrashHook::Disabled {
            attempted_crash_dir,
            reason,
        } => warn!(
            attempted_crash_dir = ?attempted_crash_dir,
            reason = %reason,
            "Crash artifact hook unavailable; panics will not be persisted"
        ),
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(data_dir: &DataDir) {
    info!(
        pid = std::process::id(),
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %data_dir.path().display(),
        config_path = %data_dir.config_file().display(),
        "Runtime startup metadata"
    );
}

#[cfg(test)]
mod decode_tests {
    use super::*;
    use image::{GrayImage, ImageBuffer, Rgb, Rgba, RgbImage};
    use tilescale_core::types::OutputFormat;

    #[test]
    fn rgb8_keeps_three_channels() {
        let img = RgbImage::from_pixel(3, 2, Rgb([10, 20, 30]));
        let source = source_from_dynamic(DynamicImage::ImageRgb8(img)).expect("source");
        assert_eq!((source.width(), source.height()), (3, 2));
        assert_eq!(source.channels(), 3);
        assert_eq!(source.bit_depth(), 8);
        assert!(!source.has_alpha());
    }

    #[test]
    fn rgba16_keeps_native_depth() {
        let img: ImageBuffer<Rgba<u16>, Vec<u16>> =
            ImageBuffer::from_pixel(2, 2, Rgba([1000, 2000, 3000, 65535]));
        let source = source_from_dynamic(DynamicImage::ImageRgba16(img)).expect("source");
        assert_eq!(source.channels(), 4);
        assert_eq!(source.bit_depth(), 16);
        assert_eq!(
            source.samples(),
            &PixelSamples::U16([1000, 2000, 3000, 65535].repeat(4))
        );
    }

    #[test]
    fn grayscale_is_converted_to_rgba8() {
        let img = GrayImage::from_pixel(4, 1, image::Luma([77]));
        let source = source_from_dynamic(DynamicImage::ImageLuma8(img)).expect("source");
        assert_eq!(source.channels(), 4);
        assert_eq!(source.bit_depth(), 8);
        assert_eq!(source.samples(), &PixelSamples::U8([77, 77, 77, 255].repeat(4)));
    }

    #[test]
    fn write_png_drops_alpha_for_opaque_output() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("out.png");
        let result = UpscaledImage {
            width: 2,
            height: 1,
            format: OutputFormat::Opaque,
            data: vec![1, 2, 3, 255, 4, 5, 6, 255],
        };

        write_png(&result, &path).expect("write png");
        let reread = image::open(&path).expect("reopen png");
        let DynamicImage::ImageRgb8(rgb) = reread else {
            panic!("expected an RGB PNG");
        };
        assert_eq!(rgb.into_raw(), vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn write_png_keeps_alpha_for_straight_output() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.png");
        let result = UpscaledImage {
            width: 1,
            height: 2,
            format: OutputFormat::Straight,
            data: vec![9, 8, 7, 0, 6, 5, 4, 128],
        };

        write_png(&result, &path).expect("write png");
        let reread = image::open(&path).expect("reopen png");
        assert_eq!(reread.to_rgba8().into_raw(), result.data);
        assert!(matches!(reread, DynamicImage::ImageRgba8(_)));
    }

    #[test]
    fn model_parser_lists_known_tags_on_error() {
        assert_eq!(
            parse_model("anime-noise1-scale2x"),
            Ok(Model::AnimeNoise1Scale2x)
        );
        let err = parse_model("nope").expect_err("unknown model");
        assert!(err.contains("anime_scale2x"));
    }
}


#[cfg(test)]
mod log_filter_tests {
    use super::*;

    #[test]
    fn selected_filters_parse_for_both_layers() {
        for verbose in 0..3 {
            let filters = LogFilters::select(&LoggingInitOptions {
                verbose,
                ..Default::default()
            });
            for filter in [&filters.console, &filters.file] {
                assert!(
                    tracing_subscriber::EnvFilter::try_new(filter).is_ok(),
                    "{filter}"
                );
            }
        }
    }

    #[test]
    fn invalid_filter_falls_back_to_default() {
        let filter = parse_env_filter_with_fallback("tilescale_core=[[nope", "console");
        assert_eq!(filter.to_string(), DEFAULT_LOG_FILTER);
    }

    #[test]
    fn valid_filter_is_kept() {
        let filter = parse_env_filter_with_fallback("ort=error,tilescale_app=debug", "file");
        assert!(filter.to_string().contains("tilescale_app=debug"));
    }
}
