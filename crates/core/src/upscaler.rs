//! Caller-facing entry point: one image in, one upscaled image (or nothing) out.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::alpha::{extract_alpha, rescale_alpha, AlphaRescalePath, GpuResampler};
use crate::border::expand_to_min;
use crate::compositor::CompositeStats;
use crate::geometry::compute_tiles;
use crate::model::{Model, ModelProvider};
use crate::pipeline::{self, PipelineOptions, TileJob};
use crate::planar::ExpandedPlanes;
use crate::types::{OutputFormat, SourceImage, UpscaledImage};

/// Milestones reported during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Model-stage completion, `completed * 100 / total`.
    Percent(u32),
    Processing,
    WaitAlpha,
    GenerateOutput,
    Finished,
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Percent(p) => write!(f, "{p}"),
            Self::Processing => f.write_str("processing"),
            Self::WaitAlpha => f.write_str("wait_alpha"),
            Self::GenerateOutput => f.write_str("generate_output"),
            Self::Finished => f.write_str("finished"),
        }
    }
}

/// Shared cancellation request. Observed once, after every stage has finished.
#[derive(Debug, Clone, Default)]
pub struct InterruptFlag(Arc<AtomicBool>);

impl InterruptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interrupt(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunStats {
    pub model: Model,
    pub tiles: usize,
    /// The source was smaller than one block and was padded before tiling.
    pub padded: bool,
    pub input_processed: usize,
    pub model_processed: usize,
    pub output_processed: usize,
    pub skipped_reads: usize,
    pub composite: CompositeStats,
    /// `None` when the image had no meaningful alpha.
    pub alpha_path: Option<AlphaRescalePath>,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed { image: UpscaledImage, stats: RunStats },
    Interrupted,
}

/// Runs images through a model one at a time.
///
/// Concurrent calls queue on an internal gate; each run gets a fresh context and nothing
/// survives between runs except the interrupt flag, which is cleared when a run starts.
pub struct Upscaler {
    provider: Arc<dyn ModelProvider>,
    gpu: Option<Arc<dyn GpuResampler>>,
    options: PipelineOptions,
    gate: Mutex<()>,
    interrupt: InterruptFlag,
}

impl Upscaler {
    pub fn new(provider: Arc<dyn ModelProvider>) -> Self {
        Self {
            provider,
            gpu: None,
            options: PipelineOptions::default(),
            gate: Mutex::new(()),
            interrupt: InterruptFlag::new(),
        }
    }

    pub fn with_gpu_resampler(mut self, gpu: Arc<dyn GpuResampler>) -> Self {
        self.gpu = Some(gpu);
        self
    }

    pub fn with_options(mut self, options: PipelineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn interrupt_flag(&self) -> InterruptFlag {
        self.interrupt.clone()
    }

    /// Upscale `image` with `model`. Returns `None` on cancellation or any failure; failures
    /// are logged.
    pub async fn run<F>(&self, image: &SourceImage, model: Model, progress: F) -> Option<UpscaledImage>
    where
        F: Fn(Progress) + Send + Sync + 'static,
    {
        match self.run_detailed(image, model, progress).await {
            Ok(RunOutcome::Completed { image, .. }) => Some(image),
            Ok(RunOutcome::Interrupted) => None,
            Err(e) => {
                error!(model = %model, "Upscale failed: {e:#}");
                None
            }
        }
    }

    pub async fn run_detailed<F>(
        &self,
        image: &SourceImage,
        model: Model,
        progress: F,
    ) -> Result<RunOutcome>
    where
        F: Fn(Progress) + Send + Sync + 'static,
    {
        let _admission = self.gate.lock().await;
        self.interrupt.reset();

        let started = Instant::now();
        let progress = Arc::new(progress);
        progress(Progress::Processing);

        let geometry = model.geometry();
        let scale = geometry.scale;
        let unit = self
            .provider
            .load(model)
            .with_context(|| format!("failed to load model '{model}'"))?;

        let out_width = image.width() * scale;
        let out_height = image.height() * scale;
        let alpha = extract_alpha(image).filter(|mask| !mask.is_opaque());

        let working = expand_to_min(image, geometry.block_size, geometry.block_size);
        let padded = working.width() != image.width() || working.height() != image.height();
        let tiles = compute_tiles(working.width(), working.height(), geometry.block_size)?;
        let planes = ExpandedPlanes::from_image(&working, geometry.halo);
        drop(working);

        info!(
            model = %model,
            width = image.width(),
            height = image.height(),
            bit_depth = image.bit_depth(),
            has_alpha = alpha.is_some(),
            padded,
            tiles = tiles.len(),
            out_width,
            out_height,
            "Starting upscale"
        );

        let alpha_task = alpha.map(|mask| {
            let gpu = self.gpu.clone();
            tokio::task::spawn_blocking(move || rescale_alpha(mask, scale, gpu.as_deref()))
        });

        let job = TileJob {
            planes: Arc::new(planes),
            tiles: Arc::new(tiles),
            unit,
            model,
            geometry,
            out_width,
            out_height,
        };
        let percent_sink = progress.clone();
        let mut running = pipeline::spawn(
            job,
            &self.options,
            Arc::new(move |p: u32| percent_sink(Progress::Percent(p))),
        );
        let tile_count = running.total();

        let counts = running.join_inference().await?;

        progress(Progress::WaitAlpha);
        let rescaled = match alpha_task {
            Some(handle) => Some(
                handle
                    .await
                    .map_err(|e| anyhow!("alpha task panicked: {e}"))?,
            ),
            None => None,
        };

        let report = running.join_output().await?;

        if self.interrupt.is_interrupted() {
            warn!(model = %model, "Upscale interrupted; discarding output");
            return Ok(RunOutcome::Interrupted);
        }

        progress(Progress::GenerateOutput);
        let mut buffer = report.buffer;
        let (format, alpha_path) = match rescaled {
            Some((mask, path)) => {
                buffer.merge_alpha(&mask)?;
                (OutputFormat::Straight, Some(path))
            }
            None => (OutputFormat::Opaque, None),
        };
        let output = buffer.into_image(format);

        let stats = RunStats {
            model,
            tiles: tile_count,
            padded,
            input_processed: counts.input_processed,
            model_processed: counts.model_processed,
            output_processed: report.output_processed,
            skipped_reads: counts.skipped_reads,
            composite: report.composite,
            alpha_path,
            elapsed: started.elapsed(),
        };
        info!(
            model = %model,
            tiles = stats.tiles,
            alpha = %stats.alpha_path.map_or_else(|| "none".to_string(), |p| p.to_string()),
            elapsed_ms = stats.elapsed.as_millis() as u64,
            "Upscale finished"
        );

        progress(Progress::Finished);
        Ok(RunOutcome::Completed {
            image: output,
            stats,
        })
    }
}
