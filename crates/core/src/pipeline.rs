//! Three-stage tile pipeline: input (tile -> planar tensor), model (tensor -> result) and
//! output (result -> composited buffer), connected by bounded channels.
//!
//! Every stage runs on the blocking pool. A shared abort flag stops all stages between items
//! after the first fatal error; errors are funnelled through one channel and the first one
//! wins. The output stage is a single consumer that re-sequences results by tile index, so
//! overlapping tiles are always composited in generation order.
//!
//! Each stage thread records its model and current tile with [`crate::logging::enter_stage`],
//! so a panic inside a stage leaves a crash artifact naming both.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::compositor::{composite, CompositeStats, OutputBuffer};
use crate::logging::{enter_stage, record_tile};
use crate::model::{InferenceUnit, Model, ModelGeometry};
use crate::planar::ExpandedPlanes;
use crate::types::{InferenceResult, PlanarTensor, Tile};

pub const DEFAULT_BUFFER_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineOptions {
    /// Capacity of each inter-stage channel.
    pub buffer_size: usize,
    /// Input stage workers. 0 picks the available parallelism.
    pub input_workers: usize,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            input_workers: 0,
        }
    }
}

impl PipelineOptions {
    fn worker_count(&self, total: usize) -> usize {
        let requested = if self.input_workers == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            self.input_workers
        };
        requested.clamp(1, total.max(1))
    }
}

/// Everything one run feeds through the stages. Built fresh per run and dropped with it.
pub struct TileJob {
    pub planes: Arc<ExpandedPlanes>,
    pub tiles: Arc<Vec<Tile>>,
    pub unit: Arc<dyn InferenceUnit>,
    pub model: Model,
    pub geometry: ModelGeometry,
    /// True output size, `source * scale`.
    pub out_width: u32,
    pub out_height: u32,
}

pub type PercentCallback = Arc<dyn Fn(u32) + Send + Sync>;

struct IndexedTensor {
    index: usize,
    tensor: PlanarTensor,
}

struct IndexedResult {
    index: usize,
    result: InferenceResult,
}

#[derive(Debug, Default)]
struct InputSummary {
    processed: usize,
    skipped_reads: usize,
}

struct OutputSummary {
    processed: usize,
    composite: CompositeStats,
    buffer: OutputBuffer,
}

/// Per-stage processed counts after input and model have been joined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InferenceCounts {
    pub input_processed: usize,
    pub model_processed: usize,
    /// Tensor elements left at zero because their source lay outside the expanded planes.
    pub skipped_reads: usize,
}

pub struct PipelineReport {
    pub buffer: OutputBuffer,
    pub output_processed: usize,
    pub composite: CompositeStats,
}

/// Handle to a pipeline whose stages are running.
pub struct RunningPipeline {
    total: usize,
    input: Vec<JoinHandle<InputSummary>>,
    model: Option<JoinHandle<usize>>,
    output: Option<JoinHandle<Option<OutputSummary>>>,
    abort: Arc<AtomicBool>,
    error_rx: mpsc::UnboundedReceiver<anyhow::Error>,
    first_error: Option<anyhow::Error>,
}

/// Spawn all three stages for `job`. Must be called inside a tokio runtime.
pub fn spawn(job: TileJob, options: &PipelineOptions, on_percent: PercentCallback) -> RunningPipeline {
    let total = job.tiles.len();
    let buffer_size = options.buffer_size.max(1);
    let workers = options.worker_count(total);

    let (error_tx, error_rx) = mpsc::unbounded_channel::<anyhow::Error>();
    let abort = Arc::new(AtomicBool::new(false));
    let (tensor_tx, tensor_rx) = mpsc::channel::<IndexedTensor>(buffer_size);
    let (result_tx, result_rx) = mpsc::channel::<IndexedResult>(buffer_size);

    tracing::debug!(tiles = total, workers, buffer_size, "Starting tile pipeline");

    let cursor = Arc::new(AtomicUsize::new(0));
    let input = (0..workers)
        .map(|worker| {
            spawn_input_worker(
                worker,
                job.model,
                job.planes.clone(),
                job.tiles.clone(),
                cursor.clone(),
                tensor_tx.clone(),
                abort.clone(),
            )
        })
        .collect();
    drop(tensor_tx);

    let model = spawn_model_stage(
        job.unit.clone(),
        job.model,
        job.geometry,
        total,
        tensor_rx,
        result_tx,
        on_percent,
        abort.clone(),
        error_tx.clone(),
    );

    let output = spawn_output_stage(
        job.model,
        job.tiles.clone(),
        job.geometry.scale,
        OutputBuffer::new(job.out_width, job.out_height),
        result_rx,
        abort.clone(),
        error_tx,
    );

    RunningPipeline {
        total,
        input,
        model: Some(model),
        output: Some(output),
        abort,
        error_rx,
        first_error: None,
    }
}

impl RunningPipeline {
    pub fn total(&self) -> usize {
        self.total
    }

    /// Wait for the input and model stages to drain.
    pub async fn join_inference(&mut self) -> Result<InferenceCounts> {
        let mut counts = InferenceCounts::default();

        for handle in std::mem::take(&mut self.input) {
            match handle.await {
                Ok(summary) => {
                    counts.input_processed += summary.processed;
                    counts.skipped_reads += summary.skipped_reads;
                }
                Err(join_error) => self.fail(anyhow!("input worker panicked: {join_error}")),
            }
        }

        if let Some(handle) = self.model.take() {
            match handle.await {
                Ok(processed) => counts.model_processed = processed,
                Err(join_error) => self.fail(anyhow!("model stage panicked: {join_error}")),
            }
        }

        self.drain_errors();
        if let Some(error) = self.first_error.take() {
            return Err(error);
        }

        if counts.input_processed != self.total {
            self.abort.store(true, Ordering::SeqCst);
            bail!(
                "input stage processed {} of {} tiles",
                counts.input_processed,
                self.total
            );
        }
        if counts.model_processed != self.total {
            self.abort.store(true, Ordering::SeqCst);
            bail!(
                "model stage processed {} of {} tiles",
                counts.model_processed,
                self.total
            );
        }

        if counts.skipped_reads > 0 {
            tracing::warn!(
                skipped = counts.skipped_reads,
                "Planar tile reads fell outside the expanded image"
            );
        }

        Ok(counts)
    }

    /// Wait for the output stage and hand back the composited buffer.
    pub async fn join_output(mut self) -> Result<PipelineReport> {
        let Some(handle) = self.output.take() else {
            bail!("output stage already joined");
        };
        let summary = match handle.await {
            Ok(summary) => summary,
            Err(join_error) => {
                self.abort.store(true, Ordering::SeqCst);
                return Err(anyhow!("output stage panicked: {join_error}"));
            }
        };

        self.drain_errors();
        if let Some(error) = self.first_error.take() {
            return Err(error);
        }

        let Some(summary) = summary else {
            bail!("pipeline aborted before the output stage completed");
        };
        if summary.processed != self.total {
            bail!(
                "output stage composited {} of {} tiles",
                summary.processed,
                self.total
            );
        }
        if summary.composite.clipped > 0 {
            tracing::debug!(
                clipped = summary.composite.clipped,
                "Dropped tile samples beyond the true output bounds"
            );
        }

        Ok(PipelineReport {
            buffer: summary.buffer,
            output_processed: summary.processed,
            composite: summary.composite,
        })
    }

    fn fail(&mut self, error: anyhow::Error) {
        self.abort.store(true, Ordering::SeqCst);
        if self.first_error.is_none() {
            self.first_error = Some(error);
        }
    }

    fn drain_errors(&mut self) {
        while let Ok(error) = self.error_rx.try_recv() {
            self.fail(error);
        }
    }
}

fn report_task_error(
    error_tx: &mpsc::UnboundedSender<anyhow::Error>,
    abort: &AtomicBool,
    error: anyhow::Error,
) {
    abort.store(true, Ordering::SeqCst);
    let _ = error_tx.send(error);
}

fn spawn_input_worker(
    worker: usize,
    model: Model,
    planes: Arc<ExpandedPlanes>,
    tiles: Arc<Vec<Tile>>,
    cursor: Arc<AtomicUsize>,
    output: mpsc::Sender<IndexedTensor>,
    abort: Arc<AtomicBool>,
) -> JoinHandle<InputSummary> {
    tokio::task::spawn_blocking(move || {
        let _stage = enter_stage(model, "input");
        let mut summary = InputSummary::default();
        let mut total_expand_ms = 0.0_f64;
        let mut total_send_ms = 0.0_f64;

        loop {
            if abort.load(Ordering::SeqCst) {
                break;
            }
            let index = cursor.fetch_add(1, Ordering::SeqCst);
            let Some(tile) = tiles.get(index) else {
                break;
            };
            record_tile(index);

            let t_expand = Instant::now();
            let (tensor, skipped) = planes.tile_tensor(tile);
            total_expand_ms += t_expand.elapsed().as_secs_f64() * 1000.0;
            summary.skipped_reads += skipped;

            let t_send = Instant::now();
            if output.blocking_send(IndexedTensor { index, tensor }).is_err() {
                break;
            }
            total_send_ms += t_send.elapsed().as_secs_f64() * 1000.0;

            summary.processed += 1;
        }

        if summary.processed > 0 {
            tracing::debug!(
                worker,
                tiles = summary.processed,
                avg_expand_ms = format!("{:.2}", total_expand_ms / summary.processed as f64),
                total_send_wait_ms = format!("{:.0}", total_send_ms),
                "Input worker summary"
            );
        }

        summary
    })
}

#[allow(clippy::too_many_arguments)]
fn spawn_model_stage(
    unit: Arc<dyn InferenceUnit>,
    model: Model,
    geometry: ModelGeometry,
    total: usize,
    input: mpsc::Receiver<IndexedTensor>,
    output: mpsc::Sender<IndexedResult>,
    on_percent: PercentCallback,
    abort: Arc<AtomicBool>,
    error_tx: mpsc::UnboundedSender<anyhow::Error>,
) -> JoinHandle<usize> {
    tokio::task::spawn_blocking(move || {
        let _stage = enter_stage(model, "model");
        let mut completed = 0_usize;
        let result = run_model_loop(
            unit.as_ref(),
            geometry,
            total,
            input,
            output,
            on_percent.as_ref(),
            &abort,
            &mut completed,
        );
        if let Err(error) = result {
            report_task_error(&error_tx, &abort, error.context("model stage failed"));
        }
        completed
    })
}

#[allow(clippy::too_many_arguments)]
fn run_model_loop(
    unit: &dyn InferenceUnit,
    geometry: ModelGeometry,
    total: usize,
    mut input: mpsc::Receiver<IndexedTensor>,
    output: mpsc::Sender<IndexedResult>,
    on_percent: &(dyn Fn(u32) + Send + Sync),
    abort: &AtomicBool,
    completed: &mut usize,
) -> Result<()> {
    let mut total_recv_ms = 0.0_f64;
    let mut total_infer_ms = 0.0_f64;
    let mut total_send_ms = 0.0_f64;
    let in_side = geometry.input_side();
    let out_block = geometry.out_block_size();

    loop {
        if abort.load(Ordering::SeqCst) {
            break;
        }

        let t_recv = Instant::now();
        let Some(IndexedTensor { index, tensor }) = input.blocking_recv() else {
            break;
        };
        total_recv_ms += t_recv.elapsed().as_secs_f64() * 1000.0;
        record_tile(index);

        if tensor.side() != in_side {
            bail!(
                "tile {index} tensor has side {}, model expects {in_side}",
                tensor.side()
            );
        }

        let t_infer = Instant::now();
        let result = unit
            .predict(tensor)
            .with_context(|| format!("inference failed on tile {index}"))?;
        total_infer_ms += t_infer.elapsed().as_secs_f64() * 1000.0;

        if !result.has_shape(out_block) {
            bail!(
                "inference result for tile {index} has shape {:?}, expected [3, {out_block}, {out_block}]",
                result.data.shape()
            );
        }

        let t_send = Instant::now();
        if output.blocking_send(IndexedResult { index, result }).is_err() {
            break;
        }
        total_send_ms += t_send.elapsed().as_secs_f64() * 1000.0;

        *completed += 1;
        on_percent((*completed * 100 / total.max(1)) as u32);
    }

    if *completed > 0 {
        tracing::info!(
            tiles = *completed,
            avg_recv_wait_ms = format!("{:.1}", total_recv_ms / *completed as f64),
            avg_infer_ms = format!("{:.1}", total_infer_ms / *completed as f64),
            avg_send_wait_ms = format!("{:.1}", total_send_ms / *completed as f64),
            total_infer_ms = format!("{:.0}", total_infer_ms),
            "Model stage summary"
        );
    }

    Ok(())
}

fn spawn_output_stage(
    model: Model,
    tiles: Arc<Vec<Tile>>,
    scale: u32,
    mut buffer: OutputBuffer,
    mut input: mpsc::Receiver<IndexedResult>,
    abort: Arc<AtomicBool>,
    error_tx: mpsc::UnboundedSender<anyhow::Error>,
) -> JoinHandle<Option<OutputSummary>> {
    tokio::task::spawn_blocking(move || {
        let _stage = enter_stage(model, "output");
        let mut pending: BTreeMap<usize, InferenceResult> = BTreeMap::new();
        let mut next = 0_usize;
        let mut stats = CompositeStats::default();
        let mut max_pending = 0_usize;
        let mut total_composite_ms = 0.0_f64;

        loop {
            if abort.load(Ordering::SeqCst) {
                return None;
            }
            let Some(IndexedResult { index, result }) = input.blocking_recv() else {
                break;
            };
            if index < next || pending.insert(index, result).is_some() {
                report_task_error(
                    &error_tx,
                    &abort,
                    anyhow!("output stage received tile {index} twice"),
                );
                return None;
            }
            max_pending = max_pending.max(pending.len());

            while let Some(result) = pending.remove(&next) {
                record_tile(next);
                let t_composite = Instant::now();
                stats += composite(&mut buffer, &tiles[next], &result, scale);
                total_composite_ms += t_composite.elapsed().as_secs_f64() * 1000.0;
                next += 1;
            }
        }

        if !pending.is_empty() {
            let missing = next;
            report_task_error(
                &error_tx,
                &abort,
                anyhow!(
                    "output stage is missing tile {missing}; {} results never composited",
                    pending.len()
                ),
            );
            return None;
        }

        if next > 0 {
            tracing::info!(
                tiles = next,
                written = stats.written,
                clipped = stats.clipped,
                max_reorder_depth = max_pending,
                total_composite_ms = format!("{:.0}", total_composite_ms),
                "Output stage summary"
            );
        }

        Some(OutputSummary {
            processed: next,
            composite: stats,
            buffer,
        })
    })
}
