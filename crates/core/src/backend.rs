//! ONNX Runtime inference: execution provider selection, session construction and the
//! [`InferenceUnit`] / [`ModelProvider`] implementations the upscaler runs on.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use half::f16;
use ndarray::{Array4, ArrayD, Axis, Ix4};
use ort::{
    execution_providers::{CUDAExecutionProvider, ExecutionProvider, TensorRTExecutionProvider},
    session::{
        builder::{GraphOptimizationLevel, SessionBuilder},
        Session,
    },
    tensor::TensorElementType,
    value::{Tensor, ValueType},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::model::{InferenceUnit, Model, ModelProvider};
use crate::types::{InferenceResult, PlanarTensor};

const TRT_TICK: Duration = Duration::from_secs(15);

/// Execution provider selection.
///
/// `Tensorrt` needs the TensorRT runtime (`libnvinfer.so.10` / `nvinfer.dll`); without it the
/// session falls back to CUDA, and without CUDA to CPU.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InferenceBackend {
    #[default]
    Cuda,
    Tensorrt,
    Cpu,
}

impl InferenceBackend {
    /// Case-insensitive; anything unrecognised selects CUDA.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "tensorrt" | "trt" => Self::Tensorrt,
            "cpu" => Self::Cpu,
            _ => Self::Cuda,
        }
    }
}

impl fmt::Display for InferenceBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Cuda => "cuda",
            Self::Tensorrt => "tensorrt",
            Self::Cpu => "cpu",
        })
    }
}

/// Element type a model expects on its input. Tiles are always f32 on our side.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Precision {
    F32,
    F16,
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::F32 => "f32",
            Self::F16 => "f16",
        })
    }
}

/// TensorRT engines for one model variant, kept under `<trt cache root>/<model tag>`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct EngineCache {
    dir: PathBuf,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct CacheUsage {
    files: u64,
    bytes: u64,
}

impl EngineCache {
    fn for_model(root: &Path, model: Model) -> Self {
        Self {
            dir: root.join(model.tag()),
        }
    }

    fn usage(&self) -> CacheUsage {
        let mut usage = CacheUsage::default();
        let mut pending = vec![self.dir.clone()];
        while let Some(dir) = pending.pop() {
            let Ok(entries) = fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                match entry.metadata() {
                    Ok(meta) if meta.is_dir() => pending.push(entry.path()),
                    Ok(meta) if meta.is_file() => {
                        usage.files += 1;
                        usage.bytes += meta.len();
                    }
                    _ => {}
                }
            }
        }
        usage
    }
}

/// Logs every `tick` while a TensorRT engine builds. Stops when dropped.
struct BuildTicker {
    stop: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl BuildTicker {
    fn start(model: Model, tick: Duration) -> Self {
        let (stop, stopped) = mpsc::channel::<()>();
        let handle = thread::spawn(move || {
            let started = Instant::now();
            while let Err(RecvTimeoutError::Timeout) = stopped.recv_timeout(tick) {
                info!(
                    model = %model,
                    elapsed_secs = started.elapsed().as_secs(),
                    "TensorRT engine build still in progress"
                );
            }
        });
        Self {
            stop: Some(stop),
            handle: Some(handle),
        }
    }
}

impl Drop for BuildTicker {
    fn drop(&mut self) {
        drop(self.stop.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Open an `ort::Session` for `model_path` on `backend`.
///
/// TensorRT engines are cached per model under `trt_cache_root`; building one can take minutes
/// on first use.
pub fn open_session(
    model: Model,
    model_path: &Path,
    backend: InferenceBackend,
    trt_cache_root: Option<&Path>,
) -> Result<Session> {
    let builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;
    let session = match backend {
        InferenceBackend::Tensorrt => {
            let root = trt_cache_root.unwrap_or_else(|| Path::new("trt_cache"));
            tensorrt_session(builder, model, model_path, &EngineCache::for_model(root, model))
        }
        InferenceBackend::Cuda => {
            if !CUDAExecutionProvider::default().is_available().unwrap_or(false) {
                warn!(model = %model, "CUDA EP is not available, inference will fall back to CPU");
            }
            builder
                .with_execution_providers([CUDAExecutionProvider::default().build()])?
                .commit_from_file(model_path)
                .map_err(anyhow::Error::from)
        }
        InferenceBackend::Cpu => builder
            .commit_from_file(model_path)
            .map_err(anyhow::Error::from),
    };
    session.with_context(|| format!("failed to load ONNX model {}", model_path.display()))
}

fn tensorrt_session(
    builder: SessionBuilder,
    model: Model,
    model_path: &Path,
    cache: &EngineCache,
) -> Result<Session> {
    if let Err(e) = fs::create_dir_all(&cache.dir) {
        warn!(dir = %cache.dir.display(), error = %e, "Failed to create TensorRT engine cache");
    }
    let before = cache.usage();
    info!(
        model = %model,
        cache_dir = %cache.dir.display(),
        cached_files = before.files,
        "Opening TensorRT session (an uncached engine build may take several minutes)"
    );

    let started = Instant::now();
    let ticker = BuildTicker::start(model, TRT_TICK);
    let committed = builder
        .with_execution_providers([
            TensorRTExecutionProvider::default()
                .with_engine_cache(true)
                .with_engine_cache_path(cache.dir.to_string_lossy().to_string())
                .with_fp16(true)
                .with_device_id(0)
                .build(),
            CUDAExecutionProvider::default().build(),
        ])?
        .commit_from_file(model_path);
    drop(ticker);

    let elapsed_secs = started.elapsed().as_secs_f64();
    match committed {
        Ok(session) => {
            let after = cache.usage();
            info!(
                model = %model,
                elapsed_secs,
                engine_built = after != before,
                cache_bytes = after.bytes,
                "TensorRT session ready"
            );
            Ok(session)
        }
        Err(e) => {
            error!(model = %model, elapsed_secs, error = %e, "TensorRT session failed");
            Err(e.into())
        }
    }
}

/// One loaded model variant. Calls are serialized on the session lock.
pub struct OrtInference {
    session: Mutex<Session>,
    input_name: String,
    output_name: String,
    precision: Precision,
}

impl OrtInference {
    pub fn from_session(session: Session) -> Result<Self> {
        let input = session.inputs().first().context("model declares no inputs")?;
        let output = session.outputs().first().context("model declares no outputs")?;
        let precision = match input.dtype() {
            ValueType::Tensor { ty, .. } if *ty == TensorElementType::Float16 => Precision::F16,
            _ => Precision::F32,
        };
        let input_name = input.name().to_string();
        let output_name = output.name().to_string();

        debug!(%input_name, %output_name, %precision, "Detected model IO");
        Ok(Self {
            session: Mutex::new(session),
            input_name,
            output_name,
            precision,
        })
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    fn run(&self, batched: Array4<f32>) -> Result<ArrayD<f32>> {
        let mut session = self
            .session
            .lock()
            .map_err(|_| anyhow!("inference session lock poisoned"))?;
        let input_name = self.input_name.as_str();

        let output = match self.precision {
            Precision::F32 => {
                let tensor = Tensor::from_array(batched)?;
                let outputs = session.run(ort::inputs![input_name => &tensor])?;
                outputs[self.output_name.as_str()]
                    .try_extract_array::<f32>()?
                    .to_owned()
            }
            Precision::F16 => {
                let tensor = Tensor::from_array(batched.mapv(f16::from_f32))?;
                let outputs = session.run(ort::inputs![input_name => &tensor])?;
                outputs[self.output_name.as_str()]
                    .try_extract_array::<f16>()?
                    .mapv(f16::to_f32)
            }
        };
        Ok(output)
    }
}

impl InferenceUnit for OrtInference {
    fn predict(&self, input: PlanarTensor) -> Result<InferenceResult> {
        let output = self
            .run(input.data.insert_axis(Axis(0)))?
            .into_dimensionality::<Ix4>()
            .context("model output is not a 4-D NCHW tensor")?;
        if output.len_of(Axis(0)) != 1 {
            bail!("model returned batch of {}, expected 1", output.len_of(Axis(0)));
        }
        Ok(InferenceResult::new(output.index_axis_move(Axis(0), 0)))
    }
}

/// Loads `<models_dir>/<tag>.onnx` on first use and keeps the session for later runs.
pub struct OrtModelProvider {
    models_dir: PathBuf,
    backend: InferenceBackend,
    trt_cache_dir: Option<PathBuf>,
    loaded: Mutex<HashMap<Model, Arc<OrtInference>>>,
}

impl OrtModelProvider {
    pub fn new(models_dir: PathBuf, backend: InferenceBackend) -> Self {
        Self {
            models_dir,
            backend,
            trt_cache_dir: None,
            loaded: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_trt_cache_dir(mut self, dir: PathBuf) -> Self {
        self.trt_cache_dir = Some(dir);
        self
    }

    pub fn model_path(&self, model: Model) -> PathBuf {
        self.models_dir.join(model.file_name())
    }
}

impl ModelProvider for OrtModelProvider {
    fn load(&self, model: Model) -> Result<Arc<dyn InferenceUnit>> {
        let mut loaded = self
            .loaded
            .lock()
            .map_err(|_| anyhow!("model cache lock poisoned"))?;
        if let Some(unit) = loaded.get(&model) {
            return Ok(unit.clone());
        }

        let model_path = self.model_path(model);
        if !model_path.is_file() {
            bail!("model file not found: {}", model_path.display());
        }

        debug!(model = %model, backend = %self.backend, path = %model_path.display(), "Loading ONNX model");
        let session = open_session(
            model,
            &model_path,
            self.backend,
            self.trt_cache_dir.as_deref(),
        )?;
        let unit = Arc::new(OrtInference::from_session(session)?);
        info!(
            model = %model,
            precision = %unit.precision(),
            input_side = model.geometry().input_side(),
            "Model ready"
        );
        loaded.insert(model, unit.clone());
        Ok(unit)
    }
}
