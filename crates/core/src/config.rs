//! `config.toml` in the data directory, and resolution of the data directory itself.
//!
//! Every table is optional; missing keys take their defaults. Relative paths in `[paths]` are
//! resolved against the data directory.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};

use crate::backend::InferenceBackend;
use crate::model::Model;
use crate::pipeline::PipelineOptions;

pub const ENV_DATA_DIR: &str = "TILESCALE_DATA_DIR";
const CONFIG_FILE_NAME: &str = "config.toml";
const FALLBACK_DATA_DIR: &str = "data";
/// Upper bound on `[pipeline] input_workers`; tiles are cheap to expand.
const MAX_INPUT_WORKERS: usize = 64;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub inference: InferenceConfig,
    pub pipeline: PipelineConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    /// Holds one `<model tag>.onnx` per variant.
    pub models_dir: PathBuf,
    pub trt_cache_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            models_dir: "models".into(),
            trt_cache_dir: "trt_cache".into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct InferenceConfig {
    pub backend: InferenceBackend,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Capacity of each channel between stages. Must be at least 1.
    pub buffer_size: usize,
    /// 0 uses the available parallelism.
    pub input_workers: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let defaults = PipelineOptions::default();
        Self {
            buffer_size: defaults.buffer_size,
            input_workers: defaults.input_workers,
        }
    }
}

impl From<&PipelineConfig> for PipelineOptions {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            buffer_size: config.buffer_size,
            input_workers: config.input_workers,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OutputConfig {
    /// Used when the command line names no model.
    pub default_model: Model,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            default_model: Model::AnimeNoise1Scale2x,
        }
    }
}

impl AppConfig {
    /// Parse and validate TOML. `origin` only labels errors.
    pub fn parse(raw: &str, origin: &Path) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(raw)
            .with_context(|| format!("invalid TOML in {}", origin.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid settings in {}", origin.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.pipeline.buffer_size >= 1,
            "[pipeline] buffer_size must be at least 1"
        );
        ensure!(
            self.pipeline.input_workers <= MAX_INPUT_WORKERS,
            "[pipeline] input_workers must be at most {MAX_INPUT_WORKERS}, got {}",
            self.pipeline.input_workers
        );
        ensure!(
            !self.paths.models_dir.as_os_str().is_empty(),
            "[paths] models_dir must not be empty"
        );
        Ok(())
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions::from(&self.pipeline)
    }

    fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("cannot encode config as TOML")
    }
}

/// Root of everything tilescale keeps on disk: `config.toml`, models, TensorRT engines,
/// runtime libraries and logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `--data-dir` wins over `TILESCALE_DATA_DIR`, which wins over `./data`.
    pub fn resolve(cli_override: Option<&Path>) -> Self {
        let root = cli_override
            .map(Path::to_path_buf)
            .or_else(|| env::var_os(ENV_DATA_DIR).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(FALLBACK_DATA_DIR));
        Self { root }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join(CONFIG_FILE_NAME)
    }

    pub fn runtime_lib_dir(&self) -> PathBuf {
        self.root.join("lib")
    }

    /// Absolute paths pass through; relative ones hang off the data directory.
    pub fn resolve_configured(&self, configured: &Path) -> PathBuf {
        if configured.is_absolute() {
            configured.to_path_buf()
        } else {
            self.root.join(configured)
        }
    }

    pub fn models_dir(&self, config: &AppConfig) -> PathBuf {
        self.resolve_configured(&config.paths.models_dir)
    }

    pub fn trt_cache_dir(&self, config: &AppConfig) -> PathBuf {
        self.resolve_configured(&config.paths.trt_cache_dir)
    }

    /// Create the directory and seed a default `config.toml`. An existing file is left alone.
    /// Returns whether a new file was written.
    pub fn ensure(&self) -> Result<bool> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("cannot create data directory {}", self.root.display()))?;
        let path = self.config_file();
        if path.exists() {
            return Ok(false);
        }
        fs::write(&path, AppConfig::default().to_toml()?)
            .with_context(|| format!("cannot write {}", path.display()))?;
        Ok(true)
    }

    /// Defaults when `config.toml` is absent.
    pub fn load_config(&self) -> Result<AppConfig> {
        let path = self.config_file();
        if !path.exists() {
            return Ok(AppConfig::default());
        }
        let raw =
            fs::read_to_string(&path).with_context(|| format!("cannot read {}", path.display()))?;
        AppConfig::parse(&raw, &path)
    }
}
