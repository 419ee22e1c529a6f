//! Core crate for the tilescale tiling upscaler.

pub mod alpha;
pub mod backend;
pub mod border;
pub mod compositor;
pub mod config;
pub mod geometry;
pub mod logging;
pub mod model;
pub mod pipeline;
pub mod planar;
pub mod resample;
pub mod runtime;
pub mod types;
pub mod upscaler;

pub use model::{InferenceUnit, Model, ModelProvider};
pub use types::{SourceImage, UpscaledImage};
pub use upscaler::{InterruptFlag, Progress, RunOutcome, Upscaler};
