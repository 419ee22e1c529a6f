//! Model variants and the inference capability the pipeline drives.
//!
//! The core never looks inside a model. It only needs the declared block size,
//! halo and scale of the selected variant, and something that turns one
//! [`PlanarTensor`] into one [`InferenceResult`].

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::types::{InferenceResult, PlanarTensor};

/// Extra border read around every tile. The model consumes it and does not return it.
pub const HALO: u32 = 7;

const DENOISE_BLOCK: u32 = 128;
const UPSCALE_BLOCK: u32 = 142;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
    /// Scale 1, block 128.
    Denoise,
    /// Scale 2, block 142.
    Upscale,
}

/// Fixed tensor geometry declared by a model variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelGeometry {
    pub block_size: u32,
    pub halo: u32,
    pub scale: u32,
}

impl ModelGeometry {
    /// Side of the planar input tensor: `block + 2 * halo`.
    pub fn input_side(&self) -> usize {
        (self.block_size + 2 * self.halo) as usize
    }

    /// Side of the inference output: `block * scale`.
    pub fn out_block_size(&self) -> usize {
        (self.block_size * self.scale) as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Model {
    AnimeNoise0,
    AnimeNoise1,
    AnimeNoise2,
    AnimeNoise3,
    AnimeScale2x,
    AnimeNoise0Scale2x,
    AnimeNoise1Scale2x,
    AnimeNoise2Scale2x,
    AnimeNoise3Scale2x,
    PhotoNoise0,
    PhotoNoise1,
    PhotoNoise2,
    PhotoNoise3,
    PhotoScale2x,
    PhotoNoise0Scale2x,
    PhotoNoise1Scale2x,
    PhotoNoise2Scale2x,
    PhotoNoise3Scale2x,
}

impl Model {
    pub const ALL: [Model; 18] = [
        Model::AnimeNoise0,
        Model::AnimeNoise1,
        Model::AnimeNoise2,
        Model::AnimeNoise3,
        Model::AnimeScale2x,
        Model::AnimeNoise0Scale2x,
        Model::AnimeNoise1Scale2x,
        Model::AnimeNoise2Scale2x,
        Model::AnimeNoise3Scale2x,
        Model::PhotoNoise0,
        Model::PhotoNoise1,
        Model::PhotoNoise2,
        Model::PhotoNoise3,
        Model::PhotoScale2x,
        Model::PhotoNoise0Scale2x,
        Model::PhotoNoise1Scale2x,
        Model::PhotoNoise2Scale2x,
        Model::PhotoNoise3Scale2x,
    ];

    pub fn family(&self) -> ModelFamily {
        match self {
            Self::AnimeNoise0
            | Self::AnimeNoise1
            | Self::AnimeNoise2
            | Self::AnimeNoise3
            | Self::PhotoNoise0
            | Self::PhotoNoise1
            | Self::PhotoNoise2
            | Self::PhotoNoise3 => ModelFamily::Denoise,
            _ => ModelFamily::Upscale,
        }
    }

    pub fn geometry(&self) -> ModelGeometry {
        let (block_size, scale) = match self.family() {
            ModelFamily::Denoise => (DENOISE_BLOCK, 1),
            ModelFamily::Upscale => (UPSCALE_BLOCK, 2),
        };
        ModelGeometry {
            block_size,
            halo: HALO,
            scale,
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Self::AnimeNoise0 => "anime_noise0",
            Self::AnimeNoise1 => "anime_noise1",
            Self::AnimeNoise2 => "anime_noise2",
            Self::AnimeNoise3 => "anime_noise3",
            Self::AnimeScale2x => "anime_scale2x",
            Self::AnimeNoise0Scale2x => "anime_noise0_scale2x",
            Self::AnimeNoise1Scale2x => "anime_noise1_scale2x",
            Self::AnimeNoise2Scale2x => "anime_noise2_scale2x",
            Self::AnimeNoise3Scale2x => "anime_noise3_scale2x",
            Self::PhotoNoise0 => "photo_noise0",
            Self::PhotoNoise1 => "photo_noise1",
            Self::PhotoNoise2 => "photo_noise2",
            Self::PhotoNoise3 => "photo_noise3",
            Self::PhotoScale2x => "photo_scale2x",
            Self::PhotoNoise0Scale2x => "photo_noise0_scale2x",
            Self::PhotoNoise1Scale2x => "photo_noise1_scale2x",
            Self::PhotoNoise2Scale2x => "photo_noise2_scale2x",
            Self::PhotoNoise3Scale2x => "photo_noise3_scale2x",
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}.onnx", self.tag())
    }
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for Model {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        match Self::ALL.iter().find(|model| model.tag() == normalized) {
            Some(model) => Ok(*model),
            None => bail!("unknown model '{s}'"),
        }
    }
}

/// A loaded model: one planar tile in, one planar result out.
///
/// Implementations must be deterministic and side-effect free; the pipeline never retries.
pub trait InferenceUnit: Send + Sync {
    fn predict(&self, input: PlanarTensor) -> Result<InferenceResult>;
}

impl<F> InferenceUnit for F
where
    F: Fn(PlanarTensor) -> Result<InferenceResult> + Send + Sync,
{
    fn predict(&self, input: PlanarTensor) -> Result<InferenceResult> {
        self(input)
    }
}

/// Resolves a model tag to a ready inference unit.
pub trait ModelProvider: Send + Sync {
    fn load(&self, model: Model) -> Result<Arc<dyn InferenceUnit>>;
}
