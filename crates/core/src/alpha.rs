//! Alpha channel extraction and rescaling.
//!
//! Alpha never goes through the model. It is pulled out of the source image as an 8-bit mask,
//! resized by the model's scale (GPU first, CPU bicubic as the guaranteed fallback) and merged
//! into channel 3 of the output.

use std::fmt;

use tracing::{debug, info, warn};

use crate::resample::resize_bicubic;
use crate::types::{AlphaMask, SourceImage};

/// Outcome of a GPU resize request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GpuResize {
    Resized(Vec<u8>),
    /// The device cannot serve this request. Not an error; the caller falls back to CPU.
    Unavailable,
}

/// Single-channel bicubic resize on a GPU.
pub trait GpuResampler: Send + Sync {
    /// Largest texture side the device accepts.
    fn max_supported_dimension(&self) -> u32;

    fn resize_single_channel(&self, mask: &[u8], width: u32, height: u32, scale: u32) -> GpuResize;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlphaRescalePath {
    /// Scale 1, mask untouched.
    Identity,
    Gpu,
    Cpu,
}

impl fmt::Display for AlphaRescalePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Identity => write!(f, "identity"),
            Self::Gpu => write!(f, "gpu"),
            Self::Cpu => write!(f, "cpu"),
        }
    }
}

/// Extract the alpha channel as one byte per pixel, or `None` for RGB images.
///
/// 16- and 32-bit samples keep only their most significant byte; compositing downstream is
/// always 8-bit.
pub fn extract_alpha(image: &SourceImage) -> Option<AlphaMask> {
    if !image.has_alpha() {
        return None;
    }

    let width = image.width() as usize;
    let height = image.height() as usize;
    let samples = image.samples();
    let mut data = Vec::with_capacity(width * height);
    for y in 0..height {
        for x in 0..width {
            data.push(samples.top_byte(image.sample_index(x, y, 3)));
        }
    }

    debug!(
        bit_depth = image.bit_depth(),
        width, height, "Extracted alpha mask"
    );

    Some(AlphaMask {
        width: image.width(),
        height: image.height(),
        data,
    })
}

/// True when the image carries alpha and at least one sample is below fully opaque.
pub fn has_meaningful_alpha(image: &SourceImage) -> bool {
    extract_alpha(image).is_some_and(|mask| !mask.is_opaque())
}

/// Resize `mask` by the integer `scale`.
///
/// Tries `gpu` when present and the output fits its texture limit, otherwise (or when the
/// device reports [`GpuResize::Unavailable`] or returns a wrongly sized buffer) resizes on the
/// CPU with the same kernel family.
pub fn rescale_alpha(
    mask: AlphaMask,
    scale: u32,
    gpu: Option<&dyn GpuResampler>,
) -> (AlphaMask, AlphaRescalePath) {
    if scale <= 1 {
        return (mask, AlphaRescalePath::Identity);
    }

    let out_width = mask.width * scale;
    let out_height = mask.height * scale;
    let expected_len = out_width as usize * out_height as usize;

    if let Some(gpu) = gpu {
        let max_dim = gpu.max_supported_dimension();
        info!(max_dim, "GPU resampler maximum texture size");

        if out_width <= max_dim && out_height <= max_dim {
            match gpu.resize_single_channel(&mask.data, mask.width, mask.height, scale) {
                GpuResize::Resized(data) if data.len() == expected_len => {
                    return (
                        AlphaMask {
                            width: out_width,
                            height: out_height,
                            data,
                        },
                        AlphaRescalePath::Gpu,
                    );
                }
                GpuResize::Resized(data) => {
                    warn!(
                        expected = expected_len,
                        got = data.len(),
                        "GPU alpha resize returned a wrongly sized buffer; using CPU"
                    );
                }
                GpuResize::Unavailable => {
                    debug!("GPU alpha resize unavailable; using CPU");
                }
            }
        } else {
            debug!(
                out_width,
                out_height, max_dim, "Alpha output exceeds GPU texture limit; using CPU"
            );
        }
    }

    let data = resize_bicubic(
        &mask.data,
        1,
        mask.width as usize,
        mask.height as usize,
        scale as f32,
    );
    (
        AlphaMask {
            width: out_width,
            height: out_height,
            data,
        },
        AlphaRescalePath::Cpu,
    )
}
