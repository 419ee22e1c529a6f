//! RGBA8 output buffer and tile compositing.

use std::ops::AddAssign;

use anyhow::{ensure, Result};

use crate::types::{
    AlphaMask, InferenceResult, OutputFormat, Tile, UpscaledImage, COLOR_PLANES, OUTPUT_CHANNELS,
};

/// RGBA8 destination of a run, sized to the true (unpadded) output resolution.
///
/// Colour channels are written by [`composite`], channel 3 starts fully opaque and is only
/// touched by [`OutputBuffer::merge_alpha`].
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl OutputBuffer {
    pub fn new(width: u32, height: u32) -> Self {
        let mut data = vec![0u8; width as usize * height as usize * OUTPUT_CHANNELS];
        for px in data.chunks_exact_mut(OUTPUT_CHANNELS) {
            px[3] = u8::MAX;
        }
        Self {
            width,
            height,
            data,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Bounds-checked store. Returns `false` (and writes nothing) outside the buffer.
    pub fn write_sample(&mut self, x: usize, y: usize, channel: usize, value: u8) -> bool {
        if x >= self.width as usize || y >= self.height as usize || channel >= OUTPUT_CHANNELS {
            return false;
        }
        let index = (y * self.width as usize + x) * OUTPUT_CHANNELS + channel;
        self.data[index] = value;
        true
    }

    /// Copy `mask` into channel 3. The mask must match the buffer exactly.
    pub fn merge_alpha(&mut self, mask: &AlphaMask) -> Result<()> {
        ensure!(
            mask.width == self.width && mask.height == self.height,
            "alpha mask {}x{} does not match output {}x{}",
            mask.width,
            mask.height,
            self.width,
            self.height
        );
        for (px, &alpha) in self.data.chunks_exact_mut(OUTPUT_CHANNELS).zip(&mask.data) {
            px[3] = alpha;
        }
        Ok(())
    }

    pub fn into_image(self, format: OutputFormat) -> UpscaledImage {
        UpscaledImage {
            width: self.width,
            height: self.height,
            format,
            data: self.data,
        }
    }
}

/// Write counts for one or more composited tiles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompositeStats {
    pub written: usize,
    /// Samples whose destination fell outside the true output and were dropped.
    pub clipped: usize,
}

impl AddAssign for CompositeStats {
    fn add_assign(&mut self, rhs: Self) {
        self.written += rhs.written;
        self.clipped += rhs.clipped;
    }
}

/// Map a raw model value in [0, 1] to an 8-bit sample. Clamps, then truncates.
pub fn to_u8(value: f32) -> u8 {
    (value * 255.0).clamp(0.0, 255.0) as u8
}

/// Write the colour planes of `result` for `tile` into `buffer`.
///
/// Local pixel `(lx, ly)` of the `out_block x out_block` result lands at
/// `(tile.x * scale + lx, tile.y * scale + ly)`. Destinations outside the buffer are the padded
/// part of the working image and are dropped. Callers composite in tile-index order so later
/// edge tiles overwrite interior ones where they overlap.
pub fn composite(
    buffer: &mut OutputBuffer,
    tile: &Tile,
    result: &InferenceResult,
    scale: u32,
) -> CompositeStats {
    let out_block = result.side();
    let origin_x = (tile.x * scale) as usize;
    let origin_y = (tile.y * scale) as usize;
    let mut stats = CompositeStats::default();

    for c in 0..COLOR_PLANES {
        let plane = result.data.index_axis(ndarray::Axis(0), c);
        for ly in 0..out_block {
            for lx in 0..out_block {
                let value = to_u8(plane[[ly, lx]]);
                if buffer.write_sample(origin_x + lx, origin_y + ly, c, value) {
                    stats.written += 1;
                } else {
                    stats.clipped += 1;
                }
            }
        }
    }

    stats
}
