//! Images, tiles and tensors shared by every stage.

use anyhow::{bail, Result};
use ndarray::Array3;

/// Number of colour planes fed to and returned by the inference unit.
pub const COLOR_PLANES: usize = 3;

/// Channel count of every [`UpscaledImage`] buffer (RGBA8).
pub const OUTPUT_CHANNELS: usize = 4;

/// Raw component samples at the image's native bit depth.
#[derive(Debug, Clone, PartialEq)]
pub enum PixelSamples {
    U8(Vec<u8>),
    U16(Vec<u16>),
    U32(Vec<u32>),
}

impl PixelSamples {
    pub fn len(&self) -> usize {
        match self {
            Self::U8(data) => data.len(),
            Self::U16(data) => data.len(),
            Self::U32(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bit_depth(&self) -> u8 {
        match self {
            Self::U8(_) => 8,
            Self::U16(_) => 16,
            Self::U32(_) => 32,
        }
    }

    /// Sample at `index` mapped into [0, 1].
    pub fn unit(&self, index: usize) -> f32 {
        match self {
            Self::U8(data) => data[index] as f32 / 255.0,
            Self::U16(data) => data[index] as f32 / 65535.0,
            Self::U32(data) => (data[index] as f64 / u32::MAX as f64) as f32,
        }
    }

    /// Most significant byte of the sample at `index`.
    pub fn top_byte(&self, index: usize) -> u8 {
        match self {
            Self::U8(data) => data[index],
            Self::U16(data) => (data[index] >> 8) as u8,
            Self::U32(data) => (data[index] >> 24) as u8,
        }
    }

    fn zeroed_like(&self, len: usize) -> Self {
        match self {
            Self::U8(_) => Self::U8(vec![0; len]),
            Self::U16(_) => Self::U16(vec![0; len]),
            Self::U32(_) => Self::U32(vec![0; len]),
        }
    }

    /// Copy `len` samples from `other[src..]` into `self[dst..]`. Both must share a depth.
    fn copy_run(&mut self, dst: usize, other: &Self, src: usize, len: usize) {
        match (self, other) {
            (Self::U8(d), Self::U8(s)) => d[dst..dst + len].copy_from_slice(&s[src..src + len]),
            (Self::U16(d), Self::U16(s)) => d[dst..dst + len].copy_from_slice(&s[src..src + len]),
            (Self::U32(d), Self::U32(s)) => d[dst..dst + len].copy_from_slice(&s[src..src + len]),
            _ => unreachable!("copy_run between different bit depths"),
        }
    }
}

/// Decoded input image, interleaved, row-major, top row first.
///
/// `channels` is 3 (RGB) or 4 (RGBA, alpha last). Immutable for the duration of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceImage {
    width: u32,
    height: u32,
    channels: u8,
    samples: PixelSamples,
}

impl SourceImage {
    pub fn new(width: u32, height: u32, channels: u8, samples: PixelSamples) -> Result<Self> {
        if width == 0 || height == 0 {
            bail!("image dimensions must be non-zero, got {width}x{height}");
        }
        if channels != 3 && channels != 4 {
            bail!("unsupported channel count {channels} (expected 3 or 4)");
        }
        let expected = width as usize * height as usize * channels as usize;
        if samples.len() != expected {
            bail!(
                "sample count mismatch: expected {expected} ({width}x{height}x{channels}), got {}",
                samples.len()
            );
        }

        Ok(Self {
            width,
            height,
            channels,
            samples,
        })
    }

    pub fn from_rgb8(width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        Self::new(width, height, 3, PixelSamples::U8(data))
    }

    pub fn from_rgba8(width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        Self::new(width, height, 4, PixelSamples::U8(data))
    }

    /// Zero-filled canvas with the same depth and channel layout as `self`.
    pub(crate) fn blank_like(&self, width: u32, height: u32) -> Self {
        let len = width as usize * height as usize * self.channels as usize;
        Self {
            width,
            height,
            channels: self.channels,
            samples: self.samples.zeroed_like(len),
        }
    }

    /// Copy all of `src` into `self` with its top-left corner at `(x, y)`.
    pub(crate) fn blit(&mut self, src: &SourceImage, x: u32, y: u32) {
        debug_assert_eq!(self.channels, src.channels);
        debug_assert!(x + src.width <= self.width && y + src.height <= self.height);

        let ch = self.channels as usize;
        let row_len = src.width as usize * ch;
        for row in 0..src.height as usize {
            let src_start = row * row_len;
            let dst_start = ((y as usize + row) * self.width as usize + x as usize) * ch;
            self.samples
                .copy_run(dst_start, &src.samples, src_start, row_len);
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn channels(&self) -> u8 {
        self.channels
    }

    pub fn bit_depth(&self) -> u8 {
        self.samples.bit_depth()
    }

    pub fn has_alpha(&self) -> bool {
        self.channels == 4
    }

    pub fn samples(&self) -> &PixelSamples {
        &self.samples
    }

    /// Interleaved sample index of channel `c` at pixel `(x, y)`.
    pub fn sample_index(&self, x: usize, y: usize, c: usize) -> usize {
        (y * self.width as usize + x) * self.channels as usize + c
    }
}

/// A square block of the (possibly padded) working image.
///
/// Tiles are stateless descriptors; their position in the generated sequence is the
/// tile index used for last-writer-wins compositing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tile {
    pub x: u32,
    pub y: u32,
    pub size: u32,
}

/// Planar `[3, side, side]` float32 input for one inference call, values in [0, 1].
#[derive(Debug, Clone, PartialEq)]
pub struct PlanarTensor {
    pub data: Array3<f32>,
}

impl PlanarTensor {
    pub fn zeros(side: usize) -> Self {
        Self {
            data: Array3::zeros((COLOR_PLANES, side, side)),
        }
    }

    pub fn side(&self) -> usize {
        self.data.shape()[1]
    }
}

/// Planar `[3, out_block, out_block]` float32 output of one inference call.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceResult {
    pub data: Array3<f32>,
}

impl InferenceResult {
    pub fn new(data: Array3<f32>) -> Self {
        Self { data }
    }

    pub fn side(&self) -> usize {
        self.data.shape()[1]
    }

    pub fn has_shape(&self, side: usize) -> bool {
        self.data.shape() == [COLOR_PLANES, side, side]
    }
}

/// One 8-bit alpha sample per pixel, row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlphaMask {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl AlphaMask {
    pub fn is_opaque(&self) -> bool {
        self.data.iter().all(|&a| a == u8::MAX)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Channel 3 is padding and always 255.
    Opaque,
    /// Channel 3 carries straight (non-premultiplied) alpha.
    Straight,
}

/// Final RGBA8 result of a run, cropped to `source * scale`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpscaledImage {
    pub width: u32,
    pub height: u32,
    pub format: OutputFormat,
    pub data: Vec<u8>,
}

impl UpscaledImage {
    pub fn has_alpha(&self) -> bool {
        self.format == OutputFormat::Straight
    }

    /// Drop channel 3, producing packed RGB8.
    pub fn to_rgb8(&self) -> Vec<u8> {
        self.data
            .chunks_exact(OUTPUT_CHANNELS)
            .flat_map(|px| [px[0], px[1], px[2]])
            .collect()
    }

    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let i = (y as usize * self.width as usize + x as usize) * OUTPUT_CHANNELS;
        [
            self.data[i],
            self.data[i + 1],
            self.data[i + 2],
            self.data[i + 3],
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_image_rejects_length_mismatch() {
        let err = SourceImage::from_rgb8(2, 2, vec![0; 11]).expect_err("should fail");
        assert!(err.to_string().contains("sample count mismatch"));
    }

    #[test]
    fn test_source_image_rejects_zero_dimension() {
        let err = SourceImage::from_rgb8(0, 4, vec![]).expect_err("should fail");
        assert!(err.to_string().contains("non-zero"));
    }

    #[test]
    fn test_source_image_rejects_grayscale() {
        let err = SourceImage::new(1, 1, 1, PixelSamples::U8(vec![0])).expect_err("should fail");
        assert!(err.to_string().contains("channel count"));
    }

    #[test]
    fn test_pixel_samples_unit_and_top_byte() {
        let s8 = PixelSamples::U8(vec![255, 0]);
        assert_eq!(s8.unit(0), 1.0);
        assert_eq!(s8.top_byte(1), 0);

        let s16 = PixelSamples::U16(vec![0xABCD]);
        assert_eq!(s16.top_byte(0), 0xAB);
        assert!((s16.unit(0) - 0xABCD as f32 / 65535.0).abs() < 1e-6);

        let s32 = PixelSamples::U32(vec![0x12345678, u32::MAX]);
        assert_eq!(s32.top_byte(0), 0x12);
        assert_eq!(s32.unit(1), 1.0);
        assert_eq!(s32.bit_depth(), 32);
    }

    #[test]
    fn test_blit_places_rows_at_offset() {
        let src = SourceImage::from_rgb8(1, 2, vec![1, 2, 3, 4, 5, 6]).unwrap();
        let mut canvas = src.blank_like(3, 3);
        canvas.blit(&src, 1, 0);

        let PixelSamples::U8(data) = canvas.samples() else {
            panic!("expected 8-bit samples");
        };
        assert_eq!(&data[3..6], &[1, 2, 3]);
        assert_eq!(&data[12..15], &[4, 5, 6]);
        assert!(data[..3].iter().all(|&v| v == 0));
        assert!(data[18..].iter().all(|&v| v == 0));
    }

    #[test]
    fn test_upscaled_image_to_rgb8() {
        let image = UpscaledImage {
            width: 2,
            height: 1,
            format: OutputFormat::Opaque,
            data: vec![1, 2, 3, 255, 4, 5, 6, 255],
        };
        assert_eq!(image.to_rgb8(), vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(image.pixel(1, 0), [4, 5, 6, 255]);
        assert!(!image.has_alpha());
    }

    #[test]
    fn test_inference_result_shape_check() {
        let result = InferenceResult::new(Array3::zeros((3, 4, 4)));
        assert!(result.has_shape(4));
        assert!(!result.has_shape(5));
        assert_eq!(result.side(), 4);
    }
}
