//! Planar float conversion of the working image and per-tile tensor extraction.

use ndarray::{s, Array3};

use crate::types::{PlanarTensor, SourceImage, Tile, COLOR_PLANES};

/// The working image as three [0, 1] float planes, grown by `halo` on every side.
///
/// The halo is filled by replicating the nearest edge pixel, so the model sees plausible
/// context at the image border. Built once per run and shared read-only by input workers.
#[derive(Debug, Clone)]
pub struct ExpandedPlanes {
    planes: Array3<f32>,
    halo: u32,
}

impl ExpandedPlanes {
    pub fn from_image(image: &SourceImage, halo: u32) -> Self {
        let w = image.width() as usize;
        let h = image.height() as usize;
        let pad = halo as usize;
        let exp_w = w + 2 * pad;
        let exp_h = h + 2 * pad;
        let samples = image.samples();

        let mut planes = Array3::<f32>::zeros((COLOR_PLANES, exp_h, exp_w));
        for ey in 0..exp_h {
            let sy = ey.saturating_sub(pad).min(h - 1);
            for ex in 0..exp_w {
                let sx = ex.saturating_sub(pad).min(w - 1);
                for c in 0..COLOR_PLANES {
                    planes[[c, ey, ex]] = samples.unit(image.sample_index(sx, sy, c));
                }
            }
        }

        Self { planes, halo }
    }

    pub fn width(&self) -> usize {
        self.planes.shape()[2]
    }

    pub fn height(&self) -> usize {
        self.planes.shape()[1]
    }

    pub fn halo(&self) -> u32 {
        self.halo
    }

    /// Copy the `(block + 2*halo)^2` window for `tile` into a fresh tensor.
    ///
    /// The window starts at `tile - halo` in image coordinates, which is `tile` in expanded
    /// coordinates. Reads falling outside the expanded planes leave the tensor's zero default
    /// in place; the returned count of such reads is zero for correctly computed tiles.
    pub fn tile_tensor(&self, tile: &Tile) -> (PlanarTensor, usize) {
        let side = (tile.size + 2 * self.halo) as usize;
        let x0 = tile.x as usize;
        let y0 = tile.y as usize;
        let mut tensor = PlanarTensor::zeros(side);

        let avail_w = self.width().saturating_sub(x0).min(side);
        let avail_h = self.height().saturating_sub(y0).min(side);
        if avail_w > 0 && avail_h > 0 {
            tensor
                .data
                .slice_mut(s![.., ..avail_h, ..avail_w])
                .assign(&self.planes.slice(s![.., y0..y0 + avail_h, x0..x0 + avail_w]));
        }

        let skipped = COLOR_PLANES * (side * side - avail_w * avail_h);
        (tensor, skipped)
    }
}
