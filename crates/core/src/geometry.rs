//! Tile layout over the working image.

use anyhow::{bail, Result};

use crate::types::Tile;

/// Cover a `width x height` image with `block x block` tiles.
///
/// Interior tiles are laid out row-major at multiples of `block`. When a dimension is not a
/// multiple of `block`, one extra edge tile per interior row (right edge) or column (bottom
/// edge) is appended, anchored flush with that edge so it overlaps the last interior tile.
/// If both remainders are non-zero a single bottom-right corner tile comes last.
///
/// The order is the compositing order: edge tiles overwrite interior tiles in the overlap.
pub fn compute_tiles(width: u32, height: u32, block: u32) -> Result<Vec<Tile>> {
    if block == 0 {
        bail!("block size must be non-zero");
    }
    if width < block || height < block {
        bail!("image {width}x{height} is smaller than one {block}px block; expand it first");
    }

    let cols = width / block;
    let rows = height / block;
    let edge_x = width % block != 0;
    let edge_y = height % block != 0;
    let right = width - block;
    let bottom = height - block;

    let tile = |x: u32, y: u32| Tile { x, y, size: block };
    let mut tiles = Vec::with_capacity(tile_count(width, height, block));

    for row in 0..rows {
        for col in 0..cols {
            tiles.push(tile(col * block, row * block));
        }
    }
    if edge_x {
        tiles.extend((0..rows).map(|row| tile(right, row * block)));
    }
    if edge_y {
        tiles.extend((0..cols).map(|col| tile(col * block, bottom)));
    }
    if edge_x && edge_y {
        tiles.push(tile(right, bottom));
    }

    Ok(tiles)
}

/// Number of tiles [`compute_tiles`] produces, without allocating.
pub fn tile_count(width: u32, height: u32, block: u32) -> usize {
    if block == 0 || width < block || height < block {
        return 0;
    }
    let cols = (width / block) as usize;
    let rows = (height / block) as usize;
    let edge_x = width % block != 0;
    let edge_y = height % block != 0;

    cols * rows
        + if edge_x { rows } else { 0 }
        + if edge_y { cols } else { 0 }
        + usize::from(edge_x && edge_y)
}
