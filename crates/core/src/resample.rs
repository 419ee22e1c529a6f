//! Pure-Rust bicubic (Catmull-Rom) resampling for interleaved 8-bit buffers.

/// Catmull-Rom kernel parameter.
const CUBIC_A: f64 = -0.5;

fn cubic_weight(t: f64) -> f64 {
    let t = t.abs();
    if t <= 1.0 {
        (CUBIC_A + 2.0) * t * t * t - (CUBIC_A + 3.0) * t * t + 1.0
    } else if t < 2.0 {
        CUBIC_A * t * t * t - 5.0 * CUBIC_A * t * t + 8.0 * CUBIC_A * t - 4.0 * CUBIC_A
    } else {
        0.0
    }
}

/// Source taps and weights for every destination coordinate along one axis.
fn axis_taps(src_len: usize, dst_len: usize) -> Vec<([usize; 4], [f64; 4])> {
    let ratio = src_len as f64 / dst_len as f64;
    let last = src_len as isize - 1;

    (0..dst_len)
        .map(|dst| {
            // Map destination pixel center to source coordinates
            let pos = (dst as f64 + 0.5) * ratio - 0.5;
            let base = pos.floor();
            let frac = pos - base;
            let base = base as isize;

            let mut idx = [0usize; 4];
            let mut w = [0.0f64; 4];
            for k in 0..4 {
                let offset = k as isize - 1;
                idx[k] = (base + offset).clamp(0, last) as usize;
                w[k] = cubic_weight(frac - offset as f64);
            }
            (idx, w)
        })
        .collect()
}

/// Output dimension for `len * scale`, never below one pixel.
pub fn scaled_len(len: usize, scale: f32) -> usize {
    ((len as f64 * scale as f64).floor() as usize).max(1)
}

/// Resize an interleaved `channels`-per-pixel 8-bit buffer by `scale`.
///
/// Output is `scaled_len(width) x scaled_len(height)`. Edges are clamped. A scale of 1 returns
/// the input unchanged.
pub fn resize_bicubic(src: &[u8], channels: usize, width: usize, height: usize, scale: f32) -> Vec<u8> {
    debug_assert_eq!(src.len(), width * height * channels);

    let dst_w = scaled_len(width, scale);
    let dst_h = scaled_len(height, scale);
    if dst_w == width && dst_h == height {
        return src.to_vec();
    }

    let x_taps = axis_taps(width, dst_w);
    let y_taps = axis_taps(height, dst_h);

    // Horizontal pass into f64 rows, then vertical pass to u8.
    let mut horizontal = vec![0.0f64; dst_w * height * channels];
    for y in 0..height {
        let row = &src[y * width * channels..(y + 1) * width * channels];
        for (dx, (idx, w)) in x_taps.iter().enumerate() {
            let out = (y * dst_w + dx) * channels;
            for c in 0..channels {
                horizontal[out + c] = (0..4)
                    .map(|k| row[idx[k] * channels + c] as f64 * w[k])
                    .sum();
            }
        }
    }

    let mut dst = vec![0u8; dst_w * dst_h * channels];
    for (dy, (idx, w)) in y_taps.iter().enumerate() {
        for dx in 0..dst_w {
            let out = (dy * dst_w + dx) * channels;
            for c in 0..channels {
                let val: f64 = (0..4)
                    .map(|k| horizontal[(idx[k] * dst_w + dx) * channels + c] * w[k])
                    .sum();
                dst[out + c] = val.round().clamp(0.0, 255.0) as u8;
            }
        }
    }

    dst
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_interpolates_at_integers() {
        assert_eq!(cubic_weight(0.0), 1.0);
        assert_eq!(cubic_weight(1.0), 0.0);
        assert_eq!(cubic_weight(2.0), 0.0);
        let sum: f64 = [-1.25, -0.25, 0.75, 1.75].iter().map(|&t| cubic_weight(t)).sum();
        assert!((sum - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_scale_one_is_identity() {
        let src: Vec<u8> = (0..5 * 3).map(|v| (v * 17) as u8).collect();
        assert_eq!(resize_bicubic(&src, 1, 5, 3, 1.0), src);
    }

    #[test]
    fn test_output_dimensions() {
        let src = vec![0u8; 7 * 4 * 2];
        let out = resize_bicubic(&src, 2, 7, 4, 2.0);
        assert_eq!(out.len(), 14 * 8 * 2);
        assert_eq!(scaled_len(7, 1.5), 10);
        assert_eq!(scaled_len(1, 0.1), 1);
    }

    #[test]
    fn test_solid_color_stays_solid() {
        let src = vec![123u8; 6 * 6];
        let out = resize_bicubic(&src, 1, 6, 6, 2.0);
        assert!(out.iter().all(|&v| v == 123));
    }

    #[test]
    fn test_overshoot_is_clamped() {
        // Hard 0/255 step makes Catmull-Rom ring past both ends.
        let mut src = vec![0u8; 8];
        src[4..].fill(255);
        let out = resize_bicubic(&src, 1, 8, 1, 4.0);
        assert_eq!(out.len(), 32);
        assert_eq!(out[0], 0);
        assert_eq!(out[31], 255);
        assert!(out.windows(2).any(|w| w[0] < w[1]));
    }

    #[test]
    fn test_channels_are_independent() {
        let mut src = Vec::new();
        for _ in 0..4 * 4 {
            src.extend_from_slice(&[10, 250]);
        }
        let out = resize_bicubic(&src, 2, 4, 4, 2.0);
        for px in out.chunks_exact(2) {
            assert_eq!(px, &[10, 250]);
        }
    }
}
