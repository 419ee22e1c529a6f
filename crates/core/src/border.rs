//! Grow images smaller than one block so they can be tiled.

use std::borrow::Cow;

use tracing::debug;

use crate::types::SourceImage;

/// Return `image` padded to at least `min_width x min_height`.
///
/// The source is drawn at the top-left of the new raster, so new columns appear on the right
/// and new rows at the bottom. Padding is
/// zero (transparent black) and preserves bit depth and channel layout. Images that already
/// meet both minimums are returned borrowed and untouched.
///
/// The caller crops the final output back to `width * scale x height * scale`, which removes
/// exactly the padded region.
pub fn expand_to_min(image: &SourceImage, min_width: u32, min_height: u32) -> Cow<'_, SourceImage> {
    let width = image.width();
    let height = image.height();
    if width >= min_width && height >= min_height {
        return Cow::Borrowed(image);
    }

    let new_width = width.max(min_width);
    let new_height = height.max(min_height);
    debug!(
        width,
        height, new_width, new_height, "Padding image smaller than one block"
    );

    let mut canvas = image.blank_like(new_width, new_height);
    canvas.blit(image, 0, 0);
    Cow::Owned(canvas)
}
