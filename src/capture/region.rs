//! Frame decoding and pixel-exact region extraction.

use image::RgbaImage;

use super::CropError;
use crate::geometry::CropRect;

/// Decode the raw grabbed frame (PNG from the capture source) into RGBA.
pub fn decode_frame(raw: &[u8]) -> Result<RgbaImage, CropError> {
    image::load_from_memory(raw)
        .map(|img| img.into_rgba8())
        .map_err(|e| CropError::Decode(e.to_string()))
}

/// Copy exactly the `rect` sub-region of `frame` into a new buffer of the
/// same size. No scaling and no smoothing: every output pixel is a source pixel.
///
/// `rect` must come from [`crate::geometry::compute_crop_rect`] for this
/// frame's dimensions, so it is always in bounds.
pub fn crop_exact(frame: &RgbaImage, rect: CropRect) -> Result<RgbaImage, CropError> {
    if rect.is_empty() {
        return Err(CropError::EmptyRegion {
            width: frame.width(),
            height: frame.height(),
        });
    }
    Ok(image::imageops::crop_imm(frame, rect.x, rect.y, rect.width, rect.height).to_image())
}
