//! Coordinate transformer: logical selection rectangles to device-pixel crops.
//!
//! The overlay works in CSS (logical) pixels relative to the viewport.
//! The captured frame is a device-pixel raster whose size can differ from
//! `viewport × devicePixelRatio` under fractional zoom, so the crop is always
//! clamped against the decoded bitmap's real dimensions.
//!
//! Pure functions only. No I/O.

use serde::{Deserialize, Serialize};

/// Smallest selection (per axis, logical pixels) treated as intentional.
/// Anything smaller is an accidental click, not a capture request.
pub const MIN_SELECTION_SIZE: f64 = 10.0;

/// A point in logical viewport coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LogicalPoint {
    pub x: f64,
    pub y: f64,
}

impl LogicalPoint {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// An axis-aligned rectangle in logical pixels. Width and height are never negative.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LogicalRect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl LogicalRect {
    /// Rectangle spanning `[min(a, b), max(a, b)]` on both axes, whatever
    /// direction the drag went.
    pub fn from_corners(a: LogicalPoint, b: LogicalPoint) -> Self {
        Self {
            x: a.x.min(b.x),
            y: a.y.min(b.y),
            width: (b.x - a.x).abs(),
            height: (b.y - a.y).abs(),
        }
    }

    /// True when either side is below [`MIN_SELECTION_SIZE`].
    pub fn is_below_threshold(&self) -> bool {
        self.width < MIN_SELECTION_SIZE || self.height < MIN_SELECTION_SIZE
    }
}

/// The region the user selected, in logical pixels, plus the device pixel
/// ratio observed by the page when the gesture ended.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionRect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub device_pixel_ratio: f64,
}

impl SelectionRect {
    pub fn new(x: f64, y: f64, width: f64, height: f64, device_pixel_ratio: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
            device_pixel_ratio,
        }
    }

    pub fn from_logical(rect: LogicalRect, device_pixel_ratio: f64) -> Self {
        Self::new(rect.x, rect.y, rect.width, rect.height, device_pixel_ratio)
    }

    /// Ratio used for scaling. Non-finite or non-positive ratios fall back to 1.
    fn effective_ratio(&self) -> f64 {
        if self.device_pixel_ratio.is_finite() && self.device_pixel_ratio > 0.0 {
            self.device_pixel_ratio
        } else {
            1.0
        }
    }
}

/// A crop rectangle in device pixels, fully inside the source image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl CropRect {
    /// A zero-area crop means "nothing to crop".
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Map a logical selection onto a source raster of `source_width × source_height`.
///
/// Each of x, y, width and height is scaled and rounded on its own so
/// opposite edges never drift apart by more than one device pixel. The origin
/// is clamped into `[0, dim - 1]`, then the extent is clamped so that
/// `origin + extent <= dim`. Never fails; degenerate input yields an empty crop.
pub fn compute_crop_rect(
    selection: &SelectionRect,
    source_width: u32,
    source_height: u32,
) -> CropRect {
    let ratio = selection.effective_ratio();
    let (x, width) = clamp_axis(
        scale(selection.x, ratio),
        scale(selection.width, ratio),
        source_width,
    );
    let (y, height) = clamp_axis(
        scale(selection.y, ratio),
        scale(selection.height, ratio),
        source_height,
    );
    CropRect {
        x,
        y,
        width,
        height,
    }
}

/// Scale and round to the nearest device pixel. NaN maps to 0 and
/// infinities saturate (float-to-int `as` casts saturate).
fn scale(value: f64, ratio: f64) -> i64 {
    (value * ratio).round() as i64
}

fn clamp_axis(origin: i64, extent: i64, dim: u32) -> (u32, u32) {
    if dim == 0 {
        return (0, 0);
    }
    let dim = i64::from(dim);
    let origin = origin.clamp(0, dim - 1);
    let extent = extent.clamp(0, dim - origin);
    // Both values are within [0, dim] here, so they fit in u32.
    (origin as u32, extent as u32)
}
