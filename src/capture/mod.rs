//! Screen capture domain: public API.
//!
//! Grab one fresh visible-tab frame, map the selection onto it, copy the
//! region out pixel-for-pixel and encode it under the transport budget.
//! External code should only use the items exported here.

mod encode;
mod region;

pub use encode::{
    encode_within_budget, EncodePolicy, EncodedImage, ImageFormat, LOSSY_QUALITY,
    MAX_TRANSPORT_BYTES,
};
pub use region::{crop_exact, decode_frame};

use std::sync::Arc;
use std::time::Duration;

use crate::browser::TabId;
use crate::error::WorkflowError;
use crate::geometry::{compute_crop_rect, SelectionRect};

/// The privileged "grab visible frame" primitive.
///
/// Returns a lossless full-frame raster (PNG bytes) of what the tab shows
/// right now. Called once per capture request; results are never cached.
pub trait CaptureSource: Send + Sync {
    fn grab_visible_frame(&self, tab_id: TabId) -> Result<Vec<u8>, CaptureError>;
}

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("no tab with id {0}")]
    NoTab(TabId),
    #[error("cannot capture browser-internal page {url}")]
    Restricted { url: String },
    #[error("{0}")]
    Grab(String),
}

#[derive(Debug, thiserror::Error)]
pub enum CropError {
    #[error("could not decode captured frame: {0}")]
    Decode(String),
    #[error("selection maps to an empty region of the {width}x{height} frame")]
    EmptyRegion { width: u32, height: u32 },
    #[error("{0}")]
    Encode(String),
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Crop(#[from] CropError),
    #[error("encoded image is {encoded_bytes} bytes, over the {limit} byte limit")]
    SizeBudget { encoded_bytes: usize, limit: usize },
    #[error("capture task aborted: {0}")]
    Aborted(String),
}

impl From<PipelineError> for WorkflowError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Capture(CaptureError::NoTab(tab_id)) => WorkflowError::NoTab {
                tab_id: Some(tab_id),
            },
            PipelineError::Capture(e) => WorkflowError::Capture {
                reason: e.to_string(),
            },
            PipelineError::Crop(e) => WorkflowError::Crop {
                reason: e.to_string(),
            },
            PipelineError::SizeBudget {
                encoded_bytes,
                limit,
            } => WorkflowError::SizeBudget {
                encoded_bytes,
                limit,
            },
            PipelineError::Aborted(reason) => WorkflowError::Capture { reason },
        }
    }
}

/// Pipeline settings.
#[derive(Debug, Clone, Copy)]
pub struct CaptureConfig {
    /// Wait before grabbing so the just-closed overlay is gone from the frame.
    pub settle_delay: Duration,
    pub encode: EncodePolicy,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(100),
            encode: EncodePolicy::default(),
        }
    }
}

/// Capture the visible tab and return the selected region, encoded.
///
/// The decode/crop/encode work is CPU-bound and runs on the blocking pool;
/// callers just await it. No retries: any failure is returned as-is.
pub async fn capture_and_crop(
    source: Arc<dyn CaptureSource>,
    tab_id: TabId,
    selection: SelectionRect,
    config: CaptureConfig,
) -> Result<EncodedImage, PipelineError> {
    if !config.settle_delay.is_zero() {
        tokio::time::sleep(config.settle_delay).await;
    }
    tokio::task::spawn_blocking(move || {
        crop_visible_frame(source.as_ref(), tab_id, &selection, &config.encode)
    })
    .await
    .map_err(|e| PipelineError::Aborted(e.to_string()))?
}

fn crop_visible_frame(
    source: &dyn CaptureSource,
    tab_id: TabId,
    selection: &SelectionRect,
    policy: &EncodePolicy,
) -> Result<EncodedImage, PipelineError> {
    let start = std::time::Instant::now();

    let raw = source.grab_visible_frame(tab_id)?;
    let grab_ms = start.elapsed().as_millis();

    let frame = decode_frame(&raw)?;
    drop(raw);
    let decode_ms = start.elapsed().as_millis() - grab_ms;

    // Crop against the real bitmap size, not the viewport size.
    let rect = compute_crop_rect(selection, frame.width(), frame.height());
    log::info!(
        "[CROP] Selection {{x: {}, y: {}, w: {}, h: {}}} @ {}x on {}x{} frame -> crop {{x: {}, y: {}, w: {}, h: {}}}",
        selection.x,
        selection.y,
        selection.width,
        selection.height,
        selection.device_pixel_ratio,
        frame.width(),
        frame.height(),
        rect.x,
        rect.y,
        rect.width,
        rect.height
    );

    let region = crop_exact(&frame, rect)?;
    drop(frame);
    let crop_ms = start.elapsed().as_millis() - grab_ms - decode_ms;

    let image = encode_within_budget(&region, policy)?;
    log::info!(
        "[CAPTURE] Total {}ms (grab={} + decode={} + crop={}) -> {} {} bytes",
        start.elapsed().as_millis(),
        grab_ms,
        decode_ms,
        crop_ms,
        image.format.mime_type(),
        image.byte_size
    );
    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedFrame {
        png: Vec<u8>,
        grabs: AtomicUsize,
    }

    impl CaptureSource for FixedFrame {
        fn grab_visible_frame(&self, _tab_id: TabId) -> Result<Vec<u8>, CaptureError> {
            self.grabs.fetch_add(1, Ordering::SeqCst);
            Ok(self.png.clone())
        }
    }

    struct Broken;

    impl CaptureSource for Broken {
        fn grab_visible_frame(&self, _tab_id: TabId) -> Result<Vec<u8>, CaptureError> {
            Err(CaptureError::Grab("permission denied".to_string()))
        }
    }

    fn frame_png(w: u32, h: u32) -> Vec<u8> {
        let img = RgbaImage::from_fn(w, h, |x, y| Rgba([(x % 256) as u8, (y % 256) as u8, 7, 255]));
        let mut bytes = Vec::new();
        image::DynamicImage::ImageRgba8(img)
            .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        bytes
    }

    fn no_delay() -> CaptureConfig {
        CaptureConfig {
            settle_delay: Duration::ZERO,
            ..CaptureConfig::default()
        }
    }

    #[tokio::test]
    async fn crops_the_device_pixel_region() {
        let source = Arc::new(FixedFrame {
            png: frame_png(2000, 1500),
            grabs: AtomicUsize::new(0),
        });
        let selection = SelectionRect::new(100.0, 50.0, 300.0, 200.0, 2.0);
        let image = capture_and_crop(source.clone(), 1, selection, no_delay())
            .await
            .unwrap();

        assert_eq!(image.format, ImageFormat::Png);
        assert_eq!((image.width, image.height), (600, 400));

        let decoded = image::load_from_memory(&image.bytes().unwrap())
            .unwrap()
            .into_rgba8();
        // Top-left of the crop is source pixel (200, 100).
        assert_eq!(decoded.get_pixel(0, 0), &Rgba([200, 100, 7, 255]));
        assert_eq!(decoded.get_pixel(599, 399), &Rgba([(799 % 256) as u8, (499 % 256) as u8, 7, 255]));
    }

    #[tokio::test]
    async fn every_request_grabs_a_fresh_frame() {
        let source = Arc::new(FixedFrame {
            png: frame_png(64, 64),
            grabs: AtomicUsize::new(0),
        });
        let selection = SelectionRect::new(0.0, 0.0, 20.0, 20.0, 1.0);
        for _ in 0..3 {
            capture_and_crop(source.clone(), 1, selection, no_delay())
                .await
                .unwrap();
        }
        assert_eq!(source.grabs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn grab_failure_is_a_capture_error() {
        let selection = SelectionRect::new(0.0, 0.0, 20.0, 20.0, 1.0);
        let err = capture_and_crop(Arc::new(Broken), 1, selection, no_delay())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Capture(CaptureError::Grab(_))));
        assert!(matches!(
            WorkflowError::from(err),
            WorkflowError::Capture { .. }
        ));
    }

    #[tokio::test]
    async fn undecodable_frame_is_a_crop_error() {
        let source = Arc::new(FixedFrame {
            png: b"not an image".to_vec(),
            grabs: AtomicUsize::new(0),
        });
        let selection = SelectionRect::new(0.0, 0.0, 20.0, 20.0, 1.0);
        let err = capture_and_crop(source, 1, selection, no_delay())
            .await
            .unwrap_err();
        assert!(matches!(
            WorkflowError::from(err),
            WorkflowError::Crop { .. }
        ));
    }

    #[tokio::test]
    async fn grab_waits_for_the_settle_delay() {
        let source = Arc::new(FixedFrame {
            png: frame_png(32, 32),
            grabs: AtomicUsize::new(0),
        });
        let selection = SelectionRect::new(0.0, 0.0, 20.0, 20.0, 1.0);
        let config = CaptureConfig {
            settle_delay: Duration::from_millis(200),
            ..CaptureConfig::default()
        };
        let started = std::time::Instant::now();
        let task = tokio::spawn(capture_and_crop(source.clone(), 1, selection, config));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(source.grabs.load(Ordering::SeqCst), 0);

        task.await.unwrap().unwrap();
        assert_eq!(source.grabs.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() >= Duration::from_millis(200));
    }
}
