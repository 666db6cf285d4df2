//! Size-budgeted encoding of a cropped region.
//!
//! Lossless PNG is always tried first. Only when its data URL would exceed the
//! transport ceiling is the same pixel data re-encoded as JPEG at a fixed
//! quality. If that is still too big the request fails; nothing is
//! downscaled or truncated further.

use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::{DynamicImage, ExtendedColorType, ImageEncoder, RgbaImage};
use serde::{Deserialize, Serialize};

use super::{CropError, PipelineError};

/// Hard ceiling on the transport-encoded (data URL) size: 4 MiB.
pub const MAX_TRANSPORT_BYTES: usize = 4 * 1024 * 1024;

/// JPEG quality used for the size fallback (0.85).
pub const LOSSY_QUALITY: u8 = 85;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Png,
    Jpeg,
}

impl ImageFormat {
    pub fn mime_type(&self) -> &'static str {
        match self {
            ImageFormat::Png => "image/png",
            ImageFormat::Jpeg => "image/jpeg",
        }
    }
}

/// A self-describing, transport-ready image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodedImage {
    pub format: ImageFormat,
    /// Size of the encoded image bytes, before base64.
    pub byte_size: usize,
    pub width: u32,
    pub height: u32,
    /// `data:<mime>;base64,<payload>`
    pub data_url: String,
}

impl EncodedImage {
    pub fn from_bytes(format: ImageFormat, width: u32, height: u32, bytes: &[u8]) -> Self {
        let payload = base64::engine::general_purpose::STANDARD.encode(bytes);
        Self {
            format,
            byte_size: bytes.len(),
            width,
            height,
            data_url: format!("data:{};base64,{}", format.mime_type(), payload),
        }
    }

    /// Size after transport encoding. This is what the ceiling applies to.
    pub fn transport_len(&self) -> usize {
        self.data_url.len()
    }

    /// Decode the data URL back into the encoded image bytes.
    pub fn bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
        let payload = self
            .data_url
            .split_once(',')
            .map(|(_, p)| p)
            .unwrap_or_default();
        base64::engine::general_purpose::STANDARD.decode(payload)
    }

    /// Rebuild from a stored data URL. Dimensions are read from the image
    /// header; pixels are not decoded.
    pub fn from_data_url(data_url: &str) -> Result<Self, CropError> {
        let format = match data_url.split_once(";base64,") {
            Some(("data:image/png", _)) => ImageFormat::Png,
            Some(("data:image/jpeg", _)) => ImageFormat::Jpeg,
            _ => return Err(CropError::Decode("not a PNG or JPEG data URL".to_string())),
        };
        let image = Self {
            format,
            byte_size: 0,
            width: 0,
            height: 0,
            data_url: data_url.to_string(),
        };
        let bytes = image.bytes().map_err(|e| CropError::Decode(e.to_string()))?;
        let (width, height) = image::ImageReader::new(std::io::Cursor::new(&bytes))
            .with_guessed_format()
            .map_err(|e| CropError::Decode(e.to_string()))?
            .into_dimensions()
            .map_err(|e| CropError::Decode(e.to_string()))?;
        Ok(Self {
            byte_size: bytes.len(),
            width,
            height,
            ..image
        })
    }
}

/// Encoding policy: transport ceiling and lossy fallback quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodePolicy {
    pub max_transport_bytes: usize,
    pub lossy_quality: u8,
}

impl Default for EncodePolicy {
    fn default() -> Self {
        Self {
            max_transport_bytes: MAX_TRANSPORT_BYTES,
            lossy_quality: LOSSY_QUALITY,
        }
    }
}

/// Encode `region` as PNG, falling back to JPEG when the PNG data URL is over budget.
pub fn encode_within_budget(
    region: &RgbaImage,
    policy: &EncodePolicy,
) -> Result<EncodedImage, PipelineError> {
    let (width, height) = region.dimensions();
    let start = std::time::Instant::now();

    let png = encode_png(region)?;
    let lossless = EncodedImage::from_bytes(ImageFormat::Png, width, height, &png);
    log::info!(
        "[ENCODE] PNG: {}ms ({} bytes, {} transport)",
        start.elapsed().as_millis(),
        lossless.byte_size,
        lossless.transport_len()
    );
    if lossless.transport_len() <= policy.max_transport_bytes {
        return Ok(lossless);
    }

    log::warn!(
        "[ENCODE] PNG over budget ({} > {}), re-encoding as JPEG q{}",
        lossless.transport_len(),
        policy.max_transport_bytes,
        policy.lossy_quality
    );
    let jpeg = encode_jpeg(region, policy.lossy_quality)?;
    let lossy = EncodedImage::from_bytes(ImageFormat::Jpeg, width, height, &jpeg);
    log::info!(
        "[ENCODE] JPEG: {}ms ({} bytes, {} transport)",
        start.elapsed().as_millis(),
        lossy.byte_size,
        lossy.transport_len()
    );
    if lossy.transport_len() > policy.max_transport_bytes {
        return Err(PipelineError::SizeBudget {
            encoded_bytes: lossy.transport_len(),
            limit: policy.max_transport_bytes,
        });
    }
    Ok(lossy)
}

fn encode_png(region: &RgbaImage) -> Result<Vec<u8>, CropError> {
    let mut bytes = Vec::new();
    PngEncoder::new(&mut bytes)
        .write_image(
            region.as_raw(),
            region.width(),
            region.height(),
            ExtendedColorType::Rgba8,
        )
        .map_err(|e| CropError::Encode(format!("PNG encode failed: {}", e)))?;
    Ok(bytes)
}

fn encode_jpeg(region: &RgbaImage, quality: u8) -> Result<Vec<u8>, CropError> {
    // JPEG carries no alpha channel; captured frames are opaque anyway.
    let rgb = DynamicImage::ImageRgba8(region.clone()).into_rgb8();
    let mut bytes = Vec::new();
    JpegEncoder::new_with_quality(&mut bytes, quality)
        .write_image(rgb.as_raw(), rgb.width(), rgb.height(), ExtendedColorType::Rgb8)
        .map_err(|e| CropError::Encode(format!("JPEG encode failed: {}", e)))?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    /// Smooth gradient with low-amplitude noise: PNG cannot compress the
    /// noise, JPEG quantizes it away.
    fn noisy_gradient(w: u32, h: u32) -> RgbaImage {
        let mut seed: u32 = 0x1234_5678;
        let mut noise = move || {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            (seed % 4) as u8
        };
        RgbaImage::from_fn(w, h, |x, y| {
            let r = (x * 200 / w.max(1)) as u8;
            let g = (y * 200 / h.max(1)) as u8;
            Rgba([
                r.saturating_add(noise()),
                g.saturating_add(noise()),
                120u8.saturating_add(noise()),
                255,
            ])
        })
    }

    #[test]
    fn small_region_stays_lossless_and_unchanged() {
        let region = RgbaImage::from_pixel(64, 48, Rgba([10, 20, 30, 255]));
        let out = encode_within_budget(&region, &EncodePolicy::default()).unwrap();
        assert_eq!(out.format, ImageFormat::Png);
        assert!(out.data_url.starts_with("data:image/png;base64,"));

        let decoded = image::load_from_memory(&out.bytes().unwrap())
            .unwrap()
            .into_rgba8();
        assert_eq!(decoded, region);
        assert_eq!(out.byte_size, out.bytes().unwrap().len());
    }

    #[test]
    fn oversized_png_falls_back_to_jpeg_within_budget() {
        let region = noisy_gradient(256, 256);
        let policy = EncodePolicy {
            max_transport_bytes: 48 * 1024,
            lossy_quality: LOSSY_QUALITY,
        };
        let png_len = EncodedImage::from_bytes(
            ImageFormat::Png,
            256,
            256,
            &encode_png(&region).unwrap(),
        )
        .transport_len();
        assert!(png_len > policy.max_transport_bytes, "fixture must overflow as PNG");

        let out = encode_within_budget(&region, &policy).unwrap();
        assert_eq!(out.format, ImageFormat::Jpeg);
        assert!(out.data_url.starts_with("data:image/jpeg;base64,"));
        assert!(out.transport_len() <= policy.max_transport_bytes);
        assert_eq!((out.width, out.height), (256, 256));
    }

    #[test]
    fn fails_when_even_jpeg_is_too_big() {
        let region = noisy_gradient(64, 64);
        let policy = EncodePolicy {
            max_transport_bytes: 200,
            lossy_quality: LOSSY_QUALITY,
        };
        match encode_within_budget(&region, &policy) {
            Err(PipelineError::SizeBudget { encoded_bytes, limit }) => {
                assert_eq!(limit, 200);
                assert!(encoded_bytes > 200);
            }
            other => panic!("expected SizeBudget, got {:?}", other),
        }
    }

    #[test]
    fn rebuilds_from_a_stored_data_url() {
        let region = RgbaImage::from_pixel(30, 12, Rgba([1, 2, 3, 255]));
        let out = encode_within_budget(&region, &EncodePolicy::default()).unwrap();
        assert_eq!(EncodedImage::from_data_url(&out.data_url).unwrap(), out);
        assert!(EncodedImage::from_data_url("data:text/plain;base64,aGk=").is_err());
        assert!(EncodedImage::from_data_url("data:image/png;base64,!!!").is_err());
    }

    #[test]
    fn transport_len_counts_the_whole_data_url() {
        let img = EncodedImage::from_bytes(ImageFormat::Png, 1, 1, &[0u8; 3]);
        assert_eq!(img.transport_len(), "data:image/png;base64,".len() + 4);
    }
}
