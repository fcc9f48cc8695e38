//! Screen frames for the model: capture, downscale, JPEG, and the display
//! geometry the coordinate normalizer needs to map answers back.

#[cfg(feature = "screen-capture")]
mod screen;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, RgbaImage};
use thiserror::Error;

use crate::protocol::{CaptureMetadata, Extent, Offset, ScreenshotResponse};

#[cfg(feature = "screen-capture")]
pub use screen::PrimaryScreenCapture;

/// Longest edge of the image sent to the model.
pub const MAX_EDGE: u32 = 1024;
pub const JPEG_QUALITY: u8 = 75;

/// One captured screen, already encoded for the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub jpeg: Vec<u8>,
    pub metadata: CaptureMetadata,
}

impl Frame {
    pub fn into_response(self, request_id: Option<String>) -> ScreenshotResponse {
        ScreenshotResponse {
            image: STANDARD.encode(&self.jpeg),
            request_id,
            metadata: Some(self.metadata),
        }
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("screen capture unavailable: {0}")]
    Unavailable(String),
    #[error("screen capture failed: {0}")]
    Failed(String),
}

pub trait ScreenCapture: Send {
    fn capture(&mut self) -> Result<Frame, CaptureError>;
}

/// Where a captured display sits in OS pointer space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DisplayGeometry {
    /// Physical pixels per logical pixel.
    pub scale_factor: f64,
    pub origin: Offset,
}

/// Metadata for a capture of `original` physical pixels sent as `scaled`.
/// Logical size truncates, as the OS reports whole pointer pixels.
pub fn capture_metadata(original: Extent, scaled: Extent, display: DisplayGeometry) -> CaptureMetadata {
    let scale_factor = if display.scale_factor.is_finite() && display.scale_factor > 0.0 {
        display.scale_factor
    } else {
        1.0
    };
    CaptureMetadata {
        original,
        logical: Extent::new(
            (f64::from(original.width) / scale_factor) as u32,
            (f64::from(original.height) / scale_factor) as u32,
        ),
        scaled,
        scale_factor,
        offset: display.origin,
    }
}

/// Largest size inside a `MAX_EDGE` square with the same aspect ratio.
/// Smaller captures are left alone.
pub fn fit_extent(original: Extent) -> Extent {
    let longest = original.width.max(original.height);
    if longest <= MAX_EDGE {
        return original;
    }
    let ratio = f64::from(MAX_EDGE) / f64::from(longest);
    let shrink = |edge: u32| ((f64::from(edge) * ratio).round() as u32).clamp(1, MAX_EDGE);
    Extent::new(shrink(original.width), shrink(original.height))
}

/// Downscales and JPEG-encodes raw RGBA pixels grabbed from `display`.
pub fn encode_frame(pixels: RgbaImage, display: DisplayGeometry) -> Result<Frame, CaptureError> {
    let original = Extent::new(pixels.width(), pixels.height());
    if original.width == 0 || original.height == 0 {
        return Err(CaptureError::Failed("empty capture".into()));
    }
    let target = fit_extent(original);
    let mut image = DynamicImage::ImageRgba8(pixels);
    if target != original {
        image = image.resize_exact(target.width, target.height, FilterType::Lanczos3);
    }
    // JPEG has no alpha channel.
    let rgb = image.to_rgb8();
    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, JPEG_QUALITY)
        .encode_image(&rgb)
        .map_err(|err| CaptureError::Failed(format!("jpeg encoding: {err}")))?;
    Ok(Frame {
        jpeg,
        metadata: capture_metadata(original, Extent::new(rgb.width(), rgb.height()), display),
    })
}

/// Capture source for hosts without a screen grabber.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableCapture;

impl ScreenCapture for UnavailableCapture {
    fn capture(&mut self) -> Result<Frame, CaptureError> {
        Err(CaptureError::Unavailable(
            "no screen grabber on this host".into(),
        ))
    }
}

/// Returns the same frame every time.
#[derive(Debug, Clone)]
pub struct FixedCapture {
    frame: Frame,
}

impl FixedCapture {
    pub fn new(frame: Frame) -> Self {
        Self { frame }
    }
}

impl ScreenCapture for FixedCapture {
    fn capture(&mut self) -> Result<Frame, CaptureError> {
        Ok(self.frame.clone())
    }
}
