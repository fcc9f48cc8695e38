use tracing::debug;
use xcap::Monitor;

use super::{CaptureError, DisplayGeometry, Frame, ScreenCapture, encode_frame};
use crate::protocol::Offset;

/// Grabs the primary display, or the first one when none is marked primary.
#[derive(Debug, Default, Clone, Copy)]
pub struct PrimaryScreenCapture;

impl ScreenCapture for PrimaryScreenCapture {
    fn capture(&mut self) -> Result<Frame, CaptureError> {
        let monitors = Monitor::all().map_err(|err| CaptureError::Unavailable(err.to_string()))?;
        let monitor = monitors
            .iter()
            .find(|monitor| monitor.is_primary())
            .or_else(|| monitors.first())
            .ok_or_else(|| CaptureError::Unavailable("no display found".into()))?;
        let display = DisplayGeometry {
            scale_factor: f64::from(monitor.scale_factor()),
            origin: Offset {
                x: monitor.x(),
                y: monitor.y(),
            },
        };
        let pixels = monitor
            .capture_image()
            .map_err(|err| CaptureError::Failed(err.to_string()))?;
        debug!(
            display = monitor.name(),
            width = pixels.width(),
            height = pixels.height(),
            "display captured"
        );
        encode_frame(pixels, display)
    }
}
