use tracing::warn;

use crate::protocol::{CaptureMetadata, CoordinateSpace, Target};

/// Extent of the model coordinate space on both axes.
pub const MODEL_EXTENT: f64 = 1000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogicalPoint {
    pub x: i32,
    pub y: i32,
}

/// Converts command coordinates into OS pointer coordinates using the most
/// recent capture geometry.
#[derive(Debug, Default)]
pub struct Normalizer {
    metadata: Option<CaptureMetadata>,
}

impl Normalizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, metadata: CaptureMetadata) {
        self.metadata = Some(metadata);
    }

    pub fn metadata(&self) -> Option<&CaptureMetadata> {
        self.metadata.as_ref()
    }

    pub fn to_logical(&self, target: Target) -> LogicalPoint {
        let Target { point, space } = target;
        match (space, &self.metadata) {
            (CoordinateSpace::Logical, _) => LogicalPoint {
                x: point.x.round() as i32,
                y: point.y.round() as i32,
            },
            (CoordinateSpace::Model, Some(metadata)) => LogicalPoint {
                x: model_axis(point.x, metadata.logical.width, metadata.offset.x),
                y: model_axis(point.y, metadata.logical.height, metadata.offset.y),
            },
            (CoordinateSpace::Physical, Some(metadata)) => {
                let scale = if metadata.scale_factor > 0.0 {
                    metadata.scale_factor
                } else {
                    1.0
                };
                LogicalPoint {
                    x: (point.x / scale).round() as i32,
                    y: (point.y / scale).round() as i32,
                }
            }
            (space, None) => {
                warn!(
                    space = space.as_str(),
                    x = point.x,
                    y = point.y,
                    "no capture metadata yet; passing coordinates through"
                );
                LogicalPoint {
                    x: point.x.round() as i32,
                    y: point.y.round() as i32,
                }
            }
        }
    }
}

fn model_axis(value: f64, extent: u32, offset: i32) -> i32 {
    ((value / MODEL_EXTENT) * f64::from(extent) + f64::from(offset)).round() as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Extent, Offset};

    fn metadata(offset_x: i32) -> CaptureMetadata {
        CaptureMetadata {
            original: Extent::new(2560, 1600),
            logical: Extent::new(1280, 800),
            scaled: Extent::new(1024, 640),
            scale_factor: 2.0,
            offset: Offset { x: offset_x, y: 0 },
        }
    }

    #[test]
    fn model_centre_maps_to_logical_centre() {
        let mut normalizer = Normalizer::new();
        normalizer.observe(metadata(0));
        assert_eq!(
            normalizer.to_logical(Target::model(500.0, 500.0)),
            LogicalPoint { x: 640, y: 400 }
        );
    }

    #[test]
    fn model_mapping_applies_display_offset() {
        let mut normalizer = Normalizer::new();
        normalizer.observe(metadata(100));
        assert_eq!(
            normalizer.to_logical(Target::model(500.0, 500.0)),
            LogicalPoint { x: 740, y: 400 }
        );
    }

    #[test]
    fn physical_pixels_divide_by_scale_and_ignore_offset() {
        let mut normalizer = Normalizer::new();
        normalizer.observe(metadata(100));
        let target = Target {
            point: crate::protocol::Point::new(1001.0, 600.0),
            space: CoordinateSpace::Physical,
        };
        // 500.5 rounds away from zero.
        assert_eq!(normalizer.to_logical(target), LogicalPoint { x: 501, y: 300 });
    }

    #[test]
    fn logical_points_pass_through() {
        let mut normalizer = Normalizer::new();
        normalizer.observe(metadata(100));
        assert_eq!(
            normalizer.to_logical(Target::logical(12.0, 34.0)),
            LogicalPoint { x: 12, y: 34 }
        );
    }

    #[test]
    fn missing_metadata_degrades_to_pass_through() {
        let normalizer = Normalizer::new();
        assert!(normalizer.metadata().is_none());
        assert_eq!(
            normalizer.to_logical(Target::model(500.0, 250.0)),
            LogicalPoint { x: 500, y: 250 }
        );
    }
}
