//! Mask rasterization.
//!
//! Converts a [`Mask`] into an [`OpacityBuffer`] sized to a target frame:
//! one alpha byte per pixel, always 0 or 255. Two paths exist:
//!
//! - **Raster-payload path** (preferred): the pre-rendered canvas image is
//!   cropped to the displayed region (undoing the letterbox), resized to the
//!   frame, and classified pixel-by-pixel with the red-marker heuristic.
//! - **Vector path** (fallback): the resolved shape is filled by direct
//!   point membership tests, with optional feathering.
//!
//! Rasterization is deterministic: the same mask against the same frame
//! size always produces byte-identical buffers.

use image::{DynamicImage, GrayImage, imageops, imageops::FilterType};

use crate::error::OccludeError;
use crate::mask::{Mask, ResolvedShape};

/// Thresholds for classifying raster-payload pixels as masked.
///
/// The payload encodes drawn strokes in a reserved red marker color rather
/// than relying on the alpha channel alone, so classification requires both
/// meaningful alpha and red dominance. The default values are the empirical
/// ones the drawing tools were tuned against; they are data, not invariants,
/// and can be overridden per run.
#[derive(Debug, Clone, Copy, PartialEq)]
#[must_use]
pub struct MarkerThresholds {
    /// Minimum (exclusive) alpha for a pixel to count as drawn.
    pub alpha_min: u8,
    /// Minimum (exclusive) red channel value.
    pub red_min: u8,
    /// How strongly red must dominate green and blue.
    pub dominance: f32,
}

impl Default for MarkerThresholds {
    fn default() -> Self {
        Self {
            alpha_min: 128,
            red_min: 150,
            dominance: 1.5,
        }
    }
}

impl MarkerThresholds {
    /// Override the minimum alpha.
    pub fn with_alpha_min(mut self, alpha_min: u8) -> Self {
        self.alpha_min = alpha_min;
        self
    }

    /// Override the minimum red value.
    pub fn with_red_min(mut self, red_min: u8) -> Self {
        self.red_min = red_min;
        self
    }

    /// Override the dominance ratio.
    pub fn with_dominance(mut self, dominance: f32) -> Self {
        self.dominance = dominance;
        self
    }

    /// Apply the dual-condition heuristic to one RGBA pixel.
    pub fn is_marker(&self, r: u8, g: u8, b: u8, a: u8) -> bool {
        a > self.alpha_min
            && r > self.red_min
            && r as f32 > self.dominance * g as f32
            && r as f32 > self.dominance * b as f32
    }
}

/// A per-pixel mask of which frame pixels the masking operation affects.
///
/// Stored row-major, one byte per pixel, each byte either 0 (untouched) or
/// 255 (masked). Buffers are cached per distinct frame size within a job
/// run and shared read-only across worker threads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpacityBuffer {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl OpacityBuffer {
    /// An all-transparent buffer.
    pub fn empty(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0; width as usize * height as usize],
        }
    }

    /// Buffer width in pixels.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Buffer height in pixels.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Whether the pixel at `(x, y)` is masked.
    pub fn is_masked(&self, x: u32, y: u32) -> bool {
        self.value(x, y) != 0
    }

    /// Raw alpha value at `(x, y)`; out-of-bounds reads return 0.
    pub fn value(&self, x: u32, y: u32) -> u8 {
        if x >= self.width || y >= self.height {
            return 0;
        }
        self.data[y as usize * self.width as usize + x as usize]
    }

    /// Number of masked pixels.
    pub fn masked_count(&self) -> usize {
        self.data.iter().filter(|&&value| value != 0).count()
    }

    /// The raw buffer bytes, row-major.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    fn set(&mut self, x: u32, y: u32, value: u8) {
        let index = y as usize * self.width as usize + x as usize;
        self.data[index] = value;
    }
}

/// Rasterize a mask against a target frame size.
///
/// A present raster payload takes precedence over the vector shape; a
/// payload that fails to decode is logged and the vector path is used so a
/// single corrupt payload cannot take down the job.
///
/// # Errors
///
/// Currently only propagates allocation-level failures from the underlying
/// image operations; geometry problems are always recovered by clamping or
/// the centered default shape.
pub fn rasterize(
    mask: &Mask,
    frame_width: u32,
    frame_height: u32,
    thresholds: &MarkerThresholds,
) -> Result<OpacityBuffer, OccludeError> {
    if mask.has_raster() {
        match mask.decode_raster() {
            Ok(Some(payload)) => {
                return Ok(rasterize_payload(
                    &payload,
                    mask,
                    frame_width,
                    frame_height,
                    thresholds,
                ));
            }
            Ok(None) => {}
            Err(error) => {
                log::warn!("Raster payload unusable ({error}); falling back to vector shape");
            }
        }
    }

    Ok(rasterize_vector(mask, frame_width, frame_height))
}

/// Classify a pre-rendered canvas payload into an opacity buffer.
///
/// The payload is canvas-sized; the displayed region (placement offset +
/// natural size × scale) is cropped out first, undoing the letterbox, and
/// the intermediate is then resized to the exact frame size — the same
/// two-stage mapping the coordinate transform applies to vector shapes.
fn rasterize_payload(
    payload: &DynamicImage,
    mask: &Mask,
    frame_width: u32,
    frame_height: u32,
    thresholds: &MarkerThresholds,
) -> OpacityBuffer {
    let rgba = payload.to_rgba8();
    let (canvas_width, canvas_height) = rgba.dimensions();

    // Crop the displayed sub-rectangle when placement metadata is present.
    let cropped = match mask
        .display
        .as_ref()
        .and_then(|display| display.placement.map(|placement| (display, placement)))
    {
        Some((display, placement)) => {
            let displayed_width = (display.natural_width as f64 * placement.scale).round() as i64;
            let displayed_height = (display.natural_height as f64 * placement.scale).round() as i64;
            let x = placement.offset_x.round() as i64;
            let y = placement.offset_y.round() as i64;

            let x = x.clamp(0, canvas_width.saturating_sub(1) as i64) as u32;
            let y = y.clamp(0, canvas_height.saturating_sub(1) as i64) as u32;
            let width = (displayed_width.max(1) as u32).min(canvas_width - x).max(1);
            let height = (displayed_height.max(1) as u32).min(canvas_height - y).max(1);

            imageops::crop_imm(&rgba, x, y, width, height).to_image()
        }
        None => rgba,
    };

    let scaled = imageops::resize(&cropped, frame_width, frame_height, FilterType::Triangle);

    let mut buffer = OpacityBuffer::empty(frame_width, frame_height);
    for (x, y, pixel) in scaled.enumerate_pixels() {
        let [r, g, b, a] = pixel.0;
        if thresholds.is_marker(r, g, b, a) {
            buffer.set(x, y, 255);
        }
    }
    buffer
}

/// Fill the resolved vector shape by direct membership tests.
fn rasterize_vector(mask: &Mask, frame_width: u32, frame_height: u32) -> OpacityBuffer {
    let mut buffer = OpacityBuffer::empty(frame_width, frame_height);

    if mask.effective_opacity() == 0 {
        return buffer;
    }

    match mask.resolve_shape(frame_width, frame_height) {
        ResolvedShape::Rectangle(rect) => {
            for y in rect.y..rect.y + rect.height {
                for x in rect.x..rect.x + rect.width {
                    buffer.set(x, y, 255);
                }
            }
        }
        ResolvedShape::Circle { cx, cy, radius } => {
            let radius_squared = radius * radius;
            for y in 0..frame_height {
                for x in 0..frame_width {
                    let dx = (x as f64 + 0.5) - cx;
                    let dy = (y as f64 + 0.5) - cy;
                    if dx * dx + dy * dy <= radius_squared {
                        buffer.set(x, y, 255);
                    }
                }
            }
        }
        ResolvedShape::Polygon(points) => {
            for y in 0..frame_height {
                for x in 0..frame_width {
                    if point_in_polygon(x as f64 + 0.5, y as f64 + 0.5, &points) {
                        buffer.set(x, y, 255);
                    }
                }
            }
        }
    }

    if mask.feather > 0.0 {
        feather(&mut buffer, mask.feather);
    }

    buffer
}

/// Blur the buffer edges and re-binarize, preserving the 0/255 contract.
fn feather(buffer: &mut OpacityBuffer, radius: f32) {
    let Some(gray) = GrayImage::from_raw(buffer.width, buffer.height, buffer.data.clone()) else {
        return;
    };
    let blurred = imageops::blur(&gray, radius);
    for (index, pixel) in blurred.pixels().enumerate() {
        buffer.data[index] = if pixel.0[0] >= 128 { 255 } else { 0 };
    }
}

/// Even-odd ray-casting membership test.
fn point_in_polygon(x: f64, y: f64, points: &[(f64, f64)]) -> bool {
    let mut inside = false;
    let count = points.len();
    let mut j = count - 1;
    for i in 0..count {
        let (xi, yi) = points[i];
        let (xj, yj) = points[j];
        if ((yi > y) != (yj > y)) && (x < (xj - xi) * (y - yi) / (yj - yi) + xi) {
            inside = !inside;
        }
        j = i;
    }
    inside
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mask::{CircleSpec, MaskShape, PointSpec, RectSpec};

    fn mask_with(shape: MaskShape) -> Mask {
        Mask {
            shape,
            opacity: 100,
            feather: 0.0,
            raster: None,
            display: None,
        }
    }

    #[test]
    fn rectangle_masks_exact_region() {
        let mask = mask_with(MaskShape::Rectangle {
            rect: RectSpec::Pixels {
                x: 10.0,
                y: 10.0,
                width: 20.0,
                height: 20.0,
            },
        });
        let buffer = rasterize(&mask, 100, 100, &MarkerThresholds::default()).unwrap();

        assert_eq!(buffer.masked_count(), 400);
        assert!(buffer.is_masked(10, 10));
        assert!(buffer.is_masked(29, 29));
        assert!(!buffer.is_masked(9, 10));
        assert!(!buffer.is_masked(30, 29));
    }

    #[test]
    fn zero_opacity_masks_nothing() {
        let mut mask = mask_with(MaskShape::Rectangle {
            rect: RectSpec::Fractions([0.0, 0.0, 1.0, 1.0]),
        });
        mask.opacity = 0;
        let buffer = rasterize(&mask, 32, 32, &MarkerThresholds::default()).unwrap();
        assert_eq!(buffer.masked_count(), 0);
    }

    #[test]
    fn circle_membership_is_radial() {
        let mask = mask_with(MaskShape::Circle {
            circle: CircleSpec::Pixels {
                cx: 50.0,
                cy: 50.0,
                radius: 10.0,
            },
        });
        let buffer = rasterize(&mask, 100, 100, &MarkerThresholds::default()).unwrap();

        assert!(buffer.is_masked(50, 50));
        assert!(buffer.is_masked(50, 42));
        assert!(!buffer.is_masked(50, 38));
        assert!(!buffer.is_masked(0, 0));
    }

    #[test]
    fn polygon_triangle_contains_centroid() {
        let mask = mask_with(MaskShape::Polygon {
            points: vec![
                PointSpec::Pixels { x: 10.0, y: 10.0 },
                PointSpec::Pixels { x: 90.0, y: 10.0 },
                PointSpec::Pixels { x: 50.0, y: 90.0 },
            ],
        });
        let buffer = rasterize(&mask, 100, 100, &MarkerThresholds::default()).unwrap();

        assert!(buffer.is_masked(50, 30));
        assert!(!buffer.is_masked(5, 50));
        assert!(!buffer.is_masked(95, 50));
    }

    #[test]
    fn marker_heuristic_requires_alpha_and_red_dominance() {
        let thresholds = MarkerThresholds::default();

        assert!(thresholds.is_marker(255, 0, 0, 255));
        assert!(thresholds.is_marker(200, 100, 50, 200));
        // Alpha too low.
        assert!(!thresholds.is_marker(255, 0, 0, 100));
        // Not red enough.
        assert!(!thresholds.is_marker(140, 0, 0, 255));
        // Red present but not dominant (e.g. white or yellow strokes).
        assert!(!thresholds.is_marker(255, 255, 255, 255));
        assert!(!thresholds.is_marker(255, 200, 0, 255));
    }

    #[test]
    fn rasterization_is_deterministic() {
        let mask = mask_with(MaskShape::Circle {
            circle: CircleSpec::Fractions([0.5, 0.5, 0.25]),
        });
        let first = rasterize(&mask, 64, 48, &MarkerThresholds::default()).unwrap();
        let second = rasterize(&mask, 64, 48, &MarkerThresholds::default()).unwrap();
        assert_eq!(first.as_bytes(), second.as_bytes());
    }

    #[test]
    fn feather_keeps_binary_values() {
        let mut mask = mask_with(MaskShape::Rectangle {
            rect: RectSpec::Pixels {
                x: 20.0,
                y: 20.0,
                width: 24.0,
                height: 24.0,
            },
        });
        mask.feather = 2.0;
        let buffer = rasterize(&mask, 64, 64, &MarkerThresholds::default()).unwrap();
        assert!(
            buffer
                .as_bytes()
                .iter()
                .all(|&value| value == 0 || value == 255)
        );
        // The interior survives the blur.
        assert!(buffer.is_masked(32, 32));
    }
}
