//! Mask descriptions and their resolution to frame-pixel space.
//!
//! A [`Mask`] is authored in canvas-display space by an operator drawing on
//! a reference frame. Shapes arrive in one of two JSON encodings: a legacy
//! array-of-numbers form carrying normalized fractions, or a keyed object
//! form carrying absolute canvas pixels. Both are accepted at ingestion and
//! resolved **once** into a single canonical pixel-space representation
//! ([`ResolvedShape`]) so no consumption site needs to branch on encoding.
//!
//! Masks may additionally carry a pre-rendered raster payload (a
//! base64-encoded image the size of the display canvas, with drawn strokes
//! in a reserved red marker color). When present, the payload is
//! authoritative over the vector shape parameters.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use image::DynamicImage;
use serde::{Deserialize, Serialize};

use crate::error::OccludeError;
use crate::transform::TransformMatrix;

/// Default mask opacity when the field is omitted (fully opaque).
const DEFAULT_OPACITY: u8 = 100;

/// How the natural image was laid out inside the display canvas.
///
/// Typically a "contain" fit: the image is scaled by `scale` and positioned
/// at `(offset_x, offset_y)`, leaving letterbox bars on two sides.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DisplayPlacement {
    /// Uniform scale applied to the natural image.
    pub scale: f64,
    /// Horizontal position of the displayed image inside the canvas.
    #[serde(rename = "offsetX", alias = "offset_x")]
    pub offset_x: f64,
    /// Vertical position of the displayed image inside the canvas.
    #[serde(rename = "offsetY", alias = "offset_y")]
    pub offset_y: f64,
}

/// Display-space metadata captured when the mask was authored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayMetadata {
    /// Canvas width in pixels.
    #[serde(rename = "canvasWidth", alias = "canvas_width")]
    pub canvas_width: u32,
    /// Canvas height in pixels.
    #[serde(rename = "canvasHeight", alias = "canvas_height")]
    pub canvas_height: u32,
    /// Natural width of the reference image as decoded.
    #[serde(rename = "naturalWidth", alias = "natural_width")]
    pub natural_width: u32,
    /// Natural height of the reference image as decoded.
    #[serde(rename = "naturalHeight", alias = "natural_height")]
    pub natural_height: u32,
    /// How the natural image was placed inside the canvas.
    #[serde(default)]
    pub placement: Option<DisplayPlacement>,
}

/// Rectangle parameters in one of the two accepted encodings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RectSpec {
    /// Absolute canvas pixels (preferred).
    Pixels {
        /// Left edge.
        x: f64,
        /// Top edge.
        y: f64,
        /// Width.
        width: f64,
        /// Height.
        height: f64,
    },
    /// Legacy normalized fractions `[x, y, width, height]`, each in `0..=1`.
    Fractions([f64; 4]),
}

/// Circle parameters in one of the two accepted encodings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CircleSpec {
    /// Absolute canvas pixels (preferred).
    Pixels {
        /// Center x.
        cx: f64,
        /// Center y.
        cy: f64,
        /// Radius.
        radius: f64,
    },
    /// Legacy normalized fractions `[cx, cy, radius]`; the radius fraction
    /// is relative to the smaller frame dimension.
    Fractions([f64; 3]),
}

/// A polygon vertex in one of the two accepted encodings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PointSpec {
    /// Absolute canvas pixels (preferred).
    Pixels {
        /// Horizontal coordinate.
        x: f64,
        /// Vertical coordinate.
        y: f64,
    },
    /// Legacy normalized fraction pair `[x, y]`.
    Fractions([f64; 2]),
}

/// The mask's vector geometry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MaskShape {
    /// An axis-aligned rectangle.
    Rectangle {
        /// Rectangle parameters.
        rect: RectSpec,
    },
    /// A circle.
    Circle {
        /// Circle parameters.
        circle: CircleSpec,
    },
    /// A closed polygon.
    Polygon {
        /// Vertices in drawing order.
        points: Vec<PointSpec>,
    },
    /// A freeform stroke outline, treated as a closed polygon.
    Freeform {
        /// Vertices in drawing order.
        points: Vec<PointSpec>,
    },
}

/// One spatial mask, as authored on the reference frame.
///
/// Invariant: when [`raster`](Mask::raster) is present it is authoritative
/// over [`shape`](Mask::shape) for pixel classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mask {
    /// Vector geometry (fallback when no raster payload is present).
    pub shape: MaskShape,
    /// Opacity 0–100. Values above 100 are clamped at ingestion.
    #[serde(default = "default_opacity")]
    pub opacity: u8,
    /// Feather radius in pixels; `0` disables feathering.
    #[serde(default)]
    pub feather: f32,
    /// Base64-encoded raster payload, identical in size to the display
    /// canvas, with drawn regions in the reserved red marker color.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raster: Option<String>,
    /// Display-space metadata captured at authoring time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<DisplayMetadata>,
}

fn default_opacity() -> u8 {
    DEFAULT_OPACITY
}

/// A rectangle clamped into frame bounds.
///
/// Invariants: `x`, `y` within the frame, `x + width <= frame_width`,
/// `y + height <= frame_height`, `width >= 1`, `height >= 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRect {
    /// Left edge.
    pub x: u32,
    /// Top edge.
    pub y: u32,
    /// Width, at least 1.
    pub width: u32,
    /// Height, at least 1.
    pub height: u32,
}

impl PixelRect {
    /// Clamp floating-point rectangle coordinates into a frame.
    ///
    /// `x`/`y` are floored to `>= 0`, width/height are reduced to fit inside
    /// the frame, and both dimensions keep a 1px minimum so a degenerate
    /// input never produces an empty region.
    pub fn clamped(x: f64, y: f64, width: f64, height: f64, frame_width: u32, frame_height: u32) -> Self {
        let frame_width = frame_width.max(1);
        let frame_height = frame_height.max(1);

        let x = (x.max(0.0).round() as u32).min(frame_width - 1);
        let y = (y.max(0.0).round() as u32).min(frame_height - 1);
        let width = (width.max(1.0).round() as u32).min(frame_width - x).max(1);
        let height = (height.max(1.0).round() as u32).min(frame_height - y).max(1);

        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Whether a pixel lies inside the rectangle.
    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.x && x < self.x + self.width && y >= self.y && y < self.y + self.height
    }
}

/// Canonical frame-pixel-space mask geometry.
///
/// Produced once per (mask, frame size) pair by [`Mask::resolve_shape`]; all
/// downstream rasterization consumes this form.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedShape {
    /// A clamped rectangle.
    Rectangle(PixelRect),
    /// A circle in frame pixels.
    Circle {
        /// Center x.
        cx: f64,
        /// Center y.
        cy: f64,
        /// Radius, always positive.
        radius: f64,
    },
    /// A closed polygon with at least three vertices.
    Polygon(Vec<(f64, f64)>),
}

impl Mask {
    /// Whether this mask carries a raster payload.
    pub fn has_raster(&self) -> bool {
        self.raster.as_ref().is_some_and(|data| !data.is_empty())
    }

    /// Opacity clamped into `0..=100`.
    pub fn effective_opacity(&self) -> u8 {
        self.opacity.min(100)
    }

    /// Decode the raster payload into an image.
    ///
    /// # Errors
    ///
    /// Returns [`OccludeError::MaskPayload`] when the payload is not valid
    /// base64 or does not decode as an image.
    pub fn decode_raster(&self) -> Result<Option<DynamicImage>, OccludeError> {
        let Some(data) = self.raster.as_ref().filter(|data| !data.is_empty()) else {
            return Ok(None);
        };

        // Payloads sometimes arrive as data URLs; strip the scheme prefix.
        let encoded = data
            .split_once("base64,")
            .map_or(data.as_str(), |(_, rest)| rest);

        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|error| OccludeError::MaskPayload(format!("base64 decode failed: {error}")))?;
        let image = image::load_from_memory(&bytes)
            .map_err(|error| OccludeError::MaskPayload(format!("image decode failed: {error}")))?;
        Ok(Some(image))
    }

    /// Resolve the vector shape into canonical frame-pixel space.
    ///
    /// Absolute canvas coordinates are mapped through the display→frame
    /// transform; normalized fractions multiply the frame dimensions
    /// directly. Invalid or out-of-range fractions, and polygons with fewer
    /// than three vertices, fall back to a centered rectangle covering 50%
    /// of the frame so the pipeline stays non-fatal.
    pub fn resolve_shape(&self, frame_width: u32, frame_height: u32) -> ResolvedShape {
        let matrix = TransformMatrix::for_frame(self.display.as_ref(), frame_width, frame_height);
        let fw = frame_width as f64;
        let fh = frame_height as f64;

        match &self.shape {
            MaskShape::Rectangle { rect } => match rect {
                RectSpec::Pixels {
                    x,
                    y,
                    width,
                    height,
                } => {
                    let (fx, fy) = matrix.map(*x, *y);
                    let fw_px = matrix.map_width(*width);
                    let fh_px = matrix.map_height(*height);
                    ResolvedShape::Rectangle(PixelRect::clamped(
                        fx,
                        fy,
                        fw_px,
                        fh_px,
                        frame_width,
                        frame_height,
                    ))
                }
                RectSpec::Fractions(values) => {
                    let [x, y, width, height] = *values;
                    if !fractions_valid(values) || width <= 0.0 || height <= 0.0 {
                        log::warn!(
                            "Rectangle fractions {values:?} out of range; using centered default"
                        );
                        return default_shape(frame_width, frame_height);
                    }
                    ResolvedShape::Rectangle(PixelRect::clamped(
                        x * fw,
                        y * fh,
                        width * fw,
                        height * fh,
                        frame_width,
                        frame_height,
                    ))
                }
            },
            MaskShape::Circle { circle } => match circle {
                CircleSpec::Pixels { cx, cy, radius } => {
                    let (fx, fy) = matrix.map(*cx, *cy);
                    // Radii scale by the average of the two axes; the axes
                    // only diverge in degraded aspect-changing mappings.
                    let scaled = radius * (matrix.scale_x + matrix.scale_y) / 2.0;
                    ResolvedShape::Circle {
                        cx: fx.clamp(0.0, fw),
                        cy: fy.clamp(0.0, fh),
                        radius: scaled.abs().max(0.5),
                    }
                }
                CircleSpec::Fractions(values) => {
                    let [cx, cy, radius] = *values;
                    if !fractions_valid(values) || radius <= 0.0 {
                        log::warn!(
                            "Circle fractions {values:?} out of range; using centered default"
                        );
                        return default_shape(frame_width, frame_height);
                    }
                    ResolvedShape::Circle {
                        cx: cx * fw,
                        cy: cy * fh,
                        radius: (radius * fw.min(fh)).max(0.5),
                    }
                }
            },
            MaskShape::Polygon { points } | MaskShape::Freeform { points } => {
                let mut resolved = Vec::with_capacity(points.len());
                for point in points {
                    match point {
                        PointSpec::Pixels { x, y } => resolved.push(matrix.map(*x, *y)),
                        PointSpec::Fractions(values) => {
                            if !fractions_valid(values) {
                                log::warn!(
                                    "Polygon fraction point {values:?} out of range; \
                                     using centered default"
                                );
                                return default_shape(frame_width, frame_height);
                            }
                            resolved.push((values[0] * fw, values[1] * fh));
                        }
                    }
                }
                if resolved.len() < 3 {
                    log::warn!(
                        "Polygon has {} point(s); using centered default",
                        resolved.len()
                    );
                    return default_shape(frame_width, frame_height);
                }
                ResolvedShape::Polygon(resolved)
            }
        }
    }
}

/// The non-fatal fallback: a centered rectangle covering 50% of the frame.
fn default_shape(frame_width: u32, frame_height: u32) -> ResolvedShape {
    ResolvedShape::Rectangle(PixelRect::clamped(
        frame_width as f64 / 4.0,
        frame_height as f64 / 4.0,
        frame_width as f64 / 2.0,
        frame_height as f64 / 2.0,
        frame_width,
        frame_height,
    ))
}

fn fractions_valid(values: &[f64]) -> bool {
    values
        .iter()
        .all(|value| value.is_finite() && (0.0..=1.0).contains(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rect_mask(rect: RectSpec) -> Mask {
        Mask {
            shape: MaskShape::Rectangle { rect },
            opacity: 100,
            feather: 0.0,
            raster: None,
            display: None,
        }
    }

    #[test]
    fn pixel_rect_clamps_to_frame() {
        let rect = PixelRect::clamped(90.0, 90.0, 20.0, 20.0, 100, 100);
        assert_eq!(
            rect,
            PixelRect {
                x: 90,
                y: 90,
                width: 10,
                height: 10
            }
        );
    }

    #[test]
    fn pixel_rect_floors_negative_origin() {
        let rect = PixelRect::clamped(-15.0, -3.0, 40.0, 40.0, 100, 100);
        assert_eq!(rect.x, 0);
        assert_eq!(rect.y, 0);
        assert_eq!(rect.width, 40);
        assert_eq!(rect.height, 40);
    }

    #[test]
    fn pixel_rect_keeps_minimum_size() {
        let rect = PixelRect::clamped(50.0, 50.0, 0.0, -4.0, 100, 100);
        assert!(rect.width >= 1);
        assert!(rect.height >= 1);
    }

    #[test]
    fn object_encoding_parses_as_pixels() {
        let json = r#"{
            "shape": {"type": "rectangle", "rect": {"x": 10, "y": 20, "width": 30, "height": 40}},
            "opacity": 80
        }"#;
        let mask: Mask = serde_json::from_str(json).unwrap();
        assert!(matches!(
            mask.shape,
            MaskShape::Rectangle {
                rect: RectSpec::Pixels { .. }
            }
        ));
        assert_eq!(mask.opacity, 80);
    }

    #[test]
    fn array_encoding_parses_as_fractions() {
        let json = r#"{
            "shape": {"type": "rectangle", "rect": [0.1, 0.1, 0.2, 0.2]}
        }"#;
        let mask: Mask = serde_json::from_str(json).unwrap();
        assert!(matches!(
            mask.shape,
            MaskShape::Rectangle {
                rect: RectSpec::Fractions(_)
            }
        ));
        assert_eq!(mask.opacity, 100);
    }

    #[test]
    fn fractions_resolve_against_frame() {
        let mask = rect_mask(RectSpec::Fractions([0.1, 0.1, 0.2, 0.2]));
        let shape = mask.resolve_shape(100, 100);
        assert_eq!(
            shape,
            ResolvedShape::Rectangle(PixelRect {
                x: 10,
                y: 10,
                width: 20,
                height: 20
            })
        );
    }

    #[test]
    fn out_of_range_fractions_fall_back_to_centered_default() {
        let mask = rect_mask(RectSpec::Fractions([1.4, -0.2, 0.5, 0.5]));
        let shape = mask.resolve_shape(200, 100);
        assert_eq!(
            shape,
            ResolvedShape::Rectangle(PixelRect {
                x: 50,
                y: 25,
                width: 100,
                height: 50
            })
        );
    }

    #[test]
    fn degenerate_polygon_falls_back() {
        let mask = Mask {
            shape: MaskShape::Polygon {
                points: vec![
                    PointSpec::Pixels { x: 1.0, y: 1.0 },
                    PointSpec::Pixels { x: 2.0, y: 2.0 },
                ],
            },
            opacity: 100,
            feather: 0.0,
            raster: None,
            display: None,
        };
        assert!(matches!(
            mask.resolve_shape(100, 100),
            ResolvedShape::Rectangle(_)
        ));
    }

    #[test]
    fn data_url_raster_prefix_is_stripped() {
        // A 1x1 transparent PNG.
        let png = {
            let img = image::RgbaImage::new(1, 1);
            let mut bytes = std::io::Cursor::new(Vec::new());
            image::DynamicImage::ImageRgba8(img)
                .write_to(&mut bytes, image::ImageFormat::Png)
                .unwrap();
            bytes.into_inner()
        };
        let encoded = BASE64.encode(&png);

        let mut mask = rect_mask(RectSpec::Fractions([0.0, 0.0, 1.0, 1.0]));
        mask.raster = Some(format!("data:image/png;base64,{encoded}"));
        let decoded = mask.decode_raster().unwrap().unwrap();
        assert_eq!((decoded.width(), decoded.height()), (1, 1));
    }

    #[test]
    fn invalid_raster_payload_is_an_error() {
        let mut mask = rect_mask(RectSpec::Fractions([0.0, 0.0, 1.0, 1.0]));
        mask.raster = Some("!!not-base64!!".to_string());
        assert!(matches!(
            mask.decode_raster(),
            Err(OccludeError::MaskPayload(_))
        ));
    }
}
