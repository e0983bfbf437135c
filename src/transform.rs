//! Display-space to frame-space coordinate mapping.
//!
//! Masks are authored on a UI canvas that shows the reference image
//! letterboxed (a "contain" fit). Frames to be masked may have different
//! pixel dimensions than that canvas, and the desired relationship is a
//! direct pixel mapping onto each frame with no letterboxing. The
//! [`TransformMatrix`] removes the letterbox bars and rescales the remaining
//! content to the frame.

use crate::mask::DisplayMetadata;

/// A 2D affine mapping from canvas-display space to frame-pixel space.
///
/// A canvas point `(cx, cy)` maps to frame space via
/// `x' = cx * scale_x + offset_x`, `y' = cy * scale_y + offset_y`.
///
/// Matrices are derived per target frame size and cached per distinct size
/// within a run; they are never persisted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransformMatrix {
    /// Horizontal scale factor.
    pub scale_x: f64,
    /// Vertical scale factor.
    pub scale_y: f64,
    /// Horizontal translation, applied after scaling.
    pub offset_x: f64,
    /// Vertical translation, applied after scaling.
    pub offset_y: f64,
}

impl TransformMatrix {
    /// The identity mapping.
    pub fn identity() -> Self {
        Self {
            scale_x: 1.0,
            scale_y: 1.0,
            offset_x: 0.0,
            offset_y: 0.0,
        }
    }

    /// Compute the mapping for a frame of `frame_width` × `frame_height`.
    ///
    /// When the mask carries a display placement record and natural image
    /// dimensions, the displayed content size is `natural * scale`; the
    /// matrix then scales that displayed region to the full frame and
    /// translates the placement offset (the letterbox bars) away:
    ///
    /// ```text
    /// scale_x  = frame_width  / (natural_width  * placement.scale)
    /// scale_y  = frame_height / (natural_height * placement.scale)
    /// offset_x = -placement.offset_x * scale_x
    /// offset_y = -placement.offset_y * scale_y
    /// ```
    ///
    /// Without display metadata (degraded mode) the mapping is a direct
    /// scale from canvas dimensions to frame dimensions with zero offsets.
    /// Unusable metadata (zero dimensions or scale) degrades the same way,
    /// and a zero canvas degrades further to the identity.
    pub fn for_frame(
        display: Option<&DisplayMetadata>,
        frame_width: u32,
        frame_height: u32,
    ) -> Self {
        let Some(display) = display else {
            return Self::identity();
        };

        if let Some(placement) = display.placement.as_ref() {
            let displayed_width = display.natural_width as f64 * placement.scale;
            let displayed_height = display.natural_height as f64 * placement.scale;

            if displayed_width > 0.0 && displayed_height > 0.0 {
                let scale_x = frame_width as f64 / displayed_width;
                let scale_y = frame_height as f64 / displayed_height;
                return Self {
                    scale_x,
                    scale_y,
                    offset_x: -placement.offset_x * scale_x,
                    offset_y: -placement.offset_y * scale_y,
                };
            }
            log::warn!(
                "Display placement has degenerate geometry ({displayed_width}x{displayed_height}); \
                 falling back to canvas scaling"
            );
        }

        // Degraded mode: no placement record. Scale canvas directly onto
        // the frame.
        if display.canvas_width > 0 && display.canvas_height > 0 {
            Self {
                scale_x: frame_width as f64 / display.canvas_width as f64,
                scale_y: frame_height as f64 / display.canvas_height as f64,
                offset_x: 0.0,
                offset_y: 0.0,
            }
        } else {
            Self::identity()
        }
    }

    /// Map a canvas point to frame space.
    pub fn map(&self, x: f64, y: f64) -> (f64, f64) {
        (
            x * self.scale_x + self.offset_x,
            y * self.scale_y + self.offset_y,
        )
    }

    /// Map a length along the horizontal axis.
    pub fn map_width(&self, width: f64) -> f64 {
        width * self.scale_x
    }

    /// Map a length along the vertical axis.
    pub fn map_height(&self, height: f64) -> f64 {
        height * self.scale_y
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mask::DisplayPlacement;

    fn display(
        canvas: (u32, u32),
        natural: (u32, u32),
        placement: Option<DisplayPlacement>,
    ) -> DisplayMetadata {
        DisplayMetadata {
            canvas_width: canvas.0,
            canvas_height: canvas.1,
            natural_width: natural.0,
            natural_height: natural.1,
            placement,
        }
    }

    #[test]
    fn displayed_corners_map_to_frame_corners() {
        // A 1920x1080 natural image shown at half scale inside an 1100x700
        // canvas, letterboxed with offsets.
        let placement = DisplayPlacement {
            scale: 0.5,
            offset_x: 70.0,
            offset_y: 80.0,
        };
        let metadata = display((1100, 700), (1920, 1080), Some(placement));
        let matrix = TransformMatrix::for_frame(Some(&metadata), 1280, 720);

        // Top-left of the displayed image content.
        let (x, y) = matrix.map(70.0, 80.0);
        assert!(x.abs() < 1e-9 && y.abs() < 1e-9, "got ({x}, {y})");

        // Bottom-right of the displayed image content (70 + 960, 80 + 540).
        let (x, y) = matrix.map(1030.0, 620.0);
        assert!((x - 1280.0).abs() < 1e-9, "got x = {x}");
        assert!((y - 720.0).abs() < 1e-9, "got y = {y}");
    }

    #[test]
    fn degraded_mode_scales_canvas_to_frame() {
        let metadata = display((800, 600), (0, 0), None);
        let matrix = TransformMatrix::for_frame(Some(&metadata), 400, 300);

        assert_eq!(matrix.map(0.0, 0.0), (0.0, 0.0));
        assert_eq!(matrix.map(800.0, 600.0), (400.0, 300.0));
    }

    #[test]
    fn missing_metadata_is_identity() {
        let matrix = TransformMatrix::for_frame(None, 640, 480);
        assert_eq!(matrix, TransformMatrix::identity());
    }

    #[test]
    fn degenerate_placement_falls_back_to_canvas() {
        let placement = DisplayPlacement {
            scale: 0.0,
            offset_x: 10.0,
            offset_y: 10.0,
        };
        let metadata = display((200, 100), (1920, 1080), Some(placement));
        let matrix = TransformMatrix::for_frame(Some(&metadata), 400, 200);

        assert_eq!(matrix.map(200.0, 100.0), (400.0, 200.0));
    }
}
