//! Per-frame mask application.
//!
//! [`apply_mask`] composites an [`OpacityBuffer`] onto one decoded frame,
//! applies the output size/fit policy, and encodes the result. The
//! composite is a destructive per-pixel overwrite — masked pixels become
//! black, matching the "redact region" semantics of the product — never an
//! alpha blend.
//!
//! This boundary is where per-frame failures are absorbed: any error
//! produces a [`FrameResult`] with `success: false` and an empty buffer,
//! preserving the frame number so index continuity survives into the
//! manifest while the rest of the batch continues.

use std::io::Cursor;

use image::{DynamicImage, GenericImage, GenericImageView, imageops::FilterType};

use crate::error::OccludeError;
use crate::output::{FitMode, OutputSettings};
use crate::rasterize::OpacityBuffer;

/// The outcome of masking one frame.
#[derive(Debug, Clone)]
pub struct FrameResult {
    /// The frame this result belongs to.
    pub frame_number: u64,
    /// Encoded output bytes; `None` for failed frames.
    pub data: Option<Vec<u8>>,
    /// Output width after the size policy was applied (0 for failed frames).
    pub output_width: u32,
    /// Output height after the size policy was applied (0 for failed frames).
    pub output_height: u32,
    /// Whether masking and encoding succeeded.
    pub success: bool,
    /// Failure description for unsuccessful frames.
    pub error: Option<String>,
}

impl FrameResult {
    /// A placeholder result for a frame that could not be processed.
    pub fn failed(frame_number: u64, error: impl Into<String>) -> Self {
        Self {
            frame_number,
            data: None,
            output_width: 0,
            output_height: 0,
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Apply an opacity buffer to one frame and encode the result.
///
/// Never fails: errors are converted into a failed [`FrameResult`] carrying
/// the frame number and a description.
pub fn apply_mask(
    frame_number: u64,
    image: &DynamicImage,
    opacity: &OpacityBuffer,
    settings: &OutputSettings,
) -> FrameResult {
    match try_apply_mask(frame_number, image, opacity, settings) {
        Ok(result) => result,
        Err(error) => {
            log::warn!("Masking frame {frame_number} failed: {error}");
            FrameResult::failed(frame_number, error.to_string())
        }
    }
}

/// Fallible inner implementation of [`apply_mask`].
fn try_apply_mask(
    frame_number: u64,
    image: &DynamicImage,
    opacity: &OpacityBuffer,
    settings: &OutputSettings,
) -> Result<FrameResult, OccludeError> {
    let (width, height) = image.dimensions();
    if (width, height) != (opacity.width(), opacity.height()) {
        // The scheduler rasterizes per frame size, so this indicates a
        // caller bug rather than bad input media.
        return Err(OccludeError::Geometry(format!(
            "opacity buffer is {}x{} but frame {frame_number} is {width}x{height}",
            opacity.width(),
            opacity.height()
        )));
    }

    // Destructive occlusion: overwrite masked pixels with black.
    let mut pixels = image.to_rgb8();
    for (x, y, pixel) in pixels.enumerate_pixels_mut() {
        if opacity.is_masked(x, y) {
            pixel.0 = [0, 0, 0];
        }
    }
    let composited = DynamicImage::ImageRgb8(pixels);

    let (target_width, target_height) = settings.size.resolve(width, height);
    let framed = apply_fit(&composited, target_width, target_height, settings.fit);

    let mut encoded = Cursor::new(Vec::new());
    framed.write_to(&mut encoded, settings.format.image_format())?;

    Ok(FrameResult {
        frame_number,
        data: Some(encoded.into_inner()),
        output_width: framed.width(),
        output_height: framed.height(),
        success: true,
        error: None,
    })
}

/// Resize `image` to the target dimensions under the given fit mode.
///
/// `Stretch` maps directly onto the target, `Letterbox` preserves aspect
/// ratio and pads the remainder with black, `Crop` preserves aspect ratio
/// and trims the overflow.
pub fn apply_fit(
    image: &DynamicImage,
    target_width: u32,
    target_height: u32,
    fit: FitMode,
) -> DynamicImage {
    let (width, height) = image.dimensions();
    if (width, height) == (target_width, target_height) {
        return image.clone();
    }

    match fit {
        FitMode::Stretch => image.resize_exact(target_width, target_height, FilterType::Triangle),
        FitMode::Crop => image.resize_to_fill(target_width, target_height, FilterType::Triangle),
        FitMode::Letterbox => {
            let scaled = image.resize(target_width, target_height, FilterType::Triangle);
            let mut canvas = DynamicImage::new_rgb8(target_width, target_height);
            let x = (target_width - scaled.width()) / 2;
            let y = (target_height - scaled.height()) / 2;
            // copy_from only fails if the scaled image overflows the canvas,
            // which resize() guarantees against.
            let _ = canvas.copy_from(&scaled, x, y);
            canvas
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mask::{Mask, MaskShape, RectSpec};
    use crate::rasterize::{MarkerThresholds, rasterize};

    fn gray_frame(width: u32, height: u32, value: u8) -> DynamicImage {
        DynamicImage::ImageRgb8(image::RgbImage::from_pixel(
            width,
            height,
            image::Rgb([value, value, value]),
        ))
    }

    fn rect_opacity(x: f64, y: f64, w: f64, h: f64, fw: u32, fh: u32) -> OpacityBuffer {
        let mask = Mask {
            shape: MaskShape::Rectangle {
                rect: RectSpec::Pixels {
                    x,
                    y,
                    width: w,
                    height: h,
                },
            },
            opacity: 75,
            feather: 0.0,
            raster: None,
            display: None,
        };
        rasterize(&mask, fw, fh, &MarkerThresholds::default()).unwrap()
    }

    #[test]
    fn masked_region_is_blackened_and_rest_untouched() {
        let frame = gray_frame(100, 100, 200);
        let opacity = rect_opacity(10.0, 10.0, 20.0, 20.0, 100, 100);

        let result = apply_mask(0, &frame, &opacity, &OutputSettings::default());
        assert!(result.success);

        let decoded = image::load_from_memory(result.data.as_ref().unwrap())
            .unwrap()
            .to_rgb8();
        for (x, y, pixel) in decoded.enumerate_pixels() {
            let expected = if (10..30).contains(&x) && (10..30).contains(&y) {
                [0, 0, 0]
            } else {
                [200, 200, 200]
            };
            assert_eq!(pixel.0, expected, "pixel at ({x}, {y})");
        }
    }

    #[test]
    fn buffer_size_mismatch_yields_failed_result() {
        let frame = gray_frame(100, 100, 128);
        let opacity = rect_opacity(0.0, 0.0, 10.0, 10.0, 50, 50);

        let result = apply_mask(7, &frame, &opacity, &OutputSettings::default());
        assert!(!result.success);
        assert_eq!(result.frame_number, 7);
        assert!(result.data.is_none());
        assert!(result.error.is_some());
    }

    #[test]
    fn letterbox_pads_with_black() {
        // A white 100x50 frame into a square target leaves bars above and
        // below.
        let frame = gray_frame(100, 50, 255);
        let framed = apply_fit(&frame, 100, 100, FitMode::Letterbox);
        assert_eq!((framed.width(), framed.height()), (100, 100));

        let rgb = framed.to_rgb8();
        assert_eq!(rgb.get_pixel(50, 5).0, [0, 0, 0]);
        assert_eq!(rgb.get_pixel(50, 50).0, [255, 255, 255]);
        assert_eq!(rgb.get_pixel(50, 95).0, [0, 0, 0]);
    }

    #[test]
    fn stretch_ignores_aspect_ratio() {
        let frame = gray_frame(100, 50, 10);
        let framed = apply_fit(&frame, 60, 60, FitMode::Stretch);
        assert_eq!((framed.width(), framed.height()), (60, 60));
    }

    #[test]
    fn crop_fills_target_exactly() {
        let frame = gray_frame(100, 50, 10);
        let framed = apply_fit(&frame, 60, 60, FitMode::Crop);
        assert_eq!((framed.width(), framed.height()), (60, 60));
    }
}
