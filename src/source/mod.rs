//! Frame sources.
//!
//! A [`FrameSource`] decodes a video, a multi-frame DICOM file, or a batch
//! of still images into per-frame raster buffers on demand, by index range.
//! Container detection is signature-based: DICOM files are recognised by
//! the fixed `DICM` marker at byte offset 128, never by extension.
//!
//! Per-frame decode failures inside [`frames`](FrameSource::frames) are
//! logged and substituted with a deterministic flat mid-gray placeholder so
//! one bad frame cannot abort a batch; only an unreadable source (or an
//! unusable reference frame) is job-fatal.

pub mod dicom;
pub mod images;
pub mod video;

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use image::DynamicImage;

use crate::error::OccludeError;
use crate::job::SourceKind;

pub use dicom::DicomSource;
pub use images::ImagesSource;
pub use video::VideoSource;

/// Gray value used for placeholder frames.
const PLACEHOLDER_GRAY: u8 = 128;

/// Metadata describing a frame source, extracted once at open time.
#[derive(Debug, Clone, PartialEq)]
#[must_use]
pub struct SourceMetadata {
    /// Native frame width in pixels.
    pub width: u32,
    /// Native frame height in pixels.
    pub height: u32,
    /// Frames per second; 0.0 when the source carries no timing (image
    /// batches, DICOM files without frame timing attributes).
    pub frame_rate: f64,
    /// Total number of frames. For DICOM this may be estimated from the
    /// pixel-data length when no explicit frame count attribute exists.
    pub total_frames: u64,
    /// Whether the source is a multi-frame medical image.
    pub is_multi_frame_medical: bool,
}

/// A decodable source of raster frames.
///
/// Implementations cache their metadata at open time; `metadata` is cheap
/// to call repeatedly.
pub trait FrameSource {
    /// Source metadata (dimensions, frame rate, frame count).
    fn metadata(&mut self) -> Result<SourceMetadata, OccludeError>;

    /// Decode a single frame by index.
    ///
    /// # Errors
    ///
    /// Returns [`OccludeError::Decode`] when the frame cannot be decoded.
    /// Callers that can tolerate a missing frame should substitute
    /// [`placeholder_frame`].
    fn frame(&mut self, index: u64) -> Result<DynamicImage, OccludeError>;

    /// Decode the frame range `[start, end)` in ascending order.
    ///
    /// The returned vector always contains exactly `end - start` entries;
    /// frames that fail to decode are replaced with the placeholder and
    /// logged rather than propagated.
    fn frames(&mut self, start: u64, end: u64)
    -> Result<Vec<(u64, DynamicImage)>, OccludeError>;
}

/// The deterministic substitute for an undecodable frame: flat mid-gray.
pub fn placeholder_frame(width: u32, height: u32) -> DynamicImage {
    DynamicImage::ImageRgb8(image::RgbImage::from_pixel(
        width.max(1),
        height.max(1),
        image::Rgb([PLACEHOLDER_GRAY, PLACEHOLDER_GRAY, PLACEHOLDER_GRAY]),
    ))
}

/// A fully-described source, ready to open.
///
/// `SourceSpec` is `Send + Clone` so background threads can open their own
/// source instance instead of sharing demuxer state.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceSpec {
    /// A standard video container, decoded via FFmpeg.
    Video(PathBuf),
    /// A multi-frame DICOM file.
    MultiFrameMedical(PathBuf),
    /// A batch of still images, one frame per file.
    Images(Vec<PathBuf>),
}

impl SourceSpec {
    /// The job source kind this spec corresponds to.
    pub fn kind(&self) -> SourceKind {
        match self {
            SourceSpec::Video(_) | SourceSpec::MultiFrameMedical(_) => SourceKind::Video,
            SourceSpec::Images(_) => SourceKind::Images,
        }
    }

    /// The source path(s), for job records.
    pub fn paths(&self) -> Vec<PathBuf> {
        match self {
            SourceSpec::Video(path) | SourceSpec::MultiFrameMedical(path) => vec![path.clone()],
            SourceSpec::Images(paths) => paths.clone(),
        }
    }
}

/// Detect the container kind of a single-file source by signature.
///
/// Reads the first bytes of the file and checks for the DICOM `DICM`
/// marker; anything else is handed to the video decoder.
///
/// # Errors
///
/// Returns [`OccludeError::FileOpen`] when the file cannot be read.
pub fn sniff<P: AsRef<Path>>(path: P) -> Result<SourceSpec, OccludeError> {
    let path = path.as_ref();
    let mut file = File::open(path).map_err(|error| OccludeError::FileOpen {
        path: path.to_path_buf(),
        reason: error.to_string(),
    })?;

    let mut header = [0u8; 132];
    let read = file.read(&mut header)?;

    if dicom::is_dicom(&header[..read]) {
        log::debug!("{} detected as DICOM by signature", path.display());
        Ok(SourceSpec::MultiFrameMedical(path.to_path_buf()))
    } else {
        Ok(SourceSpec::Video(path.to_path_buf()))
    }
}

/// Open a frame source for the given spec.
///
/// # Errors
///
/// Returns [`OccludeError::FileOpen`] when the source cannot be opened, or
/// decode errors from reading the container structure.
pub fn open(spec: &SourceSpec) -> Result<Box<dyn FrameSource>, OccludeError> {
    match spec {
        SourceSpec::Video(path) => Ok(Box::new(VideoSource::open(path)?)),
        SourceSpec::MultiFrameMedical(path) => Ok(Box::new(DicomSource::open(path)?)),
        SourceSpec::Images(paths) => Ok(Box::new(ImagesSource::new(paths.clone()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_is_flat_mid_gray() {
        let frame = placeholder_frame(4, 3).to_rgb8();
        assert_eq!((frame.width(), frame.height()), (4, 3));
        assert!(frame.pixels().all(|pixel| pixel.0 == [128, 128, 128]));
    }

    #[test]
    fn placeholder_never_collapses_to_zero_size() {
        let frame = placeholder_frame(0, 0);
        assert_eq!((frame.width(), frame.height()), (1, 1));
    }

    #[test]
    fn spec_kind_maps_to_source_kind() {
        assert_eq!(
            SourceSpec::Video("a.mp4".into()).kind(),
            SourceKind::Video
        );
        assert_eq!(
            SourceSpec::MultiFrameMedical("a.dcm".into()).kind(),
            SourceKind::Video
        );
        assert_eq!(SourceSpec::Images(vec![]).kind(), SourceKind::Images);
    }
}
