//! Error types for the `occlude` crate.
//!
//! This module defines [`OccludeError`], the unified error type returned by all
//! fallible operations in the crate. Errors carry rich context to aid debugging,
//! including file paths, frame numbers, and pixel dimensions.

use std::{io::Error as IoError, path::PathBuf};

use ffmpeg_next::Error as FfmpegError;
use image::ImageError;
use thiserror::Error;
use zip::result::ZipError;

use crate::job::JobStatus;

/// The unified error type for all `occlude` operations.
///
/// Every public method that can fail returns `Result<T, OccludeError>`.
/// Variants carry enough context to diagnose the problem without needing
/// additional logging at the call site.
///
/// Per-frame failures are normally absorbed at the masking boundary and
/// surfaced as failed [`FrameResult`](crate::FrameResult)s instead of errors;
/// the variants here describe job-level failures.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum OccludeError {
    /// The source file could not be opened.
    #[error("Failed to open source at {path}: {reason}")]
    FileOpen {
        /// Path that was passed to the source constructor.
        path: PathBuf,
        /// Underlying reason the open failed.
        reason: String,
    },

    /// The file does not contain a video stream.
    #[error("No video stream found in file")]
    NoVideoStream,

    /// A frame could not be decoded from the source.
    #[error("Failed to decode frame {frame_number}: {reason}")]
    Decode {
        /// The frame that failed to decode.
        frame_number: u64,
        /// Underlying reason the decode failed.
        reason: String,
    },

    /// The requested frame number exceeds the total frame count.
    #[error("Frame {frame_number} is out of range (source has {total_frames} frames)")]
    FrameOutOfRange {
        /// The frame number that was requested.
        frame_number: u64,
        /// The total number of frames in the source.
        total_frames: u64,
    },

    /// Mask geometry could not be resolved against the frame at all.
    ///
    /// Out-of-range coordinates are normally recovered by clamping or the
    /// centered default rectangle; this variant is reserved for masks that
    /// carry no usable geometry whatsoever.
    #[error("Invalid mask geometry: {0}")]
    Geometry(String),

    /// Frames within one job differ in native size.
    ///
    /// A single mask template is only meaningful when every frame shares the
    /// reference geometry, so this is fatal for the whole job.
    #[error(
        "Frame {frame_number} is {actual_width}x{actual_height} but the job reference is \
         {expected_width}x{expected_height}"
    )]
    DimensionMismatch {
        /// The frame whose dimensions differ.
        frame_number: u64,
        /// Reference width established by the first frame.
        expected_width: u32,
        /// Reference height established by the first frame.
        expected_height: u32,
        /// Actual decoded width.
        actual_width: u32,
        /// Actual decoded height.
        actual_height: u32,
    },

    /// The source carries a sample layout the pipeline cannot interpret.
    #[error("Unsupported pixel format: {0}")]
    UnsupportedPixelFormat(String),

    /// The mask's raster payload could not be decoded.
    #[error("Failed to decode mask raster payload: {0}")]
    MaskPayload(String),

    /// A job id was not found in the job store.
    #[error("Job {0} not found")]
    JobNotFound(String),

    /// A job with this id is already present in the job store.
    #[error("Job {0} already exists")]
    JobExists(String),

    /// A job status transition violated the state machine.
    #[error("Invalid job status transition: {from:?} -> {to:?}")]
    InvalidTransition {
        /// Status the job currently holds.
        from: JobStatus,
        /// Status that was requested.
        to: JobStatus,
    },

    /// The job carries no mask, or no geometry survived resolution.
    #[error("Job has no mask configured")]
    MissingMask,

    /// The operation was cancelled via a
    /// [`CancellationToken`](crate::CancellationToken).
    #[error("Operation cancelled")]
    Cancelled,

    /// An error originating from the FFmpeg libraries.
    #[error("FFmpeg error: {0}")]
    FfmpegError(String),

    /// An I/O error occurred while reading or writing files.
    #[error("I/O error: {0}")]
    IoError(#[from] IoError),

    /// An error from the `image` crate during frame processing.
    #[error("Image processing error: {0}")]
    ImageError(#[from] ImageError),

    /// The output archive could not be written.
    #[error("Archive error: {0}")]
    Archive(#[from] ZipError),
}

impl From<FfmpegError> for OccludeError {
    fn from(error: FfmpegError) -> Self {
        OccludeError::FfmpegError(error.to_string())
    }
}
