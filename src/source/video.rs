//! Video frame decoding via FFmpeg.
//!
//! [`VideoSource`] wraps an FFmpeg demuxer/decoder pair and extracts frames
//! by index: seek to the nearest keyframe before the target, decode
//! forward, and convert each matching frame to RGB8. Frame numbers are
//! recovered from presentation timestamps using the stream's time base and
//! average frame rate.

use std::path::{Path, PathBuf};
use std::time::Duration;

use ffmpeg_next::{
    Rational,
    codec::context::Context as CodecContext,
    format::Pixel,
    format::context::Input,
    frame::Video as VideoFrame,
    media::Type,
    software::scaling::{Context as ScalingContext, Flags as ScalingFlags},
};
use image::{DynamicImage, RgbImage};

use crate::error::OccludeError;
use crate::source::{FrameSource, SourceMetadata, placeholder_frame};

/// A video file opened for frame extraction.
///
/// Metadata is extracted once at open time and cached. Each range
/// extraction builds a fresh decoder from the stream parameters; the
/// decoder is dropped when the call returns.
pub struct VideoSource {
    input_context: Input,
    video_stream_index: usize,
    metadata: SourceMetadata,
    file_path: PathBuf,
}

impl VideoSource {
    /// Open a video file for extraction.
    ///
    /// Initializes FFmpeg (idempotent), opens the file, locates the best
    /// video stream, and caches its metadata.
    ///
    /// # Errors
    ///
    /// Returns [`OccludeError::FileOpen`] if the file cannot be opened and
    /// [`OccludeError::NoVideoStream`] if it has no video stream.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, OccludeError> {
        let path = path.as_ref();
        let file_path = path.to_path_buf();

        log::debug!("Opening video source: {}", file_path.display());

        ffmpeg_next::init().map_err(|error| OccludeError::FileOpen {
            path: file_path.clone(),
            reason: format!("FFmpeg initialisation failed: {error}"),
        })?;

        let input_context =
            ffmpeg_next::format::input(&path).map_err(|error| OccludeError::FileOpen {
                path: file_path.clone(),
                reason: error.to_string(),
            })?;

        let video_stream_index = input_context
            .streams()
            .best(Type::Video)
            .map(|stream| stream.index())
            .ok_or(OccludeError::NoVideoStream)?;

        let duration_microseconds = input_context.duration();
        let duration = if duration_microseconds > 0 {
            Duration::from_micros(duration_microseconds as u64)
        } else {
            Duration::ZERO
        };

        let stream = input_context
            .stream(video_stream_index)
            .ok_or(OccludeError::NoVideoStream)?;

        let decoder_context = CodecContext::from_parameters(stream.parameters())
            .map_err(|error| OccludeError::FileOpen {
                path: file_path.clone(),
                reason: format!("Failed to read video codec parameters: {error}"),
            })?;
        let decoder = decoder_context
            .decoder()
            .video()
            .map_err(|error| OccludeError::FileOpen {
                path: file_path.clone(),
                reason: format!("Failed to create video decoder: {error}"),
            })?;

        let frame_rate = stream.avg_frame_rate();
        let frames_per_second = if frame_rate.denominator() != 0 {
            frame_rate.numerator() as f64 / frame_rate.denominator() as f64
        } else {
            let rate = stream.rate();
            if rate.denominator() != 0 {
                rate.numerator() as f64 / rate.denominator() as f64
            } else {
                0.0
            }
        };

        let total_frames = if frames_per_second > 0.0 {
            (duration.as_secs_f64() * frames_per_second) as u64
        } else {
            0
        };

        let metadata = SourceMetadata {
            width: decoder.width(),
            height: decoder.height(),
            frame_rate: frames_per_second,
            total_frames,
            is_multi_frame_medical: false,
        };

        drop(stream);

        Ok(Self {
            input_context,
            video_stream_index,
            metadata,
            file_path,
        })
    }

    /// Decode frames `[start, end)` into per-index slots.
    ///
    /// Decode errors are logged and leave their slot empty; the caller
    /// substitutes placeholders.
    fn decode_range(
        &mut self,
        start: u64,
        end: u64,
        slots: &mut [Option<DynamicImage>],
    ) -> Result<(), OccludeError> {
        let target_width = self.metadata.width;
        let target_height = self.metadata.height;
        let frames_per_second = self.metadata.frame_rate;

        let stream = self
            .input_context
            .stream(self.video_stream_index)
            .ok_or(OccludeError::NoVideoStream)?;
        let time_base = stream.time_base();
        let decoder_context = CodecContext::from_parameters(stream.parameters())?;
        let mut decoder = decoder_context.decoder().video()?;

        let mut scaler = ScalingContext::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            Pixel::RGB24,
            target_width,
            target_height,
            ScalingFlags::BILINEAR,
        )?;

        // Seek to the nearest keyframe before the start frame.
        let start_timestamp =
            frame_number_to_stream_timestamp(start, frames_per_second, time_base);
        if let Err(error) = self.input_context.seek(start_timestamp, ..start_timestamp) {
            log::warn!(
                "Seek to frame {start} failed ({error}); decoding from current position"
            );
        }

        let mut decoded_frame = VideoFrame::empty();
        let mut rgb_frame = VideoFrame::empty();
        let mut fill =
            |frame_number: u64, decoded: &VideoFrame, scaler: &mut ScalingContext| {
                if frame_number < start || frame_number >= end {
                    return;
                }
                let slot = &mut slots[(frame_number - start) as usize];
                if slot.is_some() {
                    return;
                }
                match scaler.run(decoded, &mut rgb_frame) {
                    Ok(()) => {
                        if let Some(image) =
                            frame_to_image(&rgb_frame, target_width, target_height)
                        {
                            *slot = Some(image);
                        } else {
                            log::warn!("Frame {frame_number} produced a malformed RGB buffer");
                        }
                    }
                    Err(error) => {
                        log::warn!("Scaling frame {frame_number} failed: {error}");
                    }
                }
            };

        for (stream, packet) in self.input_context.packets() {
            if stream.index() != self.video_stream_index {
                continue;
            }

            if let Err(error) = decoder.send_packet(&packet) {
                log::warn!("Packet decode error at frame range {start}..{end}: {error}");
                continue;
            }

            let mut past_end = false;
            while decoder.receive_frame(&mut decoded_frame).is_ok() {
                let pts = decoded_frame.pts().unwrap_or(0);
                let frame_number = pts_to_frame_number(pts, time_base, frames_per_second);
                fill(frame_number, &decoded_frame, &mut scaler);
                if frame_number + 1 >= end {
                    past_end = true;
                }
            }
            if past_end {
                return Ok(());
            }
        }

        // Flush the decoder.
        decoder.send_eof()?;
        while decoder.receive_frame(&mut decoded_frame).is_ok() {
            let pts = decoded_frame.pts().unwrap_or(0);
            let frame_number = pts_to_frame_number(pts, time_base, frames_per_second);
            fill(frame_number, &decoded_frame, &mut scaler);
        }

        Ok(())
    }
}

impl FrameSource for VideoSource {
    fn metadata(&mut self) -> Result<SourceMetadata, OccludeError> {
        Ok(self.metadata.clone())
    }

    fn frame(&mut self, index: u64) -> Result<DynamicImage, OccludeError> {
        if self.metadata.total_frames > 0 && index >= self.metadata.total_frames {
            return Err(OccludeError::FrameOutOfRange {
                frame_number: index,
                total_frames: self.metadata.total_frames,
            });
        }

        let mut slots = vec![None];
        self.decode_range(index, index + 1, &mut slots)?;
        slots[0].take().ok_or_else(|| OccludeError::Decode {
            frame_number: index,
            reason: format!(
                "could not locate frame {index} in {}",
                self.file_path.display()
            ),
        })
    }

    fn frames(
        &mut self,
        start: u64,
        end: u64,
    ) -> Result<Vec<(u64, DynamicImage)>, OccludeError> {
        if end <= start {
            return Ok(Vec::new());
        }

        let mut slots: Vec<Option<DynamicImage>> = vec![None; (end - start) as usize];
        if let Err(error) = self.decode_range(start, end, &mut slots) {
            log::warn!("Decoding frames {start}..{end} failed: {error}");
        }

        let (width, height) = (self.metadata.width, self.metadata.height);
        Ok(slots
            .into_iter()
            .enumerate()
            .map(|(offset, slot)| {
                let frame_number = start + offset as u64;
                let image = slot.unwrap_or_else(|| {
                    log::warn!("Substituting placeholder for frame {frame_number}");
                    placeholder_frame(width, height)
                });
                (frame_number, image)
            })
            .collect())
    }
}

/// Convert a scaled RGB24 frame to an [`image::DynamicImage`], stripping
/// per-row stride padding.
fn frame_to_image(rgb_frame: &VideoFrame, width: u32, height: u32) -> Option<DynamicImage> {
    let stride = rgb_frame.stride(0);
    let expected_stride = (width as usize) * 3;
    let data = rgb_frame.data(0);

    let buffer = if stride == expected_stride {
        data[..expected_stride * (height as usize)].to_vec()
    } else {
        let mut buffer = Vec::with_capacity(expected_stride * (height as usize));
        for row in 0..(height as usize) {
            let row_start = row * stride;
            buffer.extend_from_slice(&data[row_start..row_start + expected_stride]);
        }
        buffer
    };

    RgbImage::from_raw(width, height, buffer).map(DynamicImage::ImageRgb8)
}

/// Convert a frame number to a timestamp in the stream's time base.
fn frame_number_to_stream_timestamp(
    frame_number: u64,
    frames_per_second: f64,
    time_base: Rational,
) -> i64 {
    if frames_per_second <= 0.0 {
        return 0;
    }
    let seconds = frame_number as f64 / frames_per_second;
    let numerator = time_base.numerator() as f64;
    let denominator = time_base.denominator() as f64;
    if numerator == 0.0 {
        return 0;
    }
    (seconds * denominator / numerator) as i64
}

/// Rescale a PTS value to a frame number.
fn pts_to_frame_number(pts: i64, time_base: Rational, frames_per_second: f64) -> u64 {
    let seconds = pts as f64 * time_base.numerator() as f64 / time_base.denominator() as f64;
    let frame = (seconds * frames_per_second).round();
    if frame < 0.0 { 0 } else { frame as u64 }
}
