//! Multi-frame DICOM decoding and windowing.
//!
//! [`DicomSource`] reads uncompressed little-endian DICOM files directly:
//! a minimal data-element walk recovers the handful of attributes the
//! pipeline needs (geometry, sample layout, frame count, window, modality)
//! plus the raw pixel data. Compressed transfer syntaxes are rejected at
//! open time.
//!
//! 16-bit samples are windowed to 8-bit using, in priority order: an
//! explicit WindowCenter/WindowWidth attribute, a modality preset, or
//! auto min/max normalization over the frame's sample population. Signed
//! sample representation is offset to unsigned before windowing.

use std::fs;
use std::path::{Path, PathBuf};

use image::DynamicImage;

use crate::error::OccludeError;
use crate::source::{FrameSource, SourceMetadata, placeholder_frame};

/// Byte offset of the `DICM` marker after the 128-byte preamble.
const MAGIC_OFFSET: usize = 128;

/// Transfer syntaxes the reader understands (uncompressed little endian).
const IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";
const EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1";

/// A window center/width pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowLevel {
    /// Center of the displayed value range.
    pub center: f64,
    /// Width of the displayed value range.
    pub width: f64,
}

/// Default window for a modality, when the file carries no explicit window.
///
/// Two presets cover the common 16-bit modality classes: CT (soft-tissue
/// window) and MR. Anything else falls through to auto min/max
/// normalization.
pub fn modality_window(modality: &str) -> Option<WindowLevel> {
    match modality.trim() {
        "CT" => Some(WindowLevel {
            center: 40.0,
            width: 400.0,
        }),
        "MR" => Some(WindowLevel {
            center: 300.0,
            width: 600.0,
        }),
        _ => None,
    }
}

/// Window 16-bit samples down to 8-bit display values.
///
/// Values at or below `center - width/2` map to 0, values at or above
/// `center + width/2` map to 255, and values in between interpolate
/// linearly.
pub fn window_samples(samples: &[u16], window: WindowLevel) -> Vec<u8> {
    let width = window.width.max(1.0);
    let window_min = window.center - width / 2.0;
    let window_max = window.center + width / 2.0;
    let range = window_max - window_min;

    samples
        .iter()
        .map(|&sample| {
            let value = sample as f64;
            if value <= window_min {
                0
            } else if value >= window_max {
                255
            } else {
                (((value - window_min) / range) * 255.0).round() as u8
            }
        })
        .collect()
}

/// Compute an auto window spanning the sample population's min/max.
pub fn auto_window(samples: &[u16]) -> WindowLevel {
    let mut min = u16::MAX;
    let mut max = u16::MIN;
    for &sample in samples {
        min = min.min(sample);
        max = max.max(sample);
    }
    if min >= max {
        // Flat input; any window that maps it off the extremes will do.
        return WindowLevel {
            center: min as f64,
            width: 1.0,
        };
    }
    WindowLevel {
        center: (min as f64 + max as f64) / 2.0,
        width: max as f64 - min as f64,
    }
}

/// Whether `bytes` starts a DICOM file (`DICM` marker after the preamble).
pub fn is_dicom(bytes: &[u8]) -> bool {
    bytes.len() >= MAGIC_OFFSET + 4 && &bytes[MAGIC_OFFSET..MAGIC_OFFSET + 4] == b"DICM"
}

/// Attributes recovered from the data-element walk.
#[derive(Debug, Clone, Default)]
struct DicomAttributes {
    rows: u16,
    columns: u16,
    bits_allocated: u16,
    pixel_representation: u16,
    samples_per_pixel: u16,
    number_of_frames: Option<u64>,
    frame_time_ms: Option<f64>,
    window: Option<WindowLevel>,
    modality: Option<String>,
}

/// A multi-frame DICOM file opened for frame extraction.
pub struct DicomSource {
    file_path: PathBuf,
    attributes: DicomAttributes,
    pixel_data: Vec<u8>,
    metadata: SourceMetadata,
}

impl DicomSource {
    /// Open and parse a DICOM file.
    ///
    /// # Errors
    ///
    /// Returns [`OccludeError::FileOpen`] for unreadable files or files
    /// without the `DICM` signature, and
    /// [`OccludeError::UnsupportedPixelFormat`] for compressed transfer
    /// syntaxes. A missing or truncated pixel-data element is *not* fatal
    /// here; it surfaces later as per-frame placeholders.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, OccludeError> {
        let path = path.as_ref();
        let file_path = path.to_path_buf();

        log::debug!("Opening DICOM source: {}", file_path.display());

        let bytes = fs::read(path).map_err(|error| OccludeError::FileOpen {
            path: file_path.clone(),
            reason: error.to_string(),
        })?;

        if !is_dicom(&bytes) {
            return Err(OccludeError::FileOpen {
                path: file_path,
                reason: "missing DICM signature at offset 128".to_string(),
            });
        }

        let (attributes, pixel_data) = parse_elements(&bytes)?;

        if attributes.rows == 0 || attributes.columns == 0 {
            return Err(OccludeError::FileOpen {
                path: file_path,
                reason: "file carries no Rows/Columns attributes".to_string(),
            });
        }

        let bytes_per_frame = bytes_per_frame(&attributes);
        let total_frames = match attributes.number_of_frames {
            Some(count) if count > 0 => count,
            _ if bytes_per_frame > 0 => {
                // Estimate from the pixel-data length.
                (pixel_data.len() / bytes_per_frame).max(1) as u64
            }
            _ => 1,
        };

        let frame_rate = attributes
            .frame_time_ms
            .filter(|&ms| ms > 0.0)
            .map_or(0.0, |ms| 1000.0 / ms);

        let metadata = SourceMetadata {
            width: attributes.columns as u32,
            height: attributes.rows as u32,
            frame_rate,
            total_frames,
            is_multi_frame_medical: true,
        };

        Ok(Self {
            file_path,
            attributes,
            pixel_data,
            metadata,
        })
    }

    /// Extract and normalize the samples for one frame.
    fn decode_frame(&self, index: u64) -> Result<DynamicImage, OccludeError> {
        let attributes = &self.attributes;
        let rows = attributes.rows as usize;
        let columns = attributes.columns as usize;
        let samples_per_pixel = attributes.samples_per_pixel.max(1) as usize;
        let bytes_per_sample = match attributes.bits_allocated {
            0 | 8 => 1usize,
            16 => 2usize,
            other => {
                return Err(OccludeError::UnsupportedPixelFormat(format!(
                    "{other} bits allocated"
                )));
            }
        };

        if samples_per_pixel != 1 && !(samples_per_pixel == 3 && bytes_per_sample == 1) {
            return Err(OccludeError::UnsupportedPixelFormat(format!(
                "{samples_per_pixel} samples per pixel at {} bits",
                attributes.bits_allocated.max(8)
            )));
        }

        let frame_bytes = rows * columns * samples_per_pixel * bytes_per_sample;
        if frame_bytes == 0 || self.pixel_data.is_empty() {
            return Err(OccludeError::Decode {
                frame_number: index,
                reason: "pixel data element is empty".to_string(),
            });
        }

        // Clamp out-of-range indices back to frame 0 rather than failing.
        let mut index = index;
        if index >= self.metadata.total_frames {
            log::warn!(
                "Frame {index} beyond estimated count {}; falling back to frame 0",
                self.metadata.total_frames
            );
            index = 0;
        }

        let mut offset = index as usize * frame_bytes;
        if offset + frame_bytes > self.pixel_data.len() {
            // Fewer bytes available than required at this offset; fall back
            // to the first frame.
            log::warn!(
                "Pixel data too short for frame {index} ({} bytes, need {}); \
                 falling back to frame 0",
                self.pixel_data.len(),
                offset + frame_bytes
            );
            offset = 0;
        }

        let available = self.pixel_data.len().saturating_sub(offset);
        let slice = &self.pixel_data[offset..offset + frame_bytes.min(available)];

        // Correct multi-frame leakage / padding to exactly rows*cols samples.
        let mut frame = slice.to_vec();
        frame.resize(frame_bytes, 0);

        let width = columns as u32;
        let height = rows as u32;

        if samples_per_pixel == 3 {
            let image = image::RgbImage::from_raw(width, height, frame).ok_or_else(|| {
                OccludeError::Decode {
                    frame_number: index,
                    reason: "RGB sample buffer construction failed".to_string(),
                }
            })?;
            return Ok(DynamicImage::ImageRgb8(image));
        }

        let gray = if bytes_per_sample == 1 {
            // 8-bit samples pass through unchanged.
            frame
        } else {
            let mut samples: Vec<u16> = frame
                .chunks_exact(2)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                .collect();

            let signed = attributes.pixel_representation == 1;
            if signed {
                // Convert two's-complement samples to unsigned.
                for sample in &mut samples {
                    *sample = (*sample as i16 as i32 + 32768) as u16;
                }
            }

            let window = attributes
                .window
                .map(|window| {
                    if signed {
                        // Keep the explicit window in the shifted space.
                        WindowLevel {
                            center: window.center + 32768.0,
                            width: window.width,
                        }
                    } else {
                        window
                    }
                })
                .or_else(|| {
                    attributes
                        .modality
                        .as_deref()
                        .and_then(modality_window)
                        .map(|window| {
                            if signed {
                                WindowLevel {
                                    center: window.center + 32768.0,
                                    width: window.width,
                                }
                            } else {
                                window
                            }
                        })
                })
                .unwrap_or_else(|| auto_window(&samples));

            window_samples(&samples, window)
        };

        let image = image::GrayImage::from_raw(width, height, gray).ok_or_else(|| {
            OccludeError::Decode {
                frame_number: index,
                reason: "grayscale sample buffer construction failed".to_string(),
            }
        })?;
        Ok(DynamicImage::ImageLuma8(image))
    }
}

impl FrameSource for DicomSource {
    fn metadata(&mut self) -> Result<SourceMetadata, OccludeError> {
        Ok(self.metadata.clone())
    }

    fn frame(&mut self, index: u64) -> Result<DynamicImage, OccludeError> {
        self.decode_frame(index)
    }

    fn frames(
        &mut self,
        start: u64,
        end: u64,
    ) -> Result<Vec<(u64, DynamicImage)>, OccludeError> {
        let (width, height) = (self.metadata.width, self.metadata.height);
        let mut frames = Vec::with_capacity(end.saturating_sub(start) as usize);
        for index in start..end {
            let image = match self.decode_frame(index) {
                Ok(image) => image,
                Err(error) => {
                    log::warn!(
                        "Frame {index} of {} undecodable ({error}); substituting placeholder",
                        self.file_path.display()
                    );
                    placeholder_frame(width, height)
                }
            };
            frames.push((index, image));
        }
        Ok(frames)
    }
}

/// Bytes occupied by one frame of pixel data.
fn bytes_per_frame(attributes: &DicomAttributes) -> usize {
    let bytes_per_sample = if attributes.bits_allocated == 16 { 2 } else { 1 };
    attributes.rows as usize
        * attributes.columns as usize
        * attributes.samples_per_pixel.max(1) as usize
        * bytes_per_sample
}

/// Walk the data elements of an uncompressed little-endian DICOM file.
///
/// The file meta group (0002) is always explicit VR; the transfer syntax it
/// names decides how the main data set is read. Sequences are skipped, not
/// parsed — nothing the pipeline needs lives inside one.
fn parse_elements(bytes: &[u8]) -> Result<(DicomAttributes, Vec<u8>), OccludeError> {
    let mut attributes = DicomAttributes {
        samples_per_pixel: 1,
        bits_allocated: 8,
        ..DicomAttributes::default()
    };
    let mut pixel_data = Vec::new();

    let mut position = MAGIC_OFFSET + 4;
    let mut explicit_vr = true;
    let mut transfer_syntax = String::new();
    let mut in_meta_group = true;

    while position + 8 <= bytes.len() {
        let group = u16::from_le_bytes([bytes[position], bytes[position + 1]]);
        let element = u16::from_le_bytes([bytes[position + 2], bytes[position + 3]]);

        // Leaving the file meta group: switch to the negotiated syntax.
        if in_meta_group && group != 0x0002 {
            in_meta_group = false;
            match transfer_syntax.as_str() {
                "" | EXPLICIT_VR_LE => explicit_vr = true,
                IMPLICIT_VR_LE => explicit_vr = false,
                other => {
                    return Err(OccludeError::UnsupportedPixelFormat(format!(
                        "transfer syntax {other} is not uncompressed little endian"
                    )));
                }
            }
        }

        let use_explicit = in_meta_group || explicit_vr;
        let (value_length, header_length, vr) = if use_explicit {
            let vr = &bytes[position + 4..position + 6];
            if matches!(vr, b"OB" | b"OW" | b"OF" | b"SQ" | b"UT" | b"UN") {
                if position + 12 > bytes.len() {
                    break;
                }
                let length = u32::from_le_bytes([
                    bytes[position + 8],
                    bytes[position + 9],
                    bytes[position + 10],
                    bytes[position + 11],
                ]);
                (length as usize, 12usize, Some(<[u8; 2]>::try_from(vr).unwrap()))
            } else {
                let length = u16::from_le_bytes([bytes[position + 6], bytes[position + 7]]);
                (length as usize, 8usize, Some(<[u8; 2]>::try_from(vr).unwrap()))
            }
        } else {
            let length = u32::from_le_bytes([
                bytes[position + 4],
                bytes[position + 5],
                bytes[position + 6],
                bytes[position + 7],
            ]);
            (length as usize, 8usize, None)
        };

        let value_start = position + header_length;

        // Undefined length: encapsulated pixel data is unsupported;
        // sequences are skipped via their delimitation item.
        if value_length == 0xFFFF_FFFF {
            if (group, element) == (0x7FE0, 0x0010) {
                return Err(OccludeError::UnsupportedPixelFormat(
                    "encapsulated (compressed) pixel data".to_string(),
                ));
            }
            position = skip_undefined_length(bytes, value_start);
            continue;
        }

        if value_start + value_length > bytes.len() {
            log::warn!(
                "Element ({group:04X},{element:04X}) overruns the file; stopping walk"
            );
            break;
        }
        let value = &bytes[value_start..value_start + value_length];

        match (group, element) {
            (0x0002, 0x0010) => {
                transfer_syntax = ascii_value(value).trim_end_matches('\0').to_string();
            }
            (0x0008, 0x0060) => attributes.modality = Some(ascii_value(value)),
            (0x0018, 0x1063) => attributes.frame_time_ms = first_decimal(value),
            (0x0028, 0x0002) => {
                attributes.samples_per_pixel = short_value(value, explicit_vr, vr).unwrap_or(1);
            }
            (0x0028, 0x0008) => {
                attributes.number_of_frames =
                    first_decimal(value).map(|count| count.max(0.0) as u64);
            }
            (0x0028, 0x0010) => {
                attributes.rows = short_value(value, explicit_vr, vr).unwrap_or(0);
            }
            (0x0028, 0x0011) => {
                attributes.columns = short_value(value, explicit_vr, vr).unwrap_or(0);
            }
            (0x0028, 0x0100) => {
                attributes.bits_allocated = short_value(value, explicit_vr, vr).unwrap_or(8);
            }
            (0x0028, 0x0103) => {
                attributes.pixel_representation =
                    short_value(value, explicit_vr, vr).unwrap_or(0);
            }
            (0x0028, 0x1050) => {
                if let Some(center) = first_decimal(value) {
                    let width = attributes.window.map_or(0.0, |window| window.width);
                    attributes.window = Some(WindowLevel { center, width });
                }
            }
            (0x0028, 0x1051) => {
                if let Some(width) = first_decimal(value) {
                    let center = attributes.window.map_or(0.0, |window| window.center);
                    attributes.window = Some(WindowLevel { center, width });
                }
            }
            (0x7FE0, 0x0010) => {
                pixel_data = value.to_vec();
            }
            _ => {}
        }

        position = value_start + value_length;
    }

    // A window is only usable once both halves arrived.
    if let Some(window) = attributes.window {
        if window.width <= 0.0 {
            attributes.window = None;
        }
    }

    Ok((attributes, pixel_data))
}

/// Skip past a sequence with undefined length by scanning for its
/// delimitation item `(FFFE,E0DD)`.
fn skip_undefined_length(bytes: &[u8], mut position: usize) -> usize {
    while position + 8 <= bytes.len() {
        if bytes[position] == 0xFE
            && bytes[position + 1] == 0xFF
            && bytes[position + 2] == 0xDD
            && bytes[position + 3] == 0xE0
        {
            return position + 8;
        }
        position += 1;
    }
    bytes.len()
}

/// Read a US value: binary u16 in both encodings.
fn short_value(value: &[u8], _explicit: bool, vr: Option<[u8; 2]>) -> Option<u16> {
    // IS-encoded shorts appear in the wild; accept digits too.
    if matches!(vr, Some(b"IS") | Some(b"DS")) {
        return first_decimal(value).map(|number| number as u16);
    }
    if value.len() >= 2 {
        Some(u16::from_le_bytes([value[0], value[1]]))
    } else {
        None
    }
}

/// Parse the first component of a numeric string value (IS/DS), tolerating
/// multi-valued `a\b` encodings and padding.
fn first_decimal(value: &[u8]) -> Option<f64> {
    let text = ascii_value(value);
    text.split('\\').next()?.trim().parse::<f64>().ok()
}

fn ascii_value(value: &[u8]) -> String {
    String::from_utf8_lossy(value).trim().to_string()
}
