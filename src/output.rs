//! Output settings and archive assembly.
//!
//! [`OutputSettings`] controls the size, format, and aspect-ratio policy of
//! masked frames; [`write_archive`] packages ordered
//! [`FrameResult`](crate::FrameResult)s into a ZIP archive with the standard
//! layout (`frames/frame_{:06}.<ext>` or `images/image_{:03}_<stem>.<ext>`)
//! plus an optional `metadata.csv` manifest.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use zip::{CompressionMethod, ZipWriter, write::SimpleFileOptions};

use crate::error::OccludeError;
use crate::job::{Job, SourceKind};
use crate::operator::FrameResult;

/// Named size presets accepted by [`SizePolicy::Named`].
const SIZE_PRESETS: &[(&str, u32, u32)] = &[
    ("480p", 854, 480),
    ("720p", 1280, 720),
    ("1080p", 1920, 1080),
];

/// Target size policy for output frames.
///
/// Accepts three JSON encodings: a keyed object (`{"width": 1280,
/// "height": 720}`, preferred), a legacy two-element array (`[1280, 720]`),
/// and a name (`"original"` or a preset such as `"720p"`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SizePolicy {
    /// Explicit target dimensions.
    Exact {
        /// Target width in pixels.
        width: u32,
        /// Target height in pixels.
        height: u32,
    },
    /// Legacy `[width, height]` pair.
    Pair([u32; 2]),
    /// `"original"` or a named preset.
    Named(String),
}

impl Default for SizePolicy {
    fn default() -> Self {
        SizePolicy::Named("original".to_string())
    }
}

impl SizePolicy {
    /// Resolve the final output dimensions given the source frame size.
    ///
    /// Unknown preset names are logged and fall back to the native size so
    /// a bad request degrades instead of failing the job.
    pub fn resolve(&self, native_width: u32, native_height: u32) -> (u32, u32) {
        match self {
            SizePolicy::Exact { width, height } => ((*width).max(1), (*height).max(1)),
            SizePolicy::Pair([width, height]) => ((*width).max(1), (*height).max(1)),
            SizePolicy::Named(name) => {
                if name.eq_ignore_ascii_case("original") {
                    return (native_width, native_height);
                }
                for (preset, width, height) in SIZE_PRESETS {
                    if name.eq_ignore_ascii_case(preset) {
                        return (*width, *height);
                    }
                }
                log::warn!("Unknown size preset {name:?}; keeping original dimensions");
                (native_width, native_height)
            }
        }
    }
}

/// Encoded output image format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Lossless PNG. This is the default.
    #[default]
    Png,
    /// Lossy JPEG.
    #[serde(alias = "jpg")]
    Jpeg,
}

impl OutputFormat {
    /// File extension without the dot.
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Png => "png",
            OutputFormat::Jpeg => "jpg",
        }
    }

    /// The corresponding `image` crate format constant.
    pub(crate) fn image_format(self) -> image::ImageFormat {
        match self {
            OutputFormat::Png => image::ImageFormat::Png,
            OutputFormat::Jpeg => image::ImageFormat::Jpeg,
        }
    }
}

/// Aspect-ratio handling when the output size differs from the native size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FitMode {
    /// Resize ignoring aspect ratio. This is the default.
    #[default]
    Stretch,
    /// Resize preserving aspect ratio, pad the remainder with black.
    Letterbox,
    /// Resize preserving aspect ratio, crop the overflow.
    Crop,
}

/// Output settings for one job, captured at submission.
///
/// These always take precedence over any aspect hint carried by the mask's
/// display metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSettings {
    /// Target size policy.
    #[serde(default)]
    pub size: SizePolicy,
    /// Encoded output format.
    #[serde(default)]
    pub format: OutputFormat,
    /// Aspect-ratio handling mode.
    #[serde(default)]
    pub fit: FitMode,
    /// Whether to emit `metadata.csv` into the archive.
    #[serde(
        default = "default_include_manifest",
        rename = "includeManifest",
        alias = "include_manifest"
    )]
    pub include_manifest: bool,
}

fn default_include_manifest() -> bool {
    true
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            size: SizePolicy::default(),
            format: OutputFormat::default(),
            fit: FitMode::default(),
            include_manifest: true,
        }
    }
}

impl OutputSettings {
    /// Create default settings (original size, PNG, stretch, manifest on).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the size policy.
    #[must_use]
    pub fn with_size(mut self, size: SizePolicy) -> Self {
        self.size = size;
        self
    }

    /// Set the output format.
    #[must_use]
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Set the aspect-ratio handling mode.
    #[must_use]
    pub fn with_fit(mut self, fit: FitMode) -> Self {
        self.fit = fit;
        self
    }

    /// Control manifest emission.
    #[must_use]
    pub fn with_manifest(mut self, include: bool) -> Self {
        self.include_manifest = include;
        self
    }
}

/// The entry name for one result inside the archive.
///
/// Video/DICOM jobs use `frames/frame_{:06}.<ext>`; image jobs use
/// `images/image_{:03}_<original stem>.<ext>`.
pub fn entry_name(job: &Job, result: &FrameResult, format: OutputFormat) -> String {
    match job.source {
        SourceKind::Video => format!(
            "frames/frame_{:06}.{}",
            result.frame_number,
            format.extension()
        ),
        SourceKind::Images => {
            let stem = job
                .source_paths
                .get(result.frame_number as usize)
                .and_then(|path| path.file_stem())
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_else(|| "image".to_string());
            format!(
                "images/image_{:03}_{}.{}",
                result.frame_number,
                stem,
                format.extension()
            )
        }
    }
}

/// Write ordered frame results into a ZIP archive at `path`.
///
/// Failed results contribute no file entry but keep their manifest row, so
/// frame-index continuity is visible to consumers.
///
/// # Errors
///
/// Returns [`OccludeError::Archive`] or [`OccludeError::IoError`] when the
/// archive cannot be written.
pub fn write_archive(
    path: &Path,
    job: &Job,
    results: &[FrameResult],
    settings: &OutputSettings,
) -> Result<PathBuf, OccludeError> {
    let file = File::create(path)?;
    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for result in results {
        let Some(data) = result.data.as_ref() else {
            continue;
        };
        let name = entry_name(job, result, settings.format);
        zip.start_file(name, options)?;
        zip.write_all(data)?;
    }

    if settings.include_manifest {
        zip.start_file("metadata.csv", options)?;
        zip.write_all(manifest_csv(job, results, settings).as_bytes())?;
    }

    zip.finish()?;
    log::debug!(
        "Wrote archive {} ({} results, manifest: {})",
        path.display(),
        results.len(),
        settings.include_manifest
    );
    Ok(path.to_path_buf())
}

/// Build the `metadata.csv` contents for a result set.
pub fn manifest_csv(job: &Job, results: &[FrameResult], settings: &OutputSettings) -> String {
    let mut csv = String::from(
        "filename,frame_number,original_width,original_height,\
         output_width,output_height,timestamp,byte_size,status\n",
    );

    for result in results {
        let filename = entry_name(job, result, settings.format);
        let timestamp = if job.frame_rate > 0.0 {
            format!("{:.3}", result.frame_number as f64 / job.frame_rate)
        } else {
            String::new()
        };
        let byte_size = result.data.as_ref().map_or(0, Vec::len);
        let status = if result.success { "success" } else { "failed" };

        csv.push_str(&format!(
            "{},{},{},{},{},{},{},{},{}\n",
            csv_field(&filename),
            result.frame_number,
            job.width,
            job.height,
            result.output_width,
            result.output_height,
            timestamp,
            byte_size,
            status
        ));
    }

    csv
}

/// Quote a CSV field when it contains separators or quotes.
fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_policy_accepts_all_three_encodings() {
        let exact: SizePolicy = serde_json::from_str(r#"{"width": 640, "height": 360}"#).unwrap();
        assert_eq!(exact.resolve(100, 100), (640, 360));

        let pair: SizePolicy = serde_json::from_str("[640, 360]").unwrap();
        assert_eq!(pair.resolve(100, 100), (640, 360));

        let named: SizePolicy = serde_json::from_str(r#""720p""#).unwrap();
        assert_eq!(named.resolve(100, 100), (1280, 720));
    }

    #[test]
    fn original_and_unknown_presets_keep_native_size() {
        assert_eq!(
            SizePolicy::Named("original".into()).resolve(321, 123),
            (321, 123)
        );
        assert_eq!(
            SizePolicy::Named("4320p-nope".into()).resolve(321, 123),
            (321, 123)
        );
    }

    #[test]
    fn format_accepts_jpg_alias() {
        let format: OutputFormat = serde_json::from_str(r#""jpg""#).unwrap();
        assert_eq!(format, OutputFormat::Jpeg);
        let format: OutputFormat = serde_json::from_str(r#""jpeg""#).unwrap();
        assert_eq!(format, OutputFormat::Jpeg);
    }

    #[test]
    fn settings_default_round_trip() {
        let settings: OutputSettings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings, OutputSettings::default());
        assert!(settings.include_manifest);
    }

    #[test]
    fn csv_fields_are_quoted_when_needed() {
        assert_eq!(csv_field("plain"), "plain");
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
    }
}
