//! Still-image batch sources.
//!
//! [`ImagesSource`] treats an ordered list of image files as a frame
//! sequence: file *N* is frame *N*. The first decodable file establishes
//! the reference dimensions used for placeholder substitution; actual
//! decoded dimensions are preserved so downstream geometry validation can
//! catch mismatched inputs.

use std::path::PathBuf;

use image::DynamicImage;

use crate::error::OccludeError;
use crate::source::{FrameSource, SourceMetadata, placeholder_frame};

/// A batch of still images, one frame per file.
pub struct ImagesSource {
    paths: Vec<PathBuf>,
    cached_metadata: Option<SourceMetadata>,
}

impl ImagesSource {
    /// Create a source over the given files, in input order.
    pub fn new(paths: Vec<PathBuf>) -> Self {
        Self {
            paths,
            cached_metadata: None,
        }
    }

    /// The input files backing this source.
    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    fn load(&self, index: u64) -> Result<DynamicImage, OccludeError> {
        let path = self
            .paths
            .get(index as usize)
            .ok_or(OccludeError::FrameOutOfRange {
                frame_number: index,
                total_frames: self.paths.len() as u64,
            })?;
        image::open(path).map_err(|error| OccludeError::Decode {
            frame_number: index,
            reason: format!("{}: {error}", path.display()),
        })
    }
}

impl FrameSource for ImagesSource {
    fn metadata(&mut self) -> Result<SourceMetadata, OccludeError> {
        if let Some(metadata) = self.cached_metadata.as_ref() {
            return Ok(metadata.clone());
        }

        // The first decodable image establishes the reference geometry.
        let mut dimensions = None;
        for index in 0..self.paths.len() as u64 {
            match self.load(index) {
                Ok(image) => {
                    dimensions = Some((image.width(), image.height()));
                    break;
                }
                Err(error) => {
                    log::warn!("Skipping undecodable reference candidate: {error}");
                }
            }
        }

        let (width, height) = dimensions.ok_or_else(|| OccludeError::FileOpen {
            path: self.paths.first().cloned().unwrap_or_default(),
            reason: "no decodable image in the batch".to_string(),
        })?;

        let metadata = SourceMetadata {
            width,
            height,
            frame_rate: 0.0,
            total_frames: self.paths.len() as u64,
            is_multi_frame_medical: false,
        };
        self.cached_metadata = Some(metadata.clone());
        Ok(metadata)
    }

    fn frame(&mut self, index: u64) -> Result<DynamicImage, OccludeError> {
        self.load(index)
    }

    fn frames(
        &mut self,
        start: u64,
        end: u64,
    ) -> Result<Vec<(u64, DynamicImage)>, OccludeError> {
        let metadata = self.metadata()?;
        let mut frames = Vec::with_capacity(end.saturating_sub(start) as usize);
        for index in start..end.min(self.paths.len() as u64) {
            let image = match self.load(index) {
                Ok(image) => image,
                Err(error) => {
                    log::warn!("Image {index} undecodable ({error}); substituting placeholder");
                    placeholder_frame(metadata.width, metadata.height)
                }
            };
            frames.push((index, image));
        }
        Ok(frames)
    }
}
