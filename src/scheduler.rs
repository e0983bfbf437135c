//! Batch scheduling and job orchestration.
//!
//! [`BatchScheduler`] drives one processing run end to end: it partitions
//! the frame space into sequential batches (persisted as batch records) and
//! smaller volumetric sub-batches (the unit of memory-bounded parallel
//! masking), decodes each sub-batch, rasterizes the mask once per distinct
//! frame size, dispatches masking across rayon threads with a sequential
//! fallback tier, emits progress after every sub-batch, and finally sorts
//! results by frame number and hands them to archive assembly.
//!
//! All mutable per-run state — most importantly the opacity-buffer cache —
//! lives in a [`JobContext`] owned by the run. Nothing is shared across
//! jobs.

use std::collections::{BTreeMap, HashMap};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::DynamicImage;
use rayon::prelude::*;

use crate::error::OccludeError;
use crate::job::{BatchStatus, FrameBatchRecord, JobStatus, JobStore, JobUpdate, SourceKind};
use crate::mask::Mask;
use crate::operator::{FrameResult, apply_mask};
use crate::output::{OutputSettings, write_archive};
use crate::progress::{CancellationToken, ProcessingProgress, ProgressChannel, ProgressTracker};
use crate::rasterize::{MarkerThresholds, OpacityBuffer, rasterize};
use crate::source::FrameSource;

/// Tuning knobs for a processing run.
///
/// `batch_size` controls decode grouping and the granularity of persisted
/// batch records; `sub_batch_size` bounds how many decoded frames are
/// resident at once and is intentionally independent of (and smaller than)
/// the batch size.
#[derive(Debug, Clone)]
#[must_use]
pub struct SchedulerConfig {
    /// Frames per sequential batch. Defaults to 50.
    pub batch_size: usize,
    /// Frames per volumetric sub-batch. Defaults to 8.
    pub sub_batch_size: usize,
    /// Whether to attempt the parallel masking tier. Defaults to `true`.
    pub parallel: bool,
    /// Red-marker classification thresholds for raster payloads.
    pub thresholds: MarkerThresholds,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            sub_batch_size: 8,
            parallel: true,
            thresholds: MarkerThresholds::default(),
        }
    }
}

impl SchedulerConfig {
    /// Create the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the sequential batch size (minimum 1).
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Set the volumetric sub-batch size (minimum 1).
    pub fn with_sub_batch_size(mut self, size: usize) -> Self {
        self.sub_batch_size = size.max(1);
        self
    }

    /// Enable or disable the parallel masking tier.
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Override the raster-payload classification thresholds.
    pub fn with_thresholds(mut self, thresholds: MarkerThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }
}

/// Per-run mutable state, owned by the scheduler for the lifetime of one
/// run and dropped with it.
pub(crate) struct JobContext {
    /// Opacity buffers keyed by frame size: written once per distinct size,
    /// read by every frame of that size.
    opacity_cache: HashMap<(u32, u32), Arc<OpacityBuffer>>,
}

impl JobContext {
    pub(crate) fn new() -> Self {
        Self {
            opacity_cache: HashMap::new(),
        }
    }

    pub(crate) fn opacity_for(
        &mut self,
        mask: &Mask,
        width: u32,
        height: u32,
        thresholds: &MarkerThresholds,
    ) -> Result<Arc<OpacityBuffer>, OccludeError> {
        if let Some(buffer) = self.opacity_cache.get(&(width, height)) {
            return Ok(Arc::clone(buffer));
        }
        log::debug!("Rasterizing mask for frame size {width}x{height}");
        let buffer = Arc::new(rasterize(mask, width, height, thresholds)?);
        self.opacity_cache
            .insert((width, height), Arc::clone(&buffer));
        Ok(buffer)
    }
}

/// Drives jobs through decode → mask → assemble.
pub struct BatchScheduler<S: JobStore> {
    store: Arc<S>,
    channel: Arc<dyn ProgressChannel>,
    config: SchedulerConfig,
}

impl<S: JobStore> BatchScheduler<S> {
    /// Create a scheduler with default configuration.
    pub fn new(store: Arc<S>, channel: Arc<dyn ProgressChannel>) -> Self {
        Self {
            store,
            channel,
            config: SchedulerConfig::default(),
        }
    }

    /// Replace the scheduler configuration.
    #[must_use]
    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Process every frame of `source` under the job's mask and output
    /// settings, writing the archive to `archive_path`.
    ///
    /// The mask and output settings are read from the job record once at
    /// the start and are immutable for the duration of the run.
    /// Cancellation is checked between sub-batches; a cancelled run
    /// discards partial results and leaves the job `Failed`.
    ///
    /// # Errors
    ///
    /// Job-level failures ([`OccludeError::DimensionMismatch`],
    /// [`OccludeError::Cancelled`], source/store errors) mark the job
    /// `Failed` with a human-readable message, emit a final progress event,
    /// and are returned to the caller. Per-frame failures never surface
    /// here; they become placeholder results.
    pub fn run(
        &self,
        job_id: &str,
        source: &mut dyn FrameSource,
        archive_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, OccludeError> {
        match self.run_inner(job_id, source, archive_path, cancel) {
            Ok(path) => Ok(path),
            Err(error) => {
                self.fail_job(job_id, &error);
                Err(error)
            }
        }
    }

    fn run_inner(
        &self,
        job_id: &str,
        source: &mut dyn FrameSource,
        archive_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, OccludeError> {
        let job = self.store.get_job(job_id)?;
        let mask = job.mask.clone().ok_or(OccludeError::MissingMask)?;
        let settings = job.output.clone().unwrap_or_default();

        // Metadata extraction. Image jobs skip the decode-ahead stage and
        // go straight to Ready.
        if job.status == JobStatus::Uploaded {
            if job.source == SourceKind::Video {
                self.transition(job_id, JobStatus::Extracting, 0)?;
            }
        }
        let metadata = source.metadata()?;
        let total = metadata.total_frames;
        self.store.update_job(
            job_id,
            JobUpdate {
                dimensions: Some((metadata.width, metadata.height)),
                frame_rate: Some(metadata.frame_rate),
                total_frames: Some(total),
                ..JobUpdate::default()
            },
        )?;
        if self.store.get_job(job_id)?.status != JobStatus::Ready {
            self.transition(job_id, JobStatus::Ready, total)?;
        }
        self.transition(job_id, JobStatus::Processing, total)?;

        let reference = (metadata.width, metadata.height);
        let mut context = JobContext::new();
        let mut tracker = ProgressTracker::new(total);
        let mut results: Vec<FrameResult> = Vec::with_capacity(total as usize);

        let batch_size = self.config.batch_size as u64;
        let sub_batch_size = self.config.sub_batch_size as u64;

        let mut batch_index = 0usize;
        let mut batch_start = 0u64;
        while batch_start < total {
            let batch_end = (batch_start + batch_size).min(total);
            self.store.create_batch_record(FrameBatchRecord {
                job_id: job_id.to_string(),
                batch_index,
                start_frame: batch_start,
                end_frame: batch_end,
                status: BatchStatus::Processing,
            })?;

            let mut sub_start = batch_start;
            while sub_start < batch_end {
                if cancel.is_cancelled() {
                    log::info!("Job {job_id} cancelled at frame {sub_start}");
                    return Err(OccludeError::Cancelled);
                }
                let sub_end = (sub_start + sub_batch_size).min(batch_end);

                let frames = source.frames(sub_start, sub_end)?;
                for (frame_number, image) in &frames {
                    let actual = (image.width(), image.height());
                    if actual != reference {
                        return Err(OccludeError::DimensionMismatch {
                            frame_number: *frame_number,
                            expected_width: reference.0,
                            expected_height: reference.1,
                            actual_width: actual.0,
                            actual_height: actual.1,
                        });
                    }
                }

                let opacity =
                    context.opacity_for(&mask, reference.0, reference.1, &self.config.thresholds)?;

                let sub_results =
                    mask_sub_batch(frames, &opacity, &settings, self.config.parallel);

                let highest = sub_results
                    .iter()
                    .map(|result| result.frame_number)
                    .max()
                    .unwrap_or(sub_start);
                tracker.advance(sub_results.len() as u64, highest);
                results.extend(sub_results);

                let progress = tracker.snapshot(JobStatus::Processing);
                self.store.update_progress(job_id, progress.clone())?;
                self.channel.emit(job_id, &progress);

                sub_start = sub_end;
            }

            self.store
                .update_batch_record(job_id, batch_index, BatchStatus::Completed)?;
            batch_index += 1;
            batch_start = batch_end;
        }

        // Completion order is not ordering-significant: restore frame order
        // and guarantee index continuity with placeholders for any gap.
        let mut ordered: BTreeMap<u64, FrameResult> = BTreeMap::new();
        for result in results {
            ordered.entry(result.frame_number).or_insert(result);
        }
        let final_results: Vec<FrameResult> = (0..total)
            .map(|frame_number| {
                ordered
                    .remove(&frame_number)
                    .unwrap_or_else(|| FrameResult::failed(frame_number, "no result produced"))
            })
            .collect();

        self.transition(job_id, JobStatus::Exporting, total)?;
        let job = self.store.get_job(job_id)?;
        let artifact = write_archive(archive_path, &job, &final_results, &settings)?;

        self.store.update_job(
            job_id,
            JobUpdate {
                status: Some(JobStatus::Completed),
                artifact_path: Some(artifact.clone()),
                ..JobUpdate::default()
            },
        )?;
        let mut progress = tracker.snapshot(JobStatus::Completed);
        progress.percent = 100.0;
        self.store.update_progress(job_id, progress.clone())?;
        self.channel.emit(job_id, &progress);

        log::info!(
            "Job {job_id} completed: {} frames -> {}",
            total,
            artifact.display()
        );
        Ok(artifact)
    }

    /// Move the job to `status` and publish the transition.
    fn transition(
        &self,
        job_id: &str,
        status: JobStatus,
        total: u64,
    ) -> Result<(), OccludeError> {
        self.store.update_job(
            job_id,
            JobUpdate {
                status: Some(status),
                ..JobUpdate::default()
            },
        )?;
        self.channel
            .emit(job_id, &ProcessingProgress::at_stage(status, total));
        Ok(())
    }

    /// Mark the job failed and publish the terminal state. Store errors at
    /// this point are logged, not propagated — the original failure wins.
    fn fail_job(&self, job_id: &str, error: &OccludeError) {
        let message = error.to_string();
        log::error!("Job {job_id} failed: {message}");

        let update = JobUpdate {
            status: Some(JobStatus::Failed),
            error_message: Some(message.clone()),
            ..JobUpdate::default()
        };
        if let Err(store_error) = self.store.update_job(job_id, update) {
            log::error!("Could not record failure for job {job_id}: {store_error}");
        }

        let total = self
            .store
            .get_job(job_id)
            .map(|job| job.total_frames)
            .unwrap_or(0);
        let mut progress = ProcessingProgress::at_stage(JobStatus::Failed, total);
        progress.error_message = Some(message);
        let _ = self.store.update_progress(job_id, progress.clone());
        self.channel.emit(job_id, &progress);
    }
}

/// Mask one volumetric sub-batch under the two-tier execution policy.
///
/// The parallel tier dispatches the whole sub-batch across rayon threads;
/// if it panics, the sequential tier retries frame by frame so a single bad
/// frame is isolated from the rest of the sub-batch. Which tier produced
/// the results is logged.
pub(crate) fn mask_sub_batch(
    frames: Vec<(u64, DynamicImage)>,
    opacity: &Arc<OpacityBuffer>,
    settings: &OutputSettings,
    parallel: bool,
) -> Vec<FrameResult> {
    if frames.is_empty() {
        return Vec::new();
    }
    let first = frames[0].0;
    let last = frames[frames.len() - 1].0;

    if parallel {
        let attempt = catch_unwind(AssertUnwindSafe(|| {
            frames
                .par_iter()
                .map(|(frame_number, image)| apply_mask(*frame_number, image, opacity, settings))
                .collect::<Vec<_>>()
        }));
        match attempt {
            Ok(results) => {
                log::debug!("Sub-batch {first}..={last} masked on the parallel tier");
                return results;
            }
            Err(_) => {
                log::warn!(
                    "Parallel tier panicked for sub-batch {first}..={last}; \
                     retrying sequentially"
                );
            }
        }
    }

    let results = frames
        .iter()
        .map(|(frame_number, image)| {
            catch_unwind(AssertUnwindSafe(|| {
                apply_mask(*frame_number, image, opacity, settings)
            }))
            .unwrap_or_else(|_| {
                log::error!("Masking frame {frame_number} panicked");
                FrameResult::failed(*frame_number, "panic during masking")
            })
        })
        .collect();
    log::debug!("Sub-batch {first}..={last} masked on the sequential tier");
    results
}
