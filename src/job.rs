//! Job records, the status state machine, and the job store interface.
//!
//! A [`Job`] identifies one processing run: a source, an operator-authored
//! mask, output settings, and a [`JobStatus`] that advances through a fixed
//! state machine. The pipeline depends only on the narrow [`JobStore`] trait,
//! not on any specific persistence technology; [`InMemoryJobStore`] is the
//! reference implementation used by the CLI and tests.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::OccludeError;
use crate::mask::Mask;
use crate::output::OutputSettings;
use crate::progress::ProcessingProgress;

/// What kind of media a job processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// A single video file or multi-frame DICOM file.
    Video,
    /// A batch of still image files, each treated as one frame.
    Images,
}

/// The job state machine.
///
/// Linear progression is `Uploaded → Extracting → Ready → Processing →
/// Exporting → Completed`; any state may transition to `Failed` on an
/// unrecoverable error. `Extracting` and `Ready` apply to the decode-ahead
/// strategy for video/DICOM sources; image jobs enter `Ready` immediately
/// since no decode-ahead is needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Source received, nothing decoded yet.
    Uploaded,
    /// Reference frame / metadata extraction in progress.
    Extracting,
    /// Reference frame available, awaiting mask + processing request.
    Ready,
    /// Frames are being masked.
    Processing,
    /// Results are being assembled into the output archive.
    Exporting,
    /// Terminal success state; the artifact path is set.
    Completed,
    /// Terminal failure state; the error message is set.
    Failed,
}

impl JobStatus {
    /// Whether the state machine permits moving from `self` to `next`.
    ///
    /// `Failed` is reachable from every non-terminal state. `Uploaded` may
    /// skip straight to `Ready` (image jobs have no extraction stage).
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Completed, _) | (Failed, _) => false,
            (_, Failed) => true,
            (Uploaded, Extracting) | (Uploaded, Ready) => true,
            (Extracting, Ready) => true,
            (Ready, Processing) => true,
            (Processing, Exporting) => true,
            (Exporting, Completed) => true,
            _ => false,
        }
    }

    /// `true` for `Completed` and `Failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// One processing run.
///
/// Owned exclusively by the batch scheduler for mutation once the run
/// starts; observers read it through the [`JobStore`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique job identifier.
    pub id: String,
    /// What kind of media this job processes.
    pub source: SourceKind,
    /// Source file path(s). One entry for video/DICOM, one per image
    /// for image batches.
    pub source_paths: Vec<PathBuf>,
    /// Native frame width in pixels (0 until metadata extraction).
    pub width: u32,
    /// Native frame height in pixels (0 until metadata extraction).
    pub height: u32,
    /// Native frame rate (0.0 for image batches).
    pub frame_rate: f64,
    /// Total frame count (0 until metadata extraction).
    pub total_frames: u64,
    /// Current position in the state machine.
    pub status: JobStatus,
    /// The mask to apply, captured at submission.
    pub mask: Option<Mask>,
    /// Output settings, captured at submission.
    pub output: Option<OutputSettings>,
    /// Human-readable failure reason, set when `status` is `Failed`.
    pub error_message: Option<String>,
    /// Path of the produced archive, set when `status` is `Completed`.
    pub artifact_path: Option<PathBuf>,
}

impl Job {
    /// Create a freshly-uploaded job with unknown geometry.
    pub fn new(id: impl Into<String>, source: SourceKind, source_paths: Vec<PathBuf>) -> Self {
        Self {
            id: id.into(),
            source,
            source_paths,
            width: 0,
            height: 0,
            frame_rate: 0.0,
            total_frames: 0,
            status: JobStatus::Uploaded,
            mask: None,
            output: None,
            error_message: None,
            artifact_path: None,
        }
    }
}

/// A partial update applied to a stored job.
///
/// `None` fields are left untouched. Status changes are validated against the
/// state machine by the store.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    /// New status, validated via [`JobStatus::can_transition_to`].
    pub status: Option<JobStatus>,
    /// Native geometry discovered during extraction.
    pub dimensions: Option<(u32, u32)>,
    /// Frame rate discovered during extraction.
    pub frame_rate: Option<f64>,
    /// Total frame count discovered during extraction.
    pub total_frames: Option<u64>,
    /// Mask captured at submission.
    pub mask: Option<Mask>,
    /// Output settings captured at submission.
    pub output: Option<OutputSettings>,
    /// Failure reason.
    pub error_message: Option<String>,
    /// Produced archive path.
    pub artifact_path: Option<PathBuf>,
}

/// Lifecycle of one persisted frame batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    /// Created, not yet started.
    Pending,
    /// Frames in this batch are being decoded/masked.
    Processing,
    /// All frames in this batch produced results.
    Completed,
    /// The batch was abandoned due to a job-level failure.
    Failed,
}

/// A persisted record of one sequential frame batch.
///
/// Batch records exist for decode grouping and observability; the smaller
/// volumetric sub-batches inside each batch are not persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameBatchRecord {
    /// Owning job.
    pub job_id: String,
    /// Zero-based batch index within the job.
    pub batch_index: usize,
    /// First frame in the batch (inclusive).
    pub start_frame: u64,
    /// Last frame in the batch (exclusive).
    pub end_frame: u64,
    /// Current batch lifecycle state.
    pub status: BatchStatus,
}

/// The narrow persistence interface the pipeline depends on.
///
/// Implementations must be [`Send`] + [`Sync`]; the scheduler calls into the
/// store from the thread driving the run.
pub trait JobStore: Send + Sync {
    /// Persist a new job. Fails if the id already exists.
    fn create_job(&self, job: Job) -> Result<(), OccludeError>;

    /// Fetch a job by id.
    fn get_job(&self, id: &str) -> Result<Job, OccludeError>;

    /// Apply a partial update to a job.
    ///
    /// # Errors
    ///
    /// [`OccludeError::JobNotFound`] for unknown ids and
    /// [`OccludeError::InvalidTransition`] for status changes the state
    /// machine forbids.
    fn update_job(&self, id: &str, update: JobUpdate) -> Result<(), OccludeError>;

    /// Persist a new frame batch record.
    fn create_batch_record(&self, record: FrameBatchRecord) -> Result<(), OccludeError>;

    /// Update the status of an existing frame batch record.
    fn update_batch_record(
        &self,
        job_id: &str,
        batch_index: usize,
        status: BatchStatus,
    ) -> Result<(), OccludeError>;

    /// Read the latest progress snapshot for a job, if any was recorded.
    fn get_progress(&self, id: &str) -> Option<ProcessingProgress>;

    /// Record the latest progress snapshot for a job.
    fn update_progress(&self, id: &str, progress: ProcessingProgress) -> Result<(), OccludeError>;
}

/// Mutex-guarded in-memory [`JobStore`].
///
/// Suitable for the CLI, tests, and single-process embedding. Progress
/// snapshots stored here are as ephemeral as the process.
#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<String, Job>>,
    batches: Mutex<HashMap<String, Vec<FrameBatchRecord>>>,
    progress: Mutex<HashMap<String, ProcessingProgress>>,
}

impl InMemoryJobStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// All batch records for a job, in creation order.
    pub fn batch_records(&self, job_id: &str) -> Vec<FrameBatchRecord> {
        self.batches
            .lock()
            .unwrap()
            .get(job_id)
            .cloned()
            .unwrap_or_default()
    }
}

impl JobStore for InMemoryJobStore {
    fn create_job(&self, job: Job) -> Result<(), OccludeError> {
        let mut jobs = self.jobs.lock().unwrap();
        if jobs.contains_key(&job.id) {
            return Err(OccludeError::JobExists(job.id));
        }
        jobs.insert(job.id.clone(), job);
        Ok(())
    }

    fn get_job(&self, id: &str) -> Result<Job, OccludeError> {
        self.jobs
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| OccludeError::JobNotFound(id.to_string()))
    }

    fn update_job(&self, id: &str, update: JobUpdate) -> Result<(), OccludeError> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| OccludeError::JobNotFound(id.to_string()))?;

        if let Some(status) = update.status {
            if !job.status.can_transition_to(status) {
                return Err(OccludeError::InvalidTransition {
                    from: job.status,
                    to: status,
                });
            }
            job.status = status;
        }
        if let Some((width, height)) = update.dimensions {
            job.width = width;
            job.height = height;
        }
        if let Some(frame_rate) = update.frame_rate {
            job.frame_rate = frame_rate;
        }
        if let Some(total_frames) = update.total_frames {
            job.total_frames = total_frames;
        }
        if let Some(mask) = update.mask {
            job.mask = Some(mask);
        }
        if let Some(output) = update.output {
            job.output = Some(output);
        }
        if let Some(message) = update.error_message {
            job.error_message = Some(message);
        }
        if let Some(path) = update.artifact_path {
            job.artifact_path = Some(path);
        }
        Ok(())
    }

    fn create_batch_record(&self, record: FrameBatchRecord) -> Result<(), OccludeError> {
        self.batches
            .lock()
            .unwrap()
            .entry(record.job_id.clone())
            .or_default()
            .push(record);
        Ok(())
    }

    fn update_batch_record(
        &self,
        job_id: &str,
        batch_index: usize,
        status: BatchStatus,
    ) -> Result<(), OccludeError> {
        let mut batches = self.batches.lock().unwrap();
        let records = batches
            .get_mut(job_id)
            .ok_or_else(|| OccludeError::JobNotFound(job_id.to_string()))?;
        let record = records
            .iter_mut()
            .find(|record| record.batch_index == batch_index)
            .ok_or_else(|| OccludeError::JobNotFound(format!("{job_id}/batch {batch_index}")))?;
        record.status = status;
        Ok(())
    }

    fn get_progress(&self, id: &str) -> Option<ProcessingProgress> {
        self.progress.lock().unwrap().get(id).cloned()
    }

    fn update_progress(&self, id: &str, progress: ProcessingProgress) -> Result<(), OccludeError> {
        self.progress
            .lock()
            .unwrap()
            .insert(id.to_string(), progress);
        Ok(())
    }
}
