//! Progress reporting and cancellation support.
//!
//! This module provides [`ProcessingProgress`] snapshots keyed by job id,
//! [`ProgressChannel`] for publishing them to real-time observers,
//! [`ProgressTracker`] for computing throughput and ETA, and
//! [`CancellationToken`] for cooperative cancellation.
//!
//! Progress is ephemeral: it lives in memory for the duration of one run and
//! is not reconstructed after a process restart. The job store retains the
//! last-known [`JobStatus`](crate::JobStatus) as the durable record.
//!
//! # Example
//!
//! ```
//! use occlude::{JobStatus, ProcessingProgress, ProgressChannel};
//!
//! struct PrintProgress;
//!
//! impl ProgressChannel for PrintProgress {
//!     fn emit(&self, job_id: &str, progress: &ProcessingProgress) {
//!         println!("[{job_id}] {:.1}% complete", progress.percent);
//!     }
//! }
//! ```

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::job::JobStatus;

/// A snapshot of processing progress for one job.
///
/// Published through a [`ProgressChannel`] after every volumetric sub-batch
/// and on every job state transition. Throughput and ETA are derived from the
/// wall-clock time elapsed since processing started.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingProgress {
    /// The job state the pipeline is currently in.
    pub stage: JobStatus,
    /// Completion percentage (0.0 – 100.0).
    pub percent: f32,
    /// The highest frame number processed so far.
    pub current_frame: u64,
    /// Total frames expected for the job.
    pub total_frames: u64,
    /// Frames completed per second of wall-clock time.
    pub frames_per_second: f64,
    /// Estimated seconds remaining, based on current throughput.
    pub eta_seconds: Option<f64>,
    /// Human-readable error message, set when the job has failed.
    pub error_message: Option<String>,
}

impl ProcessingProgress {
    /// A zero-progress snapshot for a job entering `stage`.
    pub fn at_stage(stage: JobStatus, total_frames: u64) -> Self {
        Self {
            stage,
            percent: 0.0,
            current_frame: 0,
            total_frames,
            frames_per_second: 0.0,
            eta_seconds: None,
            error_message: None,
        }
    }
}

/// A publish interface for real-time progress observers.
///
/// Implementations must be [`Send`] and [`Sync`] because the scheduler may
/// emit from worker threads. Emission is **infallible** — observers watch but
/// cannot halt a run. Use [`CancellationToken`] to stop work.
pub trait ProgressChannel: Send + Sync {
    /// Called after every sub-batch and on every job state transition.
    fn emit(&self, job_id: &str, progress: &ProcessingProgress);
}

/// A no-op implementation that discards all progress notifications.
///
/// This is the default when no channel is configured.
pub struct NoOpProgressChannel;

impl ProgressChannel for NoOpProgressChannel {
    fn emit(&self, _job_id: &str, _progress: &ProcessingProgress) {}
}

/// Cooperative cancellation token backed by an [`AtomicBool`].
///
/// Clone this token and share it between threads; call
/// [`cancel`](CancellationToken::cancel) from any thread to request
/// cancellation of the associated run. The scheduler checks
/// [`is_cancelled`](CancellationToken::is_cancelled) between volumetric
/// sub-batches; a cancelled run discards partial results and leaves the job
/// in a terminal `Failed` state.
///
/// # Example
///
/// ```
/// use occlude::CancellationToken;
///
/// let token = CancellationToken::new();
/// assert!(!token.is_cancelled());
///
/// // From another thread (or a signal handler, etc.):
/// token.cancel();
/// assert!(token.is_cancelled());
/// ```
#[derive(Debug, Clone)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Create a new, non-cancelled token.
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Request cancellation.
    ///
    /// All clones of this token will observe the cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Check whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks completion counts and timing for one run and builds
/// [`ProcessingProgress`] snapshots.
pub struct ProgressTracker {
    total: u64,
    completed: u64,
    highest_frame: u64,
    start_time: Instant,
}

impl ProgressTracker {
    /// Create a tracker for a run of `total` frames. The throughput clock
    /// starts immediately.
    pub fn new(total: u64) -> Self {
        Self {
            total,
            completed: 0,
            highest_frame: 0,
            start_time: Instant::now(),
        }
    }

    /// Record `count` completed frames, the highest of which was
    /// `frame_number`.
    pub fn advance(&mut self, count: u64, frame_number: u64) {
        self.completed += count;
        self.highest_frame = self.highest_frame.max(frame_number);
    }

    /// Number of frames recorded as complete so far.
    pub fn completed(&self) -> u64 {
        self.completed
    }

    /// Build a progress snapshot for the given stage.
    ///
    /// `frames_per_second` is `completed / elapsed`; `eta_seconds` is
    /// `remaining / frames_per_second`, absent until at least one frame has
    /// completed.
    pub fn snapshot(&self, stage: JobStatus) -> ProcessingProgress {
        let elapsed = self.start_time.elapsed().as_secs_f64();

        let percent = if self.total > 0 {
            (self.completed as f32 / self.total as f32) * 100.0
        } else {
            0.0
        };

        let frames_per_second = if elapsed > 0.0 {
            self.completed as f64 / elapsed
        } else {
            0.0
        };

        let eta_seconds = if self.completed > 0 && frames_per_second > 0.0 {
            let remaining = self.total.saturating_sub(self.completed);
            Some(remaining as f64 / frames_per_second)
        } else {
            None
        };

        ProcessingProgress {
            stage,
            percent,
            current_frame: self.highest_frame,
            total_frames: self.total,
            frames_per_second,
            eta_seconds,
            error_message: None,
        }
    }
}
