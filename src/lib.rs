//! # occlude
//!
//! Apply spatial redaction masks to video, DICOM series, and image batches.
//!
//! `occlude` takes a mask an operator drew on a reference frame in a display
//! canvas, maps it into each frame's native pixel space, blackens the masked
//! region destructively, and packages the windowed, resized results into a
//! ZIP archive. Video decoding is powered by FFmpeg via the
//! [`ffmpeg-next`](https://crates.io/crates/ffmpeg-next) crate; multi-frame
//! DICOM files are read directly, with modality-aware windowing down to
//! 8-bit display values.
//!
//! ## Quick Start
//!
//! ### Mask a Video
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use occlude::{
//!     BatchScheduler, CancellationToken, InMemoryJobStore, Job, JobStore, Mask,
//!     MaskShape, NoOpProgressChannel, RectSpec,
//! };
//!
//! let store = Arc::new(InMemoryJobStore::new());
//! let spec = occlude::source::sniff("input.mp4").unwrap();
//!
//! let mut job = Job::new("job-1", spec.kind(), spec.paths());
//! job.mask = Some(Mask {
//!     shape: MaskShape::Rectangle {
//!         rect: RectSpec::Fractions([0.25, 0.25, 0.5, 0.5]),
//!     },
//!     opacity: 100,
//!     feather: 0.0,
//!     raster: None,
//!     display: None,
//! });
//! store.create_job(job).unwrap();
//!
//! let scheduler = BatchScheduler::new(store, Arc::new(NoOpProgressChannel));
//! let mut source = occlude::source::open(&spec).unwrap();
//! let artifact = scheduler
//!     .run("job-1", source.as_mut(), "output.zip".as_ref(), &CancellationToken::new())
//!     .unwrap();
//! println!("archive written to {}", artifact.display());
//! ```
//!
//! ### Rasterize a Mask by Hand
//!
//! ```
//! use occlude::{MarkerThresholds, Mask, MaskShape, RectSpec, rasterize};
//!
//! let mask = Mask {
//!     shape: MaskShape::Rectangle {
//!         rect: RectSpec::Pixels { x: 10.0, y: 10.0, width: 20.0, height: 20.0 },
//!     },
//!     opacity: 100,
//!     feather: 0.0,
//!     raster: None,
//!     display: None,
//! };
//! let opacity = rasterize(&mask, 100, 100, &MarkerThresholds::default()).unwrap();
//! assert_eq!(opacity.masked_count(), 400);
//! ```
//!
//! ## Features
//!
//! - **Frame sources** — standard video containers via FFmpeg, uncompressed
//!   multi-frame DICOM files (signature-detected, never by extension), and
//!   still-image batches, all behind one [`FrameSource`] trait
//! - **Display-space masks** — rectangle, circle, polygon, and freeform
//!   shapes in both legacy fractional and absolute-pixel encodings, plus
//!   pre-rendered raster payloads classified by red-marker heuristic
//! - **Coordinate mapping** — removes the canvas "contain" letterbox and
//!   maps mask geometry directly onto each frame's pixels
//! - **Medical windowing** — explicit WindowCenter/WindowWidth, modality
//!   presets, or auto min/max normalization of 16-bit samples
//! - **Batch scheduling** — sequential batches with persisted records,
//!   memory-bounded volumetric sub-batches, parallel masking with a logged
//!   sequential fallback tier, per-sub-batch progress and ETA
//! - **Destructive redaction** — masked pixels become black; never a blend
//! - **Output policies** — original/preset/exact sizing, stretch, letterbox,
//!   and crop fit modes, PNG or JPEG encoding
//! - **Archive assembly** — `frames/frame_{:06}` or `images/image_{:03}_*`
//!   entries plus an optional `metadata.csv` manifest
//! - **Progress & cancellation** — a [`ProgressChannel`] publish interface
//!   and cooperative [`CancellationToken`] checked between sub-batches
//! - **Worker pool** — an explicit fixed-size OS-thread pool with per-task
//!   correlation ids, as an alternative to the rayon tier
//!
//! ### Optional Features
//!
//! | Feature | Description |
//! |---------|-------------|
//! | `async` | [`ResultStream`] for consuming masked frames via Tokio |
//!
//! ## Requirements
//!
//! FFmpeg development libraries must be installed on your system. See the
//! [README](https://github.com/skanderjeddi/occlude#installation) for
//! platform-specific instructions.
//!
//! ## Known Gaps
//!
//! Progress snapshots are ephemeral: a process restart mid-job loses them,
//! and the [`JobStore`]'s last-known [`JobStatus`] is the durable record.
//! Runs are not resumable from a checkpoint.

pub mod error;
pub mod job;
pub mod mask;
pub mod operator;
pub mod output;
pub mod progress;
pub mod rasterize;
pub mod scheduler;
pub mod source;
#[cfg(feature = "async")]
pub mod stream;
pub mod transform;
pub mod worker;

pub use error::OccludeError;
pub use job::{
    BatchStatus, FrameBatchRecord, InMemoryJobStore, Job, JobStatus, JobStore, JobUpdate,
    SourceKind,
};
pub use mask::{
    CircleSpec, DisplayMetadata, DisplayPlacement, Mask, MaskShape, PixelRect, PointSpec,
    RectSpec, ResolvedShape,
};
pub use operator::{FrameResult, apply_fit, apply_mask};
pub use output::{FitMode, OutputFormat, OutputSettings, SizePolicy, write_archive};
pub use progress::{
    CancellationToken, NoOpProgressChannel, ProcessingProgress, ProgressChannel, ProgressTracker,
};
pub use rasterize::{MarkerThresholds, OpacityBuffer, rasterize};
pub use scheduler::{BatchScheduler, SchedulerConfig};
pub use source::{
    DicomSource, FrameSource, ImagesSource, SourceMetadata, SourceSpec, VideoSource,
    placeholder_frame,
};
#[cfg(feature = "async")]
pub use stream::ResultStream;
pub use transform::TransformMatrix;
pub use worker::{MaskTask, TaskReceipt, WorkerPool};
