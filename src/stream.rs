//! Async streaming of masked frame results.
//!
//! This module provides [`ResultStream`] for asynchronously consuming
//! [`FrameResult`]s as a run produces them, without waiting for the whole
//! job or buffering every encoded frame in memory.
//!
//! Processing runs on a `tokio::task::spawn_blocking` thread — decode and
//! masking are CPU-heavy FFmpeg/raster work that must not tie up the Tokio
//! runtime's cooperative task budget. Results flow back through a bounded
//! channel; no ordering guarantee is made while processing is in flight.
//!
//! # Example
//!
//! ```no_run
//! use tokio_stream::StreamExt;
//!
//! use occlude::{
//!     CancellationToken, Mask, MaskShape, OccludeError, OutputSettings,
//!     RectSpec, ResultStream, SchedulerConfig, SourceSpec,
//! };
//!
//! # async fn example() -> Result<(), OccludeError> {
//! let mask = Mask {
//!     shape: MaskShape::Rectangle {
//!         rect: RectSpec::Fractions([0.25, 0.25, 0.5, 0.5]),
//!     },
//!     opacity: 100,
//!     feather: 0.0,
//!     raster: None,
//!     display: None,
//! };
//!
//! let mut stream = ResultStream::create(
//!     SourceSpec::Video("input.mp4".into()),
//!     mask,
//!     OutputSettings::default(),
//!     SchedulerConfig::default(),
//!     CancellationToken::new(),
//! );
//!
//! while let Some(result) = stream.next().await {
//!     let result = result?;
//!     println!("frame {} done: {}", result.frame_number, result.success);
//! }
//! # Ok(())
//! # }
//! ```

use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::mpsc::{Receiver, Sender};
use tokio::task::JoinHandle;
use tokio_stream::Stream;

use crate::error::OccludeError;
use crate::mask::Mask;
use crate::operator::FrameResult;
use crate::output::OutputSettings;
use crate::progress::CancellationToken;
use crate::scheduler::{JobContext, SchedulerConfig, mask_sub_batch};
use crate::source::{self, SourceSpec};

/// Default bounded-channel capacity for [`ResultStream`].
///
/// Kept small to avoid buffering too many encoded frames in memory.
const DEFAULT_CHANNEL_CAPACITY: usize = 8;

/// A stream of masked frame results produced by a background thread.
///
/// Implements [`tokio_stream::Stream`] so it can be used with
/// [`StreamExt`](tokio_stream::StreamExt) combinators such as `next()`,
/// `map()`, and `filter()`.
///
/// Dropping the stream closes the channel, which causes the background
/// thread to stop at the next frame boundary. Job-level failures
/// (dimension mismatch, cancellation, source errors) arrive as a final
/// `Err` item before the stream ends.
pub struct ResultStream {
    receiver: Receiver<Result<FrameResult, OccludeError>>,
    #[allow(dead_code)]
    handle: JoinHandle<()>,
}

impl ResultStream {
    /// Start processing `spec` on a blocking thread and stream the results.
    ///
    /// The source is opened inside the background thread, so the demuxer
    /// never crosses threads. Cancel via the token to end the stream early
    /// with [`OccludeError::Cancelled`].
    pub fn create(
        spec: SourceSpec,
        mask: Mask,
        settings: OutputSettings,
        config: SchedulerConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self::with_capacity(spec, mask, settings, config, cancel, None)
    }

    /// Like [`create`](ResultStream::create) with an explicit channel
    /// capacity. `None` uses the default (8).
    pub fn with_capacity(
        spec: SourceSpec,
        mask: Mask,
        settings: OutputSettings,
        config: SchedulerConfig,
        cancel: CancellationToken,
        channel_capacity: Option<usize>,
    ) -> Self {
        let capacity = channel_capacity.unwrap_or(DEFAULT_CHANNEL_CAPACITY).max(1);
        let (sender, receiver) = tokio::sync::mpsc::channel(capacity);

        let handle = tokio::task::spawn_blocking(move || {
            let result = process_blocking(&spec, &mask, &settings, &config, &cancel, &sender);
            if let Err(error) = result {
                // Try to send the error; the receiver may have been dropped.
                let _ = sender.blocking_send(Err(error));
            }
        });

        ResultStream { receiver, handle }
    }
}

impl Stream for ResultStream {
    type Item = Result<FrameResult, OccludeError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

/// Background processing loop — runs on a blocking thread.
///
/// Mirrors the scheduler's volumetric sub-batch loop without the job-store
/// bookkeeping: decode, validate geometry, rasterize per frame size, mask
/// under the two-tier policy, and push each result into the channel.
fn process_blocking(
    spec: &SourceSpec,
    mask: &Mask,
    settings: &OutputSettings,
    config: &SchedulerConfig,
    cancel: &CancellationToken,
    sender: &Sender<Result<FrameResult, OccludeError>>,
) -> Result<(), OccludeError> {
    let mut source = source::open(spec)?;
    let metadata = source.metadata()?;
    let reference = (metadata.width, metadata.height);
    let total = metadata.total_frames;

    let mut context = JobContext::new();
    let sub_batch_size = config.sub_batch_size.max(1) as u64;

    let mut sub_start = 0u64;
    while sub_start < total {
        if cancel.is_cancelled() {
            return Err(OccludeError::Cancelled);
        }
        let sub_end = (sub_start + sub_batch_size).min(total);

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

        let opacity = context.opacity_for(mask, reference.0, reference.1, &config.thresholds)?;

        for result in mask_sub_batch(frames, &opacity, settings, config.parallel) {
            sender
                .blocking_send(Ok(result))
                .map_err(|_| OccludeError::Cancelled)?;
        }

        sub_start = sub_end;
    }

    Ok(())
}
