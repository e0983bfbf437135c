//! Fixed-size worker pool for CPU-bound masking.
//!
//! An alternative execution strategy to the scheduler's rayon tier, for
//! embedders that want true OS-thread isolation with explicit lifecycle
//! control. Workers consume a FIFO task queue; every task carries a
//! correlation id and its own result channel, so results are matched back
//! to callers explicitly rather than by position or ambient listeners.
//!
//! A task that panics poisons nothing: the panic is caught inside the
//! worker, converted to a failed [`FrameResult`], and the worker moves on
//! to the next task. Shutdown is explicit and joins every worker.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use occlude::{
//!     Mask, MaskShape, MaskTask, MarkerThresholds, OutputSettings, RectSpec,
//!     WorkerPool, rasterize,
//! };
//!
//! let mask = Mask {
//!     shape: MaskShape::Rectangle {
//!         rect: RectSpec::Fractions([0.25, 0.25, 0.5, 0.5]),
//!     },
//!     opacity: 100,
//!     feather: 0.0,
//!     raster: None,
//!     display: None,
//! };
//! let opacity = Arc::new(rasterize(&mask, 32, 32, &MarkerThresholds::default()).unwrap());
//!
//! let pool = WorkerPool::new(2);
//! let receipt = pool.submit(MaskTask {
//!     frame_number: 0,
//!     image: image::DynamicImage::new_rgb8(32, 32),
//!     opacity,
//!     settings: OutputSettings::default(),
//! });
//! let result = receipt.recv().unwrap();
//! assert!(result.success);
//! pool.shutdown();
//! ```

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use image::DynamicImage;

use crate::operator::{FrameResult, apply_mask};
use crate::output::OutputSettings;
use crate::rasterize::OpacityBuffer;

/// One unit of masking work.
pub struct MaskTask {
    /// The frame this task processes.
    pub frame_number: u64,
    /// The decoded frame.
    pub image: DynamicImage,
    /// Shared opacity buffer for the frame's size.
    pub opacity: Arc<OpacityBuffer>,
    /// Output settings for the run.
    pub settings: OutputSettings,
}

/// A claim on one submitted task's result.
pub struct TaskReceipt {
    /// The id assigned at submission; echoed back with the result.
    pub correlation_id: u64,
    receiver: Receiver<(u64, FrameResult)>,
}

impl TaskReceipt {
    /// Block until the task's result arrives.
    ///
    /// Returns `None` if the pool shut down before the task ran.
    pub fn recv(self) -> Option<FrameResult> {
        match self.receiver.recv() {
            Ok((correlation_id, result)) => {
                debug_assert_eq!(correlation_id, self.correlation_id);
                Some(result)
            }
            Err(_) => None,
        }
    }
}

enum WorkerMessage {
    Task {
        correlation_id: u64,
        task: Box<MaskTask>,
        reply: Sender<(u64, FrameResult)>,
    },
    Shutdown,
}

/// A fixed set of worker threads consuming a FIFO task queue.
pub struct WorkerPool {
    task_sender: Sender<WorkerMessage>,
    workers: Vec<JoinHandle<()>>,
    next_correlation_id: AtomicU64,
}

impl WorkerPool {
    /// Spawn `size` workers (minimum 1).
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let (task_sender, task_receiver) = unbounded::<WorkerMessage>();

        let workers = (0..size)
            .map(|worker_index| {
                let receiver = task_receiver.clone();
                std::thread::Builder::new()
                    .name(format!("occlude-worker-{worker_index}"))
                    .spawn(move || worker_loop(worker_index, receiver))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        log::debug!("Worker pool started with {size} worker(s)");

        Self {
            task_sender,
            workers,
            next_correlation_id: AtomicU64::new(0),
        }
    }

    /// Enqueue a task and return a receipt for its result.
    ///
    /// Tasks are dispatched in submission order; results arrive whenever
    /// the executing worker finishes, matched via the correlation id.
    pub fn submit(&self, task: MaskTask) -> TaskReceipt {
        let correlation_id = self.next_correlation_id.fetch_add(1, Ordering::Relaxed);
        let (reply, receiver) = bounded(1);

        // Send only fails after shutdown, in which case the receipt's
        // receiver reports the disconnect.
        let _ = self.task_sender.send(WorkerMessage::Task {
            correlation_id,
            task: Box::new(task),
            reply,
        });

        TaskReceipt {
            correlation_id,
            receiver,
        }
    }

    /// Stop accepting work, let queued tasks finish, and join all workers.
    pub fn shutdown(self) {
        for _ in 0..self.workers.len() {
            let _ = self.task_sender.send(WorkerMessage::Shutdown);
        }
        drop(self.task_sender);
        for worker in self.workers {
            if worker.join().is_err() {
                log::error!("Worker thread terminated abnormally during shutdown");
            }
        }
    }
}

fn worker_loop(worker_index: usize, receiver: Receiver<WorkerMessage>) {
    while let Ok(message) = receiver.recv() {
        match message {
            WorkerMessage::Task {
                correlation_id,
                task,
                reply,
            } => {
                let frame_number = task.frame_number;
                let result = catch_unwind(AssertUnwindSafe(|| {
                    apply_mask(frame_number, &task.image, &task.opacity, &task.settings)
                }))
                .unwrap_or_else(|_| {
                    log::error!(
                        "Worker {worker_index} caught a panic masking frame {frame_number}"
                    );
                    FrameResult::failed(frame_number, "panic during masking")
                });
                // The caller may have dropped the receipt; that is fine.
                let _ = reply.send((correlation_id, result));
            }
            WorkerMessage::Shutdown => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mask::{Mask, MaskShape, RectSpec};
    use crate::rasterize::{MarkerThresholds, rasterize};

    fn test_opacity(size: u32) -> Arc<OpacityBuffer> {
        let mask = Mask {
            shape: MaskShape::Rectangle {
                rect: RectSpec::Fractions([0.0, 0.0, 0.5, 0.5]),
            },
            opacity: 100,
            feather: 0.0,
            raster: None,
            display: None,
        };
        Arc::new(rasterize(&mask, size, size, &MarkerThresholds::default()).unwrap())
    }

    #[test]
    fn results_match_by_correlation_not_position() {
        let pool = WorkerPool::new(4);
        let opacity = test_opacity(16);

        let receipts: Vec<TaskReceipt> = (0..16)
            .map(|frame_number| {
                pool.submit(MaskTask {
                    frame_number,
                    image: DynamicImage::new_rgb8(16, 16),
                    opacity: Arc::clone(&opacity),
                    settings: OutputSettings::default(),
                })
            })
            .collect();

        for (expected, receipt) in receipts.into_iter().enumerate() {
            let result = receipt.recv().unwrap();
            assert!(result.success);
            assert_eq!(result.frame_number, expected as u64);
        }

        pool.shutdown();
    }

    #[test]
    fn failing_task_does_not_poison_the_pool() {
        let pool = WorkerPool::new(1);
        let opacity = test_opacity(16);

        // A frame whose size disagrees with the buffer fails its own task...
        let bad = pool.submit(MaskTask {
            frame_number: 0,
            image: DynamicImage::new_rgb8(8, 8),
            opacity: Arc::clone(&opacity),
            settings: OutputSettings::default(),
        });
        // ...while the next task on the same worker still succeeds.
        let good = pool.submit(MaskTask {
            frame_number: 1,
            image: DynamicImage::new_rgb8(16, 16),
            opacity,
            settings: OutputSettings::default(),
        });

        assert!(!bad.recv().unwrap().success);
        assert!(good.recv().unwrap().success);
        pool.shutdown();
    }

    #[test]
    fn correlation_ids_are_unique_and_increasing() {
        let pool = WorkerPool::new(2);
        let opacity = test_opacity(8);
        let first = pool.submit(MaskTask {
            frame_number: 0,
            image: DynamicImage::new_rgb8(8, 8),
            opacity: Arc::clone(&opacity),
            settings: OutputSettings::default(),
        });
        let second = pool.submit(MaskTask {
            frame_number: 1,
            image: DynamicImage::new_rgb8(8, 8),
            opacity,
            settings: OutputSettings::default(),
        });
        assert!(second.correlation_id > first.correlation_id);
        let _ = first.recv();
        let _ = second.recv();
        pool.shutdown();
    }
}
