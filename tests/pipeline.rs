//! End-to-end batch scheduling tests over still-image jobs: state
//! transitions, ordering, archive layout, and failure handling.

use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use occlude::{
    BatchScheduler, CancellationToken, ImagesSource, InMemoryJobStore, Job, JobStatus, JobStore,
    Mask, MaskShape, OccludeError, ProcessingProgress, ProgressChannel, RectSpec, SchedulerConfig,
    SourceKind,
};

/// Records every emitted progress event for later inspection.
#[derive(Default)]
struct CollectingChannel {
    events: Mutex<Vec<ProcessingProgress>>,
}

impl CollectingChannel {
    fn stages(&self) -> Vec<JobStatus> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|event| event.stage)
            .collect()
    }
}

impl ProgressChannel for CollectingChannel {
    fn emit(&self, _job_id: &str, progress: &ProcessingProgress) {
        self.events.lock().unwrap().push(progress.clone());
    }
}

fn rect_mask(fractions: [f64; 4]) -> Mask {
    Mask {
        shape: MaskShape::Rectangle {
            rect: RectSpec::Fractions(fractions),
        },
        opacity: 100,
        feather: 0.0,
        raster: None,
        display: None,
    }
}

/// Write `count` flat-colored PNGs and return their paths in frame order.
fn write_images(dir: &tempfile::TempDir, count: usize, size: (u32, u32)) -> Vec<PathBuf> {
    (0..count)
        .map(|index| {
            let path = dir.path().join(format!("input_{index:03}.png"));
            let value = (index * 20 % 256) as u8;
            image::DynamicImage::ImageRgb8(image::RgbImage::from_pixel(
                size.0,
                size.1,
                image::Rgb([value, value, value]),
            ))
            .save(&path)
            .unwrap();
            path
        })
        .collect()
}

fn images_job(store: &InMemoryJobStore, id: &str, paths: Vec<PathBuf>, mask: Mask) {
    let mut job = Job::new(id, SourceKind::Images, paths);
    job.mask = Some(mask);
    store.create_job(job).unwrap();
}

fn archive_names(path: &std::path::Path) -> Vec<String> {
    let archive = zip::ZipArchive::new(File::open(path).unwrap()).unwrap();
    archive.file_names().map(String::from).collect()
}

fn archive_entry(path: &std::path::Path, name: &str) -> Vec<u8> {
    let mut archive = zip::ZipArchive::new(File::open(path).unwrap()).unwrap();
    let mut entry = archive.by_name(name).unwrap();
    let mut bytes = Vec::new();
    entry.read_to_end(&mut bytes).unwrap();
    bytes
}

// ── Happy path ─────────────────────────────────────────────────────

#[test]
fn images_job_runs_to_completion_in_frame_order() {
    let dir = tempfile::tempdir().unwrap();
    let paths = write_images(&dir, 11, (32, 32));
    let archive_path = dir.path().join("out.zip");

    let store = Arc::new(InMemoryJobStore::new());
    images_job(&store, "job", paths, rect_mask([0.25, 0.25, 0.5, 0.5]));

    let channel = Arc::new(CollectingChannel::default());
    // Small batches force several batch records and sub-batches.
    let scheduler = BatchScheduler::new(Arc::clone(&store), Arc::clone(&channel) as _)
        .with_config(SchedulerConfig::new().with_batch_size(4).with_sub_batch_size(2));

    let dir_paths = store.get_job("job").unwrap().source_paths.clone();
    let mut source = ImagesSource::new(dir_paths);
    let artifact = scheduler
        .run("job", &mut source, &archive_path, &CancellationToken::new())
        .unwrap();
    assert_eq!(artifact, archive_path);

    let job = store.get_job("job").unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.total_frames, 11);
    assert_eq!((job.width, job.height), (32, 32));
    assert_eq!(job.artifact_path.as_deref(), Some(archive_path.as_path()));

    // Every frame appears exactly once, ascending, no gaps.
    let mut names = archive_names(&archive_path);
    assert!(names.contains(&"metadata.csv".to_string()));
    names.retain(|name| name != "metadata.csv");
    names.sort();
    for (index, name) in names.iter().enumerate() {
        assert!(
            name.starts_with(&format!("images/image_{index:03}_input_{index:03}")),
            "entry {index} is {name}"
        );
    }
    assert_eq!(names.len(), 11);
}

#[test]
fn state_machine_walks_ready_processing_exporting_completed() {
    let dir = tempfile::tempdir().unwrap();
    let paths = write_images(&dir, 3, (16, 16));
    let archive_path = dir.path().join("out.zip");

    let store = Arc::new(InMemoryJobStore::new());
    images_job(&store, "job", paths.clone(), rect_mask([0.0, 0.0, 0.5, 0.5]));

    let channel = Arc::new(CollectingChannel::default());
    let scheduler = BatchScheduler::new(Arc::clone(&store), Arc::clone(&channel) as _);

    let mut source = ImagesSource::new(paths);
    scheduler
        .run("job", &mut source, &archive_path, &CancellationToken::new())
        .unwrap();

    let stages = channel.stages();
    let order = [
        JobStatus::Ready,
        JobStatus::Processing,
        JobStatus::Exporting,
        JobStatus::Completed,
    ];
    let mut cursor = 0;
    for stage in &stages {
        if cursor < order.len() && *stage == order[cursor] {
            cursor += 1;
        }
    }
    assert_eq!(cursor, order.len(), "stages seen: {stages:?}");
    // Image jobs never enter the decode-ahead stage.
    assert!(!stages.contains(&JobStatus::Extracting));

    let last = channel.events.lock().unwrap().last().cloned().unwrap();
    assert_eq!(last.stage, JobStatus::Completed);
    assert!((last.percent - 100.0).abs() < f32::EPSILON);
}

#[test]
fn progress_accumulates_across_sub_batches() {
    let dir = tempfile::tempdir().unwrap();
    let paths = write_images(&dir, 8, (16, 16));
    let archive_path = dir.path().join("out.zip");

    let store = Arc::new(InMemoryJobStore::new());
    images_job(&store, "job", paths.clone(), rect_mask([0.0, 0.0, 0.5, 0.5]));

    let channel = Arc::new(CollectingChannel::default());
    let scheduler = BatchScheduler::new(Arc::clone(&store), Arc::clone(&channel) as _)
        .with_config(SchedulerConfig::new().with_batch_size(8).with_sub_batch_size(2));

    let mut source = ImagesSource::new(paths);
    scheduler
        .run("job", &mut source, &archive_path, &CancellationToken::new())
        .unwrap();

    // Four sub-batches of two frames: the Processing-stage percentages
    // are monotonically non-decreasing and end at 100.
    let events = channel.events.lock().unwrap();
    let percents: Vec<f32> = events
        .iter()
        .filter(|event| event.stage == JobStatus::Processing && event.total_frames > 0)
        .map(|event| event.percent)
        .collect();
    assert!(percents.len() >= 4, "events: {percents:?}");
    assert!(
        percents.windows(2).all(|pair| pair[0] <= pair[1]),
        "percentages regressed: {percents:?}"
    );

    // The store holds the last snapshot too.
    let stored = store.get_progress("job").unwrap();
    assert_eq!(stored.stage, JobStatus::Completed);

    // Batch records were created and completed.
    let records = store.batch_records("job");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, occlude::BatchStatus::Completed);
}

#[test]
fn manifest_lists_every_frame_with_status() {
    let dir = tempfile::tempdir().unwrap();
    let paths = write_images(&dir, 4, (20, 10));
    let archive_path = dir.path().join("out.zip");

    let store = Arc::new(InMemoryJobStore::new());
    images_job(&store, "job", paths.clone(), rect_mask([0.0, 0.0, 0.5, 0.5]));

    let scheduler = BatchScheduler::new(
        Arc::clone(&store),
        Arc::new(occlude::NoOpProgressChannel) as _,
    );
    let mut source = ImagesSource::new(paths);
    scheduler
        .run("job", &mut source, &archive_path, &CancellationToken::new())
        .unwrap();

    let manifest = String::from_utf8(archive_entry(&archive_path, "metadata.csv")).unwrap();
    let lines: Vec<&str> = manifest.lines().collect();
    assert_eq!(lines.len(), 5, "manifest:\n{manifest}");
    assert!(lines[0].starts_with("filename,frame_number,original_width,original_height"));
    for (index, line) in lines[1..].iter().enumerate() {
        let fields: Vec<&str> = line.split(',').collect();
        assert_eq!(fields[1], index.to_string());
        assert_eq!(fields[2], "20");
        assert_eq!(fields[3], "10");
        assert_eq!(fields[8], "success");
    }
}

#[test]
fn masked_region_survives_the_whole_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("frame.png");
    image::DynamicImage::ImageRgb8(image::RgbImage::from_pixel(
        100,
        100,
        image::Rgb([200, 200, 200]),
    ))
    .save(&path)
    .unwrap();
    let archive_path = dir.path().join("out.zip");

    let store = Arc::new(InMemoryJobStore::new());
    let mut mask = rect_mask([0.1, 0.1, 0.2, 0.2]);
    mask.opacity = 75;
    images_job(&store, "job", vec![path.clone()], mask);

    let scheduler = BatchScheduler::new(
        Arc::clone(&store),
        Arc::new(occlude::NoOpProgressChannel) as _,
    );
    let mut source = ImagesSource::new(vec![path]);
    scheduler
        .run("job", &mut source, &archive_path, &CancellationToken::new())
        .unwrap();

    let names = archive_names(&archive_path);
    let entry = names
        .iter()
        .find(|name| name.starts_with("images/"))
        .unwrap();
    let decoded = image::load_from_memory(&archive_entry(&archive_path, entry))
        .unwrap()
        .to_rgb8();
    for (x, y, pixel) in decoded.enumerate_pixels() {
        let expected = if (10..30).contains(&x) && (10..30).contains(&y) {
            [0, 0, 0]
        } else {
            [200, 200, 200]
        };
        assert_eq!(pixel.0, expected, "pixel at ({x}, {y})");
    }
}

// ── Failure handling ───────────────────────────────────────────────

#[test]
fn mismatched_frame_dimensions_fail_the_job() {
    let dir = tempfile::tempdir().unwrap();
    let small = write_images(&dir, 1, (100, 100)).remove(0);
    let large = dir.path().join("large.png");
    image::DynamicImage::new_rgb8(200, 200).save(&large).unwrap();
    let archive_path = dir.path().join("out.zip");

    let store = Arc::new(InMemoryJobStore::new());
    let paths = vec![small, large];
    images_job(&store, "job", paths.clone(), rect_mask([0.0, 0.0, 0.5, 0.5]));

    let channel = Arc::new(CollectingChannel::default());
    let scheduler = BatchScheduler::new(Arc::clone(&store), Arc::clone(&channel) as _);

    let mut source = ImagesSource::new(paths);
    let result = scheduler.run("job", &mut source, &archive_path, &CancellationToken::new());
    assert!(matches!(
        result,
        Err(OccludeError::DimensionMismatch {
            frame_number: 1,
            expected_width: 100,
            expected_height: 100,
            actual_width: 200,
            actual_height: 200,
        })
    ));

    let job = store.get_job("job").unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    let message = job.error_message.unwrap();
    assert!(message.contains("200x200"), "message: {message}");

    // The terminal failure was published with the message attached.
    let last = channel.events.lock().unwrap().last().cloned().unwrap();
    assert_eq!(last.stage, JobStatus::Failed);
    assert!(last.error_message.is_some());

    // No archive was produced.
    assert!(!archive_path.exists());
}

#[test]
fn cancellation_discards_the_run_and_fails_the_job() {
    let dir = tempfile::tempdir().unwrap();
    let paths = write_images(&dir, 6, (16, 16));
    let archive_path = dir.path().join("out.zip");

    let store = Arc::new(InMemoryJobStore::new());
    images_job(&store, "job", paths.clone(), rect_mask([0.0, 0.0, 0.5, 0.5]));

    let scheduler = BatchScheduler::new(
        Arc::clone(&store),
        Arc::new(occlude::NoOpProgressChannel) as _,
    );

    let token = CancellationToken::new();
    token.cancel();

    let mut source = ImagesSource::new(paths);
    let result = scheduler.run("job", &mut source, &archive_path, &token);
    assert!(matches!(result, Err(OccludeError::Cancelled)));

    assert_eq!(store.get_job("job").unwrap().status, JobStatus::Failed);
    assert!(!archive_path.exists());
}

#[test]
fn missing_mask_is_rejected_before_any_decode() {
    let dir = tempfile::tempdir().unwrap();
    let paths = write_images(&dir, 2, (16, 16));
    let archive_path = dir.path().join("out.zip");

    let store = Arc::new(InMemoryJobStore::new());
    store
        .create_job(Job::new("job", SourceKind::Images, paths.clone()))
        .unwrap();

    let scheduler = BatchScheduler::new(
        Arc::clone(&store),
        Arc::new(occlude::NoOpProgressChannel) as _,
    );
    let mut source = ImagesSource::new(paths);
    let result = scheduler.run("job", &mut source, &archive_path, &CancellationToken::new());
    assert!(matches!(result, Err(OccludeError::MissingMask)));
    assert_eq!(store.get_job("job").unwrap().status, JobStatus::Failed);
}

#[test]
fn undecodable_input_becomes_a_placeholder_not_a_failure() {
    let dir = tempfile::tempdir().unwrap();
    let mut paths = write_images(&dir, 2, (24, 24));
    let broken = dir.path().join("broken.png");
    std::fs::write(&broken, b"not a png").unwrap();
    paths.insert(1, broken);
    let archive_path = dir.path().join("out.zip");

    let store = Arc::new(InMemoryJobStore::new());
    images_job(&store, "job", paths.clone(), rect_mask([0.0, 0.0, 0.25, 0.25]));

    let scheduler = BatchScheduler::new(
        Arc::clone(&store),
        Arc::new(occlude::NoOpProgressChannel) as _,
    );
    let mut source = ImagesSource::new(paths);
    scheduler
        .run("job", &mut source, &archive_path, &CancellationToken::new())
        .unwrap();

    // All three frames produced archive entries; the broken one is the
    // mid-gray placeholder with the mask applied.
    assert_eq!(store.get_job("job").unwrap().status, JobStatus::Completed);
    let names = archive_names(&archive_path);
    assert_eq!(
        names.iter().filter(|name| name.starts_with("images/")).count(),
        3
    );
    let placeholder_entry = names
        .iter()
        .find(|name| name.starts_with("images/image_001"))
        .unwrap();
    let decoded = image::load_from_memory(&archive_entry(&archive_path, placeholder_entry))
        .unwrap()
        .to_rgb8();
    assert_eq!(decoded.get_pixel(20, 20).0, [128, 128, 128]);
    assert_eq!(decoded.get_pixel(2, 2).0, [0, 0, 0]);
}

// ── Two-tier execution policy ──────────────────────────────────────

#[test]
fn sequential_tier_produces_identical_archives() {
    let dir = tempfile::tempdir().unwrap();
    let paths = write_images(&dir, 5, (32, 32));

    let run = |parallel: bool, archive_name: &str| -> Vec<u8> {
        let archive_path = dir.path().join(archive_name);
        let store = Arc::new(InMemoryJobStore::new());
        images_job(&store, "job", paths.clone(), rect_mask([0.25, 0.25, 0.5, 0.5]));
        let scheduler = BatchScheduler::new(
            Arc::clone(&store),
            Arc::new(occlude::NoOpProgressChannel) as _,
        )
        .with_config(SchedulerConfig::new().with_parallel(parallel));
        let mut source = ImagesSource::new(paths.clone());
        scheduler
            .run("job", &mut source, &archive_path, &CancellationToken::new())
            .unwrap();

        let mut names = archive_names(&archive_path);
        names.sort();
        names
            .iter()
            .flat_map(|name| archive_entry(&archive_path, name))
            .collect()
    };

    assert_eq!(run(true, "parallel.zip"), run(false, "sequential.zip"));
}
