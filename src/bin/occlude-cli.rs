use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use occlude::{
    BatchScheduler, CancellationToken, FitMode, InMemoryJobStore, Job, JobStore, Mask, MaskShape,
    OutputFormat, OutputSettings, ProcessingProgress, ProgressChannel, RectSpec, SchedulerConfig,
    SizePolicy, SourceSpec, source,
};
use serde_json::json;

const CLI_AFTER_HELP: &str = "Examples:\n  occlude probe input.mp4 --json\n  occlude mask-video input.mp4 --mask mask.json --out redacted.zip --progress\n  occlude mask-video scan.dcm --rect 0.25,0.25,0.5,0.5 --out redacted.zip\n  occlude mask-images *.png --rect 0.1,0.1,0.3,0.3 --out redacted.zip --format jpg\n  occlude completions zsh > _occlude";

#[derive(Debug, Parser)]
#[command(
    name = "occlude",
    version,
    about = "Apply spatial redaction masks to video, DICOM, and image batches",
    after_help = CLI_AFTER_HELP
)]
struct Cli {
    #[command(flatten)]
    global: GlobalOptions,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Parser, Clone, Default)]
struct GlobalOptions {
    /// Show additional logging output.
    #[arg(long)]
    verbose: bool,

    /// Show a progress bar where supported.
    #[arg(long)]
    progress: bool,

    /// Allow overwriting existing output files.
    #[arg(long)]
    overwrite: bool,

    /// Desired worker thread count for the parallel masking tier.
    #[arg(long)]
    threads: Option<usize>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print source metadata (alias: metadata).
    #[command(
        about = "Print source metadata",
        visible_alias = "metadata",
        visible_alias = "info",
        after_help = "Examples:\n  occlude probe input.mp4\n  occlude probe scan.dcm --json"
    )]
    Probe {
        /// Input video or DICOM path.
        input: PathBuf,

        /// Output metadata as machine-readable JSON.
        #[arg(long)]
        json: bool,
    },

    /// Mask every frame of a video or DICOM file.
    #[command(
        about = "Mask a video or DICOM file",
        after_help = "Examples:\n  occlude mask-video input.mp4 --mask mask.json --out redacted.zip --progress\n  occlude mask-video scan.dcm --rect 0.25,0.25,0.5,0.5 --out redacted.zip --size 720p --fit letterbox"
    )]
    MaskVideo {
        /// Input video or DICOM path.
        input: PathBuf,

        #[command(flatten)]
        mask: MaskOptions,

        #[command(flatten)]
        output: OutputOptions,

        #[command(flatten)]
        tuning: TuningOptions,
    },

    /// Mask a batch of still images, one frame per file.
    #[command(
        about = "Mask a batch of still images",
        after_help = "Examples:\n  occlude mask-images a.png b.png c.png --mask mask.json --out redacted.zip\n  occlude mask-images scans/*.jpg --rect 0.1,0.1,0.3,0.3 --out redacted.zip"
    )]
    MaskImages {
        /// Input image files, in frame order.
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        #[command(flatten)]
        mask: MaskOptions,

        #[command(flatten)]
        output: OutputOptions,

        #[command(flatten)]
        tuning: TuningOptions,
    },

    /// Generate shell completion scripts.
    #[command(about = "Generate shell completions")]
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Parser, Clone, Default)]
struct MaskOptions {
    /// Path to a mask JSON document (shape, opacity, raster payload,
    /// display metadata).
    #[arg(long, conflicts_with = "rect")]
    mask: Option<PathBuf>,

    /// Shorthand rectangle mask as normalized fractions `x,y,w,h`.
    #[arg(long)]
    rect: Option<String>,
}

#[derive(Debug, Parser, Clone)]
struct OutputOptions {
    /// Output archive path.
    #[arg(long)]
    out: PathBuf,

    /// Target size: original, a preset (480p, 720p, 1080p), or WIDTHxHEIGHT.
    #[arg(long, default_value = "original")]
    size: String,

    /// Output image format (png, jpg).
    #[arg(long, default_value = "png")]
    format: String,

    /// Aspect-ratio handling (stretch, letterbox, crop).
    #[arg(long, default_value = "stretch")]
    fit: String,

    /// Skip the metadata.csv manifest.
    #[arg(long)]
    no_manifest: bool,
}

#[derive(Debug, Parser, Clone, Default)]
struct TuningOptions {
    /// Frames per sequential batch.
    #[arg(long)]
    batch_size: Option<usize>,

    /// Frames per volumetric sub-batch.
    #[arg(long)]
    sub_batch_size: Option<usize>,

    /// Disable the parallel masking tier.
    #[arg(long)]
    sequential: bool,
}

fn parse_rect_fractions(value: &str) -> Result<[f64; 4], Box<dyn std::error::Error>> {
    let parts: Vec<&str> = value.split(',').map(str::trim).collect();
    if parts.len() != 4 {
        return Err(format!("--rect expects x,y,w,h (got {value:?})").into());
    }
    let mut fractions = [0.0; 4];
    for (slot, part) in fractions.iter_mut().zip(&parts) {
        *slot = part.parse::<f64>()?;
    }
    Ok(fractions)
}

fn load_mask(options: &MaskOptions) -> Result<Mask, Box<dyn std::error::Error>> {
    if let Some(path) = &options.mask {
        let text = fs::read_to_string(path)
            .map_err(|error| format!("cannot read {}: {error}", path.display()))?;
        return Ok(serde_json::from_str(&text)
            .map_err(|error| format!("invalid mask JSON in {}: {error}", path.display()))?);
    }
    if let Some(rect) = &options.rect {
        return Ok(Mask {
            shape: MaskShape::Rectangle {
                rect: RectSpec::Fractions(parse_rect_fractions(rect)?),
            },
            opacity: 100,
            feather: 0.0,
            raster: None,
            display: None,
        });
    }
    Err("provide a mask via --mask <file> or --rect x,y,w,h".into())
}

fn parse_size(value: &str) -> Result<SizePolicy, Box<dyn std::error::Error>> {
    let trimmed = value.trim();
    if let Some((width, height)) = trimmed.split_once(['x', 'X']) {
        let width = width.trim().parse::<u32>()?;
        let height = height.trim().parse::<u32>()?;
        if width == 0 || height == 0 {
            return Err("--size dimensions must be greater than 0".into());
        }
        return Ok(SizePolicy::Exact { width, height });
    }
    Ok(SizePolicy::Named(trimmed.to_string()))
}

fn parse_format(value: &str) -> Result<OutputFormat, Box<dyn std::error::Error>> {
    match value.to_ascii_lowercase().as_str() {
        "png" => Ok(OutputFormat::Png),
        "jpg" | "jpeg" => Ok(OutputFormat::Jpeg),
        other => Err(format!("unsupported --format: {other}").into()),
    }
}

fn parse_fit(value: &str) -> Result<FitMode, Box<dyn std::error::Error>> {
    match value.to_ascii_lowercase().as_str() {
        "stretch" => Ok(FitMode::Stretch),
        "letterbox" | "pad" => Ok(FitMode::Letterbox),
        "crop" | "fill" => Ok(FitMode::Crop),
        other => Err(format!("unsupported --fit: {other}").into()),
    }
}

fn build_settings(options: &OutputOptions) -> Result<OutputSettings, Box<dyn std::error::Error>> {
    Ok(OutputSettings::new()
        .with_size(parse_size(&options.size)?)
        .with_format(parse_format(&options.format)?)
        .with_fit(parse_fit(&options.fit)?)
        .with_manifest(!options.no_manifest))
}

fn build_config(tuning: &TuningOptions) -> SchedulerConfig {
    let mut config = SchedulerConfig::new();
    if let Some(batch_size) = tuning.batch_size {
        config = config.with_batch_size(batch_size);
    }
    if let Some(sub_batch_size) = tuning.sub_batch_size {
        config = config.with_sub_batch_size(sub_batch_size);
    }
    if tuning.sequential {
        config = config.with_parallel(false);
    }
    config
}

fn ensure_writable_path(path: &Path, overwrite: bool) -> Result<(), Box<dyn std::error::Error>> {
    if path.exists() {
        if overwrite {
            eprintln!(
                "{} {}",
                "warning:".yellow().bold(),
                format!("overwriting {}", path.display()).yellow()
            );
        } else {
            return Err(format!(
                "output already exists: {} (use --overwrite to replace)",
                path.display()
            )
            .into());
        }
    }
    Ok(())
}

fn apply_global_options(global: &GlobalOptions) {
    if let Some(threads) = global.threads {
        if threads > 0 {
            unsafe {
                std::env::set_var("RAYON_NUM_THREADS", threads.to_string());
            }
        }
    }
}

/// Renders scheduler progress as an indicatif bar.
struct TerminalProgress {
    bar: ProgressBar,
    verbose: bool,
}

impl TerminalProgress {
    fn new(verbose: bool) -> Result<Self, Box<dyn std::error::Error>> {
        let bar = ProgressBar::new(0);
        let style =
            ProgressStyle::with_template("{spinner:.green} {bar:40.cyan/blue} {pos}/{len} {msg}")?;
        bar.set_style(style.progress_chars("##-"));
        Ok(Self { bar, verbose })
    }

    fn finish(&self) {
        self.bar.finish_with_message("done");
    }
}

impl ProgressChannel for TerminalProgress {
    fn emit(&self, job_id: &str, progress: &ProcessingProgress) {
        if self.bar.length() != Some(progress.total_frames) {
            self.bar.set_length(progress.total_frames);
        }
        self.bar.set_position(progress.current_frame.min(progress.total_frames));

        let mut message = format!("{:?}", progress.stage).to_lowercase();
        if let Some(eta) = progress.eta_seconds {
            message.push_str(&format!(" (eta {eta:.0}s)"));
        }
        self.bar.set_message(message);

        if self.verbose {
            self.bar.suspend(|| {
                eprintln!(
                    "[{job_id}] {:.1}% at {:.1} fps",
                    progress.percent, progress.frames_per_second
                );
            });
        }
    }
}

struct QuietProgress;

impl ProgressChannel for QuietProgress {
    fn emit(&self, job_id: &str, progress: &ProcessingProgress) {
        if let Some(error) = &progress.error_message {
            eprintln!("[{job_id}] {} {error}", "failed:".red().bold());
        }
    }
}

fn run_job(
    spec: SourceSpec,
    mask: Mask,
    output: &OutputOptions,
    tuning: &TuningOptions,
    global: &GlobalOptions,
) -> Result<(), Box<dyn std::error::Error>> {
    ensure_writable_path(&output.out, global.overwrite)?;
    let settings = build_settings(output)?;

    let store = Arc::new(InMemoryJobStore::new());
    let mut job = Job::new("cli", spec.kind(), spec.paths());
    job.mask = Some(mask);
    job.output = Some(settings);
    store.create_job(job)?;

    let terminal = if global.progress {
        Some(Arc::new(TerminalProgress::new(global.verbose)?))
    } else {
        None
    };
    let channel: Arc<dyn ProgressChannel> = match &terminal {
        Some(terminal) => Arc::clone(terminal) as Arc<dyn ProgressChannel>,
        None => Arc::new(QuietProgress),
    };

    let scheduler = BatchScheduler::new(Arc::clone(&store), channel).with_config(build_config(tuning));
    let mut frame_source = source::open(&spec)?;

    let artifact = scheduler.run(
        "cli",
        frame_source.as_mut(),
        &output.out,
        &CancellationToken::new(),
    )?;

    if let Some(terminal) = &terminal {
        terminal.finish();
    }

    let processed = store.get_job("cli")?.total_frames;
    println!(
        "{} {}",
        "success:".green().bold(),
        format!("Masked {processed} frame(s) -> {}", artifact.display()).green()
    );
    Ok(())
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    apply_global_options(&cli.global);

    match cli.command {
        Commands::Probe { input, json } => {
            let spec = source::sniff(&input)?;
            let mut frame_source = source::open(&spec)?;
            let metadata = frame_source.metadata()?;

            if json {
                let payload = json!({
                    "width": metadata.width,
                    "height": metadata.height,
                    "frame_rate": metadata.frame_rate,
                    "total_frames": metadata.total_frames,
                    "multi_frame_medical": metadata.is_multi_frame_medical,
                });
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else {
                let kind = if metadata.is_multi_frame_medical {
                    "multi-frame DICOM"
                } else {
                    "video"
                };
                println!("Source: {kind}");
                println!("Frames: {}x{}, {} total", metadata.width, metadata.height, metadata.total_frames);
                if metadata.frame_rate > 0.0 {
                    println!("Rate: {:.2} fps", metadata.frame_rate);
                }
            }
        }
        Commands::MaskVideo {
            input,
            mask,
            output,
            tuning,
        } => {
            let spec = source::sniff(&input)?;
            let mask = load_mask(&mask)?;
            run_job(spec, mask, &output, &tuning, &cli.global)?;
        }
        Commands::MaskImages {
            inputs,
            mask,
            output,
            tuning,
        } => {
            let mask = load_mask(&mask)?;
            run_job(SourceSpec::Images(inputs), mask, &output, &tuning, &cli.global)?;
        }
        Commands::Completions { shell } => {
            let mut command = Cli::command();
            clap_complete::generate(shell, &mut command, "occlude", &mut std::io::stdout());
        }
    }

    Ok(())
}

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error}");
        std::process::exit(1);
    }
}
