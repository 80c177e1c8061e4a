use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use opencv::{core::Mat, imgcodecs, prelude::*, videoio};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use dimtrack::calibration::{CalibrationStore, FactorsUpdate};
use dimtrack::config::PipelineConfig;
use dimtrack::estimation::{EstimationQueue, Worker, WorkerConfig};
use dimtrack::pipeline::Pipeline;
use dimtrack::quality::QualityEvaluator;
use dimtrack::regressor::OnnxRegressor;
use dimtrack::report::OutboundEvent;
use dimtrack::source::{ReplaySource, TrackSource};
use dimtrack::video::VideoWriter;
use dimtrack::Frame;

#[derive(Parser)]
#[command(name = "dimtrack", version, about = "Package dimension estimation from tracked video")]
struct Cli {
    /// Pipeline configuration (TOML); defaults are used when missing
    #[arg(long, global = true, default_value = "dimtrack.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Process a video with replayed tracker output, printing reports as JSON lines
    Run {
        #[arg(long)]
        video: PathBuf,
        /// Detections dump, one `<frame>:<json array>` line per frame
        #[arg(long)]
        detections: PathBuf,
        /// Write the annotated video here
        #[arg(long)]
        output: Option<PathBuf>,
        /// Pace frames at the video's frame rate
        #[arg(long)]
        realtime: bool,
    },
    /// Derive calibration factors from a reference package of known size (cm)
    Calibrate {
        #[arg(long)]
        image: PathBuf,
        #[arg(long)]
        length: f32,
        #[arg(long)]
        width: f32,
        #[arg(long)]
        height: f32,
    },
    /// Print the quality breakdown of a single package crop
    Analyze {
        #[arg(long)]
        image: PathBuf,
    },
    /// Overwrite individual calibration factors
    SetFactors {
        #[arg(long)]
        length: Option<f32>,
        #[arg(long)]
        width: Option<f32>,
        #[arg(long)]
        height: Option<f32>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("dimtrack=info,ort=warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::load_or_default(&cli.config);

    match cli.command {
        Command::Run {
            video,
            detections,
            output,
            realtime,
        } => run(&config, video, detections, output, realtime),

        Command::Calibrate {
            image,
            length,
            width,
            height,
        } => calibrate(&config, image, [length, width, height]),

        Command::Analyze { image } => analyze(&config, image),

        Command::SetFactors {
            length,
            width,
            height,
        } => {
            let store = CalibrationStore::open(&config.calibration_path);
            let factors = store.update(FactorsUpdate {
                length,
                width,
                height,
            })?;
            println!("{}", serde_json::to_string(&factors)?);
            Ok(())
        }
    }
}

fn load_regressor(config: &PipelineConfig) -> Result<OnnxRegressor> {
    let mut regressor = OnnxRegressor::new(&config.model.path, config.model.input_size)
        .with_context(|| format!("loading model {}", config.model.path.display()))?;
    regressor.smoke_test().context("model smoke test")?;

    Ok(regressor)
}

fn calibrate(config: &PipelineConfig, image: PathBuf, known: [f32; 3]) -> Result<()> {
    let reference = imgcodecs::imread(&image.to_string_lossy(), imgcodecs::IMREAD_COLOR)?;
    if reference.empty() {
        bail!("unable to read reference image {}", image.display());
    }

    let mut regressor = load_regressor(config)?;
    let store = CalibrationStore::open(&config.calibration_path);
    let factors = store.calibrate(&mut regressor, &reference, known)?;

    println!("{}", serde_json::to_string(&factors)?);

    Ok(())
}

fn analyze(config: &PipelineConfig, image: PathBuf) -> Result<()> {
    let crop = imgcodecs::imread(&image.to_string_lossy(), imgcodecs::IMREAD_COLOR)?;
    if crop.empty() {
        bail!("unable to read image {}", image.display());
    }

    let evaluator = QualityEvaluator::new(config.quality.clone());
    let Some(analysis) = evaluator.analyze(&crop)? else {
        println!(
            "{}x{}: too small to score (minimum side {})",
            crop.cols(),
            crop.rows(),
            evaluator.params().min_roi_side
        );
        return Ok(());
    };

    let metrics = &analysis.metrics;
    println!("size:   {}x{}", analysis.width, analysis.height);
    println!("aspect: {:.2}", analysis.aspect_ratio());
    println!("fill:   {:.3}", metrics.fill_ratio);
    println!("edges:  {:.3}", metrics.edge_ratio);
    println!("lines:  {}", metrics.line_count);
    println!(
        "score:  {:.3} (qualifies at {:.2})",
        analysis.score, config.min_quality_score
    );

    Ok(())
}

fn run(
    config: &PipelineConfig,
    video: PathBuf,
    detections: PathBuf,
    output: Option<PathBuf>,
    realtime: bool,
) -> Result<()> {
    let calibration = Arc::new(CalibrationStore::open(&config.calibration_path));
    let regressor = load_regressor(config)?;

    let queue = Arc::new(EstimationQueue::<Mat>::new());
    let worker = Worker::spawn(
        queue.clone(),
        regressor,
        calibration,
        WorkerConfig::from(config),
    )?;

    let mut cam = videoio::VideoCapture::from_file(&video.to_string_lossy(), videoio::CAP_ANY)?;
    if !cam.is_opened()? {
        bail!("unable to open video {}", video.display());
    }

    let fps = cam.get(videoio::CAP_PROP_FPS)?;
    let total = cam.get(videoio::CAP_PROP_FRAME_COUNT)? as u64;
    info!(
        "video {}x{} {} frames at {:.1} fps",
        cam.get(videoio::CAP_PROP_FRAME_WIDTH)? as i32,
        cam.get(videoio::CAP_PROP_FRAME_HEIGHT)? as i32,
        total,
        fps
    );

    let mut source = ReplaySource::open(&detections)
        .with_context(|| format!("opening detections {}", detections.display()))?;
    let mut writer = output.map(|path| VideoWriter::new(path, fps));
    let mut pipeline = Pipeline::new(config, queue);

    let frame_period = if fps > 0.0 {
        Duration::from_secs_f64(1.0 / fps)
    } else {
        Duration::ZERO
    };

    let stdout = std::io::stdout();
    let mut reported = 0usize;
    let mut index = 0u64;

    loop {
        let started = Instant::now();
        let mut image = Mat::default();
        if !cam.read(&mut image)? || image.empty() {
            break;
        }

        let detections = source.next_detections(index, &image).unwrap_or_else(|err| {
            warn!("frame {}: no detections: {}", index, err);
            Vec::new()
        });

        let frame = Frame { index, detections };
        let out = pipeline.process(image, &frame, started);

        let mut lock = stdout.lock();
        for report in out.reports {
            writeln!(lock, "{}", serde_json::to_string(&OutboundEvent::from(report))?)?;
            reported += 1;
        }
        lock.flush()?;
        drop(lock);

        if let Some(writer) = writer.as_mut() {
            writer.feed(&out.frame)?;
        }

        if realtime {
            if let Some(rest) = frame_period.checked_sub(started.elapsed()) {
                std::thread::sleep(rest);
            }
        }

        index += 1;
    }

    if let Some(mut writer) = writer {
        writer.release()?;
    }
    worker.shutdown();

    info!("finished: {} frames, {} packages reported", index, reported);

    Ok(())
}
