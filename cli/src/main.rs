mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use rppg_core::{
    FfmpegSource, ModelId, ModelRegistry, OnnxFaceDetector, Pipeline, VitalsReport,
    runtime::configure_ort_dylib,
};

use crate::config::{FileConfig, Overrides};

// ── CLI definition ────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "rppg",
    version,
    about = "Contactless heart-rate estimation from face video",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Estimate heart rate, signal quality and HRV over a whole video.
    Video {
        /// Input video path
        #[arg(short, long)]
        input: PathBuf,

        /// Directory holding <model-id>.onnx files
        #[arg(long)]
        model_dir: Option<PathBuf>,

        /// Face detector ONNX model path
        #[arg(long)]
        detector: Option<PathBuf>,

        /// Signal-extraction model, e.g. PhysNet.pure
        #[arg(short, long)]
        model: Option<ModelId>,

        /// Run the face detector on every n-th frame
        #[arg(long)]
        detect_every: Option<u32>,

        /// Override the model's nominal sample rate (Hz)
        #[arg(long)]
        sample_rate: Option<f64>,

        /// TOML config file (defaults to ./rppg.toml when present)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// List the supported signal-extraction models.
    Models {
        /// Directory holding <model-id>.onnx files
        #[arg(long, default_value = "models")]
        model_dir: PathBuf,
    },
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    // Respect RUST_LOG; default to info
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Video {
            input,
            model_dir,
            detector,
            model,
            detect_every,
            sample_rate,
            config,
            json,
        } => cmd_video(
            input,
            config,
            Overrides {
                model_dir,
                detector,
                model,
                detect_every,
                sample_rate,
                json,
            },
        ),
        Commands::Models { model_dir } => cmd_models(model_dir),
    }
}

// ── video ─────────────────────────────────────────────────────────────────────

fn cmd_video(input: PathBuf, config: Option<PathBuf>, flags: Overrides) -> Result<()> {
    let run = FileConfig::load(config.as_deref())?.resolve(flags);
    info!("Vitals from video");
    info!("  input    : {}", input.display());
    info!("  model    : {}", run.pipeline.model);
    info!("  detector : {}", run.detector.display());

    configure_ort_dylib();

    let registry = ModelRegistry::with_onnx_defaults(&run.model_dir);
    let spec = registry
        .load(run.pipeline.model)
        .with_context(|| format!("failed to load model {}", run.pipeline.model))?;
    let detector = OnnxFaceDetector::load(&run.detector).with_context(|| {
        format!("failed to load face detector: {}", run.detector.display())
    })?;
    let source = FfmpegSource::open(&input)
        .with_context(|| format!("failed to open video: {}", input.display()))?;

    let mut pipeline =
        Pipeline::new(run.pipeline, spec, Box::new(detector)).context("invalid configuration")?;

    let pb = spinner("Ingesting frames…");
    let pb2 = pb.clone();
    let report = pipeline
        .process_video_with(source, move |frames| {
            if frames % 30 == 0 {
                pb2.set_message(format!("Ingesting frames… {frames}"));
            }
        })
        .context("vitals estimation failed")?;
    pb.finish_with_message("Done.");

    match report {
        Some(report) if run.json => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Some(report) => print_report(&report),
        None => println!("No pulse signal was produced; was a face visible?"),
    }
    Ok(())
}

fn print_report(report: &VitalsReport) {
    println!("heart rate : {:.1} bpm", report.hr);
    println!("quality    : {:.2}", report.sqi);
    println!("latency    : {:.3} s", report.latency);
    if report.hrv.is_empty() {
        println!("hrv        : unavailable");
        return;
    }
    println!("hrv:");
    for (name, value) in &report.hrv {
        println!("  {name:<8} : {value:.4}");
    }
}

// ── models ────────────────────────────────────────────────────────────────────

fn cmd_models(model_dir: PathBuf) -> Result<()> {
    let registry = ModelRegistry::with_onnx_defaults(&model_dir);
    println!(
        "{:<20} {:>6} {:>9} {:>5}  available",
        "model", "chunk", "input", "fps"
    );
    for id in registry.ids() {
        let Some(meta) = registry.meta(id) else {
            continue;
        };
        let present = model_dir.join(format!("{id}.onnx")).is_file();
        println!(
            "{:<20} {:>6} {:>9} {:>5}  {}",
            id.as_str(),
            meta.chunk,
            format!("{}x{}", meta.width, meta.height),
            meta.fps,
            if present { "yes" } else { "no" }
        );
    }
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    let style = ProgressStyle::with_template("{spinner:.cyan} {msg} [{elapsed_precise}]")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
    pb.set_style(style);
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(80));
    pb
}
