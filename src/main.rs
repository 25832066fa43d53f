mod background;
mod capture;
mod compositor;
mod config;
mod detection;
mod error;
mod frame;
mod offload;
mod output;
mod pipeline;
mod scheduler;
mod segmentation;

use std::io::BufRead;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use capture::WebcamCapture;
use clap::Parser;
use config::PipelineConfig;
use crossbeam_channel::{unbounded, Sender};
use frame::BackgroundMode;
use offload::OffloadChannel;
use output::V4L2Output;
use pipeline::{PipelineCommand, ProcessingKind, VideoPipeline};
use segmentation::SegmentationEngine;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Input webcam device index
    #[arg(short, long, default_value_t = 0)]
    input_device: u32,

    /// Output v4l2loopback device path
    #[arg(short, long, default_value = "/dev/video10")]
    output_device: String,

    /// Preferred capture resolution width
    #[arg(long, default_value_t = 640)]
    capture_width: u32,

    /// Preferred capture resolution height
    #[arg(long, default_value_t = 480)]
    capture_height: u32,

    /// Output resolution width
    #[arg(long, default_value_t = 1280)]
    output_width: u32,

    /// Output resolution height
    #[arg(long, default_value_t = 720)]
    output_height: u32,

    /// Target render cycles per second
    #[arg(long, default_value_t = 30)]
    fps: u32,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Path to the local segmentation model (ONNX file).
    /// Without it (and without --remote) the feed is passed through.
    #[arg(long)]
    model: Option<String>,

    /// Initial virtual background: none, blur, office, beach, mountain
    #[arg(long, default_value = "none")]
    background: BackgroundMode,

    /// Offload frame processing to a remote segmentation worker
    #[arg(long)]
    remote: bool,

    /// WebSocket endpoint of the remote worker
    #[arg(long, default_value = "ws://localhost:3001/ws")]
    offload_url: String,

    /// Health endpoint used to classify transport errors
    #[arg(long, default_value = "http://localhost:3001/health")]
    health_url: String,

    /// Directory holding the still background images
    #[arg(long, default_value = "assets")]
    backgrounds_dir: PathBuf,

    /// Foreground ratio a mask must exceed to report a person
    #[arg(long, default_value_t = 0.05)]
    detection_threshold: f64,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    tracing::info!("Fondcam starting");
    tracing::info!("Capture: {}x{}", args.capture_width, args.capture_height);
    tracing::info!("Output: {}x{}", args.output_width, args.output_height);
    tracing::info!(
        "Processing: {}",
        if args.remote { "remote" } else { "local" }
    );

    let config = PipelineConfig {
        render_interval: Duration::from_secs_f64(1.0 / args.fps.max(1) as f64),
        detection_threshold: args.detection_threshold,
        offload_url: args.offload_url.clone(),
        health_url: args.health_url.clone(),
        backgrounds_dir: args.backgrounds_dir.clone(),
        ..PipelineConfig::default()
    };

    let capture = WebcamCapture::acquire(
        args.input_device,
        args.capture_width,
        args.capture_height,
        &config,
    )
    .context("Failed to acquire webcam")?;

    let output = V4L2Output::new(&args.output_device, args.output_width, args.output_height)
        .context("Failed to initialize v4l2loopback output")?;

    let (command_tx, command_rx) = unbounded();
    install_shutdown_handler(command_tx.clone())?;
    spawn_command_reader(command_tx);

    let mut pipeline = VideoPipeline::new(config.clone(), capture, output, command_rx)
        .with_detection_callback(Box::new(|detected| {
            tracing::info!("person detected: {detected}");
        }));

    // The channel stays inert until processing is switched to remote, so
    // it is always attached and the path can be toggled at runtime.
    let channel = OffloadChannel::new(
        config.offload_url.clone(),
        config.health_url.clone(),
        config.reconnect_delay,
        config.max_outstanding_sends,
        config.send_width,
        config.jpeg_quality,
        args.background,
    );
    pipeline = pipeline.with_channel(channel);

    if let Some(model_path) = &args.model {
        tracing::info!("Loading segmentation model from {}", model_path);
        let model = segmentation::create_default_model(model_path, &config)
            .context("Failed to load segmentation model")?;
        let engine =
            SegmentationEngine::start(model, config.mask_cutoff, config.detection_threshold);
        pipeline = pipeline.with_engine(engine);
    } else if !args.remote {
        tracing::info!("No model and no --remote: running in passthrough mode");
    }

    if args.remote {
        pipeline = pipeline.with_processing(ProcessingKind::Remote);
    }

    pipeline.set_mode(args.background);
    pipeline.run()
}

fn install_shutdown_handler(tx: Sender<PipelineCommand>) -> Result<()> {
    ctrlc::set_handler(move || {
        let _ = tx.send(PipelineCommand::Stop);
    })
    .context("Failed to install ctrl-c handler")
}

/// Read commands from stdin: `mode <name>`, `processing <local|remote>`,
/// `reconnect`, `quit`.
fn spawn_command_reader(tx: Sender<PipelineCommand>) {
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            let line = line.trim();
            let command = if let Some(mode) = line.strip_prefix("mode ") {
                match mode.trim().parse::<BackgroundMode>() {
                    Ok(mode) => PipelineCommand::SetMode(mode),
                    Err(err) => {
                        tracing::warn!("{err}");
                        continue;
                    }
                }
            } else if let Some(kind) = line.strip_prefix("processing ") {
                match kind.trim().parse::<ProcessingKind>() {
                    Ok(kind) => PipelineCommand::SetProcessing(kind),
                    Err(err) => {
                        tracing::warn!("{err}");
                        continue;
                    }
                }
            } else if line == "reconnect" {
                PipelineCommand::Reconnect
            } else if line == "quit" {
                PipelineCommand::Stop
            } else {
                if !line.is_empty() {
                    tracing::warn!("unknown command: {line}");
                }
                continue;
            };
            let stop = matches!(command, PipelineCommand::Stop);
            if tx.send(command).is_err() || stop {
                break;
            }
        }
    });
}
