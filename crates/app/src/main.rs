use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use framepipe_core::{
    AppConfig, ControllerState, FrameBuffer, FramePipeError, PipelineController, SyntheticFramework,
};
use tracing_subscriber::EnvFilter;

fn main() -> framepipe_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run_pipeline(args),
        Commands::Check { description, config } => run_check(&description, config.as_ref()),
    }
}

fn run_pipeline(args: RunArgs) -> framepipe_core::Result<()> {
    let mut config = load_config(args.config.as_ref())?;
    if args.max_frames.is_some() {
        config.max_frames = args.max_frames;
    }
    if let Some(timeout_secs) = args.timeout_secs {
        config.timeout_secs = timeout_secs;
    }
    let description = args
        .description
        .or_else(|| config.pipeline.clone())
        .ok_or_else(|| FramePipeError::msg("no pipeline description given"))?;

    if let Some(dir) = &args.output_dir {
        std::fs::create_dir_all(dir)?;
    }

    tracing::info!(%description, max_frames = ?config.max_frames, "running pipeline");
    let controller = Arc::new(PipelineController::with_config(
        Arc::new(SyntheticFramework::new()),
        config.controller.clone(),
    )?);

    let received = Arc::new(AtomicU64::new(0));
    {
        let weak = Arc::downgrade(&controller);
        let received = received.clone();
        let max_frames = config.max_frames;
        let output_dir = args.output_dir.clone();
        controller.register_frame_callback(move |frame: FrameBuffer| {
            let index = received.fetch_add(1, Ordering::SeqCst);
            tracing::info!(frame = index, len = frame.len(), "received frame");

            if let Some(dir) = &output_dir {
                let path = dir.join(format!("frame_{index}.bin"));
                if let Err(err) = std::fs::write(&path, frame.as_slice()) {
                    tracing::error!(?path, %err, "failed to save frame");
                }
            }

            if max_frames.is_some_and(|max| index + 1 >= max) {
                tracing::info!("reached maximum frame count, stopping");
                if let Some(controller) = weak.upgrade() {
                    if let Err(err) = controller.stop() {
                        tracing::error!(%err, "failed to stop pipeline");
                    }
                }
            }
        });
    }

    controller.configure(&description)?;
    controller.start()?;

    let settled = controller.wait_for_state(
        &[ControllerState::Stopped, ControllerState::Faulted],
        Duration::from_secs(config.timeout_secs),
    );
    if settled.is_none() {
        tracing::warn!(timeout_secs = config.timeout_secs, "timed out, stopping pipeline");
        controller.stop()?;
    }

    let mut summary = serde_json::json!({
        "state": controller.state(),
        "frames": controller.frames_delivered(),
        "fault": controller.fault(),
    });
    if let Some(mime) = &args.data_url {
        summary["last_frame"] = serde_json::json!(controller
            .current_frame()
            .map(|frame| frame.to_data_url(mime)));
    }
    let rendered = serde_json::to_string_pretty(&summary)
        .map_err(|err| FramePipeError::msg(format!("failed to render summary: {err}")))?;
    println!("{rendered}");

    match controller.fault() {
        Some(fault) if controller.state() == ControllerState::Faulted => {
            Err(FramePipeError::msg(format!("pipeline faulted: {fault}")))
        }
        _ => Ok(()),
    }
}

fn run_check(description: &str, config: Option<&PathBuf>) -> framepipe_core::Result<()> {
    let config = load_config(config)?;
    let controller = PipelineController::with_config(
        Arc::new(SyntheticFramework::new()),
        config.controller,
    )?;

    controller.configure(description)?;
    println!(
        "pipeline is valid, output stage '{}' found",
        controller.config().output_stage
    );
    Ok(())
}

fn load_config(path: Option<&PathBuf>) -> framepipe_core::Result<AppConfig> {
    match path {
        Some(path) => {
            tracing::debug!(?path, "loading configuration");
            AppConfig::load(path)
        }
        None => Ok(AppConfig::default()),
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Host a media pipeline and receive its frames", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a pipeline until end-of-stream, an error, or the frame limit.
    Run(RunArgs),
    /// Build a pipeline and verify its output stage without playing it.
    Check {
        /// Pipeline description, e.g. "testsrc num-buffers=3 ! appsink name=sink".
        description: String,
        /// JSON configuration file.
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Pipeline description. Falls back to `pipeline` in the configuration.
    description: Option<String>,
    /// JSON configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Stop after this many frames.
    #[arg(short = 'n', long)]
    max_frames: Option<u64>,
    /// Give up waiting for the pipeline to finish after this many seconds.
    #[arg(short, long)]
    timeout_secs: Option<u64>,
    /// Save every frame as `frame_<n>.bin` in this directory.
    #[arg(short, long)]
    output_dir: Option<PathBuf>,
    /// Add the last frame to the summary as a data URL of this MIME type.
    #[arg(long, value_name = "MIME")]
    data_url: Option<String>,
}
