use std::path::PathBuf;

use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use log::info;

use gazetrace::camera::synthetic::SyntheticFrameSource;
use gazetrace::config::EngineConfig;
use gazetrace::display::{self, DisplayEvent, DisplayReceiver, FeedbackSender, UiFeedback};
use gazetrace::predictor::{FixationHandle, SyntheticPredictor};
use gazetrace::session::SessionController;

#[derive(Parser, Debug)]
#[command(name = "gazetrace", version, about = "Webcam gaze-session recorder")]
struct CliArgs {
    /// Session name; also names the output directory and trace file.
    #[arg(default_value_t = default_session_name())]
    session_name: String,

    /// JSON engine config; built-in defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory session folders are created under.
    #[arg(long, default_value = ".")]
    output_dir: PathBuf,
}

fn default_session_name() -> String {
    format!("session_{}", Utc::now().timestamp())
}

/// Console presentation layer: logs display intents and, because this
/// build runs against the synthetic collaborators, steers the synthetic
/// gaze onto each calibration target as it is shown.
fn spawn_presenter(
    mut rx: DisplayReceiver,
    ack: FeedbackSender,
    fixation: FixationHandle,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                DisplayEvent::ShowCalibrationTarget {
                    index,
                    total,
                    x,
                    y,
                } => {
                    info!("display: target {}/{} at ({x:.0}, {y:.0})", index + 1, total);
                    fixation.look_at(x, y);
                    let _ = ack.send(UiFeedback::TargetDisplayed { index });
                }
                DisplayEvent::CalibrationFinished { quality } => {
                    info!("display: calibration quality {quality:.3}");
                }
                DisplayEvent::TrackingChanged { status } => {
                    info!("display: tracking badge -> {}", status.as_str());
                }
                DisplayEvent::SessionFinished => {
                    info!("display: session finished");
                }
                DisplayEvent::HideCalibrationTarget | DisplayEvent::GazeMoved { .. } => {}
            }
        }
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    // Reads RUST_LOG, defaults to info.
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let args = CliArgs::parse();
    let config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };

    info!(
        "gazetrace starting: session '{}', screen {}x{}",
        args.session_name, config.screen.width, config.screen.height
    );

    // Synthetic collaborators stand in for the webcam and the inference
    // runtime; real deployments plug their own FrameSource/GazePredictor
    // into SessionController.
    let fixation = FixationHandle::new(
        config.screen.width as f32 / 2.0,
        config.screen.height as f32 / 2.0,
    );
    let source = SyntheticFrameSource::new(30).paced(true);
    let predictor = SyntheticPredictor::new(config.screen, fixation.clone())
        .with_noise(0.005)
        .with_miss_rate(0.02);

    let (tx, rx) = display::channel();
    let (ack_tx, ack_rx) = display::feedback_channel();
    let presenter = spawn_presenter(rx, ack_tx, fixation);

    let controller = SessionController::new(config, tx);
    let token = controller.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received, stopping session");
            token.cancel();
        }
    });

    let result = controller
        .run(
            &args.output_dir,
            &args.session_name,
            Box::new(source),
            Box::new(predictor),
            ack_rx,
        )
        .await;

    drop(controller);
    let _ = presenter.await;

    let stats = result?;
    info!(
        "done: {} samples over {:.1}s",
        stats.total_samples, stats.duration_secs
    );
    Ok(())
}
