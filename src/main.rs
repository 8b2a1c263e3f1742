//! Aquarium capture demo: runs the capture core and reports its health

use std::time::Duration;

use aquarium_capture::{CaptureBackend, CaptureConfig, WebcamCapture};
use color_eyre::Result;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "aquarium_capture=debug".into()),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("Aquarium capture launching...");

    // Load configuration: optional TOML path, then AQUARIUM__* overrides
    let config = match std::env::args().nth(1) {
        Some(path) => CaptureConfig::load(path)?,
        None => CaptureConfig::from_env()?,
    };

    if config.source == "pattern" {
        let backend = aquarium_capture::capture::TestPattern::default();
        return run(backend, config).await;
    }

    #[cfg(feature = "v4l2")]
    {
        let backend = aquarium_capture::capture::V4l2Backend::default();
        run(backend, config).await
    }

    #[cfg(not(feature = "v4l2"))]
    {
        warn!(
            "built without the v4l2 feature; using the test pattern instead of {}",
            config.source
        );
        run(aquarium_capture::capture::TestPattern::default(), config).await
    }
}

async fn run<B: CaptureBackend>(backend: B, config: CaptureConfig) -> Result<()> {
    let mut capture = WebcamCapture::new(backend);
    capture.start(config)?;

    let mut report = tokio::time::interval(Duration::from_secs(1));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Interrupt received");
                break;
            }
            _ = report.tick() => {
                let latest = capture.get_frame().map(|frame| frame.sequence);
                let inference = capture
                    .get_inference_frame()
                    .map(|frame| (frame.width, frame.height));
                info!(
                    live = capture.is_live(),
                    fps_actual = capture.fps_actual(),
                    fps_target = capture.fps_target(),
                    latest = ?latest,
                    inference = ?inference,
                    stats = ?capture.stats(),
                    "capture health"
                );
            }
        }
    }

    if !capture.stop() {
        warn!("capture worker did not release the device in time");
    }
    info!("Aquarium capture shutting down");
    Ok(())
}
