use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use timelapse_common::config::{Config, VideoConfig};
use timelapse_engine::encoder::check_ffmpeg_available;
use timelapse_engine::{Camera, FfmpegSinkFactory, SessionConfig, SessionHooks, Timelapse};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

/// Counter file for serial-numbered output filenames, kept in the
/// output directory so numbering survives restarts.
const SERIAL_NUMBER_FILE: &str = "serial_number.txt";

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    info!(
        device = config.camera.device,
        interval_secs = config.capture.interval_secs,
        duration_secs = config.capture.duration_secs,
        fps = config.video.fps,
        output_dir = config.video.output_dir,
        "starting time-lapse rig"
    );

    // Encoding will fail without it; say so up front.
    check_ffmpeg_available();

    #[cfg(feature = "v4l2")]
    let camera: Arc<dyn Camera> =
        Arc::new(timelapse_engine::V4l2Camera::new(config.camera.clone()));
    #[cfg(not(feature = "v4l2"))]
    let camera: Arc<dyn Camera> = {
        error!("this build has no camera backend; rebuild with --features v4l2");
        std::process::exit(1)
    };

    let session_config = SessionConfig {
        interval: Duration::from_secs(config.capture.interval_secs),
        duration: Duration::from_secs(config.capture.duration_secs),
        fps: config.video.fps,
    };
    let timelapse = Timelapse::new(
        session_config,
        camera,
        Arc::new(FfmpegSinkFactory),
        Arc::new(ConsoleHooks::new()),
    );

    info!("press Enter to start or stop a session, Ctrl-C to quit");
    run_trigger_loop(&timelapse, &config.video).await;

    // Let an in-flight session finish its video before the process exits.
    timelapse.stop().await;
    info!("time-lapse rig stopped");
}

/// Maps trigger events onto the session: each input line toggles
/// start/stop (standing in for the rig's tactile switch), Ctrl-C exits.
async fn run_trigger_loop(timelapse: &Timelapse, video: &VideoConfig) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, shutting down");
                return;
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(_)) => {
                        if !timelapse.is_active() {
                            match next_output_path(video) {
                                Ok(path) => {
                                    info!(path = path.display().to_string(), "session started");
                                    timelapse.start(path);
                                }
                                Err(e) => error!(error = %e, "failed to derive output path"),
                            }
                        } else {
                            info!("stop requested, waiting for the session to finish");
                            timelapse.stop().await;
                        }
                    }
                    Ok(None) => {
                        // stdin closed (e.g. running under a supervisor);
                        // nothing left to toggle with, so just wait for
                        // the interrupt.
                        let _ = tokio::signal::ctrl_c().await;
                        info!("interrupt received, shutting down");
                        return;
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to read trigger input");
                        return;
                    }
                }
            }
        }
    }
}

/// Next serial-numbered output path, e.g. `output/timelapse_0007.mp4`.
fn next_output_path(video: &VideoConfig) -> std::io::Result<PathBuf> {
    let dir = Path::new(&video.output_dir);
    std::fs::create_dir_all(dir)?;

    let counter_path = dir.join(SERIAL_NUMBER_FILE);
    let current: u32 = std::fs::read_to_string(&counter_path)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0);
    let next = current + 1;
    std::fs::write(&counter_path, next.to_string())?;

    let file = Path::new(&video.output_file);
    let stem = file
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("timelapse");
    let ext = file.extension().and_then(|s| s.to_str()).unwrap_or("mp4");
    Ok(dir.join(format!("{stem}_{next:04}.{ext}")))
}

/// Hooks that narrate the session on the console.
///
/// Encode progress arrives once per frame; log lines are throttled to
/// one per second so long encodes don't flood the output.
struct ConsoleHooks {
    last_progress_log: Mutex<chrono::DateTime<chrono::Utc>>,
}

impl ConsoleHooks {
    fn new() -> Self {
        Self {
            last_progress_log: Mutex::new(chrono::DateTime::<chrono::Utc>::MIN_UTC),
        }
    }
}

impl SessionHooks for ConsoleHooks {
    fn on_frame_captured(&self, path: &Path) {
        info!(path = path.display().to_string(), "frame captured");
    }

    fn on_video_progress(&self, written: usize, total: usize) {
        let now = chrono::Utc::now();
        let mut last = self.last_progress_log.lock().unwrap();
        if (now - *last).num_seconds() >= 1 || written == total {
            *last = now;
            let percent = written * 100 / total;
            info!(percent, written, total, "encoding video");
        }
    }

    fn on_video_created(&self, path: &Path) {
        info!(path = path.display().to_string(), "video created");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_video_config(tag: &str) -> VideoConfig {
        let dir = std::env::temp_dir().join(format!("timelapse-rig-{}-{tag}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        VideoConfig {
            fps: 24.0,
            output_dir: dir.to_str().unwrap().to_string(),
            output_file: "timelapse.mp4".to_string(),
        }
    }

    #[test]
    fn output_paths_are_serially_numbered() {
        let video = temp_video_config("serial");
        let first = next_output_path(&video).unwrap();
        let second = next_output_path(&video).unwrap();
        assert!(first.ends_with("timelapse_0001.mp4"), "got {first:?}");
        assert!(second.ends_with("timelapse_0002.mp4"), "got {second:?}");
    }

    #[test]
    fn counter_survives_a_garbled_counter_file() {
        let video = temp_video_config("garbled");
        std::fs::write(
            Path::new(&video.output_dir).join(SERIAL_NUMBER_FILE),
            "not a number",
        )
        .unwrap();
        let path = next_output_path(&video).unwrap();
        assert!(path.ends_with("timelapse_0001.mp4"), "got {path:?}");
    }
}
