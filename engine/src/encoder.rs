use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};

use tracing::{debug, error, warn};

/// Consumes ordered JPEG frames and materializes one output video.
///
/// The file is not playable until `finish` returns.
pub trait VideoSink: Send {
    fn write_frame(&mut self, jpeg: &[u8]) -> Result<(), SinkError>;
    fn finish(self: Box<Self>) -> Result<(), SinkError>;
}

/// Opens a [`VideoSink`] for a session's output file.
pub trait SinkFactory: Send + Sync {
    fn open(
        &self,
        output: &Path,
        fps: f64,
        size: (u32, u32),
    ) -> Result<Box<dyn VideoSink>, SinkError>;
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("failed to spawn ffmpeg: {0}")]
    Spawn(String),
    #[error("failed to write frame to ffmpeg stdin: {0}")]
    Write(String),
    #[error("failed to wait for ffmpeg: {0}")]
    Wait(String),
    #[error("ffmpeg exited with non-zero status: {0}")]
    FfmpegFailed(String),
}

/// Produces [`FfmpegSink`]s.
#[derive(Debug, Default)]
pub struct FfmpegSinkFactory;

impl SinkFactory for FfmpegSinkFactory {
    fn open(
        &self,
        output: &Path,
        fps: f64,
        size: (u32, u32),
    ) -> Result<Box<dyn VideoSink>, SinkError> {
        Ok(Box::new(FfmpegSink::spawn(output, fps, size)?))
    }
}

/// ffmpeg subprocess fed JPEG frames on stdin, writing H.264 MP4.
pub struct FfmpegSink {
    child: Child,
    stdin: ChildStdin,
    output_path: PathBuf,
    frame_count: u32,
}

impl FfmpegSink {
    /// Spawn an ffmpeg subprocess ready to receive JPEG frames on stdin.
    ///
    /// `size` is the probed dimensions of the first frame; every frame is
    /// scaled to it so the stream stays uniform even if the device
    /// changed resolution mid-session.
    pub fn spawn(output: &Path, fps: f64, size: (u32, u32)) -> Result<Self, SinkError> {
        let fps_str = fps.to_string();
        let size_str = format!("{}x{}", size.0, size.1);

        let mut cmd = Command::new("ffmpeg");
        cmd.args([
            "-f", "image2pipe",
            "-vcodec", "mjpeg",
            "-r", &fps_str,
            "-i", "pipe:0",
            "-c:v", "libx264",
            "-pix_fmt", "yuv420p",
            "-s", &size_str,
            "-movflags", "+faststart",
            "-y",
        ])
        .arg(output)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| SinkError::Spawn(e.to_string()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SinkError::Spawn("could not get stdin handle".into()))?;

        debug!(
            fps,
            width = size.0,
            height = size.1,
            output = output.display().to_string(),
            "ffmpeg sink started"
        );

        Ok(Self {
            child,
            stdin,
            output_path: output.to_path_buf(),
            frame_count: 0,
        })
    }
}

impl VideoSink for FfmpegSink {
    fn write_frame(&mut self, jpeg: &[u8]) -> Result<(), SinkError> {
        self.stdin
            .write_all(jpeg)
            .map_err(|e| SinkError::Write(e.to_string()))?;
        self.frame_count += 1;
        debug!(frame_count = self.frame_count, "pushed frame to ffmpeg");
        Ok(())
    }

    /// Close stdin so ffmpeg sees end-of-stream, then wait for it to
    /// finalize the file. A partial output is removed on failure.
    fn finish(self: Box<Self>) -> Result<(), SinkError> {
        let Self {
            child,
            stdin,
            output_path,
            frame_count,
        } = *self;
        drop(stdin);

        let output = child
            .wait_with_output()
            .map_err(|e| SinkError::Wait(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!(stderr = %stderr, "ffmpeg exited with error");
            let _ = std::fs::remove_file(&output_path);
            return Err(SinkError::FfmpegFailed(stderr.into_owned()));
        }

        debug!(
            frame_count,
            output = output_path.display().to_string(),
            "ffmpeg finished"
        );
        Ok(())
    }
}

/// Check whether ffmpeg is available on PATH. Logs a warning if not found.
pub fn check_ffmpeg_available() {
    match Command::new("ffmpeg")
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
    {
        Ok(status) if status.success() => {
            debug!("ffmpeg is available");
        }
        Ok(_) => {
            warn!("ffmpeg returned non-zero for -version; video assembly may fail");
        }
        Err(e) => {
            warn!(
                error = %e,
                "ffmpeg not found on PATH; video assembly will fail. \
                 Install ffmpeg with libx264 support."
            );
        }
    }
}
