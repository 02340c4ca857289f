use std::path::{Path, PathBuf};
use std::sync::Arc;

use timelapse_common::frame::is_frame_file;
use tracing::{debug, info};

use crate::encoder::{SinkError, SinkFactory};
use crate::hooks::SessionHooks;

/// Turns the working directory's frame set into one encoded video.
///
/// Frames are enumerated by file pattern rather than by the capture
/// run's own counter: the directory is the source of truth. This is safe
/// because the directory is fully cleared of frame files before a
/// session starts capturing, and it is what makes stale leftovers from
/// an aborted run impossible to pick up.
pub struct VideoAssembler {
    fps: f64,
    sink_factory: Arc<dyn SinkFactory>,
}

#[derive(Debug, thiserror::Error)]
pub enum AssembleError {
    #[error("failed to scan working directory {0}: {1}")]
    Scan(String, std::io::Error),
    #[error("failed to read frame {0}: {1}")]
    ReadFrame(String, std::io::Error),
    #[error("failed to decode first frame {0}: {1}")]
    Probe(String, image::ImageError),
    #[error(transparent)]
    Sink(#[from] SinkError),
}

impl VideoAssembler {
    pub fn new(fps: f64, sink_factory: Arc<dyn SinkFactory>) -> Self {
        Self { fps, sink_factory }
    }

    /// Encode every frame file in `work_dir`, in sequence order, into a
    /// video at `output`.
    ///
    /// Returns `Ok(None)` without creating a file or firing any hook if
    /// the directory holds no frames. Otherwise fires the progress hook
    /// once per written frame and the completion hook once the file is
    /// finalized.
    ///
    /// The output dimensions come from decoding the first frame; the
    /// advisory size the camera was configured with plays no part here.
    pub fn assemble(
        &self,
        work_dir: &Path,
        output: &Path,
        hooks: &dyn SessionHooks,
    ) -> Result<Option<PathBuf>, AssembleError> {
        let frames = collect_frames(work_dir)?;
        if frames.is_empty() {
            info!(
                dir = work_dir.display().to_string(),
                "no frames in working directory, skipping video assembly"
            );
            return Ok(None);
        }
        let total = frames.len();

        let first = std::fs::read(&frames[0])
            .map_err(|e| AssembleError::ReadFrame(frames[0].display().to_string(), e))?;
        let probed = image::load_from_memory(&first)
            .map_err(|e| AssembleError::Probe(frames[0].display().to_string(), e))?;
        let size = (probed.width(), probed.height());

        info!(
            frames = total,
            width = size.0,
            height = size.1,
            fps = self.fps,
            output = output.display().to_string(),
            "assembling video"
        );

        let mut sink = self.sink_factory.open(output, self.fps, size)?;
        for (idx, path) in frames.iter().enumerate() {
            let jpeg = std::fs::read(path)
                .map_err(|e| AssembleError::ReadFrame(path.display().to_string(), e))?;
            sink.write_frame(&jpeg)?;
            hooks.on_video_progress(idx + 1, total);
        }
        sink.finish()?;

        hooks.on_video_created(output);
        Ok(Some(output.to_path_buf()))
    }
}

/// All frame files in `work_dir`, sorted by filename. Zero-padded
/// sequence numbers make that order equal to capture order regardless of
/// how the filesystem enumerates the directory.
pub fn collect_frames(work_dir: &Path) -> Result<Vec<PathBuf>, AssembleError> {
    let scan_err = |e| AssembleError::Scan(work_dir.display().to_string(), e);
    let mut frames = Vec::new();
    for entry in std::fs::read_dir(work_dir).map_err(scan_err)? {
        let path = entry.map_err(scan_err)?.path();
        if path.is_file() && is_frame_file(&path) {
            frames.push(path);
        }
    }
    frames.sort();
    Ok(frames)
}

/// Delete every frame file in `work_dir`.
///
/// Runs at the start of a session (stale leftovers) and again after the
/// encode phase, whether encoding succeeded or not.
pub fn clear_frame_files(work_dir: &Path) -> std::io::Result<usize> {
    let mut removed = 0;
    for entry in std::fs::read_dir(work_dir)? {
        let path = entry?.path();
        if path.is_file() && is_frame_file(&path) {
            std::fs::remove_file(&path)?;
            removed += 1;
        }
    }
    if removed > 0 {
        debug!(
            removed,
            dir = work_dir.display().to_string(),
            "deleted frame files"
        );
    }
    Ok(removed)
}
