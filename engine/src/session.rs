use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use timelapse_common::frame::frame_file_name;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::assembler::{clear_frame_files, VideoAssembler};
use crate::camera::Camera;
use crate::encoder::SinkFactory;
use crate::hooks::SessionHooks;

/// Settings for one capture session. Immutable for the session's lifetime.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Sleep between frame grabs. The cadence is sleep-then-grab, so the
    /// effective inter-frame spacing is `interval` plus the grab latency;
    /// it is not deadline-corrected.
    pub interval: Duration,
    /// Wall-clock bound on the capture phase.
    pub duration: Duration,
    /// Frame rate of the output video.
    pub fps: f64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            duration: Duration::from_secs(60),
            fps: 24.0,
        }
    }
}

/// Lifecycle of a session. There is exactly one transition path,
/// `Idle -> Capturing -> Encoding -> Idle`, and no pause or resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Idle = 0,
    Capturing = 1,
    Encoding = 2,
}

/// Session state shared between the control side and the worker task.
struct StateCell(AtomicU8);

impl StateCell {
    fn new() -> Self {
        Self(AtomicU8::new(SessionState::Idle as u8))
    }

    fn load(&self) -> SessionState {
        match self.0.load(Ordering::Acquire) {
            1 => SessionState::Capturing,
            2 => SessionState::Encoding,
            _ => SessionState::Idle,
        }
    }

    fn store(&self, state: SessionState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Atomic `Idle -> Capturing` transition; the gate that makes
    /// concurrent `start` calls admit exactly one session.
    fn try_begin(&self) -> bool {
        self.0
            .compare_exchange(
                SessionState::Idle as u8,
                SessionState::Capturing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

/// Drives time-lapse capture sessions.
///
/// [`start`](Self::start) spawns one background task that samples frames
/// from the camera on a timer and, once the capture loop exits, assembles
/// them into a video. [`stop`](Self::stop) requests early termination and
/// waits for the whole pipeline, encode included, to finish. All
/// [`SessionHooks`] methods fire from the background task.
///
/// At most one session is in flight at a time; a `start` while one is
/// active is a silent no-op, as is a `stop` with nothing running.
pub struct Timelapse {
    config: SessionConfig,
    camera: Arc<dyn Camera>,
    sink_factory: Arc<dyn SinkFactory>,
    hooks: Arc<dyn SessionHooks>,
    state: Arc<StateCell>,
    stop: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Timelapse {
    pub fn new(
        config: SessionConfig,
        camera: Arc<dyn Camera>,
        sink_factory: Arc<dyn SinkFactory>,
        hooks: Arc<dyn SessionHooks>,
    ) -> Self {
        Self {
            config,
            camera,
            sink_factory,
            hooks,
            state: Arc::new(StateCell::new()),
            stop: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state.load()
    }

    pub fn is_active(&self) -> bool {
        self.state() != SessionState::Idle
    }

    /// Begin a capture session whose finished video lands at
    /// `output_path`. Returns immediately; the session runs on a
    /// background task spawned on the current tokio runtime.
    ///
    /// Silently ignored if a session is already in flight.
    pub fn start(&self, output_path: impl Into<PathBuf>) {
        let mut worker_slot = self.worker.lock().unwrap();
        if !self.state.try_begin() {
            debug!("start ignored, session already active");
            return;
        }
        self.stop.store(false, Ordering::Release);

        let worker = Worker {
            config: self.config.clone(),
            camera: Arc::clone(&self.camera),
            sink_factory: Arc::clone(&self.sink_factory),
            hooks: Arc::clone(&self.hooks),
            state: Arc::clone(&self.state),
            stop: Arc::clone(&self.stop),
            output_path: output_path.into(),
        };
        *worker_slot = Some(tokio::spawn(worker.run()));
    }

    /// Request early termination and wait for the session to finish.
    ///
    /// Sets the cooperative stop flag (observed within one interval) and
    /// then awaits the worker task, which spans both the capture loop and
    /// video assembly. When this returns the state is
    /// [`SessionState::Idle`] and either the completion hook has already
    /// fired or no frames were captured. A no-op if nothing is in flight.
    pub async fn stop(&self) {
        let handle = self.worker.lock().unwrap().take();
        let Some(handle) = handle else {
            debug!("stop ignored, no session in flight");
            return;
        };
        self.stop.store(true, Ordering::Release);
        // The await is the join point: everything the worker wrote is
        // visible once it completes.
        if let Err(e) = handle.await {
            error!(error = %e, "session task failed");
        }
    }
}

/// State owned by the background task for one session.
struct Worker {
    config: SessionConfig,
    camera: Arc<dyn Camera>,
    sink_factory: Arc<dyn SinkFactory>,
    hooks: Arc<dyn SessionHooks>,
    state: Arc<StateCell>,
    stop: Arc<AtomicBool>,
    output_path: PathBuf,
}

impl Worker {
    async fn run(self) {
        self.run_session().await;
        // Every exit path, normal or aborted, returns the machine to
        // Idle so a new start() is accepted.
        self.state.store(SessionState::Idle);
    }

    async fn run_session(&self) {
        let work_dir = match self.output_path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        if let Err(e) = std::fs::create_dir_all(&work_dir) {
            error!(
                dir = work_dir.display().to_string(),
                error = %e,
                "failed to create output directory"
            );
            return;
        }
        // Stale frames from a previous run would otherwise end up in
        // this session's video, since the assembler enumerates by
        // pattern.
        match clear_frame_files(&work_dir) {
            Ok(0) => {}
            Ok(n) => info!(
                removed = n,
                dir = work_dir.display().to_string(),
                "cleared stale frame files"
            ),
            Err(e) => {
                error!(
                    dir = work_dir.display().to_string(),
                    error = %e,
                    "failed to clear stale frame files"
                );
                return;
            }
        }

        if !self.capture_frames(&work_dir).await {
            return;
        }

        self.state.store(SessionState::Encoding);
        let assembler = VideoAssembler::new(self.config.fps, Arc::clone(&self.sink_factory));
        match assembler.assemble(&work_dir, &self.output_path, self.hooks.as_ref()) {
            Ok(Some(path)) => info!(path = path.display().to_string(), "video created"),
            Ok(None) => {}
            Err(e) => error!(error = %e, "video assembly failed"),
        }
        // Work files go away however the encode phase ended.
        if let Err(e) = clear_frame_files(&work_dir) {
            warn!(
                dir = work_dir.display().to_string(),
                error = %e,
                "failed to delete work files"
            );
        }
    }

    /// The capture loop. Returns `true` if the session should proceed to
    /// the encode phase, `false` if it aborted.
    ///
    /// The camera is opened here and released (dropped) before this
    /// returns, so the device is free before encoding begins.
    async fn capture_frames(&self, work_dir: &Path) -> bool {
        let mut source = match self.camera.open() {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "failed to open capture device");
                return false;
            }
        };

        info!(
            dir = work_dir.display().to_string(),
            interval_ms = self.config.interval.as_millis() as u64,
            duration_ms = self.config.duration.as_millis() as u64,
            "capture started"
        );

        let started = Instant::now();
        let mut seq: u64 = 0;
        while started.elapsed() < self.config.duration && !self.stop.load(Ordering::Acquire) {
            tokio::time::sleep(self.config.interval).await;

            let jpeg = match source.grab() {
                Ok(j) => j,
                Err(e) => {
                    // Fatal for the session: no encode phase, no video.
                    error!(error = %e, seq, "failed to capture frame, aborting session");
                    return false;
                }
            };

            let path = work_dir.join(frame_file_name(seq));
            if let Err(e) = std::fs::write(&path, &jpeg) {
                error!(
                    path = path.display().to_string(),
                    error = %e,
                    "failed to save frame, aborting session"
                );
                return false;
            }
            debug!(
                path = path.display().to_string(),
                bytes = jpeg.len(),
                "frame saved"
            );
            seq += 1;
            self.hooks.on_frame_captured(&path);
        }

        info!(
            frames = seq,
            stopped = self.stop.load(Ordering::Acquire),
            "capture finished"
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{CameraError, FrameSource};
    use crate::encoder::{SinkError, VideoSink};
    use std::sync::atomic::AtomicU64;

    static DIR_SEQ: AtomicU64 = AtomicU64::new(0);

    fn temp_work_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "timelapse-session-{}-{}-{}",
            std::process::id(),
            tag,
            DIR_SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn test_jpeg() -> Vec<u8> {
        let img = image::RgbImage::from_pixel(8, 6, image::Rgb([10, 180, 90]));
        let mut buf = std::io::Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut buf, image::ImageFormat::Jpeg)
            .unwrap();
        buf.into_inner()
    }

    struct StubCamera;

    impl Camera for StubCamera {
        fn open(&self) -> Result<Box<dyn FrameSource>, CameraError> {
            Ok(Box::new(StubSource(test_jpeg())))
        }
    }

    struct StubSource(Vec<u8>);

    impl FrameSource for StubSource {
        fn grab(&mut self) -> Result<Vec<u8>, CameraError> {
            Ok(self.0.clone())
        }
    }

    struct FailingCamera;

    impl Camera for FailingCamera {
        fn open(&self) -> Result<Box<dyn FrameSource>, CameraError> {
            Ok(Box::new(FailingSource))
        }
    }

    struct FailingSource;

    impl FrameSource for FailingSource {
        fn grab(&mut self) -> Result<Vec<u8>, CameraError> {
            Err(CameraError::Grab("stub device yields nothing".into()))
        }
    }

    #[derive(Default)]
    struct SinkLog {
        opened: Mutex<Vec<PathBuf>>,
        frames: Mutex<Vec<Vec<u8>>>,
    }

    struct LogSinkFactory(Arc<SinkLog>);

    impl SinkFactory for LogSinkFactory {
        fn open(
            &self,
            output: &Path,
            _fps: f64,
            _size: (u32, u32),
        ) -> Result<Box<dyn VideoSink>, SinkError> {
            self.0.opened.lock().unwrap().push(output.to_path_buf());
            Ok(Box::new(LogSink(Arc::clone(&self.0))))
        }
    }

    struct LogSink(Arc<SinkLog>);

    impl VideoSink for LogSink {
        fn write_frame(&mut self, jpeg: &[u8]) -> Result<(), SinkError> {
            self.0.frames.lock().unwrap().push(jpeg.to_vec());
            Ok(())
        }

        fn finish(self: Box<Self>) -> Result<(), SinkError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecHooks {
        captured: Mutex<Vec<PathBuf>>,
        progress: Mutex<Vec<(usize, usize)>>,
        created: Mutex<Vec<PathBuf>>,
    }

    impl SessionHooks for RecHooks {
        fn on_frame_captured(&self, path: &Path) {
            self.captured.lock().unwrap().push(path.to_path_buf());
        }

        fn on_video_progress(&self, written: usize, total: usize) {
            self.progress.lock().unwrap().push((written, total));
        }

        fn on_video_created(&self, path: &Path) {
            self.created.lock().unwrap().push(path.to_path_buf());
        }
    }

    fn session(
        interval: Duration,
        duration: Duration,
        camera: Arc<dyn Camera>,
    ) -> (Timelapse, Arc<SinkLog>, Arc<RecHooks>) {
        let log = Arc::new(SinkLog::default());
        let hooks = Arc::new(RecHooks::default());
        let timelapse = Timelapse::new(
            SessionConfig {
                interval,
                duration,
                fps: 24.0,
            },
            camera,
            Arc::new(LogSinkFactory(Arc::clone(&log))),
            Arc::clone(&hooks) as Arc<dyn SessionHooks>,
        );
        (timelapse, log, hooks)
    }

    async fn wait_until_idle(timelapse: &Timelapse, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        while timelapse.state() != SessionState::Idle {
            assert!(Instant::now() < deadline, "session did not return to idle");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn start_while_active_is_a_silent_no_op() {
        let dir = temp_work_dir("double-start");
        let (timelapse, log, hooks) = session(
            Duration::from_millis(10),
            Duration::from_secs(30),
            Arc::new(StubCamera),
        );

        timelapse.start(dir.join("first.mp4"));
        assert_eq!(timelapse.state(), SessionState::Capturing);

        tokio::time::sleep(Duration::from_millis(50)).await;
        timelapse.start(dir.join("second.mp4"));
        timelapse.stop().await;

        assert_eq!(*log.opened.lock().unwrap(), vec![dir.join("first.mp4")]);
        assert_eq!(
            *hooks.created.lock().unwrap(),
            vec![dir.join("first.mp4")],
            "only the first session ran"
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_returns_only_after_the_pipeline_finished() {
        let dir = temp_work_dir("stop-sync");
        let (timelapse, log, hooks) = session(
            Duration::from_millis(10),
            Duration::from_secs(30),
            Arc::new(StubCamera),
        );

        timelapse.start(dir.join("out.mp4"));
        tokio::time::sleep(Duration::from_millis(60)).await;
        timelapse.stop().await;

        assert_eq!(timelapse.state(), SessionState::Idle);
        let created = hooks.created.lock().unwrap();
        assert_eq!(*created, vec![dir.join("out.mp4")]);

        let captured = hooks.captured.lock().unwrap().len();
        assert!(captured >= 1, "expected at least one captured frame");
        assert_eq!(log.frames.lock().unwrap().len(), captured);

        let progress = hooks.progress.lock().unwrap();
        let expected: Vec<_> = (1..=captured).map(|i| (i, captured)).collect();
        assert_eq!(*progress, expected, "progress counts 1..=total");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn capture_ends_at_the_configured_duration() {
        let dir = temp_work_dir("duration");
        let (timelapse, _log, hooks) = session(
            Duration::from_millis(20),
            Duration::from_millis(100),
            Arc::new(StubCamera),
        );

        let begun = Instant::now();
        timelapse.start(dir.join("out.mp4"));
        wait_until_idle(&timelapse, Duration::from_secs(2)).await;

        // duration + one interval, with generous scheduling headroom.
        assert!(begun.elapsed() < Duration::from_secs(1));
        let captured = hooks.captured.lock().unwrap().len();
        assert!(
            (1..=6).contains(&captured),
            "expected about floor(100/20) frames, got {captured}"
        );
        assert_eq!(hooks.created.lock().unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failing_device_aborts_without_a_video() {
        let dir = temp_work_dir("device-failure");
        let (timelapse, log, hooks) = session(
            Duration::from_millis(10),
            Duration::from_secs(30),
            Arc::new(FailingCamera),
        );

        timelapse.start(dir.join("out.mp4"));
        wait_until_idle(&timelapse, Duration::from_secs(2)).await;

        assert!(hooks.captured.lock().unwrap().is_empty());
        assert!(hooks.created.lock().unwrap().is_empty());
        assert!(log.opened.lock().unwrap().is_empty(), "encode never ran");
        assert!(!dir.join("out.mp4").exists());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stale_frames_are_cleared_before_capture() {
        let dir = temp_work_dir("stale");
        // Leftovers from a hypothetical earlier run. High sequence
        // numbers: if they survived, they would sort after this session's
        // frames and show up at the end of the encoded stream.
        for seq in [999_990u64, 999_991, 999_992] {
            std::fs::write(dir.join(frame_file_name(seq)), b"stale junk").unwrap();
        }

        let (timelapse, log, hooks) = session(
            Duration::from_millis(10),
            Duration::from_millis(80),
            Arc::new(StubCamera),
        );
        timelapse.start(dir.join("out.mp4"));
        wait_until_idle(&timelapse, Duration::from_secs(2)).await;

        assert_eq!(hooks.created.lock().unwrap().len(), 1);
        let captured = hooks.captured.lock().unwrap().len();
        let frames = log.frames.lock().unwrap();
        assert_eq!(frames.len(), captured, "video holds only this session's frames");
        assert!(frames.iter().all(|f| f == &test_jpeg()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_with_nothing_running_is_a_no_op() {
        let (timelapse, log, hooks) = session(
            Duration::from_millis(10),
            Duration::from_secs(1),
            Arc::new(StubCamera),
        );

        timelapse.stop().await;

        assert_eq!(timelapse.state(), SessionState::Idle);
        assert!(log.opened.lock().unwrap().is_empty());
        assert!(hooks.created.lock().unwrap().is_empty());
    }
}
