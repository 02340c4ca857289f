//! Capture/encode engine for the time-lapse rig.
//!
//! One [`Timelapse`] owns the session lifecycle: `start` spawns a
//! background task that samples frames from a camera on a timer, then
//! assembles the captured frames into a video; `stop` requests early
//! termination and waits for the whole pipeline to finish. Lifecycle
//! events are surfaced through [`SessionHooks`], which fire from the
//! background task.

pub mod assembler;
pub mod camera;
pub mod encoder;
pub mod hooks;
pub mod session;

#[cfg(feature = "v4l2")]
pub mod v4l2;

pub use assembler::VideoAssembler;
pub use camera::{Camera, CameraError, FrameSource};
pub use encoder::{FfmpegSinkFactory, SinkError, SinkFactory, VideoSink};
pub use hooks::SessionHooks;
pub use session::{SessionConfig, SessionState, Timelapse};

#[cfg(feature = "v4l2")]
pub use v4l2::V4l2Camera;
