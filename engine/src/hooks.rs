use std::path::Path;

/// Observer hooks for session lifecycle events.
///
/// All methods are invoked from the session's background task, not from
/// the thread that called [`start`](crate::Timelapse::start). A slow hook
/// delays the capture cadence, so implementations should return quickly.
///
/// Failures inside a hook are the implementor's responsibility; the
/// engine never catches or reports them.
pub trait SessionHooks: Send + Sync {
    /// One frame was captured and saved to `path`. Fired in capture order.
    fn on_frame_captured(&self, _path: &Path) {}

    /// One frame was written to the output video. `written` counts up
    /// from 1 to `total` within a single encode.
    fn on_video_progress(&self, _written: usize, _total: usize) {}

    /// The output video was finalized at `path`. Fired at most once per
    /// session, and only if at least one frame was encoded.
    fn on_video_created(&self, _path: &Path) {}
}

/// Hooks implementation that ignores every event.
#[derive(Debug, Default)]
pub struct NoHooks;

impl SessionHooks for NoHooks {}
