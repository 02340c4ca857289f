/// An open capture device yielding JPEG frames.
///
/// `grab` is a synchronous call; the capture worker sleeps between grabs
/// and applies no timeout around them, so an implementation that hangs
/// stalls the whole session. Dropping the source releases the device.
pub trait FrameSource: Send {
    /// Acquire one frame as encoded JPEG bytes.
    fn grab(&mut self) -> Result<Vec<u8>, CameraError>;
}

/// A camera device that is opened once per session and released (by
/// dropping the [`FrameSource`]) when the capture phase ends.
pub trait Camera: Send + Sync {
    fn open(&self) -> Result<Box<dyn FrameSource>, CameraError>;
}

#[derive(Debug, thiserror::Error)]
pub enum CameraError {
    #[error("failed to open capture device: {0}")]
    Open(String),
    #[error("device returned no frame data: {0}")]
    Grab(String),
}
