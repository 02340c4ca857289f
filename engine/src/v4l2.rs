use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use timelapse_common::config::CameraConfig;
use tracing::{debug, info};
use v4l::buffer::Type;
use v4l::io::mmap::Stream as MmapStream;
use v4l::io::traits::CaptureStream;
use v4l::video::Capture;
use v4l::{Device, Format, FourCC};

use crate::camera::{Camera, CameraError, FrameSource};

type FrameResult = Result<Vec<u8>, CameraError>;

/// V4L2 webcam backend.
///
/// Captures MJPEG frames, which are complete JPEG images and go to the
/// working directory as-is, with no decode or re-encode on the rig.
pub struct V4l2Camera {
    config: CameraConfig,
}

impl V4l2Camera {
    pub fn new(config: CameraConfig) -> Self {
        Self { config }
    }
}

impl Camera for V4l2Camera {
    /// Open `/dev/video{index}` and set MJPEG format at the configured
    /// resolution. The device may pick a different resolution than
    /// requested; the actual frame dimensions always win downstream.
    fn open(&self) -> Result<Box<dyn FrameSource>, CameraError> {
        let path = format!("/dev/video{}", self.config.device);
        let device =
            Device::with_path(&path).map_err(|e| CameraError::Open(format!("{path}: {e}")))?;

        let mut format = Format::new(self.config.width, self.config.height, FourCC::new(b"MJPG"));
        format = Capture::set_format(&device, &format)
            .map_err(|e| CameraError::Open(format!("set format on {path}: {e}")))?;
        if format.fourcc != FourCC::new(b"MJPG") {
            return Err(CameraError::Open(format!(
                "{path} does not support MJPEG capture"
            )));
        }

        info!(
            device = path,
            width = format.width,
            height = format.height,
            "camera opened"
        );

        // The mmap stream borrows the device, so both live on a dedicated
        // thread; frames are pulled over a request/response channel pair.
        let (req_tx, req_rx) = mpsc::channel::<()>();
        let (frame_tx, frame_rx) = mpsc::channel::<FrameResult>();
        let handle = thread::spawn(move || capture_loop(device, req_rx, frame_tx));

        Ok(Box::new(V4l2Source {
            req_tx: Some(req_tx),
            frame_rx,
            thread_handle: Some(handle),
        }))
    }
}

struct V4l2Source {
    req_tx: Option<mpsc::Sender<()>>,
    frame_rx: mpsc::Receiver<FrameResult>,
    thread_handle: Option<JoinHandle<()>>,
}

impl FrameSource for V4l2Source {
    fn grab(&mut self) -> Result<Vec<u8>, CameraError> {
        let req_tx = self
            .req_tx
            .as_ref()
            .ok_or_else(|| CameraError::Grab("capture thread stopped".into()))?;
        req_tx
            .send(())
            .map_err(|_| CameraError::Grab("capture thread stopped".into()))?;
        self.frame_rx
            .recv()
            .map_err(|_| CameraError::Grab("capture thread stopped".into()))?
    }
}

impl Drop for V4l2Source {
    fn drop(&mut self) {
        // Closing the request channel ends the thread, which releases the
        // device before the encode phase starts.
        drop(self.req_tx.take());
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
        debug!("camera released");
    }
}

/// Capture thread: owns the device and its mmap stream, serves one frame
/// per request until the request channel closes.
fn capture_loop(device: Device, req_rx: mpsc::Receiver<()>, frame_tx: mpsc::Sender<FrameResult>) {
    let mut stream = match MmapStream::with_buffers(&device, Type::VideoCapture, 4) {
        Ok(s) => s,
        Err(e) => {
            let _ = frame_tx.send(Err(CameraError::Open(format!("mmap stream: {e}"))));
            return;
        }
    };

    while req_rx.recv().is_ok() {
        let result = match CaptureStream::next(&mut stream) {
            // The buffer is only valid until the next call, so copy out.
            Ok((frame_data, _metadata)) if !frame_data.is_empty() => Ok(frame_data.to_vec()),
            Ok(_) => Err(CameraError::Grab("empty frame from device".into())),
            Err(e) => Err(CameraError::Grab(e.to_string())),
        };
        if frame_tx.send(result).is_err() {
            break;
        }
    }
}
