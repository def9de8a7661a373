pub mod synthetic;

use image::RgbImage;
use std::time::Duration;
use thiserror::Error;

/// A captured camera frame plus its monotonic capture timestamp.
///
/// The timestamp is measured against the source's own clock (time since
/// `open()`), never wall time, so it is strictly increasing for the life
/// of the source.
#[derive(Debug, Clone)]
pub struct Frame {
    pub timestamp: Duration,
    pub image: RgbImage,
}

#[derive(Debug, Error)]
pub enum CameraError {
    #[error("camera unavailable: {0}")]
    Unavailable(String),

    #[error("no frame delivered within {0:?}")]
    Timeout(Duration),

    #[error("camera disconnected: {0}")]
    Disconnected(String),
}

/// Abstraction over the camera lifecycle.
///
/// Implementations hold the exclusive OS camera handle between `open()`
/// and `close()`. `close()` must be idempotent and safe to call
/// mid-loop; implementations should also release the handle on drop so
/// every exit path gives the device back. Timestamps returned from
/// `next_frame` must be strictly increasing across calls.
pub trait FrameSource: Send {
    fn open(&mut self) -> Result<(), CameraError>;

    fn next_frame(&mut self, timeout: Duration) -> Result<Frame, CameraError>;

    fn close(&mut self);
}
