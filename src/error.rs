use thiserror::Error;

/// Structural failures that end (or prevent) a session.
///
/// Per-frame conditions (no face, low confidence, a single frame timeout)
/// are not errors: they are absorbed by the tracking state machine and the
/// loop keeps running. Everything here propagates to the session
/// controller, which always runs finalization before surfacing it.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("camera unavailable: {0}")]
    CameraUnavailable(String),

    #[error("camera disconnected: {reason}")]
    CameraDisconnected { reason: String },

    #[error("calibration failed: {reason} (failed targets: {failed_targets:?})")]
    CalibrationFailed {
        reason: String,
        failed_targets: Vec<usize>,
    },

    #[error("trace sink failed {consecutive_errors} consecutive writes: {last_error}")]
    TraceSinkFailed {
        consecutive_errors: u32,
        last_error: String,
    },

    #[error("recorder queue stalled: {dropped} samples could not be enqueued")]
    RecorderStalled { dropped: u64 },
}
