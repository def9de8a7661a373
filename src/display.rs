use serde::Serialize;
use tokio::sync::mpsc;

use crate::tracking::TrackingStatus;

/// Intents emitted to the external presentation layer.
///
/// The engine never draws; calibration targets, the live gaze cursor and
/// the tracking badge are all rendered by whoever consumes this channel.
/// Emission is fire-and-forget: a missing or slow UI must not stall the
/// capture loop.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DisplayEvent {
    ShowCalibrationTarget {
        index: usize,
        total: usize,
        x: f32,
        y: f32,
    },
    HideCalibrationTarget,
    CalibrationFinished {
        quality: f32,
    },
    GazeMoved {
        x: f32,
        y: f32,
    },
    TrackingChanged {
        status: TrackingStatus,
    },
    SessionFinished,
}

pub type DisplaySender = mpsc::UnboundedSender<DisplayEvent>;
pub type DisplayReceiver = mpsc::UnboundedReceiver<DisplayEvent>;

pub fn channel() -> (DisplaySender, DisplayReceiver) {
    mpsc::unbounded_channel()
}

/// Send without caring whether a presentation layer is attached.
pub fn emit(tx: &DisplaySender, event: DisplayEvent) {
    let _ = tx.send(event);
}

/// Input events coming back from the presentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiFeedback {
    /// The calibration target with this index is now on screen.
    TargetDisplayed { index: usize },
}

pub type FeedbackSender = std::sync::mpsc::Sender<UiFeedback>;
pub type FeedbackReceiver = std::sync::mpsc::Receiver<UiFeedback>;

/// Std channel on purpose: the calibration controller waits on it with a
/// deadline from blocking context. Dropping the sender means "no
/// presentation layer attached" and sampling proceeds after the settle
/// window alone.
pub fn feedback_channel() -> (FeedbackSender, FeedbackReceiver) {
    std::sync::mpsc::channel()
}
