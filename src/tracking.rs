use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::calibration::CalibrationResult;
use crate::config::{ScreenGeometry, TrackingConfig};
use crate::predictor::{Detection, GazeEstimate};

/// Per-frame classification of the gaze signal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TrackingStatus {
    /// Gaze present, confident, and inside screen bounds.
    Active,
    /// Gaze present but off-screen or below the active confidence bar.
    LookingAway,
    /// No reliable estimate for a sustained span of frames. A steady
    /// state, not an error; the session keeps running.
    Lost,
}

impl TrackingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackingStatus::Active => "active",
            TrackingStatus::LookingAway => "looking_away",
            TrackingStatus::Lost => "lost",
        }
    }
}

/// One row of the session trace. Append-only; rows are written in
/// strictly non-decreasing timestamp order.
///
/// CSV schema: `timestamp,gaze_x,gaze_y,status,looking_at_screen,tracking_lost`.
/// `timestamp` is seconds since session start. `gaze_x`/`gaze_y` are
/// empty whenever the frame had no valid estimate (so always empty while
/// `status=lost`); last-known positions are never repeated into rows.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrackingSample {
    pub timestamp: f64,
    pub gaze_x: Option<f32>,
    pub gaze_y: Option<f32>,
    pub status: TrackingStatus,
    pub looking_at_screen: bool,
    pub tracking_lost: bool,
}

/// Hysteresis state machine over per-frame gaze estimates.
///
/// Entering `Lost` takes `lost_after_misses` consecutive invalid
/// estimates so a blink or a single dropped frame cannot flap the state;
/// leaving `Lost` takes a single valid estimate. `Active` and
/// `LookingAway` swap immediately since both mean tracking is present.
pub struct TrackingStateMachine {
    config: TrackingConfig,
    screen: ScreenGeometry,
    calibration: CalibrationResult,
    status: TrackingStatus,
    consecutive_misses: u32,
    validity: VecDeque<bool>,
    last_timestamp: Option<f64>,
}

impl TrackingStateMachine {
    pub fn new(
        config: TrackingConfig,
        screen: ScreenGeometry,
        calibration: CalibrationResult,
    ) -> Self {
        Self {
            config,
            screen,
            calibration,
            status: TrackingStatus::Lost,
            consecutive_misses: 0,
            validity: VecDeque::new(),
            last_timestamp: None,
        }
    }

    pub fn status(&self) -> TrackingStatus {
        self.status
    }

    /// Fraction of valid frames over the recent validity window.
    pub fn recent_validity(&self) -> f32 {
        if self.validity.is_empty() {
            return 0.0;
        }
        let valid = self.validity.iter().filter(|v| **v).count();
        valid as f32 / self.validity.len() as f32
    }

    /// Register a frame that never arrived (capture timeout). Counts
    /// toward the loss hysteresis exactly like an invalid estimate, but
    /// produces no trace row: the trace records frames, and a timed-out
    /// frame never existed.
    pub fn note_miss(&mut self) {
        self.validity.push_back(false);
        while self.validity.len() > self.config.validity_window {
            self.validity.pop_front();
        }
        self.consecutive_misses += 1;
        if self.consecutive_misses >= self.config.lost_after_misses {
            self.status = TrackingStatus::Lost;
        }
    }

    /// Classify one estimate into a trace row. Never fails: an absent or
    /// garbage estimate just walks the machine toward `Lost`.
    pub fn classify(&mut self, estimate: &GazeEstimate) -> TrackingSample {
        let timestamp = estimate.timestamp.as_secs_f64();
        debug_assert!(
            self.last_timestamp.map_or(true, |last| timestamp >= last),
            "estimates must arrive in timestamp order"
        );
        self.last_timestamp = Some(timestamp);

        let valid_detection = match estimate.detection {
            Detection::Face { confidence, .. } => confidence >= self.config.min_confidence,
            Detection::NoFace => false,
        };

        self.validity.push_back(valid_detection);
        while self.validity.len() > self.config.validity_window {
            self.validity.pop_front();
        }

        let mut gaze = None;
        if valid_detection {
            self.consecutive_misses = 0;
            if let Detection::Face {
                raw_x,
                raw_y,
                confidence,
            } = estimate.detection
            {
                let (x, y) = self.calibration.apply(raw_x, raw_y);
                let on_screen = self.screen.contains(x, y);
                gaze = Some((x, y));
                self.status = if on_screen && confidence >= self.config.active_confidence {
                    TrackingStatus::Active
                } else {
                    TrackingStatus::LookingAway
                };
            }
        } else {
            self.consecutive_misses += 1;
            if self.consecutive_misses >= self.config.lost_after_misses {
                self.status = TrackingStatus::Lost;
            }
        }

        TrackingSample {
            timestamp,
            gaze_x: gaze.map(|(x, _)| x),
            gaze_y: gaze.map(|(_, y)| y),
            status: self.status,
            looking_at_screen: self.status == TrackingStatus::Active,
            tracking_lost: self.status == TrackingStatus::Lost,
        }
    }
}
