mod controller;
mod fit;

pub use controller::CalibrationController;
pub use fit::fit_transform;

use serde::{Deserialize, Serialize};

use crate::config::{CalibrationConfig, ScreenGeometry};

/// One fixation target of the calibration sequence.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CalibrationTarget {
    pub index: usize,
    pub x: f32,
    pub y: f32,
}

/// Raw predictor points gathered while the user fixates one target.
/// Consumed once by the fitting step.
#[derive(Debug, Clone)]
pub struct CalibrationSample {
    pub target: CalibrationTarget,
    pub points: Vec<(f32, f32)>,
}

/// Fitted per-session transform from raw predictor space to screen
/// pixels, plus residual metrics. Created once per session and never
/// mutated; recalibrating means starting a new session.
///
/// Per-axis affine model: `screen = c0 + c1 * raw_x + c2 * raw_y`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationResult {
    pub x_coeffs: [f32; 3],
    pub y_coeffs: [f32; 3],
    pub mean_error_px: f32,
    pub max_error_px: f32,
    /// 1.0 = perfect reconstruction, monotonically decreasing with
    /// residual error, 0.0 = unusable.
    pub quality: f32,
}

impl CalibrationResult {
    pub fn apply(&self, raw_x: f32, raw_y: f32) -> (f32, f32) {
        let x = self.x_coeffs[0] + self.x_coeffs[1] * raw_x + self.x_coeffs[2] * raw_y;
        let y = self.y_coeffs[0] + self.y_coeffs[1] * raw_x + self.y_coeffs[2] * raw_y;
        (x, y)
    }

    /// Operator-facing verdict derived from the mean residual.
    pub fn quality_band(&self) -> &'static str {
        match self.mean_error_px {
            e if e < 30.0 => "excellent",
            e if e < 60.0 => "good",
            e if e < 120.0 => "acceptable",
            _ => "poor",
        }
    }

    /// Pass-through transform for tests and diagnostics.
    #[cfg(test)]
    pub fn identity() -> Self {
        Self {
            x_coeffs: [0.0, 1.0, 0.0],
            y_coeffs: [0.0, 0.0, 1.0],
            mean_error_px: 0.0,
            max_error_px: 0.0,
            quality: 1.0,
        }
    }
}

/// Phases of the calibration state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationPhase {
    Idle,
    ShowingTarget(usize),
    Sampling(usize),
    Fitting,
    Done,
    Failed,
}

/// Fixed target sequence: a grid inset from the screen edges so the
/// corners and the center are all covered (3 per axis = 9 targets).
pub fn target_grid(screen: &ScreenGeometry, config: &CalibrationConfig) -> Vec<CalibrationTarget> {
    let per_axis = config.grid_per_axis.max(2);
    let margin_x = screen.width as f32 * config.margin_fraction;
    let margin_y = screen.height as f32 * config.margin_fraction;
    let span_x = screen.width as f32 - 2.0 * margin_x;
    let span_y = screen.height as f32 - 2.0 * margin_y;

    let mut targets = Vec::with_capacity((per_axis * per_axis) as usize);
    for row in 0..per_axis {
        for col in 0..per_axis {
            let index = (row * per_axis + col) as usize;
            targets.push(CalibrationTarget {
                index,
                x: margin_x + span_x * col as f32 / (per_axis - 1) as f32,
                y: margin_y + span_y * row as f32 / (per_axis - 1) as f32,
            });
        }
    }
    targets
}
