use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, time::Duration};

/// Screen geometry the gaze trace is expressed in, in pixels.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScreenGeometry {
    pub width: u32,
    pub height: u32,
}

impl Default for ScreenGeometry {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
        }
    }
}

impl ScreenGeometry {
    pub fn contains(&self, x: f32, y: f32) -> bool {
        x >= 0.0 && y >= 0.0 && x <= self.width as f32 && y <= self.height as f32
    }
}

/// Calibration sampling and fitting thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationConfig {
    /// Grid dimension per axis (3 = 9 targets covering corners and center).
    pub grid_per_axis: u32,
    /// Fraction of screen size kept as margin around the target grid.
    pub margin_fraction: f32,
    /// Frames discarded after a target appears, while the eye settles.
    pub settle_ms: u64,
    /// Valid estimates collected per target.
    pub samples_per_target: usize,
    /// Sampling window gives up when fewer than this fraction of frames
    /// in the window yield a valid estimate.
    pub min_valid_fraction: f32,
    /// Maximum frames spent sampling one target attempt.
    pub max_window_frames: usize,
    /// Retries per target before calibration aborts.
    pub max_target_retries: u32,
    /// How long to wait for the presentation layer to confirm a target
    /// is on screen before sampling anyway.
    pub target_ack_timeout_ms: u64,
    /// Residual (px) at which the quality score drops to 0.5.
    pub quality_tolerance_px: f32,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            grid_per_axis: 3,
            margin_fraction: 0.10,
            settle_ms: 500,
            samples_per_target: 20,
            min_valid_fraction: 0.6,
            max_window_frames: 60,
            max_target_retries: 2,
            target_ack_timeout_ms: 2000,
            quality_tolerance_px: 100.0,
        }
    }
}

/// Tracking state machine thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingConfig {
    /// Sliding window of recent validity flags.
    pub validity_window: usize,
    /// Consecutive invalid estimates before entering Lost.
    pub lost_after_misses: u32,
    /// Minimum confidence for an Active classification.
    pub active_confidence: f32,
    /// Minimum confidence for the estimate to count as valid at all;
    /// between this and `active_confidence` the state is LookingAway.
    pub min_confidence: f32,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            validity_window: 10,
            lost_after_misses: 5,
            active_confidence: 0.5,
            min_confidence: 0.2,
        }
    }
}

/// Recorder queue, flush and snapshot tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecorderConfig {
    /// Bounded queue between the capture loop and the writer task.
    pub queue_capacity: usize,
    /// Rows buffered before an unconditional flush.
    pub flush_every_rows: usize,
    /// Wall-clock flush interval in milliseconds.
    pub flush_interval_ms: u64,
    /// Seconds of session time between reference snapshots.
    pub snapshot_interval_secs: f64,
    /// JPEG quality for snapshots (bounds disk usage over hours).
    pub jpeg_quality: u8,
    /// Consecutive CSV write failures tolerated before the session aborts.
    pub max_csv_write_failures: u32,
    /// Consecutive enqueue failures tolerated before the session aborts.
    pub max_enqueue_failures: u32,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 4096,
            flush_every_rows: 64,
            flush_interval_ms: 1000,
            snapshot_interval_secs: 2.0,
            jpeg_quality: 85,
            max_csv_write_failures: 5,
            max_enqueue_failures: 30,
        }
    }
}

/// Frame acquisition tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Deadline for a single frame delivery in milliseconds.
    pub frame_timeout_ms: u64,
    /// Consecutive timeouts before the camera is declared disconnected.
    pub max_consecutive_timeouts: u32,
}

impl CaptureConfig {
    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            frame_timeout_ms: 500,
            max_consecutive_timeouts: 10,
        }
    }
}

/// Top-level engine configuration, loadable from a JSON file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub screen: ScreenGeometry,
    pub calibration: CalibrationConfig,
    pub tracking: TrackingConfig,
    pub recorder: RecorderConfig,
    pub capture: CaptureConfig,
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config at {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let serialized = serde_json::to_string_pretty(self)?;
        fs::write(path, serialized)
            .with_context(|| format!("Failed to write config to {}", path.display()))
    }
}
