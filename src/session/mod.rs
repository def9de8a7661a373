mod controller;

pub use controller::SessionController;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::info;
use serde::Serialize;
use uuid::Uuid;

use crate::tracking::{TrackingSample, TrackingStatus};

/// Per-session context: identity, directory layout, start time.
/// Constructed at start, carried through the loop, destroyed after
/// finalization; never ambient state.
///
/// On-disk layout:
/// ```text
/// <name>/
///   <name>.csv
///   images/0001.jpg, 0002.jpg, ...
/// ```
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub name: String,
    pub dir: PathBuf,
    pub images_dir: PathBuf,
    pub csv_path: PathBuf,
    pub started_at: DateTime<Utc>,
}

impl Session {
    /// Create the session directory tree under `base_dir`. A name
    /// collision gets a `_<n>` suffix instead of clobbering old data.
    pub fn create(base_dir: &Path, name: &str) -> Result<Self> {
        let mut effective_name = name.to_string();
        let mut dir = base_dir.join(&effective_name);
        let mut suffix = 0u32;
        while dir.exists() {
            suffix += 1;
            effective_name = format!("{name}_{suffix}");
            dir = base_dir.join(&effective_name);
        }
        let images_dir = dir.join("images");
        fs::create_dir_all(&images_dir)
            .with_context(|| format!("Failed to create session directory {}", dir.display()))?;

        let csv_path = dir.join(format!("{effective_name}.csv"));
        info!("session directory created: {}", dir.display());

        Ok(Self {
            id: Uuid::new_v4().to_string(),
            name: effective_name,
            dir,
            images_dir,
            csv_path,
            started_at: Utc::now(),
        })
    }
}

/// End-of-session aggregates reported to the operator.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub session_name: String,
    pub started_at: DateTime<Utc>,
    pub stopped_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub total_samples: u64,
    pub active_samples: u64,
    pub looking_away_samples: u64,
    pub lost_samples: u64,
    pub pct_active: f64,
    pub pct_looking_away: f64,
    pub pct_lost: f64,
    pub mean_confidence: f64,
    pub snapshots_written: u64,
    pub calibration_quality: f32,
}

impl SessionStats {
    pub fn log_summary(&self) {
        info!("=== session statistics ===");
        info!("session: {} ({:.1}s)", self.session_name, self.duration_secs);
        info!(
            "samples: {} total / {} active / {} away / {} lost",
            self.total_samples, self.active_samples, self.looking_away_samples, self.lost_samples
        );
        info!(
            "time: {:.1}% active, {:.1}% looking away, {:.1}% lost",
            self.pct_active, self.pct_looking_away, self.pct_lost
        );
        info!(
            "mean confidence {:.3}, calibration quality {:.3}, {} snapshots",
            self.mean_confidence, self.calibration_quality, self.snapshots_written
        );
        info!("==========================");
    }
}

/// Streaming aggregation over classified samples; no sample buffering,
/// the trace on disk is the only copy.
#[derive(Debug, Default)]
pub struct StatsAccumulator {
    total: u64,
    active: u64,
    looking_away: u64,
    lost: u64,
    confidence_sum: f64,
    confidence_count: u64,
    first_timestamp: Option<f64>,
    last_timestamp: Option<f64>,
}

impl StatsAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, sample: &TrackingSample, confidence: f32) {
        self.total += 1;
        match sample.status {
            TrackingStatus::Active => self.active += 1,
            TrackingStatus::LookingAway => self.looking_away += 1,
            TrackingStatus::Lost => self.lost += 1,
        }
        if sample.status != TrackingStatus::Lost && confidence > 0.0 {
            self.confidence_sum += confidence as f64;
            self.confidence_count += 1;
        }
        if self.first_timestamp.is_none() {
            self.first_timestamp = Some(sample.timestamp);
        }
        self.last_timestamp = Some(sample.timestamp);
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn finish(
        &self,
        session: &Session,
        stopped_at: DateTime<Utc>,
        snapshots_written: u64,
        calibration_quality: f32,
    ) -> SessionStats {
        let duration_secs = match (self.first_timestamp, self.last_timestamp) {
            (Some(first), Some(last)) => last - first,
            _ => 0.0,
        };
        let pct = |count: u64| {
            if self.total == 0 {
                0.0
            } else {
                count as f64 / self.total as f64 * 100.0
            }
        };

        SessionStats {
            session_name: session.name.clone(),
            started_at: session.started_at,
            stopped_at,
            duration_secs,
            total_samples: self.total,
            active_samples: self.active,
            looking_away_samples: self.looking_away,
            lost_samples: self.lost,
            pct_active: pct(self.active),
            pct_looking_away: pct(self.looking_away),
            pct_lost: pct(self.lost),
            mean_confidence: if self.confidence_count == 0 {
                0.0
            } else {
                self.confidence_sum / self.confidence_count as f64
            },
            snapshots_written,
            calibration_quality,
        }
    }
}
