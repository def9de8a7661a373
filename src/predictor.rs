use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::camera::Frame;
use crate::config::ScreenGeometry;

/// Raw output of the gaze-inference runtime for one frame.
///
/// "No detection" is a tagged variant, never a sentinel coordinate, so
/// downstream code cannot confuse a missing face with gaze at (0, 0).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Detection {
    /// A face was found; coordinates are in the predictor's raw output
    /// space and only become screen pixels through the calibration
    /// transform.
    Face {
        raw_x: f32,
        raw_y: f32,
        confidence: f32,
    },
    NoFace,
}

/// Predictor output tied to the frame it was inferred from.
#[derive(Debug, Clone, Copy)]
pub struct GazeEstimate {
    pub timestamp: Duration,
    pub detection: Detection,
}

impl GazeEstimate {
    pub fn no_face(timestamp: Duration) -> Self {
        Self {
            timestamp,
            detection: Detection::NoFace,
        }
    }

    pub fn confidence(&self) -> f32 {
        match self.detection {
            Detection::Face { confidence, .. } => confidence,
            Detection::NoFace => 0.0,
        }
    }
}

/// Black-box gaze predictor. Real implementations wrap the inference
/// runtime; internal inference failures surface as `Detection::NoFace`
/// so a bad frame can never unwind the capture loop.
pub trait GazePredictor: Send {
    fn infer(&mut self, frame: &Frame) -> GazeEstimate;
}

/// Shared fixation point driven by the presentation layer (or a test)
/// to steer the synthetic predictor.
#[derive(Clone)]
pub struct FixationHandle {
    point: Arc<Mutex<(f32, f32)>>,
}

impl FixationHandle {
    pub fn new(x: f32, y: f32) -> Self {
        Self {
            point: Arc::new(Mutex::new((x, y))),
        }
    }

    pub fn look_at(&self, x: f32, y: f32) {
        *self.point.lock().unwrap() = (x, y);
    }

    pub fn current(&self) -> (f32, f32) {
        *self.point.lock().unwrap()
    }
}

/// Deterministic stand-in for the inference runtime.
///
/// Emits raw coordinates that are an exact affine image of the fixation
/// point (screen center maps to raw origin, one screen width to one raw
/// unit), optionally with Gaussian-ish jitter and a face-miss rate, so
/// the calibration fit recovers the inverse transform.
pub struct SyntheticPredictor {
    fixation: FixationHandle,
    screen: ScreenGeometry,
    noise_raw: f32,
    miss_rate: f64,
    confidence: f32,
    rng: StdRng,
}

impl SyntheticPredictor {
    pub fn new(screen: ScreenGeometry, fixation: FixationHandle) -> Self {
        Self {
            fixation,
            screen,
            noise_raw: 0.0,
            miss_rate: 0.0,
            confidence: 0.9,
            rng: StdRng::seed_from_u64(7),
        }
    }

    pub fn with_noise(mut self, noise_raw: f32) -> Self {
        self.noise_raw = noise_raw;
        self
    }

    pub fn with_miss_rate(mut self, miss_rate: f64) -> Self {
        self.miss_rate = miss_rate;
        self
    }

    /// Raw-space coordinates the predictor would report for a screen point.
    pub fn raw_for_screen(screen: &ScreenGeometry, x: f32, y: f32) -> (f32, f32) {
        let w = screen.width as f32;
        let h = screen.height as f32;
        ((x - w / 2.0) / w, (y - h / 2.0) / h)
    }
}

impl GazePredictor for SyntheticPredictor {
    fn infer(&mut self, frame: &Frame) -> GazeEstimate {
        if self.miss_rate > 0.0 && self.rng.gen_bool(self.miss_rate) {
            return GazeEstimate::no_face(frame.timestamp);
        }

        let (fx, fy) = self.fixation.current();
        let (raw_x, raw_y) = Self::raw_for_screen(&self.screen, fx, fy);
        let jitter_x = if self.noise_raw > 0.0 {
            self.rng.gen_range(-self.noise_raw..self.noise_raw)
        } else {
            0.0
        };
        let jitter_y = if self.noise_raw > 0.0 {
            self.rng.gen_range(-self.noise_raw..self.noise_raw)
        } else {
            0.0
        };

        GazeEstimate {
            timestamp: frame.timestamp,
            detection: Detection::Face {
                raw_x: raw_x + jitter_x,
                raw_y: raw_y + jitter_y,
                confidence: self.confidence,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    fn frame(ms: u64) -> Frame {
        Frame {
            timestamp: Duration::from_millis(ms),
            image: RgbImage::new(4, 4),
        }
    }

    #[test]
    fn synthetic_predictor_tracks_fixation() {
        let screen = ScreenGeometry::default();
        let fixation = FixationHandle::new(960.0, 540.0);
        let mut predictor = SyntheticPredictor::new(screen, fixation.clone());

        // Screen center maps to the raw origin.
        match predictor.infer(&frame(1)).detection {
            Detection::Face { raw_x, raw_y, .. } => {
                assert!(raw_x.abs() < 1e-6);
                assert!(raw_y.abs() < 1e-6);
            }
            Detection::NoFace => panic!("expected a face"),
        }

        fixation.look_at(0.0, 0.0);
        match predictor.infer(&frame(2)).detection {
            Detection::Face { raw_x, raw_y, .. } => {
                assert!((raw_x + 0.5).abs() < 1e-6);
                assert!((raw_y + 0.5).abs() < 1e-6);
            }
            Detection::NoFace => panic!("expected a face"),
        }
    }

    #[test]
    fn full_miss_rate_reports_no_face() {
        let screen = ScreenGeometry::default();
        let mut predictor =
            SyntheticPredictor::new(screen, FixationHandle::new(0.0, 0.0)).with_miss_rate(1.0);
        assert_eq!(predictor.infer(&frame(1)).detection, Detection::NoFace);
    }
}
