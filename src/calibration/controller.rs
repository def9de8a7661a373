use std::sync::mpsc::RecvTimeoutError;
use std::time::{Duration, Instant};

use log::{info, warn};

use super::{
    fit_transform, CalibrationPhase, CalibrationResult, CalibrationSample, CalibrationTarget,
    target_grid,
};
use crate::camera::{CameraError, FrameSource};
use crate::config::{CalibrationConfig, ScreenGeometry};
use crate::display::{emit, DisplayEvent, DisplaySender, FeedbackReceiver, UiFeedback};
use crate::error::EngineError;
use crate::predictor::{Detection, GazePredictor};

/// Drives the fixed target sequence, collects predictor samples per
/// target and fits the per-session transform.
///
/// State machine: Idle → ShowingTarget(i) → Sampling(i) → … → Fitting →
/// Done | Failed. Runs synchronously and blocks session start; on
/// failure the session controller must not begin recording.
pub struct CalibrationController {
    config: CalibrationConfig,
    screen: ScreenGeometry,
    phase: CalibrationPhase,
}

struct WindowOutcome {
    points: Vec<(f32, f32)>,
    frames_seen: usize,
}

impl CalibrationController {
    pub fn new(config: CalibrationConfig, screen: ScreenGeometry) -> Self {
        Self {
            config,
            screen,
            phase: CalibrationPhase::Idle,
        }
    }

    pub fn phase(&self) -> CalibrationPhase {
        self.phase
    }

    /// Run the full sequence against the default target grid.
    pub fn run(
        &mut self,
        source: &mut dyn FrameSource,
        predictor: &mut dyn GazePredictor,
        display: &DisplaySender,
        feedback: &FeedbackReceiver,
        frame_timeout: Duration,
    ) -> Result<CalibrationResult, EngineError> {
        let targets = target_grid(&self.screen, &self.config);
        self.run_with_targets(&targets, source, predictor, display, feedback, frame_timeout)
    }

    pub fn run_with_targets(
        &mut self,
        targets: &[CalibrationTarget],
        source: &mut dyn FrameSource,
        predictor: &mut dyn GazePredictor,
        display: &DisplaySender,
        feedback: &FeedbackReceiver,
        frame_timeout: Duration,
    ) -> Result<CalibrationResult, EngineError> {
        info!("calibration started: {} targets", targets.len());
        let mut samples: Vec<CalibrationSample> = Vec::with_capacity(targets.len());

        for target in targets {
            self.phase = CalibrationPhase::ShowingTarget(target.index);
            emit(
                display,
                DisplayEvent::ShowCalibrationTarget {
                    index: target.index,
                    total: targets.len(),
                    x: target.x,
                    y: target.y,
                },
            );
            self.await_target_ack(feedback, target.index);

            let mut collected = None;
            for attempt in 0..=self.config.max_target_retries {
                self.phase = CalibrationPhase::Sampling(target.index);
                let outcome = self
                    .sample_target(source, predictor, frame_timeout)
                    .map_err(|err| self.fail(target.index, err.to_string()))?;

                let valid_fraction = outcome.points.len() as f32 / outcome.frames_seen.max(1) as f32;
                if outcome.points.len() >= self.config.samples_per_target
                    && valid_fraction >= self.config.min_valid_fraction
                {
                    collected = Some(outcome.points);
                    break;
                }

                warn!(
                    "target {} attempt {}: {}/{} valid samples ({:.0}% of window), retrying",
                    target.index,
                    attempt + 1,
                    outcome.points.len(),
                    self.config.samples_per_target,
                    valid_fraction * 100.0
                );
            }

            emit(display, DisplayEvent::HideCalibrationTarget);

            match collected {
                Some(points) => samples.push(CalibrationSample {
                    target: *target,
                    points,
                }),
                None => {
                    return Err(self.fail(
                        target.index,
                        format!(
                            "target {} exhausted {} retries without enough valid samples",
                            target.index, self.config.max_target_retries
                        ),
                    ));
                }
            }
        }

        self.phase = CalibrationPhase::Fitting;
        let result = fit_transform(&samples, &self.config).map_err(|err| {
            self.phase = CalibrationPhase::Failed;
            EngineError::CalibrationFailed {
                reason: err.to_string(),
                failed_targets: Vec::new(),
            }
        })?;

        self.phase = CalibrationPhase::Done;
        emit(
            display,
            DisplayEvent::CalibrationFinished {
                quality: result.quality,
            },
        );
        info!(
            "calibration done: quality {:.3} ({}), mean residual {:.1}px, max {:.1}px",
            result.quality,
            result.quality_band(),
            result.mean_error_px,
            result.max_error_px
        );
        Ok(result)
    }

    /// One sampling attempt for one target: discard the settle window,
    /// then collect valid estimates until the quota or the frame budget
    /// runs out. Frame timeouts count as invalid frames.
    fn sample_target(
        &self,
        source: &mut dyn FrameSource,
        predictor: &mut dyn GazePredictor,
        frame_timeout: Duration,
    ) -> Result<WindowOutcome, CameraError> {
        let settle = Duration::from_millis(self.config.settle_ms);
        let mut settle_anchor = None;
        let mut points = Vec::with_capacity(self.config.samples_per_target);
        let mut frames_seen = 0usize;

        while frames_seen < self.config.max_window_frames
            && points.len() < self.config.samples_per_target
        {
            let frame = match source.next_frame(frame_timeout) {
                Ok(frame) => frame,
                Err(CameraError::Timeout(_)) => {
                    frames_seen += 1;
                    continue;
                }
                Err(err) => return Err(err),
            };

            let anchor = *settle_anchor.get_or_insert(frame.timestamp);
            if frame.timestamp < anchor + settle {
                continue;
            }

            frames_seen += 1;
            if let Detection::Face { raw_x, raw_y, .. } = predictor.infer(&frame).detection {
                points.push((raw_x, raw_y));
            }
        }

        Ok(WindowOutcome {
            points,
            frames_seen,
        })
    }

    /// Wait for the presentation layer to confirm the target is on
    /// screen, so sampling never races the render. A dropped sender
    /// means no presentation layer is attached; a silent one is given
    /// the configured grace and then sampling proceeds anyway, leaning
    /// on the settle window.
    fn await_target_ack(&self, feedback: &FeedbackReceiver, index: usize) {
        let deadline =
            Instant::now() + Duration::from_millis(self.config.target_ack_timeout_ms);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!("no display ack for target {index}, sampling anyway");
                return;
            }
            match feedback.recv_timeout(remaining) {
                Ok(UiFeedback::TargetDisplayed { index: shown }) if shown == index => return,
                // Stale ack from an earlier target, keep draining.
                Ok(_) => continue,
                Err(RecvTimeoutError::Timeout) => {
                    warn!("no display ack for target {index}, sampling anyway");
                    return;
                }
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    }

    fn fail(&mut self, target_index: usize, reason: String) -> EngineError {
        self.phase = CalibrationPhase::Failed;
        EngineError::CalibrationFailed {
            reason,
            failed_targets: vec![target_index],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::synthetic::SyntheticFrameSource;
    use crate::config::EngineConfig;
    use crate::display;
    use crate::predictor::{FixationHandle, SyntheticPredictor};

    /// Presentation-layer stand-in: fixates the synthetic gaze on each
    /// calibration target as it is shown, then acknowledges it.
    fn spawn_fixator(
        mut rx: crate::display::DisplayReceiver,
        ack: crate::display::FeedbackSender,
        fixation: FixationHandle,
    ) -> std::thread::JoinHandle<()> {
        std::thread::spawn(move || {
            while let Some(event) = rx.blocking_recv() {
                if let DisplayEvent::ShowCalibrationTarget { index, x, y, .. } = event {
                    fixation.look_at(x, y);
                    let _ = ack.send(UiFeedback::TargetDisplayed { index });
                }
            }
        })
    }

    #[test]
    fn perfect_synthetic_run_reaches_full_quality() {
        let config = EngineConfig::default();
        let fixation = FixationHandle::new(0.0, 0.0);
        let mut predictor = SyntheticPredictor::new(config.screen, fixation.clone());
        let mut source = SyntheticFrameSource::new(30);
        source.open().unwrap();

        let (tx, rx) = display::channel();
        let (ack_tx, ack_rx) = display::feedback_channel();
        let fixator = spawn_fixator(rx, ack_tx, fixation);

        let mut controller = CalibrationController::new(config.calibration, config.screen);
        let result = controller
            .run(
                &mut source,
                &mut predictor,
                &tx,
                &ack_rx,
                Duration::from_millis(500),
            )
            .unwrap();

        assert_eq!(controller.phase(), CalibrationPhase::Done);
        assert!(result.quality > 0.999, "quality {}", result.quality);
        assert!(result.mean_error_px < 1.0);

        // Fitted transform maps raw output back onto the screen point.
        let (rx_raw, ry_raw) = SyntheticPredictor::raw_for_screen(&config.screen, 300.0, 700.0);
        let (x, y) = result.apply(rx_raw, ry_raw);
        assert!((x - 300.0).abs() < 1.0);
        assert!((y - 700.0).abs() < 1.0);

        drop(tx);
        fixator.join().unwrap();
    }

    #[test]
    fn blind_predictor_fails_on_first_target() {
        let config = EngineConfig::default();
        let fixation = FixationHandle::new(0.0, 0.0);
        let mut predictor =
            SyntheticPredictor::new(config.screen, fixation).with_miss_rate(1.0);
        let mut source = SyntheticFrameSource::new(30);
        source.open().unwrap();

        // No presentation layer: the dropped ack sender must not stall the run.
        let (tx, _rx) = display::channel();
        let (_, ack_rx) = display::feedback_channel();
        let mut controller = CalibrationController::new(config.calibration, config.screen);
        let err = controller
            .run(
                &mut source,
                &mut predictor,
                &tx,
                &ack_rx,
                Duration::from_millis(500),
            )
            .unwrap_err();

        assert_eq!(controller.phase(), CalibrationPhase::Failed);
        match err {
            EngineError::CalibrationFailed { failed_targets, .. } => {
                assert_eq!(failed_targets, vec![0]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn camera_loss_during_calibration_fails_calibration() {
        let config = EngineConfig::default();
        let fixation = FixationHandle::new(0.0, 0.0);
        let mut predictor = SyntheticPredictor::new(config.screen, fixation);
        // Source dies after a few frames, well before the settle window ends.
        let mut source = SyntheticFrameSource::new(30).disconnect_after(3);
        source.open().unwrap();

        let (tx, _rx) = display::channel();
        let (_, ack_rx) = display::feedback_channel();
        let mut controller = CalibrationController::new(config.calibration, config.screen);
        let err = controller
            .run(
                &mut source,
                &mut predictor,
                &tx,
                &ack_rx,
                Duration::from_millis(500),
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::CalibrationFailed { .. }));
    }
}
