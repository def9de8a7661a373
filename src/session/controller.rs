use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use log::{error, info, warn};
use tokio_util::sync::CancellationToken;

use crate::calibration::{CalibrationController, CalibrationResult};
use crate::camera::{CameraError, FrameSource};
use crate::config::EngineConfig;
use crate::display::{emit, DisplayEvent, DisplaySender, FeedbackReceiver};
use crate::error::EngineError;
use crate::predictor::{GazeEstimate, GazePredictor};
use crate::recorder::{SessionRecorder, WriterReport};
use crate::tracking::TrackingStateMachine;

use super::{Session, SessionStats, StatsAccumulator};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Orchestrates one session end to end:
/// start → calibrate → record → finalize.
///
/// Calibration failure prevents recording entirely. Once recording has
/// started, finalization (flush sinks, compute and log statistics)
/// runs exactly once on every exit path, including camera loss and sink
/// failure, so partial data is always preserved.
pub struct SessionController {
    config: EngineConfig,
    display: DisplaySender,
    cancel: CancellationToken,
}

/// What the capture loop brings back to finalization.
struct CaptureOutcome {
    stats: StatsAccumulator,
    frames_processed: u64,
    snapshots_dropped: u64,
    /// Structural error that ended the loop, if any. Per-frame
    /// conditions never appear here.
    error: Option<EngineError>,
}

impl SessionController {
    pub fn new(config: EngineConfig, display: DisplaySender) -> Self {
        Self {
            config,
            display,
            cancel: CancellationToken::new(),
        }
    }

    /// Token for the external stop signal; honored within one
    /// frame-processing cycle.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn run(
        &self,
        base_dir: &Path,
        session_name: &str,
        mut source: Box<dyn FrameSource>,
        mut predictor: Box<dyn GazePredictor>,
        feedback: FeedbackReceiver,
    ) -> Result<SessionStats> {
        let session = Session::create(base_dir, session_name)?;
        info!("session {} ({}) starting", session.name, session.id);

        source
            .open()
            .map_err(|err| EngineError::CameraUnavailable(err.to_string()))?;

        // Calibration blocks session start; on failure nothing is recorded.
        let config = self.config.clone();
        let display = self.display.clone();
        let (mut source, mut predictor, calibration) =
            tokio::task::spawn_blocking(move || {
                let mut controller =
                    CalibrationController::new(config.calibration.clone(), config.screen);
                let result = controller.run(
                    source.as_mut(),
                    predictor.as_mut(),
                    &display,
                    &feedback,
                    config.capture.frame_timeout(),
                );
                (source, predictor, result)
            })
            .await
            .context("calibration task panicked")?;

        let calibration = match calibration {
            Ok(calibration) => calibration,
            Err(err) => {
                source.close();
                error!("calibration failed, session will not record: {err}");
                return Err(err.into());
            }
        };

        let (recorder, writer_handle) = SessionRecorder::start(
            &session.csv_path,
            &session.images_dir,
            self.config.recorder.clone(),
        );

        let config = self.config.clone();
        let display = self.display.clone();
        let cancel = self.cancel.clone();
        let quality = calibration.quality;
        let outcome = tokio::task::spawn_blocking(move || {
            let outcome = capture_loop(
                source.as_mut(),
                predictor.as_mut(),
                calibration,
                recorder,
                &config,
                &display,
                &cancel,
            );
            // Camera handle released on every exit path.
            source.close();
            outcome
        })
        .await
        .context("capture loop task panicked")?;

        self.finalize(&session, outcome, writer_handle, quality).await
    }

    /// Flush and close the sinks, compute statistics, report to the
    /// operator. Runs once on every path that reached recording.
    async fn finalize(
        &self,
        session: &Session,
        outcome: CaptureOutcome,
        writer_handle: tokio::task::JoinHandle<Result<WriterReport, EngineError>>,
        calibration_quality: f32,
    ) -> Result<SessionStats> {
        let stopped_at = Utc::now();

        let mut session_error = outcome.error;
        let report = match writer_handle.await {
            Ok(Ok(report)) => report,
            Ok(Err(sink_error)) => {
                // The writer's own error is the root cause; it wins over
                // the loop's secondhand view of the closed queue.
                error!("trace sink failed: {sink_error}");
                session_error = Some(sink_error);
                WriterReport::default()
            }
            Err(join_error) => {
                error!("writer task panicked: {join_error}");
                session_error = Some(EngineError::TraceSinkFailed {
                    consecutive_errors: 0,
                    last_error: join_error.to_string(),
                });
                WriterReport::default()
            }
        };

        info!("capture loop processed {} frames", outcome.frames_processed);
        if outcome.snapshots_dropped > 0 {
            warn!(
                "{} snapshots were dropped under backpressure",
                outcome.snapshots_dropped
            );
        }

        let stats = outcome.stats.finish(
            session,
            stopped_at,
            report.snapshots_written,
            calibration_quality,
        );
        stats.log_summary();
        emit(&self.display, DisplayEvent::SessionFinished);

        match session_error {
            Some(err) => {
                error!(
                    "session {} ended abnormally, partial data preserved in {}",
                    session.name,
                    session.dir.display()
                );
                Err(err.into())
            }
            None => {
                info!("session {} complete: {}", session.name, session.dir.display());
                Ok(stats)
            }
        }
    }
}

/// Single logical processing loop: Frame Source → Predictor → Tracking
/// State Machine → Recorder, synchronous per frame. Disk I/O lives
/// behind the recorder's queue, never on this path. Cancellation is
/// cooperative, checked once per iteration.
fn capture_loop(
    source: &mut dyn FrameSource,
    predictor: &mut dyn GazePredictor,
    calibration: CalibrationResult,
    mut recorder: SessionRecorder,
    config: &EngineConfig,
    display: &DisplaySender,
    cancel: &CancellationToken,
) -> CaptureOutcome {
    let mut machine =
        TrackingStateMachine::new(config.tracking.clone(), config.screen, calibration);
    let mut stats = StatsAccumulator::new();
    let mut frames_processed = 0u64;
    let mut consecutive_timeouts = 0u32;
    let mut clock_anchor: Option<Duration> = None;
    let mut next_heartbeat = HEARTBEAT_INTERVAL;
    let mut last_status = machine.status();
    let mut error = None;
    let frame_timeout = config.capture.frame_timeout();

    info!("recording started");
    loop {
        if cancel.is_cancelled() {
            info!("stop signal received");
            break;
        }

        let frame = match source.next_frame(frame_timeout) {
            Ok(frame) => {
                consecutive_timeouts = 0;
                frame
            }
            Err(CameraError::Timeout(_)) => {
                // Transient lost-equivalent: walks the hysteresis toward
                // Lost but emits no row for a frame that never existed.
                consecutive_timeouts += 1;
                machine.note_miss();
                if consecutive_timeouts >= config.capture.max_consecutive_timeouts {
                    error = Some(EngineError::CameraDisconnected {
                        reason: format!(
                            "{consecutive_timeouts} consecutive frame timeouts"
                        ),
                    });
                    break;
                }
                continue;
            }
            Err(err) => {
                error = Some(EngineError::CameraDisconnected {
                    reason: err.to_string(),
                });
                break;
            }
        };

        frames_processed += 1;
        let anchor = *clock_anchor.get_or_insert(frame.timestamp);
        let elapsed = frame.timestamp - anchor;

        let mut estimate = predictor.infer(&frame);
        // Trace timestamps are relative to session start.
        estimate = GazeEstimate {
            timestamp: elapsed,
            detection: estimate.detection,
        };
        let confidence = estimate.confidence();
        let sample = machine.classify(&estimate);

        if let (Some(x), Some(y)) = (sample.gaze_x, sample.gaze_y) {
            emit(display, DisplayEvent::GazeMoved { x, y });
        }
        if sample.status != last_status {
            info!(
                "tracking {} -> {}",
                last_status.as_str(),
                sample.status.as_str()
            );
            last_status = sample.status;
            emit(
                display,
                DisplayEvent::TrackingChanged {
                    status: sample.status,
                },
            );
        }

        stats.add(&sample, confidence);
        if let Err(err) = recorder.record(sample) {
            error = Some(err);
            break;
        }
        recorder.maybe_snapshot(&frame, elapsed);

        if elapsed >= next_heartbeat {
            info!(
                "recording: {} frames processed, {} samples, status {}, {:.0}% recent validity",
                frames_processed,
                stats.total(),
                machine.status().as_str(),
                machine.recent_validity() * 100.0
            );
            next_heartbeat += HEARTBEAT_INTERVAL;
        }
    }

    CaptureOutcome {
        stats,
        frames_processed,
        snapshots_dropped: recorder.snapshots_dropped(),
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::synthetic::SyntheticFrameSource;
    use crate::config::EngineConfig;
    use crate::display;
    use crate::predictor::{FixationHandle, SyntheticPredictor};
    use crate::tracking::{TrackingSample, TrackingStatus};
    use std::path::PathBuf;

    fn temp_base() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("gazetrace-session-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    /// Cheap calibration: no settle window, 3 samples per target, so the
    /// sequence consumes exactly 27 frames of the synthetic stream.
    fn fast_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.calibration.settle_ms = 0;
        config.calibration.samples_per_target = 3;
        config
    }

    const CALIBRATION_FRAMES: u64 = 27;

    /// Presentation layer stand-in: steer the synthetic gaze onto each
    /// calibration target and acknowledge it, ignore everything else.
    fn spawn_fixator(
        mut rx: display::DisplayReceiver,
        ack: display::FeedbackSender,
        fixation: FixationHandle,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let DisplayEvent::ShowCalibrationTarget { index, x, y, .. } = event {
                    fixation.look_at(x, y);
                    let _ = ack.send(display::UiFeedback::TargetDisplayed { index });
                }
            }
        })
    }

    fn read_rows(csv_path: &Path) -> Vec<TrackingSample> {
        let mut reader = csv::Reader::from_path(csv_path).unwrap();
        reader.deserialize().map(|r| r.unwrap()).collect()
    }

    #[tokio::test]
    async fn disconnect_mid_session_preserves_partial_trace() {
        let base = temp_base();
        let config = fast_config();
        let fixation = FixationHandle::new(100.0, 100.0);
        let predictor = SyntheticPredictor::new(config.screen, fixation.clone());
        // 600 frames total: 27 spent calibrating, 573 recorded, then the
        // camera dies.
        let source = SyntheticFrameSource::new(30).disconnect_after(600);

        let (tx, rx) = display::channel();
        let (ack_tx, ack_rx) = display::feedback_channel();
        let fixator = spawn_fixator(rx, ack_tx, fixation);
        let controller = SessionController::new(config, tx);

        let err = controller
            .run(&base, "disconnect", Box::new(source), Box::new(predictor), ack_rx)
            .await
            .unwrap_err();
        let engine_err = err.downcast_ref::<EngineError>().unwrap();
        assert!(matches!(engine_err, EngineError::CameraDisconnected { .. }));

        let rows = read_rows(&base.join("disconnect").join("disconnect.csv"));
        assert_eq!(rows.len(), (600 - CALIBRATION_FRAMES) as usize);
        for pair in rows.windows(2) {
            assert!(pair[1].timestamp > pair[0].timestamp);
        }
        // Fixation stayed on-screen the whole time.
        assert!(rows.iter().all(|row| row.status == TrackingStatus::Active));

        drop(controller);
        fixator.await.unwrap();
        std::fs::remove_dir_all(&base).unwrap();
    }

    #[tokio::test]
    async fn transient_timeouts_are_absorbed() {
        let base = temp_base();
        let config = fast_config();
        let fixation = FixationHandle::new(200.0, 200.0);
        let predictor = SyntheticPredictor::new(config.screen, fixation.clone());
        // Three consecutive timeouts during recording, well under the
        // escalation bound, then a clean disconnect at 100.
        let source = SyntheticFrameSource::new(30)
            .timeout_at(50..53)
            .disconnect_after(100);

        let (tx, rx) = display::channel();
        let (ack_tx, ack_rx) = display::feedback_channel();
        let fixator = spawn_fixator(rx, ack_tx, fixation);
        let controller = SessionController::new(config, tx);

        let err = controller
            .run(&base, "timeouts", Box::new(source), Box::new(predictor), ack_rx)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EngineError>().unwrap(),
            EngineError::CameraDisconnected { .. }
        ));

        // 100 deliveries: 27 calibration, 3 timeouts (no rows), 70 rows.
        let rows = read_rows(&base.join("timeouts").join("timeouts.csv"));
        assert_eq!(rows.len(), 70);
        // 3 misses with M=5 never flip the status to lost.
        assert!(rows.iter().all(|row| !row.tracking_lost));

        drop(controller);
        fixator.await.unwrap();
        std::fs::remove_dir_all(&base).unwrap();
    }

    #[tokio::test]
    async fn sustained_timeouts_escalate_to_disconnect() {
        let base = temp_base();
        let config = fast_config();
        let fixation = FixationHandle::new(200.0, 200.0);
        let predictor = SyntheticPredictor::new(config.screen, fixation.clone());
        let source = SyntheticFrameSource::new(30).timeout_at(40..60);

        let (tx, rx) = display::channel();
        let (ack_tx, ack_rx) = display::feedback_channel();
        let fixator = spawn_fixator(rx, ack_tx, fixation);
        let controller = SessionController::new(config, tx);

        let err = controller
            .run(&base, "dead-camera", Box::new(source), Box::new(predictor), ack_rx)
            .await
            .unwrap_err();
        match err.downcast_ref::<EngineError>().unwrap() {
            EngineError::CameraDisconnected { reason } => {
                assert!(reason.contains("consecutive frame timeouts"), "{reason}");
            }
            other => panic!("unexpected error: {other}"),
        }

        drop(controller);
        fixator.await.unwrap();
        std::fs::remove_dir_all(&base).unwrap();
    }

    #[tokio::test]
    async fn cooperative_stop_finalizes_cleanly() {
        let base = temp_base();
        let config = fast_config();
        let fixation = FixationHandle::new(300.0, 300.0);
        let predictor = SyntheticPredictor::new(config.screen, fixation.clone());
        // Paced so the loop is still running when the stop lands.
        let source = SyntheticFrameSource::new(200).paced(true);

        let (tx, rx) = display::channel();
        let (ack_tx, ack_rx) = display::feedback_channel();
        let fixator = spawn_fixator(rx, ack_tx, fixation);
        let controller = SessionController::new(config, tx);
        let token = controller.cancellation_token();

        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(600)).await;
            token.cancel();
        });

        let stats = controller
            .run(&base, "clean-stop", Box::new(source), Box::new(predictor), ack_rx)
            .await
            .unwrap();

        assert!(stats.total_samples > 0);
        assert_eq!(
            stats.active_samples + stats.looking_away_samples + stats.lost_samples,
            stats.total_samples
        );
        assert!((stats.calibration_quality - 1.0).abs() < 1e-3);

        let rows = read_rows(&base.join("clean-stop").join("clean-stop.csv"));
        assert_eq!(rows.len() as u64, stats.total_samples);

        stopper.await.unwrap();
        drop(controller);
        fixator.await.unwrap();
        std::fs::remove_dir_all(&base).unwrap();
    }

    #[tokio::test]
    async fn failed_calibration_records_nothing() {
        let base = temp_base();
        let config = fast_config();
        let fixation = FixationHandle::new(0.0, 0.0);
        let predictor =
            SyntheticPredictor::new(config.screen, fixation.clone()).with_miss_rate(1.0);
        let source = SyntheticFrameSource::new(30);

        let (tx, rx) = display::channel();
        let (ack_tx, ack_rx) = display::feedback_channel();
        let fixator = spawn_fixator(rx, ack_tx, fixation);
        let controller = SessionController::new(config, tx);

        let err = controller
            .run(&base, "no-cal", Box::new(source), Box::new(predictor), ack_rx)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EngineError>().unwrap(),
            EngineError::CalibrationFailed { .. }
        ));
        assert!(!base.join("no-cal").join("no-cal.csv").exists());

        drop(controller);
        fixator.await.unwrap();
        std::fs::remove_dir_all(&base).unwrap();
    }
}
