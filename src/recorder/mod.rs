mod writer;

pub use writer::WriterReport;

use std::path::Path;
use std::time::Duration;

use log::warn;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::camera::Frame;
use crate::config::RecorderConfig;
use crate::error::EngineError;
use crate::tracking::TrackingSample;

use writer::{run_writer, WriteJob};

/// Capture-loop side of the recorder: a bounded queue in front of a
/// dedicated writer task, so a slow disk can never stall frame capture.
///
/// Backpressure policy: the CSV trace is the primary data product, so
/// snapshots are dropped first when the writer falls behind. Sample
/// enqueue failures are tolerated up to a bound and then escalate; a
/// writer task that has already died surfaces on the next `record`.
pub struct SessionRecorder {
    tx: mpsc::Sender<WriteJob>,
    config: RecorderConfig,
    last_snapshot: Option<Duration>,
    enqueue_failures: u32,
    samples_dropped: u64,
    snapshots_dropped: u64,
}

impl SessionRecorder {
    /// Spawn the writer task and return the loop-side handle plus the
    /// join handle the session controller awaits during finalization.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        csv_path: &Path,
        images_dir: &Path,
        config: RecorderConfig,
    ) -> (Self, JoinHandle<Result<WriterReport, EngineError>>) {
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let csv_path = csv_path.to_path_buf();
        let images_dir = images_dir.to_path_buf();
        let writer_config = config.clone();
        let handle =
            tokio::task::spawn_blocking(move || run_writer(rx, csv_path, images_dir, writer_config));

        (
            Self {
                tx,
                config,
                last_snapshot: None,
                enqueue_failures: 0,
                samples_dropped: 0,
                snapshots_dropped: 0,
            },
            handle,
        )
    }

    /// Enqueue one trace row. Bounded, non-blocking; safe to call at
    /// camera frame rate.
    pub fn record(&mut self, sample: TrackingSample) -> Result<(), EngineError> {
        match self.tx.try_send(WriteJob::Sample(sample)) {
            Ok(()) => {
                self.enqueue_failures = 0;
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.enqueue_failures += 1;
                self.samples_dropped += 1;
                warn!(
                    "recorder queue full, sample dropped ({} consecutive)",
                    self.enqueue_failures
                );
                if self.enqueue_failures >= self.config.max_enqueue_failures {
                    Err(EngineError::RecorderStalled {
                        dropped: self.samples_dropped,
                    })
                } else {
                    Ok(())
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(EngineError::TraceSinkFailed {
                consecutive_errors: 0,
                last_error: "writer task terminated early".into(),
            }),
        }
    }

    /// Enqueue a reference snapshot if the snapshot interval has elapsed
    /// on the session clock. Cadence is wall/session time, not frame
    /// count, so frame-rate variance does not skew it.
    pub fn maybe_snapshot(&mut self, frame: &Frame, session_elapsed: Duration) {
        let interval = Duration::from_secs_f64(self.config.snapshot_interval_secs);
        let due = match self.last_snapshot {
            None => session_elapsed >= interval,
            Some(last) => session_elapsed >= last + interval,
        };
        if !due {
            return;
        }
        self.last_snapshot = Some(session_elapsed);

        match self.tx.try_send(WriteJob::Snapshot(frame.image.clone())) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                // Snapshots go overboard before CSV samples do.
                self.snapshots_dropped += 1;
                warn!("recorder queue full, snapshot dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    pub fn snapshots_dropped(&self) -> u64 {
        self.snapshots_dropped
    }
}
