use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use log::{info, warn};
use tokio::sync::mpsc;

use crate::config::RecorderConfig;
use crate::error::EngineError;
use crate::tracking::TrackingSample;

/// Work items handed from the capture loop to the writer task.
pub(crate) enum WriteJob {
    Sample(TrackingSample),
    Snapshot(RgbImage),
}

/// What the writer accomplished by the time its queue closed.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriterReport {
    pub rows_written: u64,
    pub snapshots_written: u64,
    pub snapshot_failures: u64,
}

/// Blocking writer loop: owns the CSV file and the images directory for
/// the life of the session.
///
/// CSV rows are buffered and flushed on a row-count threshold or a wall
/// clock interval, and once more when the queue closes, so a normal stop
/// or a fatal error upstream never loses buffered samples. CSV and
/// snapshot writes are independent failure domains: a snapshot failure
/// is logged and counted, while CSV failures beyond the configured
/// bound abort the session (silent trace loss is not tolerated).
pub(crate) fn run_writer(
    rx: mpsc::Receiver<WriteJob>,
    csv_path: PathBuf,
    images_dir: PathBuf,
    config: RecorderConfig,
) -> Result<WriterReport, EngineError> {
    let csv = csv::Writer::from_path(&csv_path).map_err(|err| {
        EngineError::TraceSinkFailed {
            consecutive_errors: 1,
            last_error: format!("open {}: {err}", csv_path.display()),
        }
    })?;
    drain_queue(rx, csv, &images_dir, &config)
}

fn drain_queue<W: Write>(
    mut rx: mpsc::Receiver<WriteJob>,
    mut csv: csv::Writer<W>,
    images_dir: &Path,
    config: &RecorderConfig,
) -> Result<WriterReport, EngineError> {
    let flush_interval = Duration::from_millis(config.flush_interval_ms);
    let mut report = WriterReport::default();
    let mut rows_since_flush = 0usize;
    let mut last_flush = Instant::now();
    let mut consecutive_csv_errors = 0u32;
    let mut snapshot_index = 0u64;

    while let Some(job) = rx.blocking_recv() {
        match job {
            WriteJob::Sample(sample) => match csv.serialize(&sample) {
                Ok(()) => {
                    consecutive_csv_errors = 0;
                    report.rows_written += 1;
                    rows_since_flush += 1;
                }
                Err(err) => {
                    consecutive_csv_errors += 1;
                    warn!(
                        "csv write failed ({consecutive_csv_errors} consecutive): {err}"
                    );
                    if consecutive_csv_errors >= config.max_csv_write_failures {
                        return Err(EngineError::TraceSinkFailed {
                            consecutive_errors: consecutive_csv_errors,
                            last_error: err.to_string(),
                        });
                    }
                }
            },
            WriteJob::Snapshot(image) => {
                snapshot_index += 1;
                match write_snapshot(images_dir, snapshot_index, &image, config.jpeg_quality) {
                    Ok(()) => {
                        report.snapshots_written += 1;
                        if report.snapshots_written % 30 == 0 {
                            info!("{} snapshots saved", report.snapshots_written);
                        }
                    }
                    Err(err) => {
                        report.snapshot_failures += 1;
                        warn!("snapshot {snapshot_index:04} failed: {err}");
                    }
                }
            }
        }

        if rows_since_flush >= config.flush_every_rows || last_flush.elapsed() >= flush_interval {
            if let Err(err) = csv.flush() {
                consecutive_csv_errors += 1;
                warn!("csv flush failed: {err}");
                if consecutive_csv_errors >= config.max_csv_write_failures {
                    return Err(EngineError::TraceSinkFailed {
                        consecutive_errors: consecutive_csv_errors,
                        last_error: err.to_string(),
                    });
                }
            } else {
                rows_since_flush = 0;
                last_flush = Instant::now();
            }
        }
    }

    // Queue closed: drain is complete, make the trace durable.
    csv.flush().map_err(|err| EngineError::TraceSinkFailed {
        consecutive_errors: consecutive_csv_errors + 1,
        last_error: format!("final flush: {err}"),
    })?;

    Ok(report)
}

fn write_snapshot(
    images_dir: &Path,
    index: u64,
    image: &RgbImage,
    quality: u8,
) -> anyhow::Result<()> {
    let path = images_dir.join(format!("{index:04}.jpg"));
    let file = fs::File::create(&path)?;
    let mut writer = BufWriter::new(file);
    JpegEncoder::new_with_quality(&mut writer, quality).encode_image(image)?;
    Ok(())
}
