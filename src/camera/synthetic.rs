use std::collections::HashSet;
use std::time::Duration;

use image::{Rgb, RgbImage};
use log::debug;

use super::{CameraError, Frame, FrameSource};

/// Deterministic frame source for dry runs and tests.
///
/// Produces flat frames at a fixed logical frame rate with strictly
/// increasing timestamps. Individual frame indices can be scripted to
/// time out, and the source can be capped to simulate a camera that
/// disconnects mid-session. When `paced` is set, `next_frame` sleeps one
/// frame period so the engine runs in roughly real time.
pub struct SyntheticFrameSource {
    fps: u32,
    width: u32,
    height: u32,
    paced: bool,
    max_frames: Option<u64>,
    timeout_frames: HashSet<u64>,
    opened: bool,
    frame_index: u64,
    clock: Duration,
}

impl SyntheticFrameSource {
    pub fn new(fps: u32) -> Self {
        Self {
            fps: fps.max(1),
            width: 320,
            height: 240,
            paced: false,
            max_frames: None,
            timeout_frames: HashSet::new(),
            opened: false,
            frame_index: 0,
            clock: Duration::ZERO,
        }
    }

    pub fn paced(mut self, paced: bool) -> Self {
        self.paced = paced;
        self
    }

    /// Disconnect after this many delivered frames.
    pub fn disconnect_after(mut self, frames: u64) -> Self {
        self.max_frames = Some(frames);
        self
    }

    /// Script a timeout at the given delivery indices (0-based).
    pub fn timeout_at(mut self, indices: impl IntoIterator<Item = u64>) -> Self {
        self.timeout_frames.extend(indices);
        self
    }

    fn frame_period(&self) -> Duration {
        Duration::from_secs(1) / self.fps
    }
}

impl FrameSource for SyntheticFrameSource {
    fn open(&mut self) -> Result<(), CameraError> {
        self.opened = true;
        self.frame_index = 0;
        self.clock = Duration::ZERO;
        debug!("synthetic camera opened ({} fps)", self.fps);
        Ok(())
    }

    fn next_frame(&mut self, timeout: Duration) -> Result<Frame, CameraError> {
        if !self.opened {
            return Err(CameraError::Unavailable("source not open".into()));
        }

        if let Some(max) = self.max_frames {
            if self.frame_index >= max {
                return Err(CameraError::Disconnected("synthetic stream exhausted".into()));
            }
        }

        let index = self.frame_index;
        self.frame_index += 1;
        self.clock += self.frame_period();

        if self.timeout_frames.contains(&index) {
            return Err(CameraError::Timeout(timeout));
        }

        if self.paced {
            std::thread::sleep(self.frame_period());
        }

        // Slowly cycling shade so consecutive snapshots are distinguishable.
        let shade = (index % 255) as u8;
        let image = RgbImage::from_pixel(self.width, self.height, Rgb([shade, 64, 128]));

        Ok(Frame {
            timestamp: self.clock,
            image,
        })
    }

    fn close(&mut self) {
        if self.opened {
            debug!("synthetic camera closed after {} frames", self.frame_index);
        }
        self.opened = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_strictly_increase() {
        let mut source = SyntheticFrameSource::new(30);
        source.open().unwrap();
        let mut last = Duration::ZERO;
        for _ in 0..100 {
            let frame = source.next_frame(Duration::from_millis(500)).unwrap();
            assert!(frame.timestamp > last);
            last = frame.timestamp;
        }
    }

    #[test]
    fn scripted_timeout_then_recovers() {
        let mut source = SyntheticFrameSource::new(30).timeout_at([1]);
        source.open().unwrap();
        assert!(source.next_frame(Duration::from_millis(500)).is_ok());
        assert!(matches!(
            source.next_frame(Duration::from_millis(500)),
            Err(CameraError::Timeout(_))
        ));
        assert!(source.next_frame(Duration::from_millis(500)).is_ok());
    }

    #[test]
    fn disconnects_after_budget() {
        let mut source = SyntheticFrameSource::new(30).disconnect_after(2);
        source.open().unwrap();
        source.next_frame(Duration::from_millis(500)).unwrap();
        source.next_frame(Duration::from_millis(500)).unwrap();
        assert!(matches!(
            source.next_frame(Duration::from_millis(500)),
            Err(CameraError::Disconnected(_))
        ));
    }

    #[test]
    fn close_is_idempotent() {
        let mut source = SyntheticFrameSource::new(30);
        source.open().unwrap();
        source.close();
        source.close();
        assert!(source.next_frame(Duration::from_millis(10)).is_err());
    }
}
