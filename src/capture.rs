//! Capture worker: owns the frame source and publishes the newest frame.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};

use crate::cell::SnapshotCell;
use crate::frame::Frame;
use crate::ingest::FrameSource;
use crate::worker::{StopSignal, WorkerHandle};

/// Consecutive capture failures tolerated before the worker gives up.
pub const MAX_CONSECUTIVE_ERRORS: u32 = 5;
const RETRY_DELAY: Duration = Duration::from_millis(200);

pub struct CaptureSettings {
    /// Publish the left-right mirror image, as a selfie preview shows it.
    pub mirror: bool,
}

/// Spawn the capture worker. The source must already be connected.
///
/// The frame cell is cleared when the worker exits so that downstream workers
/// go idle instead of reprocessing a stale frame.
pub fn spawn_capture(
    mut source: Box<dyn FrameSource>,
    frames: Arc<SnapshotCell<Frame>>,
    settings: CaptureSettings,
    stop: StopSignal,
) -> Result<WorkerHandle> {
    WorkerHandle::spawn("capture", stop, move |stop| {
        let result = run_capture(source.as_mut(), &frames, &settings, &stop);
        frames.clear();
        let stats = source.stats();
        log::info!(
            "capture: {} frames captured from {}",
            stats.frames_captured,
            stats.source
        );
        result
    })
}

fn run_capture(
    source: &mut dyn FrameSource,
    frames: &SnapshotCell<Frame>,
    settings: &CaptureSettings,
    stop: &StopSignal,
) -> Result<()> {
    let mut consecutive_errors = 0u32;
    while !stop.is_stopped() {
        match source.next_frame() {
            Ok(frame) => {
                consecutive_errors = 0;
                let frame = if settings.mirror {
                    frame.mirrored()
                } else {
                    frame
                };
                frames.publish(frame);
            }
            Err(err) => {
                consecutive_errors += 1;
                log::warn!(
                    "capture: frame read failed ({}/{}): {:#}",
                    consecutive_errors,
                    MAX_CONSECUTIVE_ERRORS,
                    err
                );
                if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                    return Err(anyhow!(
                        "{} consecutive capture failures from {}",
                        consecutive_errors,
                        source.describe()
                    ));
                }
                if !source.is_healthy() {
                    if let Err(err) = source.connect() {
                        log::warn!("capture: reconnect failed: {:#}", err);
                    }
                }
                if stop.wait_timeout(RETRY_DELAY) {
                    break;
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::SourceStats;
    use std::time::Instant;

    struct FailingSource;

    impl FrameSource for FailingSource {
        fn describe(&self) -> String {
            "failing".into()
        }

        fn connect(&mut self) -> Result<()> {
            Ok(())
        }

        fn next_frame(&mut self) -> Result<Frame> {
            Err(anyhow!("device unplugged"))
        }

        fn is_healthy(&self) -> bool {
            true
        }

        fn stats(&self) -> SourceStats {
            SourceStats {
                frames_captured: 0,
                source: "failing".into(),
            }
        }
    }

    struct CountingSource {
        next: u64,
    }

    impl FrameSource for CountingSource {
        fn describe(&self) -> String {
            "counting".into()
        }

        fn connect(&mut self) -> Result<()> {
            Ok(())
        }

        fn next_frame(&mut self) -> Result<Frame> {
            std::thread::sleep(Duration::from_millis(2));
            self.next += 1;
            Frame::new(vec![0, 0, 0, 255, 255, 255], 2, 1, self.next)
        }

        fn is_healthy(&self) -> bool {
            true
        }

        fn stats(&self) -> SourceStats {
            SourceStats {
                frames_captured: self.next,
                source: "counting".into(),
            }
        }
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn publishes_mirrored_frames_and_clears_on_stop() {
        let frames = Arc::new(SnapshotCell::new());
        let handle = spawn_capture(
            Box::new(CountingSource { next: 0 }),
            frames.clone(),
            CaptureSettings { mirror: true },
            StopSignal::new(),
        )
        .unwrap();

        wait_until(|| frames.latest().is_some());
        let frame = frames.latest().unwrap();
        assert_eq!(frame.pixels(), &[255, 255, 255, 0, 0, 0]);

        handle.stop().unwrap();
        assert!(frames.latest().is_none());
    }

    #[test]
    fn gives_up_after_repeated_failures() {
        let frames: Arc<SnapshotCell<Frame>> = Arc::new(SnapshotCell::new());
        let handle = spawn_capture(
            Box::new(FailingSource),
            frames.clone(),
            CaptureSettings { mirror: false },
            StopSignal::new(),
        )
        .unwrap();
        wait_until(|| !handle.is_running());
        assert!(!handle.is_running());
        handle.join().unwrap();
        assert!(frames.latest().is_none());
    }
}
