//! Recognition dispatcher.
//!
//! Pulls the newest frame, skips frames it has already submitted, sends the
//! JPEG to the recognition service and fans the answer out twice: the full
//! detection list goes to the results cell for the presenter, and non-empty
//! results go to the aggregator queue with a wall-clock timestamp.
//!
//! A transport failure ends the worker. Dependents notice through
//! [`WorkerHandle::is_running`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};

use crate::aggregator::SightingEvent;
use crate::cell::SnapshotCell;
use crate::clock::Clock;
use crate::detection::Detection;
use crate::error::RecognitionError;
use crate::frame::Frame;
use crate::recognition::RecognitionClient;
use crate::worker::{StopSignal, WorkerHandle};

/// Detections together with the frame they were computed from.
pub struct RecognitionSnapshot {
    pub frame: Arc<Frame>,
    pub detections: Arc<Vec<Detection>>,
}

#[derive(Clone, Debug)]
pub struct DispatcherSettings {
    /// Wait between checks while no new frame is available.
    pub idle_wait: Duration,
    pub jpeg_quality: u8,
    /// Extra attempts after a transport failure before giving up.
    pub transport_retries: u32,
    pub retry_backoff: Duration,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            idle_wait: Duration::from_millis(5),
            jpeg_quality: 85,
            transport_retries: 0,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Default)]
pub struct DispatcherStats {
    frames_submitted: AtomicU64,
    events_forwarded: AtomicU64,
    service_errors: AtomicU64,
}

impl DispatcherStats {
    pub fn frames_submitted(&self) -> u64 {
        self.frames_submitted.load(Ordering::Relaxed)
    }

    pub fn events_forwarded(&self) -> u64 {
        self.events_forwarded.load(Ordering::Relaxed)
    }

    pub fn service_errors(&self) -> u64 {
        self.service_errors.load(Ordering::Relaxed)
    }
}

pub struct Dispatcher {
    pub client: Box<dyn RecognitionClient>,
    pub frames: Arc<SnapshotCell<Frame>>,
    pub results: Arc<SnapshotCell<RecognitionSnapshot>>,
    pub events: Sender<SightingEvent>,
    pub clock: Arc<dyn Clock>,
    pub settings: DispatcherSettings,
    pub stats: Arc<DispatcherStats>,
}

impl Dispatcher {
    pub fn spawn(self, stop: StopSignal) -> Result<WorkerHandle> {
        WorkerHandle::spawn("recognition", stop, move |stop| {
            let results = self.results.clone();
            let outcome = self.run(&stop);
            results.clear();
            outcome
        })
    }

    fn run(mut self, stop: &StopSignal) -> Result<()> {
        log::info!("recognition: using {} client", self.client.name());
        let mut last_submitted: Option<Arc<Frame>> = None;
        let mut seen_version = 0;

        while !stop.is_stopped() {
            let (frame, version) = self
                .frames
                .wait_for_update(seen_version, self.settings.idle_wait);
            seen_version = version;
            let Some(frame) = frame else {
                continue;
            };
            if last_submitted
                .as_ref()
                .is_some_and(|last| Arc::ptr_eq(last, &frame))
            {
                continue;
            }
            last_submitted = Some(frame.clone());

            let image = match frame.encode_jpeg(self.settings.jpeg_quality) {
                Ok(image) => image,
                Err(err) => {
                    log::warn!("recognition: skipping frame {}: {}", frame.sequence, err);
                    continue;
                }
            };

            let detections = match self.recognize(&image, stop) {
                Ok(Some(detections)) => detections,
                Ok(None) => break,
                Err(err) if err.is_transport() => {
                    return Err(anyhow!(err).context("recognition worker cannot continue"));
                }
                Err(err) => {
                    self.stats.service_errors.fetch_add(1, Ordering::Relaxed);
                    log::warn!("recognition: frame {} rejected: {}", frame.sequence, err);
                    Vec::new()
                }
            };
            self.stats.frames_submitted.fetch_add(1, Ordering::Relaxed);

            let detections = Arc::new(detections);
            self.results.publish(RecognitionSnapshot {
                frame,
                detections: detections.clone(),
            });

            if !detections.is_empty() {
                let event = SightingEvent {
                    timestamp: self.clock.now(),
                    detections: detections.as_ref().clone(),
                };
                if self.events.send(event).is_err() {
                    return Err(anyhow!("aggregator queue closed"));
                }
                self.stats.events_forwarded.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    /// Returns `Ok(None)` when a stop arrives while backing off.
    fn recognize(
        &mut self,
        image: &[u8],
        stop: &StopSignal,
    ) -> Result<Option<Vec<Detection>>, RecognitionError> {
        let mut attempt = 0;
        loop {
            match self.client.recognize(image) {
                Ok(detections) => return Ok(Some(detections)),
                Err(err) if err.is_transport() && attempt < self.settings.transport_retries => {
                    attempt += 1;
                    log::warn!(
                        "recognition: {} (retry {}/{})",
                        err,
                        attempt,
                        self.settings.transport_retries
                    );
                    if stop.wait_timeout(self.settings.retry_backoff) {
                        return Ok(None);
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }
}
