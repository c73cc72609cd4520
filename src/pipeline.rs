//! Wires the capture, recognition, presentation and aggregation workers
//! together and tears them down in a fixed order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::aggregator::{Aggregator, AggregatorReport, AggregatorSettings};
use crate::capture::{spawn_capture, CaptureSettings};
use crate::cell::SnapshotCell;
use crate::clock::Clock;
use crate::dispatcher::{Dispatcher, DispatcherSettings, DispatcherStats, RecognitionSnapshot};
use crate::export::Exporter;
use crate::frame::Frame;
use crate::ingest::FrameSource;
use crate::presenter::{Presenter, PresenterSettings, Preview};
use crate::recognition::RecognitionClient;
use crate::worker::{StopSignal, WorkerHandle};

const EXIT_POLL: Duration = Duration::from_millis(200);

#[derive(Clone, Debug, Default)]
pub struct PipelineSettings {
    pub mirror: bool,
    pub dispatcher: DispatcherSettings,
    pub aggregator: AggregatorSettings,
    pub presenter: PresenterSettings,
}

/// Why [`Pipeline::wait_for_exit`] returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitReason {
    /// Shutdown was requested (Ctrl-C or the signal channel closed).
    Requested,
    /// The recognition worker died, usually because the service is unreachable.
    RecognitionStopped,
    /// The capture device could not deliver frames any more.
    CaptureStopped,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub frames_submitted: u64,
    pub events_forwarded: u64,
    pub service_errors: u64,
    pub unidentified_alerts: u64,
    pub aggregator: AggregatorReport,
}

pub struct Pipeline {
    capture: WorkerHandle,
    dispatcher: WorkerHandle,
    presenter: WorkerHandle,
    aggregator: Aggregator,
    frames: Arc<SnapshotCell<Frame>>,
    results: Arc<SnapshotCell<RecognitionSnapshot>>,
    previews: Arc<SnapshotCell<Preview>>,
    dispatcher_stats: Arc<DispatcherStats>,
    alerts: Arc<AtomicU64>,
}

impl Pipeline {
    /// Start every worker. `source` must already be connected.
    ///
    /// Consumers start before producers so nothing is published into a
    /// cell or queue nobody reads.
    pub fn start(
        source: Box<dyn FrameSource>,
        client: Box<dyn RecognitionClient>,
        exporter: Box<dyn Exporter>,
        clock: Arc<dyn Clock>,
        settings: PipelineSettings,
    ) -> Result<Self> {
        let frames = Arc::new(SnapshotCell::new());
        let results = Arc::new(SnapshotCell::new());
        let previews = Arc::new(SnapshotCell::new());
        let dispatcher_stats = Arc::new(DispatcherStats::default());
        let alerts = Arc::new(AtomicU64::new(0));
        let (events_tx, events_rx) = mpsc::channel();

        let aggregator = Aggregator::start(events_rx, exporter, clock.clone(), settings.aggregator)?;

        let presenter = Presenter {
            frames: frames.clone(),
            results: results.clone(),
            previews: previews.clone(),
            alerts: alerts.clone(),
            settings: settings.presenter,
        }
        .spawn(StopSignal::new())?;

        let dispatcher = Dispatcher {
            client,
            frames: frames.clone(),
            results: results.clone(),
            events: events_tx,
            clock,
            settings: settings.dispatcher,
            stats: dispatcher_stats.clone(),
        }
        .spawn(StopSignal::new())?;

        let capture = spawn_capture(
            source,
            frames.clone(),
            CaptureSettings {
                mirror: settings.mirror,
            },
            StopSignal::new(),
        )?;

        Ok(Self {
            capture,
            dispatcher,
            presenter,
            aggregator,
            frames,
            results,
            previews,
            dispatcher_stats,
            alerts,
        })
    }

    pub fn frames(&self) -> Arc<SnapshotCell<Frame>> {
        self.frames.clone()
    }

    pub fn results(&self) -> Arc<SnapshotCell<RecognitionSnapshot>> {
        self.results.clone()
    }

    pub fn previews(&self) -> Arc<SnapshotCell<Preview>> {
        self.previews.clone()
    }

    pub fn is_recognizing(&self) -> bool {
        self.dispatcher.is_running()
    }

    pub fn pending_minutes(&self) -> usize {
        self.aggregator.pending_minutes().len()
    }

    /// Block until a shutdown request arrives on `signal` or a producer dies.
    pub fn wait_for_exit(&self, signal: &Receiver<()>) -> ExitReason {
        loop {
            match signal.recv_timeout(EXIT_POLL) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return ExitReason::Requested,
                Err(RecvTimeoutError::Timeout) => {}
            }
            if !self.dispatcher.is_running() {
                return ExitReason::RecognitionStopped;
            }
            if !self.capture.is_running() {
                return ExitReason::CaptureStopped;
            }
        }
    }

    /// Stop in dependency order: capture, recognition, collector (draining
    /// its queue), flusher (force-flushing every bucket), presenter.
    ///
    /// Every worker is stopped even if an earlier one fails to join; the
    /// first failure is returned.
    pub fn shutdown(self) -> Result<ShutdownReport> {
        let Self {
            capture,
            dispatcher,
            presenter,
            aggregator,
            dispatcher_stats,
            alerts,
            ..
        } = self;

        let mut first_error = None;
        let mut note = |result: Result<()>| {
            if let Err(err) = result {
                log::error!("shutdown: {:#}", err);
                first_error.get_or_insert(err);
            }
        };

        note(capture.stop());
        note(dispatcher.stop());
        let aggregator = match aggregator.shutdown() {
            Ok(report) => report,
            Err(err) => {
                note(Err(err));
                AggregatorReport::default()
            }
        };
        note(presenter.stop());

        if let Some(err) = first_error {
            return Err(err);
        }
        Ok(ShutdownReport {
            frames_submitted: dispatcher_stats.frames_submitted(),
            events_forwarded: dispatcher_stats.events_forwarded(),
            service_errors: dispatcher_stats.service_errors(),
            unidentified_alerts: alerts.load(Ordering::Relaxed),
            aggregator,
        })
    }
}
