use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Local};

use super::{AggregatorStats, MinuteSightings, PendingBuckets};
use crate::clock::Clock;
use crate::export::{ExportBatch, Exporter};
use crate::worker::{StopSignal, WorkerHandle};

struct FailedExport {
    batch: ExportBatch,
    attempts: u32,
}

/// Closes out elapsed minute buckets and hands them to the exporter.
pub(crate) struct Flusher {
    exporter: Box<dyn Exporter>,
    pending: Arc<PendingBuckets>,
    stats: Arc<AggregatorStats>,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
    retry_limit: u32,
    retries: VecDeque<FailedExport>,
}

impl Flusher {
    pub(crate) fn new(
        exporter: Box<dyn Exporter>,
        pending: Arc<PendingBuckets>,
        stats: Arc<AggregatorStats>,
        clock: Arc<dyn Clock>,
        poll_interval: Duration,
        retry_limit: u32,
    ) -> Self {
        Self {
            exporter,
            pending,
            stats,
            clock,
            poll_interval,
            retry_limit,
            retries: VecDeque::new(),
        }
    }

    pub(crate) fn spawn(mut self, stop: StopSignal) -> Result<WorkerHandle> {
        WorkerHandle::spawn("flusher", stop, move |stop| {
            log::info!("flusher: exporting through {}", self.exporter.name());
            loop {
                self.tick();
                if stop.wait_timeout(self.poll_interval) {
                    break;
                }
            }
            self.flush_all();
            Ok(())
        })
    }

    /// Retry earlier failures, then export every bucket whose minute has elapsed.
    fn tick(&mut self) {
        self.retry_failed();
        let now = self.clock.now();
        while let Some((minute, sightings)) = self.pending.take_due(now) {
            self.export(ExportBatch::from_offsets(minute, sightings), 0);
        }
    }

    /// Final pass on shutdown: every retry and every bucket gets one more attempt.
    fn flush_all(&mut self) {
        for failed in std::mem::take(&mut self.retries) {
            self.export_final(failed.batch);
        }
        let remaining = self.pending.take_all();
        if !remaining.is_empty() {
            log::info!(
                "flusher: force-flushing {} pending bucket(s)",
                remaining.len()
            );
        }
        for (minute, sightings) in remaining {
            AggregatorStats::bump(&self.stats.buckets_force_flushed, 1);
            self.export_final(ExportBatch::from_offsets(minute, sightings));
        }
    }

    fn retry_failed(&mut self) {
        for failed in std::mem::take(&mut self.retries) {
            self.export(failed.batch, failed.attempts);
        }
    }

    fn export(&mut self, batch: ExportBatch, previous_attempts: u32) {
        let attempts = previous_attempts + 1;
        match self.exporter.export(&batch) {
            Ok(()) => self.exported(&batch),
            Err(err) => {
                AggregatorStats::bump(&self.stats.export_failures, 1);
                if attempts > self.retry_limit {
                    self.dropped(&batch, attempts, &err.to_string());
                } else {
                    log::warn!(
                        "flusher: export of {} failed (attempt {}), will retry: {}",
                        describe(batch.minute),
                        attempts,
                        err
                    );
                    self.retries.push_back(FailedExport { batch, attempts });
                }
            }
        }
    }

    fn export_final(&mut self, batch: ExportBatch) {
        match self.exporter.export(&batch) {
            Ok(()) => self.exported(&batch),
            Err(err) => {
                AggregatorStats::bump(&self.stats.export_failures, 1);
                self.dropped(&batch, 1, &err.to_string());
            }
        }
    }

    fn exported(&self, batch: &ExportBatch) {
        AggregatorStats::bump(&self.stats.batches_exported, 1);
        log::debug!(
            "flusher: exported {} ({} subject(s))",
            describe(batch.minute),
            batch.sightings.len()
        );
    }

    fn dropped(&self, batch: &ExportBatch, attempts: u32, err: &str) {
        AggregatorStats::bump(&self.stats.batches_dropped, 1);
        log::error!(
            "flusher: dropping {} after {} failed attempt(s): {} subjects lost: {}",
            describe(batch.minute),
            attempts,
            batch.sightings.len(),
            err
        );
    }
}

fn describe(minute: DateTime<Local>) -> String {
    format!("bucket {}", minute.format("%Y-%m-%d %H:%M"))
}

impl ExportBatch {
    fn from_offsets(minute: DateTime<Local>, sightings: MinuteSightings) -> Self {
        let sightings = sightings
            .into_iter()
            .map(|(subject, offsets)| {
                let times = offsets
                    .into_iter()
                    .map(|second| minute + chrono::Duration::seconds(i64::from(second)))
                    .collect();
                (subject, times)
            })
            .collect();
        Self { minute, sightings }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::ExportError;
    use crate::subject::SubjectIdentity;
    use chrono::TimeZone;
    use std::sync::{Mutex, PoisonError};

    #[derive(Clone, Default)]
    struct FlakyExporter {
        failures_left: Arc<Mutex<u32>>,
        batches: Arc<Mutex<Vec<ExportBatch>>>,
    }

    impl Exporter for FlakyExporter {
        fn name(&self) -> &'static str {
            "flaky"
        }

        fn export(&mut self, batch: &ExportBatch) -> Result<(), ExportError> {
            let mut failures = self
                .failures_left
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if *failures > 0 {
                *failures -= 1;
                return Err(ExportError::Rejected("disk full".into()));
            }
            self.batches.lock().unwrap().push(batch.clone());
            Ok(())
        }
    }

    fn at(m: u32, s: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 3, 5, 14, m, s).single().unwrap()
    }

    fn flusher(exporter: FlakyExporter, clock: Arc<ManualClock>, retry_limit: u32) -> Flusher {
        let pending = Arc::new(PendingBuckets::default());
        pending.record(
            at(10, 7),
            vec![SubjectIdentity::parse("Adams, Amy (1) [3]").unwrap()],
        );
        Flusher::new(
            Box::new(exporter),
            pending,
            Arc::new(AggregatorStats::default()),
            clock,
            Duration::from_millis(10),
            retry_limit,
        )
    }

    #[test]
    fn exports_only_after_minute_elapses() {
        let exporter = FlakyExporter::default();
        let clock = Arc::new(ManualClock::new(at(10, 30)));
        let mut flusher = flusher(exporter.clone(), clock.clone(), 3);

        flusher.tick();
        assert!(exporter.batches.lock().unwrap().is_empty());

        clock.set(at(11, 0));
        flusher.tick();
        let batches = exporter.batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].minute, at(10, 0));
        let times: Vec<_> = batches[0].sightings.values().next().unwrap().clone();
        assert_eq!(times, vec![at(10, 7)]);
    }

    #[test]
    fn failed_batch_is_retried_unchanged() {
        let exporter = FlakyExporter {
            failures_left: Arc::new(Mutex::new(2)),
            ..FlakyExporter::default()
        };
        let clock = Arc::new(ManualClock::new(at(12, 0)));
        let mut flusher = flusher(exporter.clone(), clock, 3);

        flusher.tick();
        flusher.tick();
        assert!(exporter.batches.lock().unwrap().is_empty());
        assert_eq!(flusher.retries.len(), 1);

        flusher.tick();
        assert_eq!(exporter.batches.lock().unwrap().len(), 1);
        assert!(flusher.retries.is_empty());
        let stats = flusher.stats.snapshot();
        assert_eq!(stats.export_failures, 2);
        assert_eq!(stats.batches_exported, 1);
    }

    #[test]
    fn batch_is_dropped_after_retry_limit() {
        let exporter = FlakyExporter {
            failures_left: Arc::new(Mutex::new(10)),
            ..FlakyExporter::default()
        };
        let clock = Arc::new(ManualClock::new(at(12, 0)));
        let mut flusher = flusher(exporter, clock, 1);

        flusher.tick();
        flusher.tick();
        assert!(flusher.retries.is_empty());
        assert_eq!(flusher.stats.snapshot().batches_dropped, 1);
    }

    #[test]
    fn flush_all_ignores_bucket_age() {
        let exporter = FlakyExporter::default();
        let clock = Arc::new(ManualClock::new(at(10, 30)));
        let mut flusher = flusher(exporter.clone(), clock, 3);
        flusher.flush_all();
        assert_eq!(exporter.batches.lock().unwrap().len(), 1);
        assert_eq!(flusher.stats.snapshot().buckets_force_flushed, 1);
        assert!(flusher.pending.is_empty());
    }
}
