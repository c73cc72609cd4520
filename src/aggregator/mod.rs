//! Minute-bucketed sighting aggregation.
//!
//! Two workers share one ordered map of pending minute buckets:
//!
//! - the **collector** drains the sighting queue, keeps matching detections and
//!   appends each sighting's second-of-minute under its subject;
//! - the **flusher** removes buckets whose minute has fully elapsed and hands
//!   them to the exporter.
//!
//! Shutdown order matters: the collector is stopped and joined first so no
//! event can land in a bucket after it has been exported, then the flusher
//! force-flushes whatever is left.

mod collector;
mod flusher;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Local, Timelike};

use crate::clock::Clock;
use crate::detection::{Detection, SimilarityThreshold};
use crate::error::IntegrityError;
use crate::export::Exporter;
use crate::subject::SubjectIdentity;
use crate::worker::{StopSignal, WorkerHandle};

use collector::Collector;
use flusher::Flusher;

/// Detections from one recognized frame, stamped when the answer arrived.
#[derive(Clone, Debug)]
pub struct SightingEvent {
    pub timestamp: DateTime<Local>,
    pub detections: Vec<Detection>,
}

/// Second-of-minute offsets per subject for one minute.
pub type MinuteSightings = BTreeMap<SubjectIdentity, Vec<u8>>;

/// Truncate a timestamp to the start of its minute.
pub fn minute_of(timestamp: DateTime<Local>) -> DateTime<Local> {
    timestamp
        - chrono::Duration::seconds(i64::from(timestamp.second()))
        - chrono::Duration::nanoseconds(i64::from(timestamp.nanosecond()))
}

/// Pending minute buckets, oldest first.
///
/// Exactly two mutators: the collector appends, the flusher removes.
#[derive(Default)]
pub struct PendingBuckets {
    buckets: Mutex<BTreeMap<DateTime<Local>, MinuteSightings>>,
}

impl PendingBuckets {
    fn lock(&self) -> MutexGuard<'_, BTreeMap<DateTime<Local>, MinuteSightings>> {
        self.buckets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record one second offset for each subject under the minute of `timestamp`.
    pub(crate) fn record(&self, timestamp: DateTime<Local>, subjects: Vec<SubjectIdentity>) {
        let second = timestamp.second().min(59) as u8;
        let mut buckets = self.lock();
        let bucket = buckets.entry(minute_of(timestamp)).or_default();
        for subject in subjects {
            bucket.entry(subject).or_default().push(second);
        }
    }

    /// Remove the oldest bucket if its minute has fully elapsed at `now`.
    pub(crate) fn take_due(
        &self,
        now: DateTime<Local>,
    ) -> Option<(DateTime<Local>, MinuteSightings)> {
        let mut buckets = self.lock();
        let (&minute, _) = buckets.first_key_value()?;
        if now < minute + chrono::Duration::minutes(1) {
            return None;
        }
        buckets.pop_first()
    }

    /// Remove every bucket regardless of age, oldest first.
    pub(crate) fn take_all(&self) -> Vec<(DateTime<Local>, MinuteSightings)> {
        std::mem::take(&mut *self.lock()).into_iter().collect()
    }

    pub fn minutes(&self) -> Vec<DateTime<Local>> {
        self.lock().keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[derive(Debug, Default)]
pub(crate) struct AggregatorStats {
    pub(crate) events_received: AtomicU64,
    pub(crate) events_without_match: AtomicU64,
    pub(crate) sightings_recorded: AtomicU64,
    pub(crate) integrity_errors: AtomicU64,
    pub(crate) batches_exported: AtomicU64,
    pub(crate) export_failures: AtomicU64,
    pub(crate) batches_dropped: AtomicU64,
    pub(crate) buckets_force_flushed: AtomicU64,
}

impl AggregatorStats {
    pub(crate) fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    fn snapshot(&self) -> AggregatorReport {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        AggregatorReport {
            events_received: load(&self.events_received),
            events_without_match: load(&self.events_without_match),
            sightings_recorded: load(&self.sightings_recorded),
            integrity_errors: load(&self.integrity_errors),
            batches_exported: load(&self.batches_exported),
            export_failures: load(&self.export_failures),
            batches_dropped: load(&self.batches_dropped),
            buckets_force_flushed: load(&self.buckets_force_flushed),
        }
    }
}

#[derive(Clone, Debug)]
pub struct AggregatorSettings {
    pub threshold: SimilarityThreshold,
    /// Idle wait for both the collector's queue read and the flusher's tick.
    pub poll_interval: Duration,
    /// Extra export attempts for a failed batch before it is dropped.
    pub export_retry_limit: u32,
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        Self {
            threshold: SimilarityThreshold::default(),
            poll_interval: Duration::from_secs(1),
            export_retry_limit: 3,
        }
    }
}

/// Point-in-time aggregator counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AggregatorReport {
    pub events_received: u64,
    /// Events that carried detections but no matching subject.
    pub events_without_match: u64,
    pub sightings_recorded: u64,
    /// Events rejected because a matched subject failed validation.
    pub integrity_errors: u64,
    pub batches_exported: u64,
    /// Failed export attempts, including ones later retried successfully.
    pub export_failures: u64,
    pub batches_dropped: u64,
    /// Buckets exported before their minute elapsed, during shutdown.
    pub buckets_force_flushed: u64,
}

/// Running collector and flusher pair.
pub struct Aggregator {
    collector: WorkerHandle,
    flusher: WorkerHandle,
    pending: Arc<PendingBuckets>,
    stats: Arc<AggregatorStats>,
}

impl Aggregator {
    pub fn start(
        events: Receiver<SightingEvent>,
        exporter: Box<dyn Exporter>,
        clock: Arc<dyn Clock>,
        settings: AggregatorSettings,
    ) -> Result<Self> {
        let pending = Arc::new(PendingBuckets::default());
        let stats = Arc::new(AggregatorStats::default());

        let collector = Collector::new(
            events,
            pending.clone(),
            stats.clone(),
            settings.threshold,
            settings.poll_interval,
        )
        .spawn(StopSignal::new())?;
        let flusher = Flusher::new(
            exporter,
            pending.clone(),
            stats.clone(),
            clock,
            settings.poll_interval,
            settings.export_retry_limit,
        )
        .spawn(StopSignal::new())?;

        Ok(Self {
            collector,
            flusher,
            pending,
            stats,
        })
    }

    pub fn stats(&self) -> AggregatorReport {
        self.stats.snapshot()
    }

    pub fn pending_minutes(&self) -> Vec<DateTime<Local>> {
        self.pending.minutes()
    }

    pub fn is_running(&self) -> bool {
        self.collector.is_running() && self.flusher.is_running()
    }

    /// Stop the collector (draining its queue), then force-flush every
    /// remaining bucket and stop the flusher.
    pub fn shutdown(self) -> Result<AggregatorReport> {
        let Self {
            collector,
            flusher,
            pending,
            stats,
        } = self;
        collector.stop()?;
        flusher.stop()?;
        if !pending.is_empty() {
            log::error!(
                "aggregator: {} bucket(s) left unexported after shutdown",
                pending.minutes().len()
            );
        }
        Ok(stats.snapshot())
    }
}

/// Parse every matching subject in `event`.
///
/// Returns `Ok(None)` when nothing matches. Any malformed subject rejects the
/// whole event so a bucket never holds part of one.
pub(crate) fn matched_subjects(
    event: &SightingEvent,
    threshold: SimilarityThreshold,
) -> Result<Option<Vec<SubjectIdentity>>, IntegrityError> {
    let mut subjects = Vec::new();
    for name in event
        .detections
        .iter()
        .filter_map(|detection| detection.matched_subject(threshold))
    {
        let subject = SubjectIdentity::parse(name).map_err(|source| IntegrityError {
            subject: name.to_string(),
            source,
        })?;
        subjects.push(subject);
    }
    if subjects.is_empty() {
        Ok(None)
    } else {
        Ok(Some(subjects))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 3, 5, h, m, s).single().unwrap()
    }

    fn subject(name: &str) -> SubjectIdentity {
        SubjectIdentity::parse(name).unwrap()
    }

    #[test]
    fn minute_truncation_drops_seconds_and_nanos() {
        let ts = at(10, 15, 42) + chrono::Duration::milliseconds(250);
        assert_eq!(minute_of(ts), at(10, 15, 0));
        assert_eq!(minute_of(at(10, 15, 0)), at(10, 15, 0));
    }

    #[test]
    fn buckets_keep_insertion_order_and_duplicates() {
        let pending = PendingBuckets::default();
        let a = subject("Adams, Amy (1) [3]");
        pending.record(at(10, 15, 2), vec![a.clone()]);
        pending.record(at(10, 15, 5), vec![a.clone()]);
        pending.record(at(10, 15, 5), vec![a.clone()]);

        let (minute, bucket) = pending.take_due(at(10, 16, 0)).unwrap();
        assert_eq!(minute, at(10, 15, 0));
        assert_eq!(bucket[&a], vec![2, 5, 5]);
        assert!(pending.is_empty());
    }

    #[test]
    fn bucket_is_not_due_within_its_minute() {
        let pending = PendingBuckets::default();
        pending.record(at(10, 15, 2), vec![subject("Adams, Amy (1) [3]")]);
        assert!(pending.take_due(at(10, 15, 59)).is_none());
        assert!(pending.take_due(at(10, 15, 0)).is_none());
        assert!(pending.take_due(at(10, 16, 0)).is_some());
    }

    #[test]
    fn oldest_bucket_comes_out_first() {
        let pending = PendingBuckets::default();
        let a = subject("Adams, Amy (1) [3]");
        pending.record(at(10, 17, 1), vec![a.clone()]);
        pending.record(at(10, 15, 1), vec![a.clone()]);
        assert_eq!(pending.minutes(), vec![at(10, 15, 0), at(10, 17, 0)]);

        let (first, _) = pending.take_due(at(10, 17, 30)).unwrap();
        assert_eq!(first, at(10, 15, 0));
        assert!(pending.take_due(at(10, 17, 30)).is_none());
        let all = pending.take_all();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].0, at(10, 17, 0));
    }
}
