use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use super::{matched_subjects, AggregatorStats, PendingBuckets, SightingEvent};
use crate::detection::SimilarityThreshold;
use crate::worker::{StopSignal, WorkerHandle};

/// Moves sighting events from the queue into the pending minute buckets.
pub(crate) struct Collector {
    events: Receiver<SightingEvent>,
    pending: Arc<PendingBuckets>,
    stats: Arc<AggregatorStats>,
    threshold: SimilarityThreshold,
    poll_interval: Duration,
}

impl Collector {
    pub(crate) fn new(
        events: Receiver<SightingEvent>,
        pending: Arc<PendingBuckets>,
        stats: Arc<AggregatorStats>,
        threshold: SimilarityThreshold,
        poll_interval: Duration,
    ) -> Self {
        Self {
            events,
            pending,
            stats,
            threshold,
            poll_interval,
        }
    }

    pub(crate) fn spawn(self, stop: StopSignal) -> Result<WorkerHandle> {
        WorkerHandle::spawn("collector", stop, move |stop| {
            self.run(&stop);
            Ok(())
        })
    }

    fn run(&self, stop: &StopSignal) {
        loop {
            match self.events.recv_timeout(self.poll_interval) {
                Ok(event) => self.ingest(event),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    log::info!("collector: sighting queue closed");
                    return;
                }
            }
            if stop.is_stopped() {
                let mut drained = 0;
                while let Ok(event) = self.events.try_recv() {
                    self.ingest(event);
                    drained += 1;
                }
                if drained > 0 {
                    log::info!("collector: drained {} queued event(s) on stop", drained);
                }
                return;
            }
        }
    }

    fn ingest(&self, event: SightingEvent) {
        AggregatorStats::bump(&self.stats.events_received, 1);
        match matched_subjects(&event, self.threshold) {
            Ok(Some(subjects)) => {
                let count = subjects.len() as u64;
                self.pending.record(event.timestamp, subjects);
                AggregatorStats::bump(&self.stats.sightings_recorded, count);
            }
            Ok(None) => {
                AggregatorStats::bump(&self.stats.events_without_match, 1);
            }
            Err(err) => {
                AggregatorStats::bump(&self.stats.integrity_errors, 1);
                log::error!(
                    "collector: rejected event at {}: {} ({})",
                    event.timestamp.format("%H:%M:%S"),
                    err,
                    err.source
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::{BoundingBox, Detection};
    use chrono::{DateTime, Local, TimeZone};
    use std::sync::mpsc;

    fn at(s: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 3, 5, 9, 30, s).single().unwrap()
    }

    fn face(name: &str, similarity: f64) -> Detection {
        Detection::with_match(BoundingBox::new(0, 0, 10, 10).unwrap(), name, similarity).unwrap()
    }

    fn collector(rx: Receiver<SightingEvent>) -> Collector {
        Collector::new(
            rx,
            Arc::new(PendingBuckets::default()),
            Arc::new(AggregatorStats::default()),
            SimilarityThreshold::default(),
            Duration::from_millis(10),
        )
    }

    #[test]
    fn records_every_matching_subject_of_an_event() {
        let (_tx, rx) = mpsc::channel();
        let collector = collector(rx);
        collector.ingest(SightingEvent {
            timestamp: at(12),
            detections: vec![
                face("Adams, Amy (1) [3]", 0.9),
                face("Baker, Ben (2) [T]", 0.8),
                face("Cole, Cy (3) [4]", 0.3),
            ],
        });
        let (_, bucket) = collector.pending.take_all().pop().unwrap();
        assert_eq!(bucket.len(), 2);
        assert!(bucket.values().all(|offsets| offsets == &vec![12]));
        assert_eq!(collector.stats.snapshot().sightings_recorded, 2);
    }

    #[test]
    fn event_without_match_leaves_buckets_untouched() {
        let (_tx, rx) = mpsc::channel();
        let collector = collector(rx);
        collector.ingest(SightingEvent {
            timestamp: at(12),
            detections: vec![
                face("Adams, Amy (1) [3]", 0.6),
                Detection::unmatched(BoundingBox::new(0, 0, 5, 5).unwrap()),
            ],
        });
        assert!(collector.pending.is_empty());
        assert_eq!(collector.stats.snapshot().events_without_match, 1);
    }

    #[test]
    fn malformed_subject_rejects_the_whole_event() {
        let (_tx, rx) = mpsc::channel();
        let collector = collector(rx);
        collector.ingest(SightingEvent {
            timestamp: at(12),
            detections: vec![
                face("Adams, Amy (1) [3]", 0.9),
                face("Jane Doe", 0.95),
            ],
        });
        assert!(collector.pending.is_empty());
        let stats = collector.stats.snapshot();
        assert_eq!(stats.integrity_errors, 1);
        assert_eq!(stats.sightings_recorded, 0);
    }

    #[test]
    fn drains_queue_on_stop() {
        let (tx, rx) = mpsc::channel();
        let collector = collector(rx);
        let pending = collector.pending.clone();
        for s in [1, 2, 3] {
            tx.send(SightingEvent {
                timestamp: at(s),
                detections: vec![face("Adams, Amy (1) [3]", 0.9)],
            })
            .unwrap();
        }
        let stop = StopSignal::new();
        stop.request_stop();
        collector.spawn(stop).unwrap().join().unwrap();

        let (_, bucket) = pending.take_all().pop().unwrap();
        assert_eq!(bucket.values().next().unwrap(), &vec![1, 2, 3]);
    }
}
