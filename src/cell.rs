//! Single-slot, last-write-wins publication cell.
//!
//! One writer replaces the whole value at once; readers clone the `Arc` and
//! keep reading their snapshot while newer values are published. A version
//! counter lets readers block until something newer than what they have seen
//! arrives, so consumers wake on publication rather than on a fixed sleep.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

struct Slot<T> {
    value: Option<Arc<T>>,
    version: u64,
}

pub struct SnapshotCell<T> {
    slot: Mutex<Slot<T>>,
    changed: Condvar,
}

impl<T> Default for SnapshotCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SnapshotCell<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                value: None,
                version: 0,
            }),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the current value. Returns the new version.
    pub fn publish(&self, value: T) -> u64 {
        self.publish_arc(Arc::new(value))
    }

    pub fn publish_arc(&self, value: Arc<T>) -> u64 {
        self.replace(Some(value))
    }

    /// Empty the cell, e.g. when the producer stops.
    pub fn clear(&self) -> u64 {
        self.replace(None)
    }

    fn replace(&self, value: Option<Arc<T>>) -> u64 {
        let version = {
            let mut slot = self.lock();
            slot.value = value;
            slot.version += 1;
            slot.version
        };
        self.changed.notify_all();
        version
    }

    pub fn latest(&self) -> Option<Arc<T>> {
        self.lock().value.clone()
    }

    pub fn version(&self) -> u64 {
        self.lock().version
    }

    /// Current value together with its version.
    pub fn snapshot(&self) -> (Option<Arc<T>>, u64) {
        let slot = self.lock();
        (slot.value.clone(), slot.version)
    }

    /// Block until the version differs from `seen` or `timeout` elapses, then
    /// return the current snapshot either way.
    pub fn wait_for_update(&self, seen: u64, timeout: Duration) -> (Option<Arc<T>>, u64) {
        let deadline = Instant::now() + timeout;
        let mut slot = self.lock();
        while slot.version == seen {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            slot = self
                .changed
                .wait_timeout(slot, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        (slot.value.clone(), slot.version)
    }

    /// Wake every blocked reader without changing the value.
    pub fn notify(&self) {
        self.changed.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn last_write_wins() {
        let cell = SnapshotCell::new();
        assert!(cell.latest().is_none());
        cell.publish(1);
        cell.publish(2);
        assert_eq!(*cell.latest().unwrap(), 2);
        assert_eq!(cell.version(), 2);
        cell.clear();
        assert!(cell.latest().is_none());
        assert_eq!(cell.version(), 3);
    }

    #[test]
    fn readers_keep_their_snapshot() {
        let cell = SnapshotCell::new();
        cell.publish(vec![1, 2, 3]);
        let held = cell.latest().unwrap();
        cell.publish(vec![9]);
        assert_eq!(*held, vec![1, 2, 3]);
        assert_eq!(*cell.latest().unwrap(), vec![9]);
    }

    #[test]
    fn wait_times_out_without_publication() {
        let cell: SnapshotCell<u8> = SnapshotCell::new();
        let started = Instant::now();
        let (value, version) = cell.wait_for_update(0, Duration::from_millis(20));
        assert!(value.is_none());
        assert_eq!(version, 0);
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn wait_wakes_on_publication() {
        let cell = Arc::new(SnapshotCell::new());
        let writer = {
            let cell = cell.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                cell.publish("frame");
            })
        };
        let (value, version) = cell.wait_for_update(0, Duration::from_secs(5));
        writer.join().unwrap();
        assert_eq!(value.as_deref(), Some(&"frame"));
        assert_eq!(version, 1);
    }
}
