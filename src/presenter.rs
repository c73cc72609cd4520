//! Headless presentation worker.
//!
//! Builds an annotated preview from the newest frame and the newest
//! recognition results, and raises an alert when an unidentified face stays
//! in view. Optional JPEG snapshots of the preview are written for alerts.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use chrono::{Local, NaiveDate};
use image::{Rgb, RgbImage};

use crate::cell::SnapshotCell;
use crate::detection::{BoundingBox, Detection, SimilarityThreshold};
use crate::dispatcher::RecognitionSnapshot;
use crate::frame::{encode_rgb_jpeg, Frame};
use crate::worker::{StopSignal, WorkerHandle};

const MATCHED: Rgb<u8> = Rgb([0, 200, 0]);
const UNMATCHED: Rgb<u8> = Rgb([220, 0, 0]);
const BOX_THICKNESS: u32 = 2;
/// Time without unidentified faces after which the dwell timer restarts.
const CLEAR_GRACE: Duration = Duration::from_secs(1);

/// Annotated frame ready for display.
pub struct Preview {
    pub image: RgbImage,
    pub frame_sequence: u64,
    /// One label per detection, in detection order.
    pub labels: Vec<String>,
    pub unidentified: bool,
}

#[derive(Clone, Debug)]
pub struct PresenterSettings {
    pub threshold: SimilarityThreshold,
    /// How long an unidentified face must stay in view before an alert.
    pub unidentified_timeout: Duration,
    pub snapshot_dir: Option<PathBuf>,
    pub refresh: Duration,
}

impl Default for PresenterSettings {
    fn default() -> Self {
        Self {
            threshold: SimilarityThreshold::default(),
            unidentified_timeout: Duration::from_secs(5),
            snapshot_dir: None,
            refresh: Duration::from_millis(50),
        }
    }
}

/// Decides when an unidentified face has been present long enough to alert.
///
/// The timer restarts whenever no unidentified face was seen for a moment,
/// and again after every alert.
pub struct UnidentifiedTracker {
    timeout: Duration,
    mark: Instant,
}

impl UnidentifiedTracker {
    pub fn new(timeout: Duration, now: Instant) -> Self {
        Self { timeout, mark: now }
    }

    /// Returns `true` when an alert should be raised now.
    pub fn observe(&mut self, unidentified: bool, now: Instant) -> bool {
        let since_mark = now.saturating_duration_since(self.mark);
        if !unidentified {
            if since_mark > CLEAR_GRACE {
                self.mark = now;
            }
            return false;
        }
        if since_mark > self.timeout {
            self.mark = now;
            return true;
        }
        false
    }
}

pub struct Presenter {
    pub frames: Arc<SnapshotCell<Frame>>,
    pub results: Arc<SnapshotCell<RecognitionSnapshot>>,
    pub previews: Arc<SnapshotCell<Preview>>,
    pub alerts: Arc<AtomicU64>,
    pub settings: PresenterSettings,
}

impl Presenter {
    pub fn spawn(self, stop: StopSignal) -> Result<WorkerHandle> {
        if let Some(dir) = &self.settings.snapshot_dir {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create snapshot directory {}", dir.display()))?;
        }
        WorkerHandle::spawn("presenter", stop, move |stop| self.run(&stop))
    }

    fn run(self, stop: &StopSignal) -> Result<()> {
        let mut tracker = UnidentifiedTracker::new(self.settings.unidentified_timeout, Instant::now());
        let mut frame_version = 0;
        let mut results_version = 0;

        while !stop.is_stopped() {
            let (frame, fv) = self
                .frames
                .wait_for_update(frame_version, self.settings.refresh);
            let (results, rv) = self.results.snapshot();
            if fv == frame_version && rv == results_version {
                continue;
            }
            frame_version = fv;
            results_version = rv;

            let base = frame.or_else(|| results.as_ref().map(|r| r.frame.clone()));
            let Some(base) = base else {
                self.previews.clear();
                continue;
            };
            let detections = results
                .map(|r| r.detections.clone())
                .unwrap_or_default();

            let preview = render(&base, &detections, self.settings.threshold)?;
            if tracker.observe(preview.unidentified, Instant::now()) {
                self.alert(&preview);
            }
            self.previews.publish(preview);
        }
        self.previews.clear();
        Ok(())
    }

    fn alert(&self, preview: &Preview) {
        let count = self.alerts.fetch_add(1, Ordering::Relaxed) + 1;
        let Some(dir) = &self.settings.snapshot_dir else {
            log::warn!("presenter: unidentified person in view (alert #{})", count);
            return;
        };
        match save_snapshot(dir, Local::now().date_naive(), &preview.image) {
            Ok(path) => log::warn!(
                "presenter: unidentified person in view (alert #{}), snapshot {}",
                count,
                path.display()
            ),
            Err(err) => log::error!(
                "presenter: unidentified person in view (alert #{}), snapshot failed: {:#}",
                count,
                err
            ),
        }
    }
}

/// Draw every detection onto a copy of `frame`.
pub fn render(
    frame: &Frame,
    detections: &[Detection],
    threshold: SimilarityThreshold,
) -> Result<Preview> {
    let mut image = frame.to_rgb_image()?;
    let mut labels = Vec::with_capacity(detections.len());
    let mut unidentified = false;

    for detection in detections {
        let matched = detection.matched_subject(threshold);
        if matched.is_none() {
            unidentified = true;
        }
        let color = if matched.is_some() { MATCHED } else { UNMATCHED };
        draw_box(&mut image, detection.bbox(), color);
        labels.push(label(detection, matched));
    }

    Ok(Preview {
        image,
        frame_sequence: frame.sequence,
        labels,
        unidentified,
    })
}

fn label(detection: &Detection, matched: Option<&str>) -> String {
    let mut parts = vec![match (matched, detection.similarity()) {
        (Some(subject), Some(similarity)) => format!("{} ({:.0}%)", subject, similarity * 100.0),
        _ => "No known faces".to_string(),
    }];
    if let Some(age) = detection.age() {
        parts.push(format!("Age: {}-{}", age.low, age.high));
    }
    if let Some(sex) = detection.sex() {
        parts.push(format!("Sex: {}", sex));
    }
    parts.join(" | ")
}

/// Rectangle outline clipped to the image.
fn draw_box(image: &mut RgbImage, bbox: &BoundingBox, color: Rgb<u8>) {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return;
    }
    let clamp_x = |x: i32| x.clamp(0, width as i32 - 1) as u32;
    let clamp_y = |y: i32| y.clamp(0, height as i32 - 1) as u32;
    let (x0, x1) = (clamp_x(bbox.x_min()), clamp_x(bbox.x_max()));
    let (y0, y1) = (clamp_y(bbox.y_min()), clamp_y(bbox.y_max()));

    for t in 0..BOX_THICKNESS {
        for x in x0..=x1 {
            image.put_pixel(x, (y0 + t).min(y1), color);
            image.put_pixel(x, y1.saturating_sub(t).max(y0), color);
        }
        for y in y0..=y1 {
            image.put_pixel((x0 + t).min(x1), y, color);
            image.put_pixel(x1.saturating_sub(t).max(x0), y, color);
        }
    }
}

/// First unused `snapshot_YYYYMMDD_NNN.jpg` in `dir`, counting from 001.
pub fn snapshot_file_name(dir: &Path, date: NaiveDate) -> PathBuf {
    let stamp = date.format("%Y%m%d");
    let mut n = 1;
    loop {
        let candidate = dir.join(format!("snapshot_{}_{:03}.jpg", stamp, n));
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

pub fn save_snapshot(dir: &Path, date: NaiveDate, image: &RgbImage) -> Result<PathBuf> {
    let path = snapshot_file_name(dir, date);
    let (width, height) = image.dimensions();
    let jpeg = encode_rgb_jpeg(image.as_raw(), width, height, 90).map_err(|e| anyhow!(e))?;
    std::fs::write(&path, jpeg).with_context(|| format!("write snapshot {}", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::AgeRange;
    use tempfile::tempdir;

    fn black_frame() -> Frame {
        Frame::new(vec![0; 20 * 10 * 3], 20, 10, 4).unwrap()
    }

    #[test]
    fn renders_boxes_and_labels() {
        let matched =
            Detection::with_match(BoundingBox::new(1, 1, 8, 8).unwrap(), "Doe, Jane (1) [5]", 0.9)
                .unwrap()
                .with_age(AgeRange::new(10, 14).unwrap())
                .with_sex("female");
        let preview = render(&black_frame(), &[matched], SimilarityThreshold::default()).unwrap();
        assert!(!preview.unidentified);
        assert_eq!(preview.frame_sequence, 4);
        assert_eq!(
            preview.labels,
            vec!["Doe, Jane (1) [5] (90%) | Age: 10-14 | Sex: female".to_string()]
        );
        assert_eq!(*preview.image.get_pixel(1, 1), MATCHED);
        assert_eq!(*preview.image.get_pixel(4, 4), Rgb([0, 0, 0]));
    }

    #[test]
    fn weak_match_counts_as_unidentified() {
        let weak =
            Detection::with_match(BoundingBox::new(2, 2, 30, 30).unwrap(), "Doe, Jane (1) [5]", 0.5)
                .unwrap();
        let preview = render(&black_frame(), &[weak], SimilarityThreshold::default()).unwrap();
        assert!(preview.unidentified);
        assert_eq!(preview.labels, vec!["No known faces".to_string()]);
        assert_eq!(*preview.image.get_pixel(19, 9), UNMATCHED);
    }

    #[test]
    fn alert_needs_sustained_unidentified_presence() {
        let start = Instant::now();
        let mut tracker = UnidentifiedTracker::new(Duration::from_secs(5), start);
        let at = |secs: u64| start + Duration::from_secs(secs);

        assert!(!tracker.observe(true, at(1)));
        assert!(!tracker.observe(true, at(5)));
        assert!(tracker.observe(true, at(6)));
        assert!(!tracker.observe(true, at(7)));

        assert!(!tracker.observe(false, at(9)));
        assert!(!tracker.observe(true, at(13)));
        assert!(tracker.observe(true, at(15)));
    }

    #[test]
    fn snapshot_names_count_up() {
        let dir = tempdir().unwrap();
        let date = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
        let image = RgbImage::new(4, 4);
        let first = save_snapshot(dir.path(), date, &image).unwrap();
        let second = save_snapshot(dir.path(), date, &image).unwrap();
        assert_eq!(first.file_name().unwrap(), "snapshot_20240305_001.jpg");
        assert_eq!(second.file_name().unwrap(), "snapshot_20240305_002.jpg");
    }
}
