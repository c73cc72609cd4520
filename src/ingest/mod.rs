//! Frame sources.
//!
//! - `stub://` URLs: synthetic frames paced at the target rate (offline runs, tests)
//! - `http(s)://` URLs: MJPEG multipart streams or single JPEG snapshots
//!
//! A source is owned by exactly one capture worker and is never shared.

mod http;
mod synthetic;

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use url::Url;

use crate::frame::Frame;

pub use http::HttpSource;
pub use synthetic::SyntheticSource;

/// Configuration for a frame source.
#[derive(Clone, Debug)]
pub struct SourceConfig {
    pub url: String,
    /// Target frame rate. Faster sources are decimated to this rate.
    pub target_fps: u32,
    /// Frame size for synthetic sources; network sources report their own.
    pub width: u32,
    pub height: u32,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            url: "stub://webcam0".to_string(),
            target_fps: 30,
            width: 640,
            height: 480,
        }
    }
}

/// Statistics for a frame source.
#[derive(Clone, Debug)]
pub struct SourceStats {
    pub frames_captured: u64,
    pub source: String,
}

pub trait FrameSource: Send {
    fn describe(&self) -> String;

    fn connect(&mut self) -> Result<()>;

    /// Block until the next frame is available.
    fn next_frame(&mut self) -> Result<Frame>;

    fn is_healthy(&self) -> bool;

    fn stats(&self) -> SourceStats;
}

/// Build the source matching the URL scheme.
pub fn open_source(config: SourceConfig) -> Result<Box<dyn FrameSource>> {
    if config.url.starts_with("stub://") {
        return Ok(Box::new(SyntheticSource::new(config)));
    }
    let url = Url::parse(&config.url).context("parse camera url")?;
    match url.scheme() {
        "http" | "https" => Ok(Box::new(HttpSource::new(config))),
        other => Err(anyhow!(
            "unsupported camera scheme '{}'; expected stub:// or http(s)://",
            other
        )),
    }
}

pub(crate) fn frame_interval(target_fps: u32) -> Duration {
    if target_fps == 0 {
        Duration::from_millis(0)
    } else {
        Duration::from_millis((1000 / target_fps).max(1) as u64)
    }
}

pub(crate) fn health_grace(target_fps: u32) -> Duration {
    let base_ms = if target_fps == 0 {
        2_000
    } else {
        (1000 / target_fps).saturating_mul(6)
    };
    Duration::from_millis(base_ms.max(2_000) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_source_by_scheme() {
        let stub = open_source(SourceConfig::default()).unwrap();
        assert!(stub.describe().contains("synthetic"));

        let http = open_source(SourceConfig {
            url: "http://127.0.0.1:81/stream".into(),
            ..SourceConfig::default()
        })
        .unwrap();
        assert!(http.describe().contains("http"));

        assert!(open_source(SourceConfig {
            url: "rtsp://camera/stream".into(),
            ..SourceConfig::default()
        })
        .is_err());
    }

    #[test]
    fn frame_interval_tracks_fps() {
        assert_eq!(frame_interval(10), Duration::from_millis(100));
        assert_eq!(frame_interval(0), Duration::from_millis(0));
        assert_eq!(health_grace(30), Duration::from_millis(2_000));
        assert_eq!(health_grace(1), Duration::from_millis(6_000));
    }
}
