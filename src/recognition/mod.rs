//! Recognition service clients.
//!
//! The dispatcher owns exactly one client and calls it synchronously on its
//! own thread, so implementations need `Send` but not `Sync`.

mod compreface;
mod stub;

use std::time::Duration;

use anyhow::Result;

use crate::detection::Detection;
use crate::error::RecognitionError;

pub use compreface::{CompreFaceClient, FacePage, SavedFace};
pub use stub::{CallLog, ScriptedRecognizer};

pub const DEFAULT_HOST: &str = "http://127.0.0.1";
pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_API_KEY: &str = "00000000-0000-0000-0000-000000000002";
pub const DEFAULT_DET_PROB_THRESHOLD: f64 = 0.8;

/// Connection settings for the recognition service.
#[derive(Clone, Debug)]
pub struct ServiceSettings {
    pub host: String,
    pub port: u16,
    pub api_key: String,
    /// Minimum face-detection probability the service applies before matching.
    pub det_prob_threshold: f64,
    pub timeout: Duration,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            api_key: DEFAULT_API_KEY.to_string(),
            det_prob_threshold: DEFAULT_DET_PROB_THRESHOLD,
            timeout: Duration::from_secs(10),
        }
    }
}

impl ServiceSettings {
    pub fn base_url(&self) -> String {
        format!("{}:{}", self.host.trim_end_matches('/'), self.port)
    }

    /// `stub://` hosts select the offline scripted recognizer.
    pub fn is_stub(&self) -> bool {
        self.host.starts_with("stub://")
    }
}

pub trait RecognitionClient: Send {
    /// Client identifier for logs.
    fn name(&self) -> &'static str;

    /// Submit one encoded image and return every face found in it.
    ///
    /// Transport failures must be reported as [`RecognitionError::Transport`];
    /// the dispatcher treats them as fatal.
    fn recognize(&mut self, image: &[u8]) -> Result<Vec<Detection>, RecognitionError>;
}

/// Build the client for the configured service.
pub fn open_client(settings: &ServiceSettings) -> Result<Box<dyn RecognitionClient>> {
    if settings.is_stub() {
        log::warn!(
            "recognition: {} selects the scripted recognizer; no real faces will be matched",
            settings.host
        );
        return Ok(Box::new(ScriptedRecognizer::demo()?));
    }
    Ok(Box::new(CompreFaceClient::new(settings.clone())?))
}
