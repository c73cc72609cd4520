//! Daemon configuration: optional TOML file, then environment overrides,
//! then validation.

use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::aggregator::AggregatorSettings;
use crate::detection::{SimilarityThreshold, DEFAULT_SIMILARITY_THRESHOLD};
use crate::dispatcher::DispatcherSettings;
use crate::export::ExportFormat;
use crate::ingest::SourceConfig;
use crate::pipeline::PipelineSettings;
use crate::presenter::PresenterSettings;
use crate::recognition::{
    ServiceSettings, DEFAULT_API_KEY, DEFAULT_DET_PROB_THRESHOLD, DEFAULT_HOST, DEFAULT_PORT,
};

const DEFAULT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_IDLE_WAIT_MS: u64 = 5;
const DEFAULT_JPEG_QUALITY: u8 = 85;
const DEFAULT_TRANSPORT_RETRIES: u32 = 0;
const DEFAULT_RETRY_BACKOFF_MS: u64 = 500;
const DEFAULT_CAMERA_URL: &str = "stub://webcam0";
const DEFAULT_CAMERA_FPS: u32 = 30;
const DEFAULT_CAMERA_WIDTH: u32 = 640;
const DEFAULT_CAMERA_HEIGHT: u32 = 480;
const DEFAULT_POLL_INTERVAL_SECS: u64 = 1;
const DEFAULT_EXPORT_RETRY_LIMIT: u32 = 3;
const DEFAULT_EXPORT_DIR: &str = "easyID/Data";
const DEFAULT_UNIDENTIFIED_TIMEOUT_SECS: u64 = 5;

#[derive(Debug, Deserialize, Default)]
struct EasyIdConfigFile {
    service: Option<ServiceConfigFile>,
    recognition: Option<RecognitionConfigFile>,
    camera: Option<CameraConfigFile>,
    aggregator: Option<AggregatorConfigFile>,
    export: Option<ExportConfigFile>,
    presenter: Option<PresenterConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ServiceConfigFile {
    host: Option<String>,
    port: Option<u16>,
    api_key: Option<String>,
    det_prob_threshold: Option<f64>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct RecognitionConfigFile {
    similarity_threshold: Option<f64>,
    idle_wait_ms: Option<u64>,
    jpeg_quality: Option<u8>,
    transport_retries: Option<u32>,
    retry_backoff_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    url: Option<String>,
    target_fps: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
    mirror: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct AggregatorConfigFile {
    poll_interval_secs: Option<u64>,
    export_retry_limit: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct ExportConfigFile {
    directory: Option<PathBuf>,
    format: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct PresenterConfigFile {
    snapshot_dir: Option<PathBuf>,
    unidentified_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct EasyIdConfig {
    pub service: ServiceSettings,
    pub recognition: RecognitionTuning,
    pub camera: CameraSettings,
    pub poll_interval: Duration,
    pub export_retry_limit: u32,
    pub export_dir: PathBuf,
    pub export_format: ExportFormat,
    pub snapshot_dir: Option<PathBuf>,
    pub unidentified_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct RecognitionTuning {
    /// Similarity a match must strictly exceed, in (0, 1].
    pub similarity_threshold: f64,
    pub idle_wait: Duration,
    pub jpeg_quality: u8,
    pub transport_retries: u32,
    pub retry_backoff: Duration,
}

#[derive(Debug, Clone)]
pub struct CameraSettings {
    pub url: String,
    pub target_fps: u32,
    pub width: u32,
    pub height: u32,
    pub mirror: bool,
}

impl EasyIdConfig {
    /// Load using the file named by `EASYID_CONFIG`, if any.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("EASYID_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: EasyIdConfigFile) -> Result<Self> {
        let service = file.service.unwrap_or_default();
        let recognition = file.recognition.unwrap_or_default();
        let camera = file.camera.unwrap_or_default();
        let aggregator = file.aggregator.unwrap_or_default();
        let export = file.export.unwrap_or_default();
        let presenter = file.presenter.unwrap_or_default();

        let export_format = match export.format.as_deref() {
            Some(format) => format.parse()?,
            None => ExportFormat::Csv,
        };

        Ok(Self {
            service: ServiceSettings {
                host: service.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
                port: service.port.unwrap_or(DEFAULT_PORT),
                api_key: service
                    .api_key
                    .unwrap_or_else(|| DEFAULT_API_KEY.to_string()),
                det_prob_threshold: service
                    .det_prob_threshold
                    .unwrap_or(DEFAULT_DET_PROB_THRESHOLD),
                timeout: Duration::from_secs(
                    service.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS),
                ),
            },
            recognition: RecognitionTuning {
                similarity_threshold: recognition
                    .similarity_threshold
                    .unwrap_or(DEFAULT_SIMILARITY_THRESHOLD),
                idle_wait: Duration::from_millis(
                    recognition.idle_wait_ms.unwrap_or(DEFAULT_IDLE_WAIT_MS),
                ),
                jpeg_quality: recognition.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
                transport_retries: recognition
                    .transport_retries
                    .unwrap_or(DEFAULT_TRANSPORT_RETRIES),
                retry_backoff: Duration::from_millis(
                    recognition
                        .retry_backoff_ms
                        .unwrap_or(DEFAULT_RETRY_BACKOFF_MS),
                ),
            },
            camera: CameraSettings {
                url: camera
                    .url
                    .unwrap_or_else(|| DEFAULT_CAMERA_URL.to_string()),
                target_fps: camera.target_fps.unwrap_or(DEFAULT_CAMERA_FPS),
                width: camera.width.unwrap_or(DEFAULT_CAMERA_WIDTH),
                height: camera.height.unwrap_or(DEFAULT_CAMERA_HEIGHT),
                mirror: camera.mirror.unwrap_or(true),
            },
            poll_interval: Duration::from_secs(
                aggregator
                    .poll_interval_secs
                    .unwrap_or(DEFAULT_POLL_INTERVAL_SECS),
            ),
            export_retry_limit: aggregator
                .export_retry_limit
                .unwrap_or(DEFAULT_EXPORT_RETRY_LIMIT),
            export_dir: export
                .directory
                .unwrap_or_else(|| PathBuf::from(DEFAULT_EXPORT_DIR)),
            export_format,
            snapshot_dir: presenter.snapshot_dir,
            unidentified_timeout: Duration::from_secs(
                presenter
                    .unidentified_timeout_secs
                    .unwrap_or(DEFAULT_UNIDENTIFIED_TIMEOUT_SECS),
            ),
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(host) = std::env::var("EASYID_HOST") {
            if !host.trim().is_empty() {
                self.service.host = host;
            }
        }
        if let Ok(port) = std::env::var("EASYID_PORT") {
            self.service.port = port
                .trim()
                .parse()
                .map_err(|_| anyhow!("EASYID_PORT must be a port number"))?;
        }
        if let Ok(key) = std::env::var("EASYID_API_KEY") {
            if !key.trim().is_empty() {
                self.service.api_key = key;
            }
        }
        if let Ok(value) = std::env::var("EASYID_DET_PROB_THRESHOLD") {
            self.service.det_prob_threshold = value
                .trim()
                .parse()
                .map_err(|_| anyhow!("EASYID_DET_PROB_THRESHOLD must be a number"))?;
        }
        if let Ok(value) = std::env::var("EASYID_SIMILARITY_THRESHOLD") {
            self.recognition.similarity_threshold = value
                .trim()
                .parse()
                .map_err(|_| anyhow!("EASYID_SIMILARITY_THRESHOLD must be a number"))?;
        }
        if let Ok(value) = std::env::var("EASYID_TRANSPORT_RETRIES") {
            self.recognition.transport_retries = value
                .trim()
                .parse()
                .map_err(|_| anyhow!("EASYID_TRANSPORT_RETRIES must be an integer"))?;
        }
        if let Ok(url) = std::env::var("EASYID_CAMERA_URL") {
            if !url.trim().is_empty() {
                self.camera.url = url;
            }
        }
        if let Ok(value) = std::env::var("EASYID_POLL_INTERVAL_SECS") {
            let seconds: u64 = value.trim().parse().map_err(|_| {
                anyhow!("EASYID_POLL_INTERVAL_SECS must be an integer number of seconds")
            })?;
            self.poll_interval = Duration::from_secs(seconds);
        }
        if let Ok(dir) = std::env::var("EASYID_EXPORT_DIR") {
            if !dir.trim().is_empty() {
                self.export_dir = PathBuf::from(dir);
            }
        }
        if let Ok(format) = std::env::var("EASYID_EXPORT_FORMAT") {
            if !format.trim().is_empty() {
                self.export_format = format.parse()?;
            }
        }
        if let Ok(dir) = std::env::var("EASYID_SNAPSHOT_DIR") {
            if !dir.trim().is_empty() {
                self.snapshot_dir = Some(PathBuf::from(dir));
            }
        }
        Ok(())
    }

    /// Checks shared by file, env and command-line values. Call again after
    /// applying command-line overrides.
    pub fn validate(&self) -> Result<()> {
        if self.service.host.trim().is_empty() {
            return Err(anyhow!("service host must not be empty"));
        }
        if self.service.port == 0 {
            return Err(anyhow!("service port must be greater than zero"));
        }
        if self.service.api_key.trim().is_empty() {
            return Err(anyhow!("service api key must not be empty"));
        }
        SimilarityThreshold::new(self.recognition.similarity_threshold)
            .map_err(|e| anyhow!("similarity threshold: {}", e))?;
        SimilarityThreshold::new(self.service.det_prob_threshold)
            .map_err(|e| anyhow!("detection probability threshold: {}", e))?;
        if !(1..=100).contains(&self.recognition.jpeg_quality) {
            return Err(anyhow!("jpeg quality must be between 1 and 100"));
        }
        if self.camera.target_fps == 0 {
            return Err(anyhow!("camera target_fps must be greater than zero"));
        }
        if self.camera.width == 0 || self.camera.height == 0 {
            return Err(anyhow!("camera width and height must be greater than zero"));
        }
        if self.poll_interval.is_zero() {
            return Err(anyhow!("poll interval must be greater than zero"));
        }
        if self.unidentified_timeout.is_zero() {
            return Err(anyhow!("unidentified timeout must be greater than zero"));
        }
        Ok(())
    }

    pub fn source_config(&self) -> SourceConfig {
        SourceConfig {
            url: self.camera.url.clone(),
            target_fps: self.camera.target_fps,
            width: self.camera.width,
            height: self.camera.height,
        }
    }

    pub fn pipeline_settings(&self) -> Result<PipelineSettings> {
        let threshold = SimilarityThreshold::new(self.recognition.similarity_threshold)
            .map_err(|e| anyhow!("similarity threshold: {}", e))?;
        Ok(PipelineSettings {
            mirror: self.camera.mirror,
            dispatcher: DispatcherSettings {
                idle_wait: self.recognition.idle_wait,
                jpeg_quality: self.recognition.jpeg_quality,
                transport_retries: self.recognition.transport_retries,
                retry_backoff: self.recognition.retry_backoff,
            },
            aggregator: AggregatorSettings {
                threshold,
                poll_interval: self.poll_interval,
                export_retry_limit: self.export_retry_limit,
            },
            presenter: PresenterSettings {
                threshold,
                unidentified_timeout: self.unidentified_timeout,
                snapshot_dir: self.snapshot_dir.clone(),
                ..PresenterSettings::default()
            },
        })
    }
}

fn read_config_file(path: &Path) -> Result<EasyIdConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = toml::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
