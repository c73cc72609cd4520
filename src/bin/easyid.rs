//! easyid - attendance daemon
//!
//! This daemon:
//! 1. Captures frames from the configured camera
//! 2. Submits new frames to the recognition service
//! 3. Buckets matched subjects per minute and exports each closed minute
//! 4. Flushes every pending bucket on Ctrl-C before exiting

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;

use easyid::config::EasyIdConfig;
use easyid::export::{open_exporter, ExportFormat};
use easyid::ui::{Ui, UiMode};
use easyid::{open_client, open_source, ExitReason, Pipeline, SystemClock};

#[derive(Parser, Debug)]
#[command(name = "easyid", about = "Face recognition attendance daemon")]
struct Args {
    /// TOML configuration file.
    #[arg(long, env = "EASYID_CONFIG")]
    config: Option<PathBuf>,
    /// Recognition service host, including scheme (stub:// runs offline).
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    api_key: Option<String>,
    /// Camera URL: stub://name or an http(s) MJPEG/JPEG endpoint.
    #[arg(long)]
    camera_url: Option<String>,
    /// Directory for the daily sighting log.
    #[arg(long)]
    export_dir: Option<PathBuf>,
    #[arg(long)]
    export_format: Option<String>,
    #[arg(long, value_enum, default_value_t = UiMode::Auto)]
    ui: UiMode,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let ui = Ui::new(args.ui);

    let config = {
        let _stage = ui.stage("Load configuration");
        let mut config = EasyIdConfig::load_from(args.config.as_deref())?;
        if let Some(host) = args.host {
            config.service.host = host;
        }
        if let Some(port) = args.port {
            config.service.port = port;
        }
        if let Some(api_key) = args.api_key {
            config.service.api_key = api_key;
        }
        if let Some(url) = args.camera_url {
            config.camera.url = url;
        }
        if let Some(dir) = args.export_dir {
            config.export_dir = dir;
        }
        if let Some(format) = args.export_format {
            config.export_format = format.parse::<ExportFormat>()?;
        }
        config.validate()?;
        config
    };

    let source = {
        let mut stage = ui.stage("Connect camera");
        let mut source = open_source(config.source_config())?;
        source.connect().context("camera unavailable")?;
        stage.set_detail(source.describe());
        source
    };

    let client = {
        let mut stage = ui.stage("Prepare recognition client");
        let client = open_client(&config.service)?;
        stage.set_detail(format!("{} at {}", client.name(), config.service.base_url()));
        client
    };

    let exporter = {
        let _stage = ui.stage("Open sighting log");
        open_exporter(
            config.export_format,
            &config.export_dir,
            chrono::Local::now().date_naive(),
        )?
    };

    let pipeline = {
        let _stage = ui.stage("Start workers");
        Pipeline::start(
            source,
            client,
            exporter,
            Arc::new(SystemClock),
            config.pipeline_settings()?,
        )?
    };

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    log::info!("easyid running. press Ctrl-C to stop");
    let reason = pipeline.wait_for_exit(&rx);
    match reason {
        ExitReason::Requested => log::info!("shutdown signal received, flushing sightings..."),
        ExitReason::RecognitionStopped => {
            log::error!("recognition stopped; flushing sightings before exit")
        }
        ExitReason::CaptureStopped => log::error!("camera stopped; flushing sightings before exit"),
    }

    let report = pipeline.shutdown()?;
    log::info!(
        "frames submitted: {}, sighting events: {}, minutes exported: {} ({} at shutdown), dropped: {}, integrity errors: {}, unidentified alerts: {}",
        report.frames_submitted,
        report.events_forwarded,
        report.aggregator.batches_exported,
        report.aggregator.buckets_force_flushed,
        report.aggregator.batches_dropped,
        report.aggregator.integrity_errors,
        report.unidentified_alerts
    );

    match reason {
        ExitReason::Requested => Ok(()),
        ExitReason::RecognitionStopped => Err(anyhow!("recognition service unreachable")),
        ExitReason::CaptureStopped => Err(anyhow!("camera stopped delivering frames")),
    }
}
