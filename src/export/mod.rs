//! Durable sinks for closed minute buckets.

mod jsonl;
mod spreadsheet;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Local, NaiveDate};

use crate::error::ExportError;
use crate::subject::SubjectIdentity;

pub use jsonl::JsonLinesExporter;
pub use spreadsheet::SpreadsheetExporter;

/// Sightings of one closed minute, with absolute timestamps.
#[derive(Clone, Debug, PartialEq)]
pub struct ExportBatch {
    pub minute: DateTime<Local>,
    pub sightings: BTreeMap<SubjectIdentity, Vec<DateTime<Local>>>,
}

/// A sink for finalized buckets.
///
/// Called once per bucket from the flusher thread. An `Err` leaves the batch
/// with the caller, which may submit the same batch again later.
pub trait Exporter: Send {
    fn name(&self) -> &'static str;

    fn export(&mut self, batch: &ExportBatch) -> Result<(), ExportError>;
}

/// Export format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Csv,
    JsonLines,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::JsonLines => "jsonl",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "csv" => Ok(ExportFormat::Csv),
            "jsonl" | "json" => Ok(ExportFormat::JsonLines),
            other => Err(anyhow!("unknown export format '{}'; expected csv or jsonl", other)),
        }
    }
}

/// Build the exporter for `format`, writing a fresh daily log under `dir`.
pub fn open_exporter(format: ExportFormat, dir: &Path, date: NaiveDate) -> Result<Box<dyn Exporter>> {
    std::fs::create_dir_all(dir)
        .map_err(|e| anyhow!("failed to create export directory {}: {}", dir.display(), e))?;
    let path = log_file_name(dir, date, format.extension());
    log::info!("export: writing sightings to {}", path.display());
    Ok(match format {
        ExportFormat::Csv => Box::new(SpreadsheetExporter::new(path)),
        ExportFormat::JsonLines => Box::new(JsonLinesExporter::new(path)),
    })
}

/// First unused `easyID_log_YYYYMMDD[(n)].ext` in `dir`.
pub fn log_file_name(dir: &Path, date: NaiveDate, extension: &str) -> PathBuf {
    let stem = format!("easyID_log_{}", date.format("%Y%m%d"));
    let mut n = 0;
    loop {
        let name = if n == 0 {
            format!("{}.{}", stem, extension)
        } else {
            format!("{}({}).{}", stem, n, extension)
        };
        let candidate = dir.join(name);
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}
