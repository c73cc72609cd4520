use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use super::{ExportBatch, Exporter};
use crate::error::ExportError;

const HEADER: [&str; 7] = [
    "ID Number",
    "Last Name",
    "First Name",
    "Grade",
    "First Seen",
    "Last Seen",
    "Times Seen",
];
const TIME_FORMAT: &str = "%x %X";

/// Appends one CSV row per subject per closed minute.
///
/// The file is created on the first export; the header is written once.
pub struct SpreadsheetExporter {
    path: PathBuf,
    header_written: bool,
}

impl SpreadsheetExporter {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            header_written: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Exporter for SpreadsheetExporter {
    fn name(&self) -> &'static str {
        "spreadsheet"
    }

    fn export(&mut self, batch: &ExportBatch) -> Result<(), ExportError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let needs_header = !self.header_written && file.metadata()?.len() == 0;
        let mut wtr = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);

        if needs_header {
            wtr.write_record(HEADER)?;
        }
        for (subject, times) in &batch.sightings {
            let (Some(first), Some(last)) = (times.first(), times.last()) else {
                continue;
            };
            let grade = subject.grade().to_string();
            let first_seen = first.format(TIME_FORMAT).to_string();
            let last_seen = last.format(TIME_FORMAT).to_string();
            let times_seen = times.len().to_string();
            wtr.write_record([
                subject.id_number(),
                subject.last_name(),
                subject.first_name(),
                grade.as_str(),
                first_seen.as_str(),
                last_seen.as_str(),
                times_seen.as_str(),
            ])?;
        }
        wtr.flush()?;
        self.header_written = true;
        Ok(())
    }
}
