use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;

use super::{ExportBatch, Exporter};
use crate::error::ExportError;

#[derive(Debug, Serialize)]
struct SightingRecord<'a> {
    minute: String,
    id_number: &'a str,
    last_name: &'a str,
    first_name: &'a str,
    grade: String,
    seen_at: Vec<String>,
}

/// Appends one JSON object per subject per closed minute.
pub struct JsonLinesExporter {
    path: PathBuf,
}

impl JsonLinesExporter {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Exporter for JsonLinesExporter {
    fn name(&self) -> &'static str {
        "jsonl"
    }

    fn export(&mut self, batch: &ExportBatch) -> Result<(), ExportError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut out = BufWriter::new(file);
        for (subject, times) in &batch.sightings {
            let record = SightingRecord {
                minute: batch.minute.to_rfc3339(),
                id_number: subject.id_number(),
                last_name: subject.last_name(),
                first_name: subject.first_name(),
                grade: subject.grade().to_string(),
                seen_at: times.iter().map(|t| t.to_rfc3339()).collect(),
            };
            serde_json::to_writer(&mut out, &record)?;
            out.write_all(b"\n")?;
        }
        out.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subject::SubjectIdentity;
    use chrono::{Local, TimeZone};
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    #[test]
    fn writes_one_line_per_subject() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        let minute = Local.with_ymd_and_hms(2024, 3, 5, 8, 5, 0).single().unwrap();
        let mut sightings = BTreeMap::new();
        sightings.insert(
            SubjectIdentity::parse("Doe, Jane (000042) [7]").unwrap(),
            vec![minute + chrono::Duration::seconds(2)],
        );
        sightings.insert(
            SubjectIdentity::parse("Smith, Al (9) [T]").unwrap(),
            vec![minute, minute + chrono::Duration::seconds(30)],
        );
        let mut exporter = JsonLinesExporter::new(path.clone());
        exporter.export(&ExportBatch { minute, sightings }).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = contents
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["id_number"], "000042");
        assert_eq!(lines[0]["seen_at"].as_array().unwrap().len(), 1);
        assert_eq!(lines[1]["grade"], "T");
        assert_eq!(lines[1]["seen_at"].as_array().unwrap().len(), 2);
    }
}
