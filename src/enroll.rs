//! Roster import and subject enrollment.
//!
//! A roster is a CSV export with at least the columns `Last Name`,
//! `First Name`, `Subject ID`, `Internal ID`, `Grade` and `Images`. Each row
//! with a photo becomes a [`SubjectIdentity`] that is registered with the
//! recognition service under its canonical name, plus one example photo.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use indicatif::ProgressBar;
use serde::Deserialize;

use crate::recognition::CompreFaceClient;
use crate::subject::{Grade, SubjectIdentity};

#[derive(Debug, Deserialize)]
struct RosterRow {
    #[serde(rename = "Last Name")]
    last_name: String,
    #[serde(rename = "First Name")]
    first_name: String,
    #[serde(rename = "Subject ID")]
    subject_id: String,
    #[serde(rename = "Internal ID")]
    internal_id: String,
    #[serde(rename = "Grade")]
    grade: String,
    #[serde(rename = "Images")]
    images: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RosterEntry {
    pub subject: SubjectIdentity,
    pub image_path: PathBuf,
}

/// Parse the roster at `path`, resolving photos against `photo_dir`.
///
/// Rows without a photo are skipped. Any other bad row fails the whole load,
/// naming the CSV line.
pub fn load_roster(path: &Path, photo_dir: &Path) -> Result<Vec<RosterEntry>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("open roster {}", path.display()))?;
    let mut entries = Vec::new();
    for (index, row) in reader.deserialize::<RosterRow>().enumerate() {
        let line = index + 2;
        let row = row.with_context(|| format!("roster line {}", line))?;
        if row.images.trim().is_empty() {
            log::info!(
                "skipping {} {} (line {}): no picture",
                row.first_name,
                row.last_name,
                line
            );
            continue;
        }
        let image_path = photo_dir.join(row.images.trim());
        if !image_path.is_file() {
            return Err(anyhow!(
                "roster line {}: image for {}, {} not found at {}",
                line,
                row.last_name,
                row.first_name,
                image_path.display()
            ));
        }
        let id_number = if row.subject_id.trim().is_empty() {
            row.internal_id.as_str()
        } else {
            row.subject_id.as_str()
        };
        let grade = if row.grade.trim().is_empty() {
            Grade::STAFF
        } else {
            row.grade
                .parse::<Grade>()
                .with_context(|| format!("roster line {}", line))?
        };
        let subject = SubjectIdentity::new(&row.last_name, &row.first_name, id_number, grade)
            .with_context(|| format!("roster line {}", line))?;
        entries.push(RosterEntry {
            subject,
            image_path,
        });
    }
    Ok(entries)
}

/// The service calls enrollment needs.
pub trait SubjectRegistry {
    fn list_subjects(&self) -> Result<BTreeSet<String>>;
    fn add_subject(&self, name: &str) -> Result<()>;
    fn subjects_with_faces(&self) -> Result<BTreeSet<String>>;
    fn add_face(&self, subject: &str, image: &[u8]) -> Result<String>;
}

impl SubjectRegistry for CompreFaceClient {
    fn list_subjects(&self) -> Result<BTreeSet<String>> {
        CompreFaceClient::list_subjects(self)
    }

    fn add_subject(&self, name: &str) -> Result<()> {
        CompreFaceClient::add_subject(self, name)
    }

    fn subjects_with_faces(&self) -> Result<BTreeSet<String>> {
        CompreFaceClient::subjects_with_faces(self)
    }

    fn add_face(&self, subject: &str, image: &[u8]) -> Result<String> {
        CompreFaceClient::add_face(self, subject, image)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EnrollReport {
    pub subjects_added: usize,
    pub subjects_existing: usize,
    pub faces_added: usize,
    pub faces_existing: usize,
    pub faces_failed: usize,
}

/// Register every subject, then upload a photo for each subject that has none.
///
/// A failed photo upload is logged and counted; the run continues.
pub fn enroll(
    registry: &dyn SubjectRegistry,
    entries: &[RosterEntry],
    progress: &ProgressBar,
) -> Result<EnrollReport> {
    let mut report = EnrollReport::default();

    let existing = registry.list_subjects()?;
    for entry in entries {
        let name = entry.subject.to_string();
        if existing.contains(&name) {
            report.subjects_existing += 1;
            continue;
        }
        registry.add_subject(&name)?;
        log::info!("{} added", name);
        report.subjects_added += 1;
    }

    let with_faces = registry.subjects_with_faces()?;
    progress.set_length(entries.len() as u64);
    for entry in entries {
        let name = entry.subject.to_string();
        progress.set_message(name.clone());
        if with_faces.contains(&name) {
            report.faces_existing += 1;
            progress.inc(1);
            continue;
        }
        let uploaded = std::fs::read(&entry.image_path)
            .with_context(|| format!("read {}", entry.image_path.display()))
            .and_then(|image| registry.add_face(&name, &image));
        match uploaded {
            Ok(image_id) => {
                log::info!("image {} added for {}", image_id, name);
                report.faces_added += 1;
            }
            Err(err) => {
                log::warn!("could not add photo for {}: {:#}", name, err);
                report.faces_failed += 1;
            }
        }
        progress.inc(1);
    }
    progress.finish_and_clear();
    Ok(report)
}
