//! enroll_subjects - register a roster with the recognition service
//!
//! Reads a roster CSV, registers every subject under its canonical name and
//! uploads one photo for each subject that does not have one yet.

use anyhow::{anyhow, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{BufRead, Write};
use std::path::PathBuf;

use easyid::enroll::{enroll, load_roster};
use easyid::recognition::{
    CompreFaceClient, ServiceSettings, DEFAULT_API_KEY, DEFAULT_HOST, DEFAULT_PORT,
};
use easyid::ui::{Ui, UiMode};

#[derive(Parser, Debug)]
#[command(name = "enroll_subjects", about = "Upload a roster to the recognition service")]
struct Args {
    /// Roster CSV with Last Name, First Name, Subject ID, Internal ID, Grade, Images.
    #[arg(long, default_value = "students.csv")]
    spreadsheet_path: PathBuf,
    /// Directory the Images column is relative to.
    #[arg(long, default_value = ".")]
    photo_dir: PathBuf,
    #[arg(long, env = "EASYID_API_KEY", default_value = DEFAULT_API_KEY)]
    api_key: String,
    #[arg(long, env = "EASYID_HOST", default_value = DEFAULT_HOST)]
    host: String,
    #[arg(long, env = "EASYID_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,
    /// Skip the confirmation prompt.
    #[arg(long)]
    yes: bool,
    #[arg(long, value_enum, default_value_t = UiMode::Auto)]
    ui: UiMode,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let ui = Ui::new(args.ui);

    let entries = {
        let mut stage = ui.stage("Read roster");
        let entries = load_roster(&args.spreadsheet_path, &args.photo_dir)?;
        stage.set_detail(format!("{} subject(s)", entries.len()));
        entries
    };
    if entries.is_empty() {
        return Err(anyhow!(
            "no subjects with photos in {}",
            args.spreadsheet_path.display()
        ));
    }

    if !args.yes && !confirm(&format!("Upload {} subjects? (y/n): ", entries.len()))? {
        log::info!("nothing uploaded");
        return Ok(());
    }

    let client = CompreFaceClient::new(ServiceSettings {
        host: args.host,
        port: args.port,
        api_key: args.api_key,
        ..ServiceSettings::default()
    })?;

    let progress = ProgressBar::new(entries.len() as u64);
    let style = ProgressStyle::with_template("{bar:40} {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    progress.set_style(style);

    let report = {
        let _stage = ui.stage("Enroll subjects");
        enroll(&client, &entries, &progress)?
    };
    log::info!(
        "subjects added: {} (already present: {}), photos added: {} (already present: {}, failed: {})",
        report.subjects_added,
        report.subjects_existing,
        report.faces_added,
        report.faces_existing,
        report.faces_failed
    );
    Ok(())
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{}", prompt);
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer)?;
    Ok(answer.trim().eq_ignore_ascii_case("y"))
}
