//! Record persistence
//!
//! Extracted records land in two places, in order: a JSONL backup line
//! first, then a row in the dated CSV. Both are flushed per record, so the
//! backup always holds at least as much as the CSV and either survives a
//! crash mid-record. A small meta sidecar is rewritten atomically alongside
//! so status reporting never has to scan the CSV.
//!
//! Reopening an existing CSV scans it for identifiers already written,
//! which keeps the output duplicate-free across resumed runs.

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::PathsConfig;
use crate::record::PractitionerRecord;

/// Errors from record persistence
#[derive(Debug, Error)]
pub enum OutputError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Sidecar describing the current output file
#[derive(Debug, Serialize, Deserialize)]
pub struct OutputMeta {
    pub csv_file: String,
    pub records: usize,
    pub updated_at: DateTime<Utc>,
}

/// Appends extracted records to the dated CSV plus the JSONL backup.
pub struct RecordWriter {
    csv_path: PathBuf,
    backup_path: PathBuf,
    meta_path: PathBuf,
    csv_writer: csv::Writer<File>,
    backup: File,
    written_ids: HashSet<String>,
}

impl RecordWriter {
    /// Open today's output file, creating it with a header row when new
    /// and scanning it for already-written identifiers when it exists.
    pub fn open(paths: &PathsConfig) -> Result<Self, OutputError> {
        let extracted_dir = paths.extracted_dir();
        fs::create_dir_all(&extracted_dir)?;

        let date = Local::now().format("%Y-%m-%d");
        let csv_path = extracted_dir.join(format!("practitioners_{}.csv", date));
        let meta_path = extracted_dir.join("meta.json");

        let existing = csv_path.exists() && fs::metadata(&csv_path)?.len() > 0;
        let written_ids = if existing {
            Self::scan_existing(&csv_path)?
        } else {
            HashSet::new()
        };

        if existing {
            info!(
                "Appending to {} ({} records already written)",
                csv_path.display(),
                written_ids.len()
            );
        }

        let csv_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&csv_path)?;
        // The header row is only written once, when the file starts empty
        let csv_writer = csv::WriterBuilder::new()
            .has_headers(!existing)
            .from_writer(csv_file);

        let backup_path = paths.backup_file();
        if let Some(parent) = backup_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let backup = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&backup_path)?;

        Ok(Self {
            csv_path,
            backup_path,
            meta_path,
            csv_writer,
            backup,
            written_ids,
        })
    }

    fn scan_existing(path: &PathBuf) -> Result<HashSet<String>, OutputError> {
        let mut ids = HashSet::new();
        let mut reader = csv::Reader::from_path(path)?;
        for row in reader.deserialize::<PractitionerRecord>() {
            let record = row?;
            ids.insert(record.reg_id);
        }
        Ok(ids)
    }

    /// Whether this identifier is already present in the output file
    pub fn contains(&self, reg_id: &str) -> bool {
        self.written_ids.contains(reg_id)
    }

    pub fn len(&self) -> usize {
        self.written_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.written_ids.is_empty()
    }

    pub fn csv_path(&self) -> &PathBuf {
        &self.csv_path
    }

    /// Persist one record: JSONL backup line first, then the CSV row,
    /// both flushed before returning. Duplicates are dropped silently.
    pub fn persist(&mut self, record: &PractitionerRecord) -> Result<(), OutputError> {
        if !self.written_ids.insert(record.reg_id.clone()) {
            debug!("Skipping duplicate record {}", record.reg_id);
            return Ok(());
        }

        let line = serde_json::to_string(record)?;
        writeln!(self.backup, "{}", line)?;
        self.backup.flush()?;

        self.csv_writer.serialize(record)?;
        self.csv_writer.flush()?;

        self.write_meta()?;
        Ok(())
    }

    /// Rewrite the meta sidecar atomically.
    fn write_meta(&self) -> Result<(), OutputError> {
        let meta = OutputMeta {
            csv_file: self.csv_path.display().to_string(),
            records: self.written_ids.len(),
            updated_at: Utc::now(),
        };
        let json = serde_json::to_string_pretty(&meta)?;
        let tmp = self.meta_path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.meta_path)?;
        Ok(())
    }

    pub fn backup_path(&self) -> &PathBuf {
        &self.backup_path
    }
}

/// Read the meta sidecar if one exists, for status reporting.
pub fn read_meta(paths: &PathsConfig) -> Result<Option<OutputMeta>, OutputError> {
    let meta_path = paths.extracted_dir().join("meta.json");
    if !meta_path.exists() {
        return Ok(None);
    }
    let json = fs::read_to_string(meta_path)?;
    Ok(Some(serde_json::from_str(&json)?))
}
