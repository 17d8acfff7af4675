//! Append-only journal of page transfers, one JSON object per line.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::location::Location;
use crate::pages::PageTransfer;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Completed,
    ChecksumMismatch,
    Failed,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TransferLogEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub source: PathBuf,
    pub source_location: Location,
    pub destination: PathBuf,
    pub status: TransferStatus,
    pub horizon: u64,
    pub blocks_examined: u32,
    pub blocks_sent: u32,
    pub blocks_skipped: u32,
    pub bytes_written: u64,
    pub truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TransferLogEntry {
    pub fn new(source: &Path, source_location: Location, destination: &Path, horizon: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.to_path_buf(),
            source_location,
            destination: destination.to_path_buf(),
            status: TransferStatus::Completed,
            horizon,
            blocks_examined: 0,
            blocks_sent: 0,
            blocks_skipped: 0,
            bytes_written: 0,
            truncated: false,
            error: None,
        }
    }

    pub fn completed(mut self, stats: &PageTransfer) -> Self {
        self.status = TransferStatus::Completed;
        self.blocks_examined = stats.blocks_examined;
        self.blocks_sent = stats.blocks_sent;
        self.blocks_skipped = stats.blocks_skipped;
        self.bytes_written = stats.bytes_written;
        self.truncated = stats.truncated;
        self
    }

    pub fn failed(mut self, err: &crate::FioError) -> Self {
        self.status = match err {
            crate::FioError::PageChecksumMismatch { .. } => TransferStatus::ChecksumMismatch,
            _ => TransferStatus::Failed,
        };
        self.error = Some(err.to_string());
        self
    }
}

pub struct TransferLog {
    path: PathBuf,
}

impl TransferLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn add_entry(&self, entry: &TransferLogEntry) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open transfer journal {}", self.path.display()))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, entry)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    pub fn read_log(&self) -> Result<Vec<TransferLogEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.path)
            .with_context(|| format!("open transfer journal {}", self.path.display()))?;
        let mut entries = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            entries.push(serde_json::from_str(&line)?);
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn entries_append_in_order() {
        let tmp = TempDir::new().unwrap();
        let log = TransferLog::new(tmp.path().join("journal/pages.jsonl"));
        assert!(log.read_log().unwrap().is_empty());

        let stats = PageTransfer {
            blocks_examined: 10,
            blocks_sent: 7,
            blocks_skipped: 3,
            bytes_written: 7 * 8200,
            truncated: false,
        };
        let ok = TransferLogEntry::new(Path::new("base/1/1259"), Location::DbHost, Path::new("/backup/1259"), 42)
            .completed(&stats);
        let bad = TransferLogEntry::new(Path::new("base/1/1260"), Location::DbHost, Path::new("/backup/1260"), 42)
            .failed(&crate::FioError::PageChecksumMismatch { block: 5 });
        log.add_entry(&ok).unwrap();
        log.add_entry(&bad).unwrap();

        let entries = log.read_log().unwrap();
        assert_eq!(entries, vec![ok, bad]);
        assert_eq!(entries[1].status, TransferStatus::ChecksumMismatch);
        assert_ne!(entries[0].id, entries[1].id);
    }
}
