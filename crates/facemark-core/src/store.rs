//! CSV-backed attendance table.
//!
//! The table has a fixed `Name,Date,Day,Time` header and one row per
//! attendance event. At most one row exists per (name, date). Every append
//! reads the whole table, scans it for a duplicate, and rewrites it.
//!
//! The rewrite goes to a sibling temporary file that is renamed over the
//! table, so readers never see a half-written file. There is no lock:
//! two processes appending at once can both pass the duplicate scan, and
//! the later rename wins.

use crate::types::{AppendOutcome, AttendanceRecord, DATE_FORMAT, TIME_FORMAT};
use chrono::{NaiveDate, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Column names, in file order.
pub const HEADER: [&str; 4] = ["Name", "Date", "Day", "Time"];

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("CSV: {0}")]
    Csv(#[from] csv::Error),
    #[error("unexpected header in {path}: {found:?}")]
    BadHeader { path: String, found: Vec<String> },
    #[error("malformed row at line {line} in {path}: {reason}")]
    Malformed {
        path: String,
        line: usize,
        reason: String,
    },
}

/// A row exactly as it appears on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct StoredRow {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Date")]
    date: String,
    #[serde(rename = "Day")]
    day: String,
    #[serde(rename = "Time")]
    time: String,
}

impl From<&AttendanceRecord> for StoredRow {
    fn from(record: &AttendanceRecord) -> Self {
        Self {
            name: record.name.clone(),
            date: record.date_field(),
            day: record.day_field().to_string(),
            time: record.time_field(),
        }
    }
}

impl TryFrom<StoredRow> for AttendanceRecord {
    type Error = String;

    fn try_from(row: StoredRow) -> Result<Self, String> {
        let date = NaiveDate::parse_from_str(&row.date, DATE_FORMAT)
            .map_err(|e| format!("bad date {:?}: {e}", row.date))?;
        let day = row
            .day
            .parse::<Weekday>()
            .map_err(|_| format!("bad day {:?}", row.day))?;
        let time = NaiveTime::parse_from_str(&row.time, TIME_FORMAT)
            .map_err(|e| format!("bad time {:?}: {e}", row.time))?;
        Ok(Self {
            name: row.name,
            date,
            day,
            time,
        })
    }
}

/// Attendance table at a fixed path.
pub struct AttendanceStore {
    path: PathBuf,
}

impl AttendanceStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the table with its header if it does not exist yet.
    /// Returns `true` if the file was created.
    pub fn ensure_initialized(&self) -> Result<bool, StoreError> {
        if self.path.exists() {
            return Ok(false);
        }
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.display().to_string(),
                source,
            })?;
        }
        self.write_rows(&[])?;
        tracing::info!(path = %self.path.display(), "attendance table created");
        Ok(true)
    }

    /// Append `record` unless a row with the same name and date exists.
    ///
    /// Never fails outright: any I/O or format problem comes back as
    /// [`AppendOutcome::Failed`].
    pub fn try_append_if_absent(&self, record: &AttendanceRecord) -> AppendOutcome {
        match self.append_if_absent(record) {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "append failed");
                AppendOutcome::Failed(e.to_string())
            }
        }
    }

    fn append_if_absent(&self, record: &AttendanceRecord) -> Result<AppendOutcome, StoreError> {
        self.ensure_initialized()?;
        // Reject a table that `query_all` would reject before adding to it.
        let existing = self.query_all()?;

        if existing
            .iter()
            .any(|r| r.name == record.name && r.date == record.date)
        {
            tracing::debug!(name = %record.name, date = %record.date_field(), "already recorded");
            return Ok(AppendOutcome::AlreadyPresent);
        }

        let row = StoredRow::from(record);
        tracing::info!(name = %row.name, date = %row.date, time = %row.time, "recording attendance");
        let mut rows: Vec<StoredRow> = existing.iter().map(StoredRow::from).collect();
        rows.push(row);
        self.write_rows(&rows)?;
        Ok(AppendOutcome::Appended)
    }

    /// All records in append order. A missing table reads as empty.
    pub fn query_all(&self) -> Result<Vec<AttendanceRecord>, StoreError> {
        self.read_rows()?
            .into_iter()
            .enumerate()
            .map(|(i, row)| {
                AttendanceRecord::try_from(row).map_err(|reason| StoreError::Malformed {
                    path: self.path.display().to_string(),
                    line: i + 2,
                    reason,
                })
            })
            .collect()
    }

    /// Records for a single day, in append order.
    pub fn query_by_date(&self, date: NaiveDate) -> Result<Vec<AttendanceRecord>, StoreError> {
        Ok(self
            .query_all()?
            .into_iter()
            .filter(|r| r.date == date)
            .collect())
    }

    fn read_rows(&self) -> Result<Vec<StoredRow>, StoreError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_path(&self.path)?;

        let headers = reader.headers()?.clone();
        if headers.is_empty() {
            // zero-length file: treated as a table with no rows
            return Ok(Vec::new());
        }
        if headers.iter().ne(HEADER.iter().copied()) {
            return Err(StoreError::BadHeader {
                path: self.path.display().to_string(),
                found: headers.iter().map(str::to_string).collect(),
            });
        }

        let mut rows = Vec::new();
        for (i, result) in reader.deserialize::<StoredRow>().enumerate() {
            let row = result.map_err(|e| StoreError::Malformed {
                path: self.path.display().to_string(),
                line: i + 2, // +1 for header, +1 for 1-based lines
                reason: e.to_string(),
            })?;
            rows.push(row);
        }
        Ok(rows)
    }

    fn write_rows(&self, rows: &[StoredRow]) -> Result<(), StoreError> {
        let tmp = self.tmp_path();
        let result = Self::write_table(&tmp, rows).and_then(|()| {
            std::fs::rename(&tmp, &self.path).map_err(|source| StoreError::Io {
                path: self.path.display().to_string(),
                source,
            })
        });
        if result.is_err() && tmp.exists() {
            if let Err(error) = std::fs::remove_file(&tmp) {
                tracing::warn!(path = %tmp.display(), %error, "failed to remove temporary table");
            }
        }
        result
    }

    /// Write header and rows to `path` and flush them to disk.
    fn write_table(path: &Path, rows: &[StoredRow]) -> Result<(), StoreError> {
        let io_err = |source: std::io::Error| StoreError::Io {
            path: path.display().to_string(),
            source,
        };

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_path(path)?;
        writer.write_record(HEADER)?;
        for row in rows {
            writer.serialize(row)?;
        }
        let file = writer.into_inner().map_err(|e| io_err(e.into_error()))?;
        file.sync_all().map_err(io_err)?;
        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}
