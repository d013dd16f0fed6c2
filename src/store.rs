//! ==============================================================================
//! store.rs - durable reading log
//! ==============================================================================
//!
//! purpose:
//!     append-only csv log of every accepted reading. the file is created with
//!     a header row on first start and is only ever appended to afterwards,
//!     so `rows - 1 == readings accepted since creation`, across restarts.
//!
//! design:
//!     - `LogSink` is the seam the server writes through. production uses
//!       `CsvLog`; tests swap in sinks that fail on demand.
//!     - each row is encoded to bytes first and handed to the file in one
//!       `write_all`, so a failed append never leaves half a row sitting in a
//!       buffer that a later append would flush.
//!     - callers serialize appends (the server holds its write lock).
//!     - a row torn by a crash or a failed write is cut off on the next open,
//!       so the following append starts on a fresh line.
//!
//! relationships:
//!     - used by: server.rs (ServerContext owns a Box<dyn LogSink>)
//!     - used by: recorder.rs (CSV_HEADER for recording files)
//!     - uses: domain.rs (Reading)
//!
//! ==============================================================================

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::domain::Reading;
use crate::error::StorageError;

/// header shared by the log and recording files
pub const CSV_HEADER: [&str; 3] = ["timestamp", "tds_value", "temperature"];

/// where accepted readings go
pub trait LogSink: Send {
    /// append one reading; must either persist the whole row or return an error
    fn append(&mut self, reading: &Reading) -> Result<(), StorageError>;
}

// ==============================================================================
// csv log
// ==============================================================================

pub struct CsvLog {
    path: PathBuf,
    file: File,
    rows: u64,
    /// file length after the last complete row
    len: u64,
    sync: bool,
}

impl CsvLog {
    /// open the log, creating it (and its directory) with a header if absent
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();

        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|e| StorageError::io(dir, e))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| StorageError::io(&path, e))?;

        let mut len = file
            .metadata()
            .map_err(|e| StorageError::io(&path, e))?
            .len();

        let torn = torn_tail(&path, len).map_err(|e| StorageError::io(&path, e))?;
        if torn > 0 {
            len -= torn;
            file.set_len(len)
                .and_then(|_| file.sync_data())
                .map_err(|e| StorageError::io(&path, e))?;
            warn!(path = %path.display(), dropped_bytes = torn, "cut off a partial row at the end of the log");
        }

        let rows = if len == 0 {
            let header = encode_header().map_err(|e| StorageError::csv(&path, e))?;
            file.write_all(&header)
                .and_then(|_| file.sync_data())
                .map_err(|e| StorageError::io(&path, e))?;
            len = header.len() as u64;
            info!(path = %path.display(), "created reading log");
            0
        } else {
            let (rows, malformed) = scan_rows(&path)?;
            if malformed > 0 {
                warn!(path = %path.display(), malformed, "log contains rows with the wrong number of fields");
            }
            info!(path = %path.display(), rows, "resuming reading log");
            rows
        };

        Ok(Self { path, file, rows, len, sync: true })
    }

    /// skip fsync after each append (tests, tmpfs)
    pub fn without_sync(mut self) -> Self {
        self.sync = false;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// data rows in the file, excluding the header
    pub fn rows(&self) -> u64 {
        self.rows
    }
}

impl LogSink for CsvLog {
    fn append(&mut self, reading: &Reading) -> Result<(), StorageError> {
        let row = encode_row(reading).map_err(|e| StorageError::csv(&self.path, e))?;
        let written = self.file.write_all(&row).and_then(|_| {
            if self.sync {
                self.file.sync_data()
            } else {
                Ok(())
            }
        });
        if let Err(e) = written {
            // drop whatever part of the row reached the file
            if let Err(undo) = self.file.set_len(self.len) {
                warn!(path = %self.path.display(), "could not roll back partial row: {}", undo);
            }
            return Err(StorageError::io(&self.path, e));
        }
        self.len += row.len() as u64;
        self.rows += 1;
        Ok(())
    }
}

// ==============================================================================
// row encoding
// ==============================================================================

fn encode_header() -> Result<Vec<u8>, csv::Error> {
    let mut wtr = csv::Writer::from_writer(Vec::with_capacity(40));
    wtr.write_record(CSV_HEADER)?;
    wtr.into_inner().map_err(inner_error)
}

fn encode_row(reading: &Reading) -> Result<Vec<u8>, csv::Error> {
    let mut wtr = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::with_capacity(48));
    wtr.serialize(reading)?;
    wtr.into_inner().map_err(inner_error)
}

fn inner_error<W>(e: csv::IntoInnerError<W>) -> csv::Error {
    let io = e.error();
    csv::Error::from(std::io::Error::new(io.kind(), io.to_string()))
}

/// bytes after the last newline; 0 when the file ends cleanly
fn torn_tail(path: &Path, len: u64) -> std::io::Result<u64> {
    if len == 0 {
        return Ok(0);
    }
    let mut file = File::open(path)?;
    let mut buf = [0u8; 4096];
    let mut end = len;
    while end > 0 {
        let start = end.saturating_sub(buf.len() as u64);
        let chunk = &mut buf[..(end - start) as usize];
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(chunk)?;
        if let Some(i) = chunk.iter().rposition(|&b| b == b'\n') {
            return Ok(len - (start + i as u64 + 1));
        }
        end = start;
    }
    // no newline at all: not even the header made it
    Ok(len)
}

/// (data rows, rows whose field count is off), header excluded
fn scan_rows(path: &Path) -> Result<(u64, u64), StorageError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)
        .map_err(|e| StorageError::csv(path, e))?;
    let (mut rows, mut malformed) = (0, 0);
    for record in reader.byte_records() {
        let record = record.map_err(|e| StorageError::csv(path, e))?;
        if record.len() != CSV_HEADER.len() {
            malformed += 1;
        }
        rows += 1;
    }
    Ok((rows, malformed))
}

/// data rows (header excluded) in a log or recording file
pub fn count_rows(path: &Path) -> Result<u64, StorageError> {
    scan_rows(path).map(|(rows, _)| rows)
}

/// every reading in a log or recording file, in file order
pub fn read_all(path: &Path) -> Result<Vec<Reading>, StorageError> {
    let mut reader = csv::Reader::from_path(path).map_err(|e| StorageError::csv(path, e))?;
    reader
        .deserialize()
        .collect::<Result<Vec<Reading>, _>>()
        .map_err(|e| StorageError::csv(path, e))
}

// ==============================================================================
// tests
// ==============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn reading(ts: &str, tds: f64, temp: f64) -> Reading {
        Reading { timestamp: ts.to_string(), tds_value: tds, temperature: temp }
    }

    #[test]
    fn test_creates_log_with_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("database.csv");

        let log = CsvLog::open(&path).unwrap();
        assert_eq!(log.rows(), 0);

        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text, "timestamp,tds_value,temperature\n");
    }

    #[test]
    fn test_append_and_resume() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("database.csv");

        let mut log = CsvLog::open(&path).unwrap().without_sync();
        log.append(&reading("2024-03-01 10:00:00", 150.2, 24.5)).unwrap();
        log.append(&reading("2024-03-01 10:00:02", 151.0, 24.4)).unwrap();
        assert_eq!(log.rows(), 2);
        drop(log);

        // restart: header is not rewritten, count carries over
        let mut log = CsvLog::open(&path).unwrap();
        assert_eq!(log.rows(), 2);
        log.append(&reading("2024-03-01 10:05:00", 149.9, 24.6)).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text.matches("timestamp").count(), 1);
        assert_eq!(count_rows(&path).unwrap(), 3);

        let all = read_all(&path).unwrap();
        assert_eq!(all[0], reading("2024-03-01 10:00:00", 150.2, 24.5));
        assert_eq!(all[2].timestamp, "2024-03-01 10:05:00");
    }

    #[test]
    fn test_empty_existing_file_gets_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("database.csv");
        File::create(&path).unwrap();

        CsvLog::open(&path).unwrap();
        assert!(fs::read_to_string(&path).unwrap().starts_with("timestamp,"));
    }

    #[test]
    fn test_torn_last_row_is_cut_off_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("database.csv");

        let mut log = CsvLog::open(&path).unwrap().without_sync();
        log.append(&reading("2024-03-01 10:00:00", 150.2, 24.5)).unwrap();
        drop(log);

        // a crash mid-append left half a row without a newline
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"2024-03-01 10:00:02,15").unwrap();
        drop(file);

        let mut log = CsvLog::open(&path).unwrap().without_sync();
        assert_eq!(log.rows(), 1);
        log.append(&reading("2024-03-01 10:00:04", 151.0, 24.4)).unwrap();

        assert_eq!(
            read_all(&path).unwrap(),
            vec![
                reading("2024-03-01 10:00:00", 150.2, 24.5),
                reading("2024-03-01 10:00:04", 151.0, 24.4),
            ]
        );
    }

    #[test]
    fn test_torn_header_is_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("database.csv");
        fs::write(&path, "timest").unwrap();

        let log = CsvLog::open(&path).unwrap();
        assert_eq!(log.rows(), 0);
        assert_eq!(fs::read_to_string(&path).unwrap(), "timestamp,tds_value,temperature\n");
    }

    #[test]
    fn test_open_fails_when_parent_is_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, "x").unwrap();

        let err = CsvLog::open(blocker.join("database.csv")).err().unwrap();
        assert!(matches!(err, StorageError::Io { .. }));
    }
}
