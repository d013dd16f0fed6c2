//! ==============================================================================
//! recorder.rs - user-controlled recording sessions
//! ==============================================================================
//!
//! purpose:
//!     mirrors live readings into a buffer between a user's "start" and
//!     "stop", then saves them as `record_<n>.csv`.
//!
//!         start()                 stop()
//!     Idle ───────> Recording ───────────> Idle
//!                      │ observe(reading)    └─ flush buffer -> record_<n>.csv
//!                      └─ buffer.push
//!
//!     - start() while Recording is rejected, nothing changes
//!     - stop() with an empty buffer reports NothingRecorded, no file
//!     - a failed flush keeps the buffer; the next stop() retries it
//!     - files are written as `record_<n>.csv.tmp` and renamed into place, so
//!       a reader (or a crash) never sees a half-written recording
//!
//! relationships:
//!     - used by: poller.rs (MonitorState owns one; tick calls observe)
//!     - used by: console.rs (start/stop commands)
//!     - uses: store.rs (CSV_HEADER)
//!
//! ==============================================================================

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::domain::Reading;
use crate::error::{RecorderError, StorageError};
use crate::store::CSV_HEADER;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    Idle,
    Recording,
}

/// result of a successful stop()
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    Saved { path: PathBuf, rows: usize },
    NothingRecorded,
}

// ==============================================================================
// filename allocation
// ==============================================================================

/// hands out `record_<n>.csv` names that are free on disk
///
/// the counter only moves forward, so a name is never handed out twice in one
/// process even if its file is deleted afterwards
#[derive(Debug)]
pub struct FilenameAllocator {
    dir: PathBuf,
    next: u32,
}

impl FilenameAllocator {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into(), next: 1 }
    }

    pub fn next_filename(&mut self) -> PathBuf {
        loop {
            let candidate = self.dir.join(format!("record_{}.csv", self.next));
            self.next += 1;
            if !candidate.exists() {
                return candidate;
            }
        }
    }
}

// ==============================================================================
// recorder
// ==============================================================================

#[derive(Debug)]
pub struct Recorder {
    state: RecorderState,
    buffer: Vec<Reading>,
    names: FilenameAllocator,
}

impl Recorder {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            state: RecorderState::Idle,
            buffer: Vec::new(),
            names: FilenameAllocator::new(output_dir),
        }
    }

    pub fn state(&self) -> RecorderState {
        self.state
    }

    pub fn is_recording(&self) -> bool {
        self.state == RecorderState::Recording
    }

    /// readings waiting to be saved
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn start(&mut self) -> Result<(), RecorderError> {
        if self.is_recording() {
            return Err(RecorderError::AlreadyRecording);
        }
        if !self.buffer.is_empty() {
            warn!(discarded = self.buffer.len(), "discarding unsaved readings from previous recording");
        }
        self.buffer.clear();
        self.state = RecorderState::Recording;
        info!("recording started");
        Ok(())
    }

    /// called by the poller for every fetched reading
    ///
    /// placeholders ("N/A" from a server with no readings yet, local
    /// "No Data") carry no measurement and are not recorded
    pub fn observe(&mut self, reading: &Reading) {
        if self.is_recording() && !reading.is_no_data() && !reading.is_sentinel() {
            self.buffer.push(reading.clone());
        }
    }

    pub fn stop(&mut self) -> Result<StopOutcome, RecorderError> {
        if self.is_recording() {
            self.state = RecorderState::Idle;
            info!(buffered = self.buffer.len(), "recording stopped");
        }

        if self.buffer.is_empty() {
            return Ok(StopOutcome::NothingRecorded);
        }

        let path = self.names.next_filename();
        match write_recording(&path, &self.buffer) {
            Ok(()) => {
                let rows = self.buffer.len();
                self.buffer.clear();
                info!(path = %path.display(), rows, "recording saved");
                Ok(StopOutcome::Saved { path, rows })
            }
            Err(source) => Err(RecorderError::Storage { buffered: self.buffer.len(), source }),
        }
    }
}

fn write_recording(path: &Path, rows: &[Reading]) -> Result<(), StorageError> {
    let tmp = path.with_extension("csv.tmp");
    let result = write_rows(&tmp, rows)
        .and_then(|()| fs::rename(&tmp, path).map_err(|e| StorageError::io(path, e)));
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

fn write_rows(path: &Path, rows: &[Reading]) -> Result<(), StorageError> {
    let mut wtr = csv::WriterBuilder::new()
        .has_headers(false)
        .from_path(path)
        .map_err(|e| StorageError::csv(path, e))?;

    wtr.write_record(CSV_HEADER).map_err(|e| StorageError::csv(path, e))?;
    for row in rows {
        wtr.serialize(row).map_err(|e| StorageError::csv(path, e))?;
    }

    wtr.flush().map_err(|e| StorageError::io(path, e))?;
    wtr.get_ref().sync_all().map_err(|e| StorageError::io(path, e))
}
