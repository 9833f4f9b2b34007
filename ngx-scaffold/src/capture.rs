//! Traffic capture.
//!
//! Writes the bytes exchanged with the server-under-test to an NDJSON file,
//! one line per direction per block. Payloads are base64-encoded because
//! raw requests are often deliberately not valid UTF-8.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::Serialize;
use tracing::debug;

use crate::error::ScaffoldError;

/// Direction of the captured bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureDirection {
    /// Bytes written by the driver.
    Request,
    /// Bytes read back from the server.
    Response,
}

#[derive(Debug, Serialize)]
struct CaptureEntry<'a> {
    timestamp: String,
    ordinal: usize,
    title: &'a str,
    direction: CaptureDirection,
    len: usize,
    data: String,
}

/// Writer for traffic capture files.
pub struct CaptureWriter {
    // Held briefly for a buffered write + flush, never across `.await`.
    writer: Mutex<BufWriter<File>>,
    path: PathBuf,
}

impl std::fmt::Debug for CaptureWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureWriter")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl CaptureWriter {
    /// Creates a capture writer in `capture_dir`.
    ///
    /// The directory is created if missing. The file is named
    /// `run-<timestamp>-<pid>-<rand>.jsonl` so concurrent runs sharing a
    /// directory never collide.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the file
    /// cannot be opened.
    pub fn new(capture_dir: &Path) -> Result<Self, ScaffoldError> {
        if capture_dir.as_os_str().is_empty() {
            return Err(ScaffoldError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "capture directory path is empty",
            )));
        }
        fs::create_dir_all(capture_dir)?;

        let timestamp = chrono::Utc::now().format("%Y%m%dT%H%M%SZ");
        let pid = std::process::id();
        let rand_suffix: u16 = rand::random();
        let path = capture_dir.join(format!("run-{timestamp}-{pid}-{rand_suffix:04x}.jsonl"));

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        debug!(path = %path.display(), "capture file opened");

        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
            path,
        })
    }

    /// Appends one capture line.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or I/O fails, or the writer lock
    /// was poisoned by a panicking thread.
    pub fn record(
        &self,
        ordinal: usize,
        title: &str,
        direction: CaptureDirection,
        bytes: &[u8],
    ) -> Result<(), ScaffoldError> {
        let entry = CaptureEntry {
            timestamp: chrono::Utc::now().to_rfc3339(),
            ordinal,
            title,
            direction,
            len: bytes.len(),
            data: STANDARD.encode(bytes),
        };
        let line = serde_json::to_string(&entry)?;

        let mut writer = self
            .writer
            .lock()
            .map_err(|_| ScaffoldError::Io(std::io::Error::other("capture writer lock poisoned")))?;
        writeln!(writer, "{line}")?;
        writer.flush()?;
        drop(writer);
        Ok(())
    }

    /// Path of the capture file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_writes_base64_lines() {
        let dir = tempfile::tempdir().unwrap();
        let writer = CaptureWriter::new(dir.path()).unwrap();
        writer
            .record(1, "TEST 1: hello", CaptureDirection::Request, b"GET / HTTP/1.1\r\n\r\n")
            .unwrap();
        writer
            .record(1, "TEST 1: hello", CaptureDirection::Response, &[0xff, 0x00])
            .unwrap();

        let content = fs::read_to_string(writer.path()).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["direction"], "request");
        assert_eq!(lines[0]["ordinal"], 1);
        assert_eq!(
            STANDARD.decode(lines[0]["data"].as_str().unwrap()).unwrap(),
            b"GET / HTTP/1.1\r\n\r\n"
        );
        assert_eq!(lines[1]["direction"], "response");
        assert_eq!(lines[1]["len"], 2);
    }

    #[test]
    fn test_capture_file_name() {
        let dir = tempfile::tempdir().unwrap();
        let writer = CaptureWriter::new(dir.path()).unwrap();
        let name = writer.path().file_name().unwrap().to_string_lossy();
        assert!(name.starts_with("run-"));
        assert!(name.ends_with(".jsonl"));
    }

    #[test]
    fn test_empty_capture_dir_rejected() {
        assert!(CaptureWriter::new(Path::new("")).is_err());
    }
}
