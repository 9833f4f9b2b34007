//! Log tail tracking.
//!
//! A [`LogCursor`] remembers how far each tracked file has been read in
//! the current server generation. Offsets only move forward until a new
//! generation begins, so a line read once is never matched again.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use indexmap::IndexMap;

/// Read position per tracked file, scoped to one server generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogCursor {
    generation: u64,
    offsets: IndexMap<PathBuf, u64>,
}

impl LogCursor {
    /// A cursor at offset zero of every file in `files`.
    #[must_use]
    pub fn new(generation: u64, files: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            generation,
            offsets: files.into_iter().map(|path| (path, 0)).collect(),
        }
    }

    /// Generation the offsets belong to.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Current offset of `path`, if tracked.
    #[must_use]
    pub fn offset(&self, path: &Path) -> Option<u64> {
        self.offsets.get(path).copied()
    }

    /// Starts `generation` reading every file from the beginning.
    ///
    /// Used after the files were truncated for a fresh start.
    pub fn reset(&mut self, generation: u64) {
        self.generation = generation;
        for offset in self.offsets.values_mut() {
            *offset = 0;
        }
    }

    /// Starts `generation` at the files' current lengths.
    ///
    /// Used for a reload, where the files keep the previous generation's
    /// output.
    pub fn rebaseline(&mut self, generation: u64) {
        self.generation = generation;
        self.skip_to_end();
    }

    /// Moves every offset to the current end of its file without reading.
    ///
    /// Offsets never move backwards, even if a file shrank.
    pub fn skip_to_end(&mut self) {
        for (path, offset) in &mut self.offsets {
            let len = std::fs::metadata(path).map_or(0, |m| m.len());
            *offset = (*offset).max(len);
        }
    }

    /// Reads everything appended since the last read and advances.
    ///
    /// A missing file reads as empty. A file shorter than its offset reads
    /// as empty and keeps its offset.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if an existing file cannot be read.
    pub fn read_new(&mut self) -> io::Result<LogSnapshot> {
        let mut files = Vec::with_capacity(self.offsets.len());
        for (path, offset) in &mut self.offsets {
            let bytes = read_from(path, *offset)?;
            *offset += bytes.len() as u64;
            files.push((path.clone(), String::from_utf8_lossy(&bytes).into_owned()));
        }
        Ok(LogSnapshot {
            generation: self.generation,
            files,
        })
    }
}

fn read_from(path: &Path, offset: u64) -> io::Result<Vec<u8>> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    if file.metadata()?.len() <= offset {
        return Ok(Vec::new());
    }
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    Ok(buf)
}

/// The log output of one block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogSnapshot {
    /// Generation the text was read from.
    pub generation: u64,
    /// New text per tracked file, in tracking order.
    pub files: Vec<(PathBuf, String)>,
}

impl LogSnapshot {
    /// All files' new text in tracking order, one file per line run.
    ///
    /// A file whose text lacks a final newline gets one, so its last line
    /// never merges with the next file's first line.
    #[must_use]
    pub fn text(&self) -> String {
        let mut out = String::new();
        for (_, text) in &self.files {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(text);
        }
        out
    }

    /// New text of the file whose name is `file_name`.
    #[must_use]
    pub fn file(&self, file_name: &str) -> Option<&str> {
        self.files
            .iter()
            .find(|(path, _)| path.file_name().is_some_and(|n| n == file_name))
            .map(|(_, text)| text.as_str())
    }

    /// Appends another snapshot's text, file by file.
    pub fn extend(&mut self, other: Self) {
        for (path, text) in other.files {
            match self.files.iter_mut().find(|(p, _)| *p == path) {
                Some((_, existing)) => existing.push_str(&text),
                None => self.files.push((path, text)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn append(path: &Path, text: &str) {
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        f.write_all(text.as_bytes()).unwrap();
    }

    #[test]
    fn test_lines_are_read_once() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("error.log");
        let mut cursor = LogCursor::new(1, [log.clone()]);

        append(&log, "block one\n");
        let first = cursor.read_new().unwrap();
        assert_eq!(first.text(), "block one\n");

        append(&log, "block two\n");
        let second = cursor.read_new().unwrap();
        assert_eq!(second.text(), "block two\n");
        assert!(!second.text().contains("block one"));
    }

    #[test]
    fn test_missing_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut cursor = LogCursor::new(1, [dir.path().join("absent.log")]);
        assert_eq!(cursor.read_new().unwrap().text(), "");
    }

    #[test]
    fn test_rebaseline_skips_old_output() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("error.log");
        append(&log, "old generation\n");
        let mut cursor = LogCursor::new(1, [log.clone()]);
        cursor.rebaseline(2);
        append(&log, "new generation\n");

        let snap = cursor.read_new().unwrap();
        assert_eq!(snap.generation, 2);
        assert_eq!(snap.text(), "new generation\n");
    }

    #[test]
    fn test_offsets_never_move_backwards() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("error.log");
        append(&log, "0123456789\n");
        let mut cursor = LogCursor::new(1, [log.clone()]);
        cursor.read_new().unwrap();
        let before = cursor.offset(&log).unwrap();

        std::fs::write(&log, "x\n").unwrap();
        cursor.skip_to_end();
        assert_eq!(cursor.offset(&log).unwrap(), before);
        assert_eq!(cursor.read_new().unwrap().text(), "");
    }

    #[test]
    fn test_reset_reads_from_start() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("error.log");
        append(&log, "a\n");
        let mut cursor = LogCursor::new(1, [log.clone()]);
        cursor.read_new().unwrap();
        std::fs::write(&log, "fresh\n").unwrap();
        cursor.reset(2);
        assert_eq!(cursor.read_new().unwrap().text(), "fresh\n");
    }

    #[test]
    fn test_snapshot_file_lookup_and_extend() {
        let mut snap = LogSnapshot {
            generation: 1,
            files: vec![
                (PathBuf::from("/s/logs/error.log"), "e\n".to_string()),
                (PathBuf::from("/s/logs/stderr.log"), "s\n".to_string()),
            ],
        };
        snap.extend(LogSnapshot {
            generation: 1,
            files: vec![(PathBuf::from("/s/logs/stderr.log"), "t\n".to_string())],
        });
        assert_eq!(snap.file("stderr.log"), Some("s\nt\n"));
        assert_eq!(snap.text(), "e\ns\nt\n");
    }

    #[test]
    fn test_unterminated_file_does_not_merge_with_next() {
        let snap = LogSnapshot {
            generation: 1,
            files: vec![
                (PathBuf::from("/s/logs/error.log"), "[error] partial".to_string()),
                (PathBuf::from("/s/logs/stderr.log"), "==1== ERROR SUMMARY\n".to_string()),
            ],
        };
        assert_eq!(snap.text(), "[error] partial\n==1== ERROR SUMMARY\n");
        assert!(snap.text().lines().all(|l| !l.contains("partial==")));
    }
}
