// SPDX-License-Identifier: Apache-2.0

use std::fs::File;
use std::io::{self, ErrorKind, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{FileId, LogLine};

/// Where a freshly opened handle begins reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekTo {
    /// Offset 0; used for files that appear after registration (their
    /// whole content is new) and for one-shot mode.
    Start,
    /// Current end of file; used when attaching to an already-live log.
    End,
}

/// One open log file.
///
/// Keeps the file handle, the identity of the inode it was opened on, the
/// read offset, and the bytes of a line whose terminating newline has not
/// arrived yet. There is no maximum line length: the partial buffer grows
/// with the line and an unterminated line is never emitted.
pub struct LogHandle {
    path: Arc<PathBuf>,
    file: File,
    file_id: FileId,
    offset: u64,
    partial: Vec<u8>,
}

impl LogHandle {
    pub fn open(path: &Path, seek_to: SeekTo) -> io::Result<Self> {
        let file = File::open(path)?;
        let file_id = FileId::from_file(&file)?;
        let offset = match seek_to {
            SeekTo::Start => 0,
            SeekTo::End => file.metadata()?.len(),
        };

        Ok(Self {
            path: Arc::new(path.to_path_buf()),
            file,
            file_id,
            offset,
            partial: Vec::new(),
        })
    }

    pub fn path(&self) -> &Arc<PathBuf> {
        &self.path
    }

    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Read from the last offset to EOF, emitting every newline-terminated
    /// line through `emit`. Trailing bytes without a newline stay buffered
    /// for the next read. Returns the number of lines emitted.
    ///
    /// A file size below the current offset means the file was truncated:
    /// the offset resets to 0 and the partial buffer is discarded, since
    /// truncation cut whatever line was in flight.
    pub fn read_lines(&mut self, emit: &mut dyn FnMut(LogLine)) -> io::Result<u64> {
        let size = self.file.metadata()?.len();
        if size < self.offset {
            tracing::info!(path = %self.path.display(), "file truncated, re-reading from start");
            self.offset = 0;
            self.partial.clear();
        }

        self.file.seek(SeekFrom::Start(self.offset))?;

        let mut emitted = 0;
        let mut buf = [0u8; 8192];
        loop {
            match self.file.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    self.offset += n as u64;
                    self.partial.extend_from_slice(&buf[..n]);
                    emitted += self.drain_complete_lines(emit);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(emitted)
    }

    fn drain_complete_lines(&mut self, emit: &mut dyn FnMut(LogLine)) -> u64 {
        let mut emitted = 0;
        let mut start = 0;

        while let Some(pos) = self.partial[start..].iter().position(|&b| b == b'\n') {
            let end = start + pos;
            let mut segment = &self.partial[start..end];
            if segment.last() == Some(&b'\r') {
                segment = &segment[..segment.len() - 1];
            }

            emit(LogLine::new(
                self.path.clone(),
                String::from_utf8_lossy(segment).into_owned(),
            ));
            emitted += 1;
            start = end + 1;
        }

        if start > 0 {
            self.partial.drain(..start);
        }

        emitted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use std::io::Write;
    use tempfile::TempDir;

    fn collect_lines(handle: &mut LogHandle) -> Vec<String> {
        let mut lines = Vec::new();
        handle
            .read_lines(&mut |line| lines.push(line.text))
            .unwrap();
        lines
    }

    fn append(path: &Path, bytes: &[u8]) {
        let mut f = OpenOptions::new().append(true).open(path).unwrap();
        f.write_all(bytes).unwrap();
        f.flush().unwrap();
    }

    #[test]
    fn reads_complete_lines_in_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log");
        std::fs::write(&path, "a\nb\nc\nd\n").unwrap();

        let mut handle = LogHandle::open(&path, SeekTo::Start).unwrap();
        assert_eq!(vec!["a", "b", "c", "d"], collect_lines(&mut handle));
    }

    #[test]
    fn partial_line_is_held_until_newline() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log");
        std::fs::write(&path, "").unwrap();

        let mut handle = LogHandle::open(&path, SeekTo::Start).unwrap();

        append(&path, b"a");
        assert!(collect_lines(&mut handle).is_empty());

        append(&path, b"b");
        assert!(collect_lines(&mut handle).is_empty());

        append(&path, b"\n");
        assert_eq!(vec!["ab"], collect_lines(&mut handle));
    }

    #[test]
    fn seek_to_end_skips_existing_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log");
        std::fs::write(&path, "old 1\nold 2\n").unwrap();

        let mut handle = LogHandle::open(&path, SeekTo::End).unwrap();
        assert!(collect_lines(&mut handle).is_empty());

        append(&path, b"new\n");
        assert_eq!(vec!["new"], collect_lines(&mut handle));
    }

    #[test]
    fn truncation_resets_offset_and_discards_partial() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log");
        std::fs::write(&path, "a\nb\nc\npart").unwrap();

        let mut handle = LogHandle::open(&path, SeekTo::Start).unwrap();
        assert_eq!(vec!["a", "b", "c"], collect_lines(&mut handle));

        // truncate, cutting the in-flight "part"
        let f = OpenOptions::new().write(true).open(&path).unwrap();
        f.set_len(0).unwrap();
        drop(f);
        append(&path, b"d\ne\n");

        assert_eq!(vec!["d", "e"], collect_lines(&mut handle));
        assert_eq!(4, handle.offset());
    }

    #[test]
    fn crlf_line_endings_are_trimmed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log");
        std::fs::write(&path, "one\r\ntwo\r\n").unwrap();

        let mut handle = LogHandle::open(&path, SeekTo::Start).unwrap();
        assert_eq!(vec!["one", "two"], collect_lines(&mut handle));
    }

    #[test]
    fn empty_lines_are_emitted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log");
        std::fs::write(&path, "a\n\nb\n").unwrap();

        let mut handle = LogHandle::open(&path, SeekTo::Start).unwrap();
        assert_eq!(vec!["a", "", "b"], collect_lines(&mut handle));
    }

    #[test]
    fn line_paths_point_at_the_source_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log");
        std::fs::write(&path, "x\n").unwrap();

        let mut handle = LogHandle::open(&path, SeekTo::Start).unwrap();
        let mut lines = Vec::new();
        handle.read_lines(&mut |line| lines.push(line)).unwrap();

        assert_eq!(path, *lines[0].path.as_ref());
    }
}
