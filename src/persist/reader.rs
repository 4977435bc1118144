use std::path::{Path, PathBuf};
use std::sync::atomic::{fence, Ordering};

use crate::persist::header::{RecordHeader, HEADER_SIZE};
use crate::persist::mmap::MmapFile;
use crate::persist::segment::{
    cursor_meta_path, first_segment, load_cursor_position, open_segment, scan_tail, segment_path,
    store_cursor_position, validate_cursor_name, CursorPosition, READERS_DIR,
};
use crate::{Error, Result};

/// One record as seen by a cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub seq: u64,
    pub timestamp_ns: u64,
    pub payload: Vec<u8>,
}

/// A read position into a log directory ("tailer").
///
/// Named cursors persist their position after every record so a later cursor
/// with the same name resumes right after the last record handed out.
/// Anonymous cursors start at the tail and live only in memory.
pub struct LogCursor {
    path: PathBuf,
    name: Option<String>,
    meta_path: Option<PathBuf>,
    position: CursorPosition,
    mmap: Option<MmapFile>,
}

impl LogCursor {
    pub fn named(path: impl AsRef<Path>, name: &str) -> Result<Self> {
        validate_cursor_name(name)?;
        let path = path.as_ref().to_path_buf();
        std::fs::create_dir_all(path.join(READERS_DIR))?;
        let meta_path = cursor_meta_path(&path, name);
        let position = match load_cursor_position(&meta_path)? {
            Some(position) => position,
            None => CursorPosition::start_of(first_segment(&path)?.unwrap_or(0)),
        };
        Ok(Self {
            path,
            name: Some(name.to_string()),
            meta_path: Some(meta_path),
            position,
            mmap: None,
        })
    }

    pub fn anonymous(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let position = scan_tail(&path)?.position;
        Ok(Self {
            path,
            name: None,
            meta_path: None,
            position,
            mmap: None,
        })
    }

    /// Anonymous cursor positioned at the oldest segment still on disk.
    pub fn from_start(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let position = CursorPosition::start_of(first_segment(&path)?.unwrap_or(0));
        Ok(Self {
            path,
            name: None,
            meta_path: None,
            position,
            mmap: None,
        })
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn position(&self) -> CursorPosition {
        self.position
    }

    /// Next committed record, or `None` if the writer has not produced one yet.
    pub fn next(&mut self) -> Result<Option<LogRecord>> {
        loop {
            if self.mmap.is_none() {
                if !segment_path(&self.path, self.position.segment_id).exists() {
                    return Ok(None);
                }
                self.mmap = Some(open_segment(&self.path, self.position.segment_id)?);
            }
            let Some(mmap) = self.mmap.as_ref() else {
                return Ok(None);
            };

            let offset = self.position.offset as usize;
            if offset + HEADER_SIZE > mmap.len() {
                if self.advance_segment() {
                    continue;
                }
                return Ok(None);
            }

            let header = RecordHeader::from_bytes(mmap.range(offset, HEADER_SIZE)?)?;
            if header.is_roll() {
                if self.advance_segment() {
                    continue;
                }
                return Ok(None);
            }
            if !header.is_committed() {
                return Ok(None);
            }
            fence(Ordering::Acquire);

            let payload_len = header.length as usize;
            let record_len = header.record_len();
            if offset + record_len > mmap.len() {
                return Err(Error::Corrupt("record extends past segment end"));
            }
            let payload = mmap.range(offset + HEADER_SIZE, payload_len)?.to_vec();
            header.validate_crc(&payload)?;

            self.position.offset += record_len as u64;
            self.commit()?;
            return Ok(Some(LogRecord {
                seq: header.seq,
                timestamp_ns: header.timestamp_ns,
                payload,
            }));
        }
    }

    /// Persists the current position for named cursors; no-op otherwise.
    pub fn commit(&self) -> Result<()> {
        match &self.meta_path {
            Some(meta_path) => store_cursor_position(meta_path, &self.position),
            None => Ok(()),
        }
    }

    /// Unmaps the current segment; the next `next()` maps it again.
    pub fn release(&mut self) {
        self.mmap = None;
    }

    pub(crate) fn is_mapped(&self) -> bool {
        self.mmap.is_some()
    }

    fn advance_segment(&mut self) -> bool {
        let next = self.position.segment_id + 1;
        if !segment_path(&self.path, next).exists() {
            return false;
        }
        self.position = CursorPosition::start_of(next);
        self.mmap = None;
        true
    }
}
