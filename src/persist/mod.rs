//! Persisted, append-only log channel.
//!
//! A log directory holds fixed-size memory-mapped segments plus small metadata
//! files:
//!
//! ```text
//! <dir>/
//!   000000000.q          segment 0 (64-byte segment header, then records)
//!   000000001.q          segment 1, created when segment 0 is full
//!   index.meta           writer tail (segment, offset), refreshed on roll/close
//!   writer.lock          flock held by the appending instance
//!   readers/<name>.meta  durable cursor positions
//! ```
//!
//! Each [`LogChannel`] owns one cursor. `send` appends and msyncs before it
//! returns; `receive` never blocks and yields `None` when the cursor has
//! caught up with the writer.
//!
//! ```no_run
//! use datachannel::{Channel, LogChannel};
//!
//! let channel = LogChannel::open_named("./data/binance_spot", "normalizer")?;
//! channel.send(b"{\"e\":\"trade\"}")?;
//! loop {
//!     match channel.receive()? {
//!         Some(msg) => { /* normalize */ let _ = msg; }
//!         None => std::thread::sleep(std::time::Duration::from_millis(5)),
//!     }
//! }
//! # Ok::<(), datachannel::Error>(())
//! ```

pub mod header;
pub mod mmap;
pub mod reader;
pub mod segment;
pub mod writer;
mod writer_lock;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use log::debug;

use crate::channel::{Channel, Message};
use crate::{Error, Result};

pub use reader::{LogCursor, LogRecord};
pub use segment::{CursorPosition, DEFAULT_SEGMENT_SIZE, MIN_SEGMENT_SIZE};
pub use writer::LogWriter;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogConfig {
    /// Size of each segment file. Default: 16 MiB.
    pub segment_size: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            segment_size: DEFAULT_SEGMENT_SIZE,
        }
    }
}

pub struct LogChannel {
    path: PathBuf,
    config: LogConfig,
    // Opened on first send so read-only instances never take the writer lock.
    writer: Mutex<Option<LogWriter>>,
    cursor: Mutex<LogCursor>,
    closed: AtomicBool,
}

impl LogChannel {
    /// Opens with an anonymous cursor positioned at the current tail.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_config(path, None, LogConfig::default())
    }

    /// Opens with a durable cursor that resumes where `cursor` last stopped.
    pub fn open_named(path: impl AsRef<Path>, cursor: &str) -> Result<Self> {
        Self::open_with_config(path, Some(cursor), LogConfig::default())
    }

    pub fn open_with_config(
        path: impl AsRef<Path>,
        cursor: Option<&str>,
        config: LogConfig,
    ) -> Result<Self> {
        segment::validate_segment_size(config.segment_size)?;
        let path = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&path)?;
        let cursor = match cursor {
            Some(name) => LogCursor::named(&path, name)?,
            None => LogCursor::anonymous(&path)?,
        };
        debug!(
            "log {}: opened cursor {:?} at {:?}",
            path.display(),
            cursor.name(),
            cursor.position()
        );
        Ok(Self {
            path,
            config,
            writer: Mutex::new(None),
            cursor: Mutex::new(cursor),
            closed: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn cursor_name(&self) -> Result<Option<String>> {
        let cursor = self
            .cursor
            .lock()
            .map_err(|_| Error::Corrupt("cursor lock poisoned"))?;
        Ok(cursor.name().map(str::to_string))
    }

    /// Like `receive`, but keeps the record's sequence number and timestamp.
    pub fn receive_record(&self) -> Result<Option<LogRecord>> {
        if self.is_closed() {
            return Err(Error::ChannelClosed);
        }
        let mut cursor = self
            .cursor
            .lock()
            .map_err(|_| Error::Corrupt("cursor lock poisoned"))?;
        cursor.next()
    }
}

impl Channel for LogChannel {
    fn send(&self, message: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ChannelClosed);
        }
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| Error::Corrupt("writer lock poisoned"))?;
        // Re-check under the lock so a concurrent close cannot race a fresh writer open.
        if self.is_closed() {
            return Err(Error::ChannelClosed);
        }
        if writer.is_none() {
            *writer = Some(LogWriter::open(&self.path, self.config.segment_size)?);
        }
        match writer.as_mut() {
            Some(writer) => writer.append(message).map(|_| ()),
            None => Err(Error::ChannelClosed),
        }
    }

    fn receive(&self) -> Result<Option<Message>> {
        Ok(self.receive_record()?.map(|record| record.payload))
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| Error::Corrupt("writer lock poisoned"))?;
        let flushed = match writer.take() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        };
        drop(writer);
        self.cursor
            .lock()
            .map_err(|_| Error::Corrupt("cursor lock poisoned"))?
            .release();
        debug!("log {}: closed", self.path.display());
        flushed
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for LogChannel {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
