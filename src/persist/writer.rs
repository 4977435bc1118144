use std::path::{Path, PathBuf};
use std::sync::atomic::{fence, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, warn};

use crate::persist::header::{record_len, RecordHeader, FLAGS_OFFSET, FLAG_COMMITTED, HEADER_SIZE};
use crate::persist::mmap::MmapFile;
use crate::persist::segment::{
    create_segment, open_or_create_segment, scan_tail, store_index, SegmentIndex, INDEX_FILE,
    SEG_DATA_OFFSET,
};
use crate::persist::writer_lock::WriterLock;
use crate::{Error, Result};

/// Single appender for a log directory.
pub struct LogWriter {
    path: PathBuf,
    mmap: MmapFile,
    segment_id: u64,
    write_offset: usize,
    seq: u64,
    segment_size: usize,
    clock: RecordClock,
    _lock: WriterLock,
}

impl LogWriter {
    pub fn open(path: impl AsRef<Path>, segment_size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&path)?;
        let lock = WriterLock::acquire(&path)?;

        let tail = scan_tail(&path)?;
        let segment_id = tail.position.segment_id;
        let mut mmap = open_or_create_segment(&path, segment_id, segment_size, tail.next_seq)?;
        let write_offset = tail.position.offset as usize;
        if tail.partial {
            warn!(
                "log {}: discarding torn record at segment {} offset {}",
                path.display(),
                segment_id,
                write_offset
            );
            repair_tail(&mut mmap, write_offset)?;
        }
        store_index(
            &path.join(INDEX_FILE),
            &SegmentIndex::new(segment_id, write_offset as u64),
        )?;
        debug!(
            "log {}: writer open at segment {} offset {} seq {}",
            path.display(),
            segment_id,
            write_offset,
            tail.next_seq
        );

        Ok(Self {
            path,
            mmap,
            segment_id,
            write_offset,
            seq: tail.next_seq,
            segment_size,
            clock: RecordClock::new(),
            _lock: lock,
        })
    }

    /// Appends one record and msyncs it before returning.
    pub fn append(&mut self, payload: &[u8]) -> Result<u64> {
        let len = record_len(payload.len());
        if len > self.segment_size - SEG_DATA_OFFSET || payload.len() > u32::MAX as usize {
            return Err(Error::PayloadTooLarge);
        }
        if self.write_offset + len > self.mmap.len() {
            self.roll()?;
        }

        let offset = self.write_offset;
        let seq = self.seq;
        let header = RecordHeader::new(
            payload.len() as u32,
            seq,
            self.clock.now_ns(),
            RecordHeader::crc32(payload),
        );
        self.mmap
            .range_mut(offset, HEADER_SIZE)?
            .copy_from_slice(&header.to_bytes());
        self.mmap
            .range_mut(offset + HEADER_SIZE, payload.len())?
            .copy_from_slice(payload);

        fence(Ordering::Release);
        self.mmap.range_mut(offset + FLAGS_OFFSET, 1)?[0] = FLAG_COMMITTED;
        self.mmap.flush_range(offset, len)?;

        self.write_offset += len;
        self.seq += 1;
        Ok(seq)
    }

    fn roll(&mut self) -> Result<()> {
        if self.write_offset + HEADER_SIZE <= self.mmap.len() {
            let marker = RecordHeader::roll_marker().to_bytes();
            self.mmap
                .range_mut(self.write_offset, HEADER_SIZE)?
                .copy_from_slice(&marker);
            self.mmap.flush_range(self.write_offset, HEADER_SIZE)?;
        }
        let next = self.segment_id + 1;
        let mmap = create_segment(&self.path, next, self.segment_size, self.seq)?;
        store_index(
            &self.path.join(INDEX_FILE),
            &SegmentIndex::new(next, SEG_DATA_OFFSET as u64),
        )?;
        debug!("log {}: rolled to segment {}", self.path.display(), next);
        self.mmap = mmap;
        self.segment_id = next;
        self.write_offset = SEG_DATA_OFFSET;
        Ok(())
    }

    /// Syncs the mapping and records the tail in `index.meta`.
    pub fn flush(&self) -> Result<()> {
        self.mmap.flush_sync()?;
        store_index(
            &self.path.join(INDEX_FILE),
            &SegmentIndex::new(self.segment_id, self.write_offset as u64),
        )
    }
}

fn repair_tail(mmap: &mut MmapFile, offset: usize) -> Result<()> {
    let header = RecordHeader::from_bytes(mmap.range(offset, HEADER_SIZE)?)?;
    let claimed = HEADER_SIZE.saturating_add(header.length as usize);
    let end = offset.saturating_add(claimed).min(mmap.len());
    mmap.range_mut(offset, end - offset)?.fill(0);
    mmap.flush_range(offset, end - offset)?;
    Ok(())
}

/// Wall-clock nanoseconds, anchored once and advanced by the TSC so record
/// timestamps never step backwards within one writer.
struct RecordClock {
    clock: quanta::Clock,
    start: quanta::Instant,
    start_wall_ns: u64,
}

impl RecordClock {
    fn new() -> Self {
        let clock = quanta::Clock::new();
        let start = clock.now();
        let start_wall_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        Self {
            clock,
            start,
            start_wall_ns,
        }
    }

    fn now_ns(&self) -> u64 {
        let elapsed = self.clock.now().duration_since(self.start);
        self.start_wall_ns + elapsed.as_nanos() as u64
    }
}
