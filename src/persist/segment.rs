use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::persist::header::{RecordHeader, HEADER_SIZE};
use crate::persist::mmap::MmapFile;
use crate::{Error, Result};

pub const DEFAULT_SEGMENT_SIZE: usize = 16 * 1024 * 1024;
pub const MIN_SEGMENT_SIZE: usize = 4 * 1024;
pub const SEG_HEADER_SIZE: usize = 64;
pub const SEG_DATA_OFFSET: usize = SEG_HEADER_SIZE;
pub const SEG_MAGIC: u32 = 0x4443_4c47; // 'DCLG'
pub const SEG_VERSION: u32 = 1;

pub const INDEX_FILE: &str = "index.meta";
pub const READERS_DIR: &str = "readers";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentIndex {
    pub current_segment: u64,
    pub write_offset: u64,
}

/// Where a cursor will read next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorPosition {
    pub segment_id: u64,
    pub offset: u64,
}

impl SegmentIndex {
    pub fn new(current_segment: u64, write_offset: u64) -> Self {
        Self {
            current_segment,
            write_offset,
        }
    }
}

impl CursorPosition {
    pub fn new(segment_id: u64, offset: u64) -> Self {
        Self { segment_id, offset }
    }

    pub fn start_of(segment_id: u64) -> Self {
        Self::new(segment_id, SEG_DATA_OFFSET as u64)
    }
}

pub fn segment_filename(id: u64) -> String {
    format!("{:09}.q", id)
}

pub fn segment_path(root: &Path, id: u64) -> PathBuf {
    root.join(segment_filename(id))
}

pub fn validate_segment_size(segment_size: usize) -> Result<usize> {
    if segment_size < MIN_SEGMENT_SIZE {
        return Err(Error::Configuration(format!(
            "segment size {segment_size} is below the minimum of {MIN_SEGMENT_SIZE} bytes"
        )));
    }
    if segment_size > u32::MAX as usize {
        return Err(Error::Configuration(format!(
            "segment size {segment_size} exceeds u32 range"
        )));
    }
    Ok(segment_size)
}

pub fn open_segment(root: &Path, id: u64) -> Result<MmapFile> {
    let mmap = MmapFile::open(&segment_path(root, id))?;
    if mmap.len() < SEG_DATA_OFFSET + HEADER_SIZE {
        return Err(Error::Corrupt("segment smaller than its header"));
    }
    let header = mmap.range(0, 16)?;
    let magic = u32::from_le_bytes(header[0..4].try_into().expect("slice length"));
    let version = u32::from_le_bytes(header[4..8].try_into().expect("slice length"));
    let stored_id = u64::from_le_bytes(header[8..16].try_into().expect("slice length"));
    if magic != SEG_MAGIC {
        return Err(Error::Corrupt("segment magic mismatch"));
    }
    if version != SEG_VERSION {
        return Err(Error::Corrupt("unsupported segment version"));
    }
    if stored_id != id {
        return Err(Error::Corrupt("segment id mismatch"));
    }
    Ok(mmap)
}

/// Sequence number of the first record a segment holds, from its header.
pub fn segment_base_seq(mmap: &MmapFile) -> Result<u64> {
    let header = mmap.range(16, 8)?;
    Ok(u64::from_le_bytes(header.try_into().expect("slice length")))
}

/// Creates a zeroed segment under a temporary name and renames it into place,
/// so readers never observe a segment without its header.
pub fn create_segment(root: &Path, id: u64, segment_size: usize, base_seq: u64) -> Result<MmapFile> {
    let final_path = segment_path(root, id);
    let tmp_path = final_path.with_extension("q.tmp");
    let mut mmap = MmapFile::create(&tmp_path, segment_size)?;
    let header = mmap.range_mut(0, 24)?;
    header[0..4].copy_from_slice(&SEG_MAGIC.to_le_bytes());
    header[4..8].copy_from_slice(&SEG_VERSION.to_le_bytes());
    header[8..16].copy_from_slice(&id.to_le_bytes());
    header[16..24].copy_from_slice(&base_seq.to_le_bytes());
    mmap.flush_range(0, SEG_HEADER_SIZE)?;
    std::fs::rename(&tmp_path, &final_path)?;
    Ok(mmap)
}

pub fn open_or_create_segment(
    root: &Path,
    id: u64,
    segment_size: usize,
    base_seq: u64,
) -> Result<MmapFile> {
    if segment_path(root, id).exists() {
        open_segment(root, id)
    } else {
        create_segment(root, id, segment_size, base_seq)
    }
}

/// Lowest segment id present in `root`, if any.
pub fn first_segment(root: &Path) -> Result<Option<u64>> {
    if !root.exists() {
        return Ok(None);
    }
    let mut first: Option<u64> = None;
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(id) = name.to_str().and_then(parse_segment_id) else {
            continue;
        };
        first = Some(first.map_or(id, |current| current.min(id)));
    }
    Ok(first)
}

fn parse_segment_id(name: &str) -> Option<u64> {
    let stem = name.strip_suffix(".q")?;
    if stem.is_empty() {
        return None;
    }
    stem.parse::<u64>().ok()
}

pub fn load_index(path: &Path) -> Result<SegmentIndex> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(SegmentIndex::new(0, SEG_DATA_OFFSET as u64))
        }
        Err(err) => return Err(err.into()),
    };
    let mut buf = [0u8; 16];
    file.read_exact(&mut buf)?;
    let current_segment = u64::from_le_bytes(buf[0..8].try_into().expect("slice length"));
    let write_offset = u64::from_le_bytes(buf[8..16].try_into().expect("slice length"));
    Ok(SegmentIndex::new(current_segment, write_offset))
}

pub fn store_index(path: &Path, index: &SegmentIndex) -> Result<()> {
    let mut buf = [0u8; 16];
    buf[0..8].copy_from_slice(&index.current_segment.to_le_bytes());
    buf[8..16].copy_from_slice(&index.write_offset.to_le_bytes());
    write_atomically(path, &buf)
}

pub fn cursor_meta_path(root: &Path, name: &str) -> PathBuf {
    root.join(READERS_DIR).join(format!("{name}.meta"))
}

pub fn validate_cursor_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::Configuration("cursor name cannot be empty".to_string()));
    }
    let valid = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.');
    if !valid || name.starts_with('.') {
        return Err(Error::Configuration(format!(
            "cursor name {name:?} must be [A-Za-z0-9_.-] and not start with '.'"
        )));
    }
    Ok(())
}

/// `Ok(None)` when the cursor has never been persisted.
pub fn load_cursor_position(path: &Path) -> Result<Option<CursorPosition>> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    if file.metadata()?.len() != 16 {
        return Err(Error::Corrupt("cursor metadata has unexpected size"));
    }
    let mut buf = [0u8; 16];
    file.read_exact(&mut buf)?;
    let segment_id = u64::from_le_bytes(buf[0..8].try_into().expect("slice length"));
    let offset = u64::from_le_bytes(buf[8..16].try_into().expect("slice length"));
    Ok(Some(CursorPosition::new(segment_id, offset)))
}

pub fn store_cursor_position(path: &Path, position: &CursorPosition) -> Result<()> {
    let mut buf = [0u8; 16];
    buf[0..8].copy_from_slice(&position.segment_id.to_le_bytes());
    buf[8..16].copy_from_slice(&position.offset.to_le_bytes());
    write_atomically(path, &buf)
}

fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp_path = path.with_extension("meta.tmp");
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp_path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    std::fs::rename(tmp_path, path)?;
    Ok(())
}

/// End of the committed data, found by walking the records of the segment
/// named in `index.meta` and any segments rolled to after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TailScan {
    pub position: CursorPosition,
    pub next_seq: u64,
    /// An uncommitted header was found at `position` (torn write).
    pub partial: bool,
}

pub fn scan_tail(root: &Path) -> Result<TailScan> {
    let index = load_index(&root.join(INDEX_FILE))?;
    let mut segment_id = index.current_segment;
    let mut offset = SEG_DATA_OFFSET;
    let mut next_seq = 0;

    loop {
        if !segment_path(root, segment_id).exists() {
            return Ok(TailScan {
                position: CursorPosition::start_of(segment_id),
                next_seq,
                partial: false,
            });
        }
        let mmap = open_segment(root, segment_id)?;
        next_seq = segment_base_seq(&mmap)?;
        let mut rolled = false;
        loop {
            if offset + HEADER_SIZE > mmap.len() {
                if segment_path(root, segment_id + 1).exists() {
                    rolled = true;
                }
                break;
            }
            let header = RecordHeader::from_bytes(mmap.range(offset, HEADER_SIZE)?)?;
            if header.is_roll() {
                rolled = true;
                break;
            }
            if !header.is_committed() {
                let partial = mmap.range(offset, HEADER_SIZE)?.iter().any(|&b| b != 0);
                return Ok(TailScan {
                    position: CursorPosition::new(segment_id, offset as u64),
                    next_seq,
                    partial,
                });
            }
            let record_len = header.record_len();
            if offset + record_len > mmap.len() {
                return Ok(TailScan {
                    position: CursorPosition::new(segment_id, offset as u64),
                    next_seq,
                    partial: true,
                });
            }
            next_seq = header.seq + 1;
            offset += record_len;
        }
        if !rolled {
            return Ok(TailScan {
                position: CursorPosition::new(segment_id, offset as u64),
                next_seq,
                partial: false,
            });
        }
        segment_id += 1;
        offset = SEG_DATA_OFFSET;
    }
}
