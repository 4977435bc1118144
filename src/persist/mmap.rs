use std::fs::{File, OpenOptions};
use std::ops::Range;
use std::path::Path;

use memmap2::{MmapMut, MmapOptions};

use crate::{Error, Result};

/// Shared read-write mapping of one segment file.
///
/// The file handle is closed as soon as the mapping exists; dropping the
/// `MmapFile` unmaps the segment and releases everything it held.
pub struct MmapFile {
    map: MmapMut,
}

impl MmapFile {
    /// Creates (or truncates) `path` to `len` zero bytes and maps it.
    pub fn create(path: &Path, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::Configuration("segment length must be non-zero".to_string()));
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        file.set_len(len as u64)?;
        map_whole(&file, len)
    }

    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len() as usize;
        if len == 0 {
            return Err(Error::Corrupt("segment file is empty"));
        }
        map_whole(&file, len)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn range(&self, offset: usize, len: usize) -> Result<&[u8]> {
        let bounds = self.bounds(offset, len)?;
        Ok(&self.map[bounds])
    }

    pub fn range_mut(&mut self, offset: usize, len: usize) -> Result<&mut [u8]> {
        let bounds = self.bounds(offset, len)?;
        Ok(&mut self.map[bounds])
    }

    /// msync(MS_SYNC) of one byte range; blocks until it reaches the disk.
    pub fn flush_range(&self, offset: usize, len: usize) -> Result<()> {
        self.bounds(offset, len)?;
        self.map.flush_range(offset, len)?;
        Ok(())
    }

    pub fn flush_sync(&self) -> Result<()> {
        self.map.flush()?;
        Ok(())
    }

    fn bounds(&self, offset: usize, len: usize) -> Result<Range<usize>> {
        match offset.checked_add(len) {
            Some(end) if end <= self.map.len() => Ok(offset..end),
            Some(_) => Err(Error::Corrupt("range out of bounds")),
            None => Err(Error::Corrupt("range overflow")),
        }
    }
}

fn map_whole(file: &File, len: usize) -> Result<MmapFile> {
    // The mapping outlives the descriptor; no fd stays open per segment.
    let map = unsafe { MmapOptions::new().len(len).map_mut(file)? };
    Ok(MmapFile { map })
}
