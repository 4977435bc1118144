use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use crate::{Error, Result};

pub const WRITER_LOCK_FILE: &str = "writer.lock";

/// Exclusive advisory lock on `writer.lock`, released when dropped.
pub struct WriterLock {
    _file: File,
}

impl WriterLock {
    pub fn acquire(root: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(root.join(WRITER_LOCK_FILE))?;
        if !try_lock(&file)? {
            return Err(Error::WriterAlreadyActive);
        }
        write_lock_record(&file)?;
        Ok(Self { _file: file })
    }
}

#[cfg(unix)]
fn try_lock(file: &File) -> Result<bool> {
    use std::os::unix::io::AsRawFd;

    let res = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if res == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.kind() == std::io::ErrorKind::WouldBlock {
        return Ok(false);
    }
    Err(Error::Transport(err))
}

#[cfg(not(unix))]
fn try_lock(_file: &File) -> Result<bool> {
    Ok(true)
}

// Owner pid, for operators inspecting a stuck directory.
fn write_lock_record(file: &File) -> Result<()> {
    let record = format!("{}\n", std::process::id());
    let mut handle = file.try_clone()?;
    handle.set_len(0)?;
    handle.seek(SeekFrom::Start(0))?;
    handle.write_all(record.as_bytes())?;
    handle.sync_all()?;
    Ok(())
}
