use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::channel::Message;
use crate::{Error, Result};

pub const RECORD_SEPARATOR: u8 = b'\n';

/// Rejects payloads that would break newline framing.
pub fn check_frame(message: &[u8]) -> Result<()> {
    if message.contains(&RECORD_SEPARATOR) {
        return Err(Error::InvalidMessage("message contains the record separator"));
    }
    Ok(())
}

/// A TCP socket with independent line reader and writer halves.
///
/// Reads and writes lock separately, so a thread parked in `read_line` does
/// not stall writers; `shutdown` goes through a third handle and wakes both.
pub struct Connection {
    id: u64,
    peer: SocketAddr,
    reader: Mutex<BufReader<TcpStream>>,
    writer: Mutex<BufWriter<TcpStream>>,
    control: TcpStream,
    closed: AtomicBool,
}

impl Connection {
    pub fn new(stream: TcpStream, id: u64) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        let reader = BufReader::new(stream.try_clone()?);
        let writer = BufWriter::new(stream.try_clone()?);
        Ok(Self {
            id,
            peer,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            control: stream,
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn write_line(&self, message: &[u8]) -> io::Result<()> {
        if self.is_closed() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "connection closed"));
        }
        let mut writer = lock_io(&self.writer)?;
        writer.write_all(message)?;
        writer.write_all(&[RECORD_SEPARATOR])?;
        writer.flush()
    }

    /// Next line without its terminator; `None` on a clean EOF.
    pub fn read_line(&self) -> io::Result<Option<Message>> {
        let mut reader = lock_io(&self.reader)?;
        let mut line = Vec::new();
        let read = reader.read_until(RECORD_SEPARATOR, &mut line)?;
        if read == 0 {
            return Ok(None);
        }
        if line.last() != Some(&RECORD_SEPARATOR) {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed mid-message",
            ));
        }
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Ok(Some(line))
    }

    /// True when the peer has already sent FIN (or reset) and nothing unread
    /// remains before it. A write to such a socket is accepted locally and
    /// then lost, so writers check this first.
    pub fn peer_hung_up(&self) -> bool {
        if self.is_closed() {
            return true;
        }
        peek_hung_up(&self.control)
    }

    /// Idempotent; unblocks any thread parked on this socket.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.control.shutdown(Shutdown::Both);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// MSG_PEEK | MSG_DONTWAIT leaves the socket's blocking mode alone, so a
// reader parked on a clone of this socket is unaffected.
#[cfg(unix)]
fn peek_hung_up(stream: &TcpStream) -> bool {
    use std::os::unix::io::AsRawFd;

    let mut byte = 0u8;
    let res = unsafe {
        libc::recv(
            stream.as_raw_fd(),
            (&mut byte as *mut u8).cast::<libc::c_void>(),
            1,
            libc::MSG_PEEK | libc::MSG_DONTWAIT,
        )
    };
    match res {
        0 => true,
        n if n > 0 => false,
        _ => !matches!(
            io::Error::last_os_error().kind(),
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
        ),
    }
}

#[cfg(not(unix))]
fn peek_hung_up(_stream: &TcpStream) -> bool {
    false
}

fn lock_io<T>(mutex: &Mutex<T>) -> io::Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| io::Error::new(io::ErrorKind::Other, "connection lock poisoned"))
}
