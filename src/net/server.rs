use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, warn};

use crate::channel::{Channel, Message};
use crate::memory::MemoryChannel;
use crate::net::connection::{check_frame, Connection};
use crate::{Error, Result};

const WAKE_TIMEOUT: Duration = Duration::from_secs(1);
const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(50);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    /// Interface to bind. Default: all IPv4 interfaces.
    pub host: String,
    /// Listening port; 0 picks an ephemeral port.
    pub port: u16,
}

impl ServerConfig {
    pub fn new(port: u16) -> Self {
        Self {
            host: Ipv4Addr::UNSPECIFIED.to_string(),
            port,
        }
    }
}

struct Shared {
    closed: AtomicBool,
    connections: Mutex<HashMap<u64, Arc<Connection>>>,
    inbound: MemoryChannel,
    readers: Mutex<Vec<JoinHandle<()>>>,
    next_id: AtomicU64,
}

/// TCP server channel.
///
/// `send` broadcasts a line to every connected client; `receive` returns lines
/// from any client in arrival order.
pub struct NetworkServer {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    // Second handle on the acceptor's socket so close() can shut it down.
    listener: Mutex<Option<TcpListener>>,
    acceptor: Mutex<Option<JoinHandle<()>>>,
}

impl NetworkServer {
    pub fn bind(port: u16) -> Result<Self> {
        Self::bind_with_config(ServerConfig::new(port))
    }

    pub fn bind_with_config(config: ServerConfig) -> Result<Self> {
        let listener = TcpListener::bind((config.host.as_str(), config.port))?;
        let local_addr = listener.local_addr()?;
        info!("server listening on {}", local_addr);

        let shared = Arc::new(Shared {
            closed: AtomicBool::new(false),
            connections: Mutex::new(HashMap::new()),
            inbound: MemoryChannel::unbounded(),
            readers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        });
        let control = listener.try_clone()?;
        let acceptor = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name(format!("datachannel-accept-{}", local_addr.port()))
                .spawn(move || accept_loop(listener, shared))?
        };
        Ok(Self {
            shared,
            local_addr,
            listener: Mutex::new(Some(control)),
            acceptor: Mutex::new(Some(acceptor)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn connection_count(&self) -> usize {
        self.shared
            .connections
            .lock()
            .map(|connections| connections.len())
            .unwrap_or(0)
    }

    fn snapshot(&self) -> Result<Vec<Arc<Connection>>> {
        let connections = self
            .shared
            .connections
            .lock()
            .map_err(|_| Error::Corrupt("connection set lock poisoned"))?;
        let mut snapshot: Vec<_> = connections.values().cloned().collect();
        snapshot.sort_by_key(|conn| conn.id());
        Ok(snapshot)
    }

    /// Stops the listening socket so the acceptor's blocking `accept()`
    /// returns. Falls back to a throwaway self-connection where shutting a
    /// listener down is not supported.
    fn stop_listening(&self) -> Result<bool> {
        let listener = self
            .listener
            .lock()
            .map_err(|_| Error::Corrupt("listener lock poisoned"))?
            .take();
        let Some(listener) = listener else {
            return Ok(false);
        };
        match shutdown_listener(&listener) {
            Ok(()) => Ok(true),
            Err(err) => {
                debug!("server {}: listener shutdown failed ({}), self-connecting", self.local_addr, err);
                Ok(self.wake_acceptor())
            }
        }
    }

    fn wake_acceptor(&self) -> bool {
        let ip = match self.local_addr {
            SocketAddr::V4(addr) if addr.ip().is_unspecified() => Ipv4Addr::LOCALHOST.into(),
            SocketAddr::V6(addr) if addr.ip().is_unspecified() => Ipv6Addr::LOCALHOST.into(),
            addr => addr.ip(),
        };
        let target = SocketAddr::new(ip, self.local_addr.port());
        match TcpStream::connect_timeout(&target, WAKE_TIMEOUT) {
            Ok(_) => true,
            Err(err) => {
                warn!("server {}: failed to wake acceptor: {}", self.local_addr, err);
                false
            }
        }
    }
}

#[cfg(unix)]
fn shutdown_listener(listener: &TcpListener) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let res = unsafe { libc::shutdown(listener.as_raw_fd(), libc::SHUT_RDWR) };
    if res == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn shutdown_listener(_listener: &TcpListener) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "listener shutdown unsupported",
    ))
}

fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    for stream in listener.incoming() {
        if shared.closed.load(Ordering::Acquire) {
            break;
        }
        match stream {
            Ok(stream) => {
                if let Err(err) = register(&shared, stream) {
                    warn!("failed to register connection: {}", err);
                }
            }
            Err(err) => {
                warn!("error accepting client: {}", err);
                thread::sleep(ACCEPT_ERROR_PAUSE);
            }
        }
    }
    debug!("accept loop exited");
}

fn register(shared: &Arc<Shared>, stream: TcpStream) -> Result<()> {
    let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
    let conn = Arc::new(Connection::new(stream, id)?);
    info!("accepted connection {} from {}", id, conn.peer());

    {
        let mut connections = shared
            .connections
            .lock()
            .map_err(|_| Error::Corrupt("connection set lock poisoned"))?;
        // close() may have drained the set between accept and here.
        if shared.closed.load(Ordering::Acquire) {
            conn.shutdown();
            return Err(Error::ChannelClosed);
        }
        connections.insert(id, Arc::clone(&conn));
    }

    let reader = {
        let shared = Arc::clone(shared);
        let conn = Arc::clone(&conn);
        thread::Builder::new()
            .name(format!("datachannel-conn-{id}"))
            .spawn(move || read_loop(&shared, &conn))?
    };
    let mut readers = shared
        .readers
        .lock()
        .map_err(|_| Error::Corrupt("reader list lock poisoned"))?;
    readers.retain(|handle| !handle.is_finished());
    readers.push(reader);
    Ok(())
}

fn read_loop(shared: &Shared, conn: &Connection) {
    loop {
        match conn.read_line() {
            Ok(Some(line)) => {
                if shared.inbound.send(&line).is_err() {
                    break;
                }
            }
            Ok(None) => {
                debug!("connection {} closed by peer", conn.id());
                break;
            }
            Err(err) => {
                if !conn.is_closed() && !shared.closed.load(Ordering::Acquire) {
                    warn!("error reading from connection {}: {}", conn.id(), err);
                }
                break;
            }
        }
    }
    conn.shutdown();
    if let Ok(mut connections) = shared.connections.lock() {
        connections.remove(&conn.id());
    }
}

impl Channel for NetworkServer {
    fn send(&self, message: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ChannelClosed);
        }
        check_frame(message)?;
        for conn in self.snapshot()? {
            if let Err(err) = conn.write_line(message) {
                warn!(
                    "error sending to connection {} ({}), disconnecting: {}",
                    conn.id(),
                    conn.peer(),
                    err
                );
                conn.shutdown();
                if let Ok(mut connections) = self.shared.connections.lock() {
                    connections.remove(&conn.id());
                }
            }
        }
        Ok(())
    }

    fn receive(&self) -> Result<Option<Message>> {
        self.shared.inbound.receive()
    }

    fn close(&self) -> Result<()> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shared.inbound.close()?;

        let acceptor = self
            .acceptor
            .lock()
            .map_err(|_| Error::Corrupt("acceptor lock poisoned"))?
            .take();
        if self.stop_listening()? {
            if let Some(acceptor) = acceptor {
                let _ = acceptor.join();
            }
        } else {
            warn!("server {}: acceptor could not be woken, detaching it", self.local_addr);
        }

        let connections: Vec<_> = self
            .shared
            .connections
            .lock()
            .map_err(|_| Error::Corrupt("connection set lock poisoned"))?
            .drain()
            .map(|(_, conn)| conn)
            .collect();
        for conn in &connections {
            conn.shutdown();
        }

        let readers: Vec<_> = self
            .shared
            .readers
            .lock()
            .map_err(|_| Error::Corrupt("reader list lock poisoned"))?
            .drain(..)
            .collect();
        for reader in readers {
            let _ = reader.join();
        }
        info!("server {} closed", self.local_addr);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

impl Drop for NetworkServer {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
