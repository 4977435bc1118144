use std::io;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::{info, warn};

use crate::channel::{Channel, Message};
use crate::net::connection::{check_frame, Connection};
use crate::{Error, Result};

pub const DEFAULT_MAX_RETRIES: u32 = 5;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(2);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    /// Connect attempts after the first one before giving up. Default: 5.
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each further attempt. Default: 2s.
    pub base_delay: Duration,
}

impl ClientConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
        }
    }

    pub fn with_retries(mut self, max_retries: u32, base_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.base_delay = base_delay;
        self
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Backoff before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }
}

/// TCP client channel with reconnect-on-use.
///
/// A failed `send` or `receive` triggers one reconnect (with the full backoff
/// budget) and a single retry of the operation; a second failure is returned.
pub struct NetworkClient {
    config: ClientConfig,
    closed: AtomicBool,
    current: Mutex<Option<Arc<Connection>>>,
    reconnect: Mutex<()>,
    shutdown_tx: Mutex<Option<Sender<()>>>,
    shutdown_rx: Receiver<()>,
    next_id: AtomicU64,
}

impl NetworkClient {
    pub fn connect(host: impl Into<String>, port: u16) -> Result<Self> {
        Self::connect_with_config(ClientConfig::new(host, port))
    }

    pub fn connect_with_config(config: ClientConfig) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = bounded(0);
        let client = Self {
            config,
            closed: AtomicBool::new(false),
            current: Mutex::new(None),
            reconnect: Mutex::new(()),
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            shutdown_rx,
            next_id: AtomicU64::new(1),
        };
        let conn = client.establish()?;
        client.set_current(Some(conn))?;
        Ok(client)
    }

    /// Drops the current socket without closing the channel; the next
    /// operation reconnects.
    pub fn reset_connection(&self) -> Result<()> {
        if let Some(conn) = self.current()? {
            info!("resetting connection to {}", self.config.addr());
            conn.shutdown();
        }
        Ok(())
    }

    fn establish(&self) -> Result<Arc<Connection>> {
        let addr = self.config.addr();
        let mut attempt = 0;
        loop {
            if self.is_closed() {
                return Err(Error::ChannelClosed);
            }
            let err = match TcpStream::connect((self.config.host.as_str(), self.config.port)) {
                Ok(stream) => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    match Connection::new(stream, id) {
                        Ok(conn) => {
                            info!("connected to server {}", addr);
                            return Ok(Arc::new(conn));
                        }
                        Err(err) => err,
                    }
                }
                Err(err) => err,
            };

            attempt += 1;
            if attempt > self.config.max_retries {
                return Err(Error::ConnectionExhausted {
                    addr,
                    attempts: attempt,
                    source: err,
                });
            }
            let delay = self.config.delay_for(attempt);
            warn!(
                "connection attempt {} to {} failed ({}), retrying in {:?}",
                attempt, addr, err, delay
            );
            match self.shutdown_rx.recv_timeout(delay) {
                Err(RecvTimeoutError::Timeout) => {}
                // Sender dropped: close() was called while we slept.
                _ => return Err(Error::ChannelClosed),
            }
        }
    }

    fn current(&self) -> Result<Option<Arc<Connection>>> {
        let current = self
            .current
            .lock()
            .map_err(|_| Error::Corrupt("connection lock poisoned"))?;
        Ok(current.clone())
    }

    fn set_current(&self, conn: Option<Arc<Connection>>) -> Result<()> {
        let mut current = self
            .current
            .lock()
            .map_err(|_| Error::Corrupt("connection lock poisoned"))?;
        *current = conn;
        Ok(())
    }

    fn connection(&self) -> Result<Arc<Connection>> {
        match self.current()? {
            Some(conn) if !conn.is_closed() => Ok(conn),
            stale => self.reconnect(stale.as_ref()),
        }
    }

    /// Replaces `failed` with a fresh connection. If another thread already
    /// replaced it, that connection is reused.
    fn reconnect(&self, failed: Option<&Arc<Connection>>) -> Result<Arc<Connection>> {
        let _guard = self
            .reconnect
            .lock()
            .map_err(|_| Error::Corrupt("reconnect lock poisoned"))?;
        if self.is_closed() {
            return Err(Error::ChannelClosed);
        }
        if let Some(current) = self.current()? {
            let replaced = failed.map_or(true, |failed| !Arc::ptr_eq(failed, &current));
            if replaced && !current.is_closed() {
                return Ok(current);
            }
            current.shutdown();
        }
        warn!("reconnecting to {}", self.config.addr());
        self.set_current(None)?;
        let conn = self.establish()?;
        self.set_current(Some(Arc::clone(&conn)))?;
        // close() may have run while establish() held no lock on `current`.
        if self.is_closed() {
            conn.shutdown();
            return Err(Error::ChannelClosed);
        }
        Ok(conn)
    }

    fn surface(&self, err: io::Error) -> Error {
        if self.is_closed() {
            Error::ChannelClosed
        } else {
            Error::Transport(err)
        }
    }
}

impl Channel for NetworkClient {
    fn send(&self, message: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ChannelClosed);
        }
        check_frame(message)?;
        let mut conn = self.connection()?;
        // The kernel accepts a write to a half-closed socket and then drops
        // it, so a server that went away must be noticed before writing.
        if conn.peer_hung_up() {
            if self.is_closed() {
                return Err(Error::ChannelClosed);
            }
            warn!("server {} hung up, reconnecting before send", self.config.addr());
            conn = self.reconnect(Some(&conn))?;
        }
        match conn.write_line(message) {
            Ok(()) => Ok(()),
            Err(err) => {
                if self.is_closed() {
                    return Err(Error::ChannelClosed);
                }
                warn!("send to {} failed: {}", self.config.addr(), err);
                let conn = self.reconnect(Some(&conn))?;
                conn.write_line(message).map_err(|err| self.surface(err))
            }
        }
    }

    fn receive(&self) -> Result<Option<Message>> {
        if self.is_closed() {
            return Err(Error::ChannelClosed);
        }
        let conn = self.connection()?;
        let failure = match conn.read_line() {
            Ok(Some(line)) => return Ok(Some(line)),
            Ok(None) => io::Error::new(io::ErrorKind::UnexpectedEof, "end of stream reached"),
            Err(err) => err,
        };
        if self.is_closed() {
            return Err(Error::ChannelClosed);
        }
        warn!("receive from {} failed: {}", self.config.addr(), failure);
        let conn = self.reconnect(Some(&conn))?;
        match conn.read_line() {
            Ok(Some(line)) => Ok(Some(line)),
            Ok(None) => Err(self.surface(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "end of stream reached after reconnection",
            ))),
            Err(err) => Err(self.surface(err)),
        }
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shutdown_tx
            .lock()
            .map_err(|_| Error::Corrupt("shutdown lock poisoned"))?
            .take();
        if let Some(conn) = self.current()? {
            conn.shutdown();
        }
        self.set_current(None)?;
        info!("client for {} closed", self.config.addr());
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for NetworkClient {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
