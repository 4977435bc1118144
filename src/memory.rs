//! In-process FIFO channel.
//!
//! Backed by a crossbeam queue. Close is signalled through a second,
//! never-written channel whose sender is dropped on close: every thread parked
//! in `select!` on it wakes up and observes `ChannelClosed`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender, TryRecvError};

use crate::channel::{Channel, Message};
use crate::{Error, Result};

pub struct MemoryChannel {
    tx: Sender<Message>,
    rx: Receiver<Message>,
    closed: AtomicBool,
    shutdown_tx: Mutex<Option<Sender<()>>>,
    shutdown_rx: Receiver<()>,
}

impl MemoryChannel {
    pub fn unbounded() -> Self {
        Self::from_parts(unbounded())
    }

    /// Creates a channel holding at most `capacity` messages; `send` blocks when full.
    pub fn bounded(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::Configuration(
                "in-memory channel capacity must be at least 1".to_string(),
            ));
        }
        Ok(Self::from_parts(bounded(capacity)))
    }

    /// `None` builds an unbounded channel.
    pub fn with_capacity(capacity: Option<usize>) -> Result<Self> {
        match capacity {
            Some(capacity) => Self::bounded(capacity),
            None => Ok(Self::unbounded()),
        }
    }

    fn from_parts((tx, rx): (Sender<Message>, Receiver<Message>)) -> Self {
        let (shutdown_tx, shutdown_rx) = bounded(0);
        Self {
            tx,
            rx,
            closed: AtomicBool::new(false),
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            shutdown_rx,
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> Option<usize> {
        self.rx.capacity()
    }

    fn drain_one(&self) -> Result<Option<Message>> {
        match self.rx.try_recv() {
            Ok(msg) => Ok(Some(msg)),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {
                Err(Error::ChannelClosed)
            }
        }
    }
}

impl Default for MemoryChannel {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl Channel for MemoryChannel {
    fn send(&self, message: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ChannelClosed);
        }
        let msg = message.to_vec();
        select! {
            send(self.tx, msg) -> res => res.map_err(|_| Error::ChannelClosed),
            recv(self.shutdown_rx) -> _ => Err(Error::ChannelClosed),
        }
    }

    fn receive(&self) -> Result<Option<Message>> {
        match self.rx.try_recv() {
            Ok(msg) => return Ok(Some(msg)),
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => return Err(Error::ChannelClosed),
        }
        if self.is_closed() {
            return Err(Error::ChannelClosed);
        }
        select! {
            recv(self.rx) -> msg => msg.map(Some).map_err(|_| Error::ChannelClosed),
            // Closed while parked: hand out anything that raced in, then fail.
            recv(self.shutdown_rx) -> _ => self.drain_one(),
        }
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        let mut guard = self
            .shutdown_tx
            .lock()
            .map_err(|_| Error::Corrupt("shutdown lock poisoned"))?;
        guard.take();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(matches!(
            MemoryChannel::bounded(0),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn reports_capacity_and_len() {
        let channel = MemoryChannel::bounded(4).unwrap();
        assert_eq!(channel.capacity(), Some(4));
        channel.send(b"a").unwrap();
        channel.send(b"b").unwrap();
        assert_eq!(channel.len(), 2);

        let channel = MemoryChannel::unbounded();
        assert_eq!(channel.capacity(), None);
        assert!(channel.is_empty());
    }

    #[test]
    fn close_is_idempotent() {
        let channel = MemoryChannel::unbounded();
        channel.close().unwrap();
        channel.close().unwrap();
        assert!(channel.is_closed());
    }
}
