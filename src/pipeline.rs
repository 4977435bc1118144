//! Chains channels into one logical channel.
//!
//! ```text
//! send() ─► c0 ──fwd──► c1 ──fwd──► … ──fwd──► cn ─► receive()
//! ```
//!
//! Each `fwd` is a thread looping `receive` on its source and `send` on its
//! destination. A typical use backs a network stream with a durable log so a
//! paused consumer loses nothing:
//!
//! ```no_run
//! use std::sync::Arc;
//! use datachannel::{Channel, LogChannel, NetworkClient, PipelineChannel};
//!
//! let pipeline = PipelineChannel::new(vec![
//!     Arc::new(NetworkClient::connect("localhost", 9000)?),
//!     Arc::new(LogChannel::open_named("./data/quotes", "normalizer")?),
//! ])?;
//! while let Some(msg) = pipeline.receive()? {
//!     let _ = msg;
//! }
//! # Ok::<(), datachannel::Error>(())
//! ```
//!
//! When a forwarder fails it logs the error, records it in [`HopState`] and
//! stops; the rest of the pipeline stays open. The message that failed to
//! send is dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error};

use crate::channel::{Channel, Message, SharedChannel};
use crate::{Error, Result};

const IDLE_BACKOFF_MIN: Duration = Duration::from_millis(1);
const IDLE_BACKOFF_MAX: Duration = Duration::from_millis(50);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HopState {
    Running,
    /// Exited because the pipeline was closed.
    Stopped,
    /// Exited on an error from its source or destination.
    Failed(String),
}

struct Shared {
    closed: AtomicBool,
    hops: Mutex<Vec<HopState>>,
}

impl Shared {
    fn set_hop(&self, hop: usize, state: HopState) {
        if let Ok(mut hops) = self.hops.lock() {
            if let Some(slot) = hops.get_mut(hop) {
                *slot = state;
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

pub struct PipelineChannel {
    stages: Vec<SharedChannel>,
    shared: Arc<Shared>,
    shutdown_tx: Mutex<Option<Sender<()>>>,
    forwarders: Mutex<Vec<JoinHandle<()>>>,
}

impl PipelineChannel {
    /// Starts one forwarder per adjacent pair of `stages`.
    ///
    /// # Errors
    ///
    /// `Error::Configuration` with fewer than two stages.
    pub fn new(stages: Vec<SharedChannel>) -> Result<Self> {
        if stages.len() < 2 {
            return Err(Error::Configuration(format!(
                "a pipeline needs at least two channels, got {}",
                stages.len()
            )));
        }
        let hop_count = stages.len() - 1;
        let shared = Arc::new(Shared {
            closed: AtomicBool::new(false),
            hops: Mutex::new(vec![HopState::Running; hop_count]),
        });
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);

        let mut forwarders = Vec::with_capacity(hop_count);
        for hop in 0..hop_count {
            let forwarder = Forwarder {
                hop,
                source: Arc::clone(&stages[hop]),
                dest: Arc::clone(&stages[hop + 1]),
                shared: Arc::clone(&shared),
                shutdown_rx: shutdown_rx.clone(),
            };
            let handle = thread::Builder::new()
                .name(format!("datachannel-forward-{hop}"))
                .spawn(move || forwarder.run());
            match handle {
                Ok(handle) => forwarders.push(handle),
                Err(err) => {
                    shared.closed.store(true, Ordering::Release);
                    drop(shutdown_tx);
                    for stage in &stages {
                        let _ = stage.close();
                    }
                    for handle in forwarders {
                        let _ = handle.join();
                    }
                    return Err(err.into());
                }
            }
        }

        Ok(Self {
            stages,
            shared,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            forwarders: Mutex::new(forwarders),
        })
    }

    pub fn hop_states(&self) -> Vec<HopState> {
        self.shared
            .hops
            .lock()
            .map(|hops| hops.clone())
            .unwrap_or_default()
    }

    fn first(&self) -> &SharedChannel {
        &self.stages[0]
    }

    fn last(&self) -> &SharedChannel {
        &self.stages[self.stages.len() - 1]
    }
}

impl Channel for PipelineChannel {
    fn send(&self, message: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ChannelClosed);
        }
        self.first().send(message)
    }

    fn receive(&self) -> Result<Option<Message>> {
        self.last().receive()
    }

    fn close(&self) -> Result<()> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Ok(mut shutdown_tx) = self.shutdown_tx.lock() {
            shutdown_tx.take();
        }

        let mut first_err = None;
        for stage in &self.stages {
            if let Err(err) = stage.close() {
                error!("pipeline: closing stage failed: {}", err);
                first_err.get_or_insert(err);
            }
        }

        let forwarders: Vec<_> = self
            .forwarders
            .lock()
            .map_err(|_| Error::Corrupt("forwarder list lock poisoned"))?
            .drain(..)
            .collect();
        for handle in forwarders {
            let _ = handle.join();
        }
        debug!("pipeline closed");
        first_err.map_or(Ok(()), Err)
    }

    fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }
}

impl Drop for PipelineChannel {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

struct Forwarder {
    hop: usize,
    source: SharedChannel,
    dest: SharedChannel,
    shared: Arc<Shared>,
    shutdown_rx: Receiver<()>,
}

impl Forwarder {
    fn run(self) {
        let mut idle = IDLE_BACKOFF_MIN;
        let state = loop {
            if self.shared.is_closed() {
                break HopState::Stopped;
            }
            match self.source.receive() {
                Ok(Some(msg)) => {
                    idle = IDLE_BACKOFF_MIN;
                    if let Err(err) = self.dest.send(&msg) {
                        break self.fail("send", err);
                    }
                }
                // Non-blocking source with nothing new: back off, but wake on close.
                Ok(None) => match self.shutdown_rx.recv_timeout(idle) {
                    Err(RecvTimeoutError::Timeout) => {
                        idle = (idle * 2).min(IDLE_BACKOFF_MAX);
                    }
                    _ => break HopState::Stopped,
                },
                Err(err) => break self.fail("receive", err),
            }
        };
        debug!("pipeline hop {} exited: {:?}", self.hop, state);
        self.shared.set_hop(self.hop, state);
    }

    fn fail(&self, op: &str, err: Error) -> HopState {
        if self.shared.is_closed() {
            return HopState::Stopped;
        }
        error!(
            "pipeline hop {} -> {}: {} failed, forwarder stopped: {}",
            self.hop,
            self.hop + 1,
            op,
            err
        );
        HopState::Failed(format!("{op}: {err}"))
    }
}
