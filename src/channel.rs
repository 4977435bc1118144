//! The uniform channel contract.
//!
//! Every transport in this crate (in-memory queue, persisted log, TCP server
//! and client, pipeline) implements [`Channel`]. Producers only call
//! [`Channel::send`], consumers loop on [`Channel::receive`], and either side
//! may call [`Channel::close`].
//!
//! ```no_run
//! use datachannel::{Channel, MemoryChannel, POISON_PILL};
//!
//! let channel = MemoryChannel::unbounded();
//! channel.send(b"{\"px\":101.5}")?;
//! channel.send(POISON_PILL)?;
//!
//! while let Some(msg) = channel.receive()? {
//!     if msg == POISON_PILL {
//!         break;
//!     }
//!     // normalize msg
//! }
//! channel.close()?;
//! # Ok::<(), datachannel::Error>(())
//! ```

use std::sync::Arc;

use crate::Result;

/// Conventional sentinel asking a consumer to stop without closing the channel.
///
/// Channels never interpret it; it travels like any other payload.
pub const POISON_PILL: &[u8] = b"POISON_PILL";

/// An owned message payload.
pub type Message = Vec<u8>;

/// A message channel with `open -> (send|receive)* -> closed` lifecycle.
///
/// Implementations are shareable across threads; all methods take `&self`.
pub trait Channel: Send + Sync {
    /// Enqueues, transmits or persists `message`.
    ///
    /// # Errors
    ///
    /// - `Error::ChannelClosed` once the channel has been closed
    /// - `Error::Transport` when the underlying socket or file fails
    fn send(&self, message: &[u8]) -> Result<()>;

    /// Returns the next message.
    ///
    /// Blocking transports park until a message arrives and always return
    /// `Some`. The persisted log never blocks and returns `None` when no new
    /// record exists; callers poll with backoff in that case.
    ///
    /// # Errors
    ///
    /// `Error::ChannelClosed` when the channel is closed and nothing buffered
    /// remains.
    fn receive(&self) -> Result<Option<Message>>;

    /// Releases sockets, files and background threads. Idempotent.
    fn close(&self) -> Result<()>;

    fn is_closed(&self) -> bool;
}

impl<C: Channel + ?Sized> Channel for Arc<C> {
    fn send(&self, message: &[u8]) -> Result<()> {
        (**self).send(message)
    }

    fn receive(&self) -> Result<Option<Message>> {
        (**self).receive()
    }

    fn close(&self) -> Result<()> {
        (**self).close()
    }

    fn is_closed(&self) -> bool {
        (**self).is_closed()
    }
}

impl<C: Channel + ?Sized> Channel for Box<C> {
    fn send(&self, message: &[u8]) -> Result<()> {
        (**self).send(message)
    }

    fn receive(&self) -> Result<Option<Message>> {
        (**self).receive()
    }

    fn close(&self) -> Result<()> {
        (**self).close()
    }

    fn is_closed(&self) -> bool {
        (**self).is_closed()
    }
}

/// Shared, type-erased channel handle.
pub type SharedChannel = Arc<dyn Channel>;
