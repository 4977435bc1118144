//! Interchangeable message channels for market-data pipelines.
//!
//! Producers and consumers only see the [`Channel`] contract; what sits behind
//! it decides the delivery semantics:
//!
//! | Channel | Semantics | `receive` |
//! |---------|-----------|-----------|
//! | [`MemoryChannel`] | in-process FIFO, optional capacity | blocks |
//! | [`LogChannel`] | durable segmented log, named cursors | returns `None` when caught up |
//! | [`NetworkServer`] | TCP, broadcast out, aggregate in | blocks |
//! | [`NetworkClient`] | TCP, reconnect-on-use | blocks |
//! | [`PipelineChannel`] | chains ≥2 channels with forwarders | as the last stage |

pub mod channel;
#[cfg(feature = "config")]
pub mod config;
pub mod error;
pub mod memory;
pub mod net;
pub mod persist;
pub mod pipeline;

pub use channel::{Channel, Message, SharedChannel, POISON_PILL};
#[cfg(feature = "config")]
pub use config::ChannelConfig;
pub use error::{Error, Result};
pub use memory::MemoryChannel;
pub use net::{ClientConfig, NetworkClient, NetworkServer, ServerConfig};
pub use persist::{LogChannel, LogConfig, LogCursor, LogRecord};
pub use pipeline::{HopState, PipelineChannel};
