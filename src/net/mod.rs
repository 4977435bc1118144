//! Line-framed TCP channels.
//!
//! ```text
//!   NetworkClient ──┐                      ┌── broadcast on send()
//!   NetworkClient ──┼──► NetworkServer ────┤
//!   NetworkClient ──┘                      └── inbound queue for receive()
//! ```
//!
//! Every message travels as one `\n`-terminated line, so payloads must not
//! contain a newline; both ends reject such messages with
//! `Error::InvalidMessage`.

pub mod client;
pub mod connection;
pub mod server;

pub use client::{ClientConfig, NetworkClient, DEFAULT_BASE_DELAY, DEFAULT_MAX_RETRIES};
pub use server::{NetworkServer, ServerConfig};
