use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The channel was closed and (for reads) nothing buffered remains.
    #[error("channel closed")]
    ChannelClosed,

    /// Underlying socket or disk failure, after any retry policy ran out.
    #[error("transport failure: {0}")]
    Transport(#[from] std::io::Error),

    /// A network client could not (re-)establish its connection.
    #[error("unable to connect to {addr} after {attempts} attempts")]
    ConnectionExhausted {
        addr: String,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid message: {0}")]
    InvalidMessage(&'static str),

    #[error("corrupt data: {0}")]
    Corrupt(&'static str),

    #[error("payload too large")]
    PayloadTooLarge,

    #[error("writer already active")]
    WriterAlreadyActive,
}

impl Error {
    pub fn is_closed(&self) -> bool {
        matches!(self, Error::ChannelClosed)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
