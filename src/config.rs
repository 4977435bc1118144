//! Declarative channel configuration.
//!
//! Any channel, including nested pipelines, can be described in JSON and
//! opened at runtime:
//!
//! ```json
//! {
//!   "type": "pipeline",
//!   "stages": [
//!     { "type": "client", "host": "localhost", "port": 9000 },
//!     { "type": "log", "dir": "./data/quotes", "cursor": "normalizer" }
//!   ]
//! }
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::channel::SharedChannel;
use crate::memory::MemoryChannel;
use crate::net::{ClientConfig, NetworkClient, NetworkServer, ServerConfig};
use crate::persist::{LogChannel, LogConfig, DEFAULT_SEGMENT_SIZE};
use crate::pipeline::PipelineChannel;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelConfig {
    /// In-process queue; unbounded when `capacity` is omitted.
    Memory {
        #[serde(default)]
        capacity: Option<usize>,
    },
    /// Persisted log; durable cursor when `cursor` is set.
    Log {
        dir: PathBuf,
        #[serde(default)]
        cursor: Option<String>,
        #[serde(default = "default_segment_size")]
        segment_size: usize,
    },
    Server {
        #[serde(default = "default_bind_host")]
        host: String,
        port: u16,
    },
    Client {
        host: String,
        port: u16,
        #[serde(default = "default_max_retries")]
        max_retries: u32,
        #[serde(default = "default_base_delay_ms")]
        base_delay_ms: u64,
    },
    Pipeline { stages: Vec<ChannelConfig> },
}

fn default_segment_size() -> usize {
    DEFAULT_SEGMENT_SIZE
}

fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}

fn default_max_retries() -> u32 {
    crate::net::DEFAULT_MAX_RETRIES
}

fn default_base_delay_ms() -> u64 {
    crate::net::DEFAULT_BASE_DELAY.as_millis() as u64
}

impl ChannelConfig {
    pub fn memory(capacity: Option<usize>) -> Self {
        Self::Memory { capacity }
    }

    pub fn log(dir: impl Into<PathBuf>, cursor: Option<&str>) -> Self {
        Self::Log {
            dir: dir.into(),
            cursor: cursor.map(str::to_string),
            segment_size: DEFAULT_SEGMENT_SIZE,
        }
    }

    pub fn server(port: u16) -> Self {
        Self::Server {
            host: default_bind_host(),
            port,
        }
    }

    pub fn client(host: impl Into<String>, port: u16) -> Self {
        Self::Client {
            host: host.into(),
            port,
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
        }
    }

    pub fn pipeline(stages: Vec<ChannelConfig>) -> Self {
        Self::Pipeline { stages }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|err| Error::Configuration(format!("invalid channel config: {err}")))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json).map_err(|err| match err {
            Error::Configuration(msg) => Error::Configuration(format!("{}: {msg}", path.display())),
            other => other,
        })
    }

    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|err| Error::Configuration(format!("unserializable channel config: {err}")))
    }

    /// Builds the described channel. Pipeline stages are opened in order; if
    /// a later stage fails, the ones already opened are closed again.
    pub fn open(&self) -> Result<SharedChannel> {
        let channel: SharedChannel = match self {
            ChannelConfig::Memory { capacity } => Arc::new(MemoryChannel::with_capacity(*capacity)?),
            ChannelConfig::Log {
                dir,
                cursor,
                segment_size,
            } => Arc::new(LogChannel::open_with_config(
                dir,
                cursor.as_deref(),
                LogConfig {
                    segment_size: *segment_size,
                },
            )?),
            ChannelConfig::Server { host, port } => {
                Arc::new(NetworkServer::bind_with_config(ServerConfig {
                    host: host.clone(),
                    port: *port,
                })?)
            }
            ChannelConfig::Client {
                host,
                port,
                max_retries,
                base_delay_ms,
            } => Arc::new(NetworkClient::connect_with_config(
                ClientConfig::new(host.clone(), *port)
                    .with_retries(*max_retries, Duration::from_millis(*base_delay_ms)),
            )?),
            ChannelConfig::Pipeline { stages } => {
                let mut opened: Vec<SharedChannel> = Vec::with_capacity(stages.len());
                for stage in stages {
                    match stage.open() {
                        Ok(channel) => opened.push(channel),
                        Err(err) => {
                            for channel in &opened {
                                let _ = channel.close();
                            }
                            return Err(err);
                        }
                    }
                }
                Arc::new(PipelineChannel::new(opened)?)
            }
        };
        Ok(channel)
    }
}
