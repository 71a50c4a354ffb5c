use std::{net::SocketAddr, num::NonZeroUsize, path::Path, time::Duration};

use anyhow::bail;
use serde::{Deserialize, Serialize};

mod extractor;

// MAX configuration file size: 16 MB
const MAX_CONFIG_FILE_SIZE: u64 = 16 * 1024 * 1024;
// Default iouring/epoll entries: 32k
const DEFAULT_ENTRIES: u32 = 32768;

pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;
pub const DEFAULT_MAX_INPUT_BYTES: usize = 1024 * 1024;
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 3000;
pub const DEFAULT_MAX_HEADER_BYTES: usize = 16 * 1024;
pub const DEFAULT_MAX_BODY_BYTES: usize = 512 * 1024;
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 256 * 1024;
pub const MIN_SQPOLL_IDLE_TIME: u32 = 1000; // 1s idle time.
pub const FALLBACK_PARALLELISM: NonZeroUsize = match NonZeroUsize::new(1) {
    Some(n) => n,
    None => unreachable!(),
};
pub const PROTOCOL_HTTP: &str = "http";
pub const PROTOCOL_WEBSOCKET: &str = "websocket";
pub const PROTOCOL_SSE: &str = "sse";

macro_rules! define_const {
    ($name: ident, $val: expr, $type: ty) => {
        const fn $name() -> $type {
            $val
        }
    };
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_workers")]
    pub worker_threads: usize,
    #[serde(default = "default_entries")]
    pub entries: u32,
    pub sqpoll_idle: Option<u32>,
    #[serde(default)]
    pub runtime_type: RuntimeType,
    #[serde(default = "default_cpu_affinity")]
    pub cpu_affinity: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            worker_threads: default_workers(),
            entries: default_entries(),
            sqpoll_idle: None,
            runtime_type: Default::default(),
            cpu_affinity: default_cpu_affinity(),
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .unwrap_or(FALLBACK_PARALLELISM)
        .into()
}

define_const!(default_entries, DEFAULT_ENTRIES, u32);
define_const!(default_cpu_affinity, false, bool);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeType {
    #[cfg(target_os = "linux")]
    IoUring,
    Legacy,
}

impl Default for RuntimeType {
    #[cfg(target_os = "linux")]
    fn default() -> Self {
        Self::IoUring
    }
    #[cfg(not(target_os = "linux"))]
    fn default() -> Self {
        Self::Legacy
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub listener: SocketAddr,
    /// Enabled protocol names; detectors that support none of them are skipped.
    #[serde(default = "default_protocols")]
    pub protocols: Vec<String>,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub worker_pool: WorkerPoolConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub websocket: WebSocketConfig,
    #[serde(default)]
    pub sse: SseConfig,
}

impl ServerConfig {
    pub fn new(listener: SocketAddr) -> Self {
        Self {
            listener,
            protocols: default_protocols(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            session: Default::default(),
            worker_pool: Default::default(),
            http: Default::default(),
            websocket: Default::default(),
            sse: Default::default(),
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

fn default_protocols() -> Vec<String> {
    vec![
        PROTOCOL_WEBSOCKET.to_string(),
        PROTOCOL_SSE.to_string(),
        PROTOCOL_HTTP.to_string(),
    ]
}

define_const!(default_shutdown_grace_ms, DEFAULT_SHUTDOWN_GRACE_MS, u64);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionConfig {
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
    #[serde(default = "default_max_input_bytes")]
    pub max_input_bytes: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: default_read_buffer_size(),
            max_input_bytes: default_max_input_bytes(),
        }
    }
}

define_const!(default_read_buffer_size, DEFAULT_READ_BUFFER_SIZE, usize);
define_const!(default_max_input_bytes, DEFAULT_MAX_INPUT_BYTES, usize);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerPoolConfig {
    #[serde(default = "default_pool_capacity")]
    pub capacity: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            capacity: default_pool_capacity(),
        }
    }
}

fn default_pool_capacity() -> usize {
    usize::from(
        std::thread::available_parallelism().unwrap_or(FALLBACK_PARALLELISM),
    ) * 2
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct HttpConfig {
    #[serde(default = "default_max_header_bytes")]
    pub max_header_bytes: usize,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            max_header_bytes: default_max_header_bytes(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

define_const!(default_max_header_bytes, DEFAULT_MAX_HEADER_BYTES, usize);
define_const!(default_max_body_bytes, DEFAULT_MAX_BODY_BYTES, usize);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct WebSocketConfig {
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            max_message_bytes: default_max_message_bytes(),
        }
    }
}

define_const!(default_max_message_bytes, DEFAULT_MAX_MESSAGE_BYTES, usize);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SseConfig {
    /// Reconnection delay advertised to clients as the first event.
    pub retry_ms: Option<u64>,
}

impl Config {
    pub fn new(listener: SocketAddr) -> Self {
        Self {
            runtime: Default::default(),
            server: ServerConfig::new(listener),
        }
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        Self::from_slice(&Self::read_file(path)?)
    }

    pub fn from_slice(content: &[u8]) -> anyhow::Result<Self> {
        // read first non-space u8
        let is_json = match content
            .iter()
            .find(|&&b| b != b' ' && b != b'\r' && b != b'\n' && b != b'\t')
        {
            Some(first) => *first == b'{',
            None => false,
        };
        match is_json {
            true => serde_json::from_slice::<Self>(content).map_err(Into::into),
            false => toml::from_str::<Self>(&String::from_utf8_lossy(content)).map_err(Into::into),
        }
    }

    fn read_file(path: impl AsRef<Path>) -> anyhow::Result<Vec<u8>> {
        let path = path.as_ref();
        let metadata = match std::fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(e) => bail!("Config: error open file {}: {:?}", path.display(), e),
        };
        if metadata.len() > MAX_CONFIG_FILE_SIZE {
            bail!("Config: max file size: {}", MAX_CONFIG_FILE_SIZE);
        }
        Ok(std::fs::read(path)?)
    }
}
