//! Konfigurasi server dan client
//!
//! Tidak ada file config; binary mengisi struct ini dari flag CLI.

use std::time::Duration;

use super::net_addr::NetAddress;
use crate::core::DEFAULT_EVENTS_CAPACITY;
use crate::error::{NetError, Result};
use crate::protocol::DEFAULT_MAX_FRAME_LEN;

pub const DEFAULT_BUFFER_SIZE: usize = 128;
pub const DEFAULT_IO_THREADS: usize = 4;
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(75);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: NetAddress,
    pub io_threads: usize,
    /// Kapasitas awal in/out buffer per connection
    pub buffer_size: usize,
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
    pub max_frame_len: usize,
    pub nodelay: bool,
    pub events_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: NetAddress::from(std::net::SocketAddr::from(([0, 0, 0, 0], 9999))),
            io_threads: DEFAULT_IO_THREADS,
            buffer_size: DEFAULT_BUFFER_SIZE,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            nodelay: true,
            events_capacity: DEFAULT_EVENTS_CAPACITY,
        }
    }
}

impl ServerConfig {
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }

    pub fn validate(&self) -> Result<()> {
        if self.io_threads == 0 {
            return Err(NetError::Config("io_threads must be at least 1".into()));
        }
        if self.buffer_size == 0 {
            return Err(NetError::Config("buffer_size must be non-zero".into()));
        }
        if self.sweep_interval.is_zero() {
            return Err(NetError::Config("sweep_interval must be non-zero".into()));
        }
        if self.events_capacity == 0 {
            return Err(NetError::Config("events_capacity must be non-zero".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    pub fn bind_addr(mut self, addr: NetAddress) -> Self {
        self.config.bind_addr = addr;
        self
    }

    pub fn io_threads(mut self, n: usize) -> Self {
        self.config.io_threads = n;
        self
    }

    pub fn buffer_size(mut self, size: usize) -> Self {
        self.config.buffer_size = size;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.config.sweep_interval = interval;
        self
    }

    pub fn max_frame_len(mut self, len: usize) -> Self {
        self.config.max_frame_len = len;
        self
    }

    pub fn nodelay(mut self, enabled: bool) -> Self {
        self.config.nodelay = enabled;
        self
    }

    pub fn events_capacity(mut self, capacity: usize) -> Self {
        self.config.events_capacity = capacity;
        self
    }

    pub fn build(self) -> Result<ServerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub buffer_size: usize,
    pub max_frame_len: usize,
    pub nodelay: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            nodelay: true,
        }
    }
}
