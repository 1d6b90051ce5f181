use clap::Parser;
use std::time::Duration;

use crate::frame::{Limits, DEFAULT_MAX_ARRAY_LEN, DEFAULT_MAX_BULK_LEN, DEFAULT_MAX_DEPTH};

pub const DEFAULT_ADDR: &str = "127.0.0.1:6379";

/// Server settings. Every flag can also be given through the environment.
#[derive(Parser, Debug, Clone, PartialEq)]
#[command(name = "respkv", version, about)]
pub struct Config {
    /// The address to listen on, port 0 picks an ephemeral port
    #[arg(short, long, env = "RESPKV_ADDR", default_value = DEFAULT_ADDR)]
    pub addr: String,

    /// Largest bulk string accepted from clients, in bytes
    #[arg(long, env = "RESPKV_MAX_BULK_LEN", default_value_t = DEFAULT_MAX_BULK_LEN)]
    pub max_bulk_len: usize,

    /// Largest number of elements accepted in a single array
    #[arg(long, env = "RESPKV_MAX_ARRAY_LEN", default_value_t = DEFAULT_MAX_ARRAY_LEN)]
    pub max_array_len: usize,

    /// Deepest array nesting accepted from clients
    #[arg(long, env = "RESPKV_MAX_DEPTH", default_value_t = DEFAULT_MAX_DEPTH)]
    pub max_depth: usize,

    /// Pause between two passes of the control loop, in microseconds
    #[arg(long, env = "RESPKV_POLL_INTERVAL_US", default_value_t = 50)]
    pub poll_interval_us: u64,

    /// Extra event loop passes given to in-flight operations during shutdown
    #[arg(long, env = "RESPKV_SHUTDOWN_PASSES", default_value_t = 32)]
    pub shutdown_passes: usize,

    /// Size of the per-connection read buffer, in bytes
    #[arg(long, env = "RESPKV_READ_BUFFER_SIZE", default_value_t = 4096)]
    pub read_buffer_size: usize,
}

impl Config {
    /// Default settings listening on `addr`.
    pub fn with_addr(addr: impl Into<String>) -> Config {
        Config {
            addr: addr.into(),
            ..Config::default()
        }
    }

    pub fn parser_limits(&self) -> Limits {
        Limits {
            max_bulk_len: self.max_bulk_len,
            max_array_len: self.max_array_len,
            max_depth: self.max_depth,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.poll_interval_us)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            addr: DEFAULT_ADDR.to_string(),
            max_bulk_len: DEFAULT_MAX_BULK_LEN,
            max_array_len: DEFAULT_MAX_ARRAY_LEN,
            max_depth: DEFAULT_MAX_DEPTH,
            poll_interval_us: 50,
            shutdown_passes: 32,
            read_buffer_size: 4096,
        }
    }
}
