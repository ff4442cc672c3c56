use serde::Deserialize;
use std::time::Duration;
use std::convert::TryFrom;

use crate::net::KeepAlive;
use crate::pool::PoolLimits;

/// Largest response head accepted before failing with `HeadTooLarge`.
pub const DEFAULT_MAX_HEAD_SIZE: usize = 64 * 1024;
/// Size of a single `recv` on a connection.
pub const DEFAULT_RECV_BUFFER_SIZE: usize = 4096;
/// Handshake I/O rounds before a TLS connect is abandoned.
pub const DEFAULT_HANDSHAKE_RETRIES: u32 = 254;

/// Configuration for the HTTP client and its connection pool.
///
/// Read from a `ferrule` config file (if present) and from environment
/// variables with the "FERRULE_" prefix, e.g. `FERRULE_POOL_TOTAL_SIZE=20`.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Idle connections kept across all destinations. Unlimited when unset.
    #[serde(default)]
    pub pool_total_size: Option<usize>,
    /// Idle connections kept per (host, port). Unlimited when unset.
    #[serde(default)]
    pub pool_destination_size: Option<usize>,
    /// Idle connections older than this are closed by a periodic sweep.
    #[serde(default)]
    pub pool_unused_timeout_secs: Option<f64>,
    /// Default deadline for a whole request
    #[serde(default)]
    pub request_timeout_secs: Option<f64>,
    #[serde(default = "default_max_head_size")]
    pub max_head_size: usize,
    #[serde(default = "default_recv_buffer_size")]
    pub recv_buffer_size: usize,
    #[serde(default = "default_handshake_retries")]
    pub handshake_retries: u32,
    #[serde(default = "default_keepalive_idle_secs")]
    pub keepalive_idle_secs: u64,
    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,
    #[serde(default = "default_keepalive_count")]
    pub keepalive_count: u32,
}

impl TryFrom<config::Config> for ClientConfig {
    type Error = config::ConfigError;

    fn try_from(config: config::Config) -> Result<Self, Self::Error> {
        config.try_deserialize()
    }
}

impl ClientConfig {
    /// Loads `.env`, then the optional `ferrule` config file, then `FERRULE_*`
    /// environment variables, later sources overriding earlier ones.
    ///
    /// # Errors
    /// Returns a ConfigError if a source cannot be read or a value does not parse.
    pub fn new() -> Result<Self, config::ConfigError> {
        dotenv::dotenv().ok();

        let builder = config::Config::builder()
            .add_source(config::File::with_name("ferrule").required(false))
            .add_source(config::Environment::with_prefix("FERRULE"));

        builder.build()?.try_into()
    }

    pub fn pool_limits(&self) -> PoolLimits {
        PoolLimits {
            total_size: self.pool_total_size,
            destination_size: self.pool_destination_size,
        }
    }

    pub fn unused_timeout(&self) -> Option<Duration> {
        self.pool_unused_timeout_secs.and_then(secs_to_duration)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.and_then(secs_to_duration)
    }

    pub fn keepalive(&self) -> KeepAlive {
        KeepAlive {
            idle: Duration::from_secs(self.keepalive_idle_secs),
            interval: Duration::from_secs(self.keepalive_interval_secs),
            count: self.keepalive_count,
        }
    }
}

// Negative or non-finite values disable the setting.
fn secs_to_duration(secs: f64) -> Option<Duration> {
    match Duration::try_from_secs_f64(secs) {
        Ok(duration) => Some(duration),
        Err(err) => {
            log::warn!("ignoring duration of {} seconds: {}", secs, err);
            None
        }
    }
}

fn default_max_head_size() -> usize {
    DEFAULT_MAX_HEAD_SIZE
}

fn default_recv_buffer_size() -> usize {
    DEFAULT_RECV_BUFFER_SIZE
}

fn default_handshake_retries() -> u32 {
    DEFAULT_HANDSHAKE_RETRIES
}

fn default_keepalive_idle_secs() -> u64 {
    600
}

fn default_keepalive_interval_secs() -> u64 {
    75
}

fn default_keepalive_count() -> u32 {
    9
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            pool_total_size: None,
            pool_destination_size: None,
            pool_unused_timeout_secs: None,
            request_timeout_secs: None,
            max_head_size: DEFAULT_MAX_HEAD_SIZE,
            recv_buffer_size: DEFAULT_RECV_BUFFER_SIZE,
            handshake_retries: DEFAULT_HANDSHAKE_RETRIES,
            keepalive_idle_secs: 600,
            keepalive_interval_secs: 75,
            keepalive_count: 9,
        }
    }
}
