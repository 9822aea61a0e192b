//! Configuration types for genproxy

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::fingerprint::FingerprintPolicy;
use crate::intercept::InterceptionRule;
use crate::{GenproxyError, Result};

/// Default listen address
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8500";

/// Default storage key prefix
pub const DEFAULT_KEY_PREFIX: &str = "genproxy:";

/// Longest accepted recording TTL: 100 years
pub const MAX_TTL_SECS: u64 = 100 * 365 * 24 * 60 * 60;

/// Operating mode, fixed for the lifetime of the process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Forward requests upstream and store the responses
    Record,
    /// Serve stored responses without contacting the upstream
    #[serde(alias = "replay")]
    Playback,
}

impl Mode {
    /// Check if mode is Record
    #[must_use]
    pub fn is_record(&self) -> bool {
        matches!(self, Mode::Record)
    }

    /// Check if mode is Playback
    #[must_use]
    pub fn is_playback(&self) -> bool {
        matches!(self, Mode::Playback)
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Mode::Record => "record",
            Mode::Playback => "playback",
        })
    }
}

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Operating mode
    #[serde(default = "default_mode")]
    pub mode: Mode,
    /// Proxy listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    /// Interception rule patterns
    #[serde(default)]
    pub intercept: InterceptConfig,
    /// Recording storage
    #[serde(default)]
    pub storage: StorageConfig,
    /// Fingerprint inclusion policy
    #[serde(default)]
    pub fingerprint: FingerprintPolicy,
    /// Playback miss handling
    #[serde(default)]
    pub playback: PlaybackConfig,
    /// Resource limits
    #[serde(default)]
    pub limits: LimitsConfig,
}

fn default_mode() -> Mode {
    Mode::Playback
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8500))
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            listen_addr: default_listen_addr(),
            intercept: InterceptConfig::default(),
            storage: StorageConfig::default(),
            fingerprint: FingerprintPolicy::default(),
            playback: PlaybackConfig::default(),
            limits: LimitsConfig::default(),
        }
    }
}

/// Interception patterns
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterceptConfig {
    /// Regex over CONNECT `host:port` selecting tunnels to decrypt
    #[serde(default = "default_connect_hosts")]
    pub connect_hosts: String,
    /// Regex over request `host:port` selecting managed destinations
    #[serde(default = "default_destination")]
    pub destination: String,
}

fn default_connect_hosts() -> String {
    "^.*$".to_string()
}

fn default_destination() -> String {
    "^.*:80$".to_string()
}

impl Default for InterceptConfig {
    fn default() -> Self {
        Self {
            connect_hosts: default_connect_hosts(),
            destination: default_destination(),
        }
    }
}

/// Storage backend kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Redis (or any RESP-compatible server)
    Redis,
    /// In-process map; recordings die with the process
    Memory,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Backend kind
    #[serde(default = "default_backend")]
    pub backend: Backend,
    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    /// Prefix for every recording key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Timeout for a single get/put, in milliseconds
    #[serde(default = "default_storage_timeout_ms")]
    pub timeout_ms: u64,
    /// Recording expiry in seconds; 0 keeps recordings forever
    #[serde(default)]
    pub ttl_secs: u64,
}

fn default_backend() -> Backend {
    Backend::Redis
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

fn default_storage_timeout_ms() -> u64 {
    2000
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            redis_url: default_redis_url(),
            key_prefix: default_key_prefix(),
            timeout_ms: default_storage_timeout_ms(),
            ttl_secs: 0,
        }
    }
}

impl StorageConfig {
    /// Per-operation timeout
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Write TTL, if any
    #[must_use]
    pub fn ttl(&self) -> Option<Duration> {
        (self.ttl_secs > 0).then(|| Duration::from_secs(self.ttl_secs))
    }
}

/// What the front-end does when playback finds no recording
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissPolicy {
    /// Answer with `miss_status`
    Error,
    /// Forward live to the upstream without recording
    Passthrough,
}

/// Playback configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackConfig {
    /// Miss handling
    #[serde(default = "default_on_miss")]
    pub on_miss: MissPolicy,
    /// Status code for misses under [`MissPolicy::Error`]
    #[serde(default = "default_miss_status")]
    pub miss_status: u16,
}

fn default_on_miss() -> MissPolicy {
    MissPolicy::Error
}

fn default_miss_status() -> u16 {
    502
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            on_miss: default_on_miss(),
            miss_status: default_miss_status(),
        }
    }
}

/// Resource limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum concurrent connections
    pub max_connections: usize,
    /// Maximum request size in bytes
    pub max_request_size: usize,
    /// Maximum response size in bytes
    pub max_response_size: usize,
    /// Maximum headers per request
    pub max_headers: usize,
    /// Upstream request timeout in milliseconds
    pub upstream_timeout_ms: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: 4096,
            max_request_size: 16 * 1024 * 1024,   // 16 MB
            max_response_size: 256 * 1024 * 1024, // 256 MB
            max_headers: 128,
            upstream_timeout_ms: 30_000,
        }
    }
}

impl LimitsConfig {
    /// Upstream request timeout
    #[must_use]
    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream_timeout_ms)
    }
}

impl Config {
    /// Load configuration from TOML file
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read or parsed
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| GenproxyError::Config(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string
    ///
    /// # Errors
    ///
    /// Returns error if the document cannot be parsed or fails validation
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| GenproxyError::Config(format!("Failed to parse config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns error if configuration is invalid
    pub fn validate(&self) -> Result<()> {
        InterceptionRule::from_config(&self.intercept)?;

        if self.storage.key_prefix.is_empty() {
            return Err(GenproxyError::Config(
                "storage.key_prefix cannot be empty".to_string(),
            ));
        }

        if self.storage.backend == Backend::Redis && self.storage.redis_url.trim().is_empty() {
            return Err(GenproxyError::Config(
                "storage.redis_url is required for the redis backend".to_string(),
            ));
        }

        if self.storage.timeout_ms == 0 {
            return Err(GenproxyError::Config(
                "storage.timeout_ms must be > 0".to_string(),
            ));
        }

        if self.storage.ttl_secs > MAX_TTL_SECS {
            return Err(GenproxyError::Config(format!(
                "storage.ttl_secs must be at most {MAX_TTL_SECS}, got {}",
                self.storage.ttl_secs
            )));
        }

        if !(400..=599).contains(&self.playback.miss_status) {
            return Err(GenproxyError::Config(format!(
                "playback.miss_status must be a 4xx or 5xx code, got {}",
                self.playback.miss_status
            )));
        }

        let limits = &self.limits;
        for (name, value) in [
            ("max_connections", limits.max_connections),
            ("max_request_size", limits.max_request_size),
            ("max_response_size", limits.max_response_size),
            ("max_headers", limits.max_headers),
        ] {
            if value == 0 {
                return Err(GenproxyError::Config(format!("limits.{name} must be > 0")));
            }
        }

        if limits.upstream_timeout_ms == 0 {
            return Err(GenproxyError::Config(
                "limits.upstream_timeout_ms must be > 0".to_string(),
            ));
        }

        for name in self.fingerprint.volatile_inclusions() {
            warn!(
                "fingerprint.include_headers contains volatile header '{}'; keys may never repeat",
                name
            );
        }

        Ok(())
    }
}
