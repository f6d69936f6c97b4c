//! Configuration loading and constants.
//!
//! Loads server configuration from a TOML file and defines constants for
//! history sharding, fetch pacing, pool maintenance, transfer thresholds,
//! and expiry batching. `AppConfig` is the root configuration struct.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::{Result, SpoolError};

// =============================================================================
// History Index Constants
// =============================================================================

/// Number of shard database files (selected by the first hex character).
pub const HISTORY_SHARD_COUNT: usize = 16;

/// Number of tables per shard (selected by hex characters 1..3).
pub const HISTORY_TABLE_COUNT: usize = 256;

/// Default length of the per-shard hash key (hex characters 3..3+len).
pub const DEFAULT_SHORT_HASH_LEN: u8 = 7;

/// Permitted range for the short hash key length.
pub const MIN_SHORT_HASH_LEN: u8 = 2;
pub const MAX_SHORT_HASH_LEN: u8 = 7;

/// Capacity of the history append-log writer queue.
pub const HISTORY_WRITER_QUEUE_CAPACITY: usize = 256;

/// Maximum records the log writer batches into one flush+fsync.
pub const HISTORY_WRITER_BATCH: usize = 64;

/// Capacity of the in-memory Message-ID fast-path cache.
pub const MSGID_CACHE_CAPACITY: u64 = 100_000;

// =============================================================================
// Fetcher Constants
// =============================================================================

/// Article numbers walked per chunk; the watermark checkpoints at chunk ends.
pub const FETCH_CHUNK_SIZE: u64 = 10_000;

/// Transient-error retry attempts per article.
pub const FETCH_RETRY_ATTEMPTS: u32 = 3;

/// Base delay for exponential retry backoff.
pub const FETCH_RETRY_BASE_SECS: u64 = 1;

/// Cap on the retry backoff delay.
pub const FETCH_RETRY_CAP_SECS: u64 = 30;

/// Capacity of the processor's inbound article queue (fetcher backpressure).
pub const INGEST_QUEUE_CAPACITY: usize = 100;

/// Pause between full fetch passes in daemon mode.
pub const FETCH_PASS_INTERVAL_SECS: u64 = 300;

/// A provider marked Failed is retried after this long.
pub const PROVIDER_FAILED_RESET_SECS: u64 = 600;

/// Consecutive transient failures before a provider is throttled.
pub const PROVIDER_THROTTLE_AFTER: u32 = 3;

// =============================================================================
// Network Timeout Constants
// =============================================================================

/// TCP/TLS connect deadline for upstream dials.
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Per-read deadline on upstream connections.
pub const READ_TIMEOUT_SECS: u64 = 120;

/// How long a caller waits for a free pooled connection.
pub const POOL_GET_DEADLINE_SECS: u64 = 60;

// =============================================================================
// Connection Pool Constants
// =============================================================================

/// Interval between idle-connection reaper scans.
pub const POOL_REAP_INTERVAL_SECS: u64 = 5;

/// Connections idle longer than this are closed by the reaper.
pub const POOL_IDLE_TIMEOUT_SECS: u64 = 60;

/// Delay before reconnecting after an upstream connection failure.
pub const RECONNECT_DELAY_SECS: u64 = 5;

// =============================================================================
// Per-Group Store Constants
// =============================================================================

/// Group handles idle longer than this are closed by the handle reaper.
pub const GROUP_HANDLE_IDLE_SECS: u64 = 300;

/// Interval between group-handle reaper scans.
pub const GROUP_HANDLE_REAP_INTERVAL_SECS: u64 = 30;

/// Articles with `DateSent` more than this far in the future never advance
/// thread activity.
pub const FUTURE_DATE_SLACK_SECS: i64 = 7_200;

// =============================================================================
// Transfer Constants
// =============================================================================

/// Minimum offers before the success rate is evaluated at all.
pub const XFER_RATE_MIN_TOTAL: u64 = 10;

/// Below this success rate, switch to CHECK-first mode.
pub const XFER_CHECK_FIRST_BELOW: f64 = 0.95;

/// Offers required before switching back to TAKETHIS-direct is considered.
pub const XFER_DIRECT_MIN_TOTAL: u64 = 20;

/// At or above this success rate, switch back to TAKETHIS-direct mode.
pub const XFER_DIRECT_ABOVE: f64 = 0.98;

/// Message-IDs per CHECK batch (protocol bounds 1..=100).
pub const XFER_CHECK_BATCH_SIZE: usize = 25;
pub const XFER_CHECK_BATCH_MAX: usize = 100;

/// TAKETHIS commands pipelined per window in direct mode; the success rate
/// is re-evaluated at window boundaries.
pub const XFER_DIRECT_WINDOW: usize = 10;

/// Attempts before a deferred article is treated as rejected.
pub const XFER_DEFER_MAX_ATTEMPTS: u32 = 3;

/// Poll interval for the post-queue runner when the queue is empty.
pub const XFER_QUEUE_POLL_SECS: u64 = 10;

// =============================================================================
// Expiry Constants
// =============================================================================

/// Article IDs deleted per transaction, bounded by SQLite parameter limits.
pub const EXPIRE_DELETE_CHUNK: usize = 5_000;

// =============================================================================
// Server Constants
// =============================================================================

/// Maximum accepted line length on a reader/peer connection.
pub const SERVER_MAX_LINE_BYTES: usize = 4_096;

/// Maximum accepted article size on POST/TAKETHIS when no group limit applies.
pub const SERVER_MAX_ARTICLE_BYTES: u64 = 4 * 1024 * 1024;

/// Per-command read deadline on client connections.
pub const SERVER_READ_TIMEOUT_SECS: u64 = 600;

// =============================================================================
// Bridge Constants
// =============================================================================

/// Capacity of the best-effort bridge event queue; events beyond this drop.
pub const BRIDGE_QUEUE_CAPACITY: usize = 256;

// =============================================================================
// Default Paths and Strings
// =============================================================================

/// Default configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "spool.toml";

/// Default log filter when RUST_LOG is not set.
pub const DEFAULT_LOG_FILTER: &str = "spool=info";

/// Default log format (text or json).
pub const DEFAULT_LOG_FORMAT: &str = "text";

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Local hostname used in generated Path headers. Required.
    pub hostname: String,
    /// Root directory for the main DB, group DBs, and history files.
    #[serde(default = "AppConfig::default_data_dir")]
    pub data_dir: PathBuf,
    /// Requested short hash key length (2-7). Locked after first run;
    /// a mismatch against the locked value warns and is ignored.
    #[serde(default = "AppConfig::default_short_hash_len")]
    pub short_hash_len: u8,
    /// NNTP listener configuration.
    pub server: ServerConfig,
    /// Upstream providers articles are fetched from.
    #[serde(default)]
    pub provider: Vec<ProviderConfig>,
    /// Peers locally accepted articles are offered to.
    #[serde(default)]
    pub peer: Vec<PeerConfig>,
    /// Active file read on bootstrap (missing groups created, never overwritten).
    pub active_file: Option<PathBuf>,
    /// Descriptions file read on bootstrap.
    pub descriptions_file: Option<PathBuf>,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    fn default_data_dir() -> PathBuf {
        PathBuf::from("data")
    }

    fn default_short_hash_len() -> u8 {
        DEFAULT_SHORT_HASH_LEN
    }

    /// Load and validate configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            SpoolError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: AppConfig = toml::from_str(&raw)
            .map_err(|e| SpoolError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.hostname.is_empty() {
            return Err(SpoolError::Config("hostname must be set".into()));
        }
        if !(MIN_SHORT_HASH_LEN..=MAX_SHORT_HASH_LEN).contains(&self.short_hash_len) {
            return Err(SpoolError::Config(format!(
                "short_hash_len must be {}-{}, got {}",
                MIN_SHORT_HASH_LEN, MAX_SHORT_HASH_LEN, self.short_hash_len
            )));
        }
        for p in &self.provider {
            if p.max_conns == 0 {
                return Err(SpoolError::Config(format!(
                    "provider {}: max_conns must be at least 1",
                    p.name
                )));
            }
        }
        Ok(())
    }
}

/// NNTP listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Plain-text listen address, e.g. "0.0.0.0:119".
    pub listen: String,
    /// Implicit-TLS listen address, e.g. "0.0.0.0:563".
    pub tls_listen: Option<String>,
    /// PEM certificate chain for the TLS listener.
    pub tls_cert: Option<PathBuf>,
    /// PEM private key for the TLS listener.
    pub tls_key: Option<PathBuf>,
    /// Require AUTHINFO before reader commands.
    #[serde(default)]
    pub auth_required: bool,
    /// Allow POST from anonymous sessions.
    #[serde(default = "ServerConfig::default_anonymous_posting")]
    pub anonymous_posting: bool,
}

impl ServerConfig {
    fn default_anonymous_posting() -> bool {
        true
    }
}

/// Configuration for one upstream provider.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    /// Provider name (used for logging and watermark rows).
    pub name: String,
    pub host: String,
    pub port: u16,
    /// Use implicit TLS for connections to this provider.
    #[serde(default)]
    pub ssl: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Maximum concurrent connections (also the fetch worker count).
    #[serde(default = "ProviderConfig::default_max_conns")]
    pub max_conns: usize,
    /// Lower numbers are tried first.
    #[serde(default)]
    pub priority: i32,
    /// Skip articles larger than this many bytes (0 = unlimited).
    #[serde(default)]
    pub max_art_size: u64,
    /// Whether this provider accepts POST.
    #[serde(default)]
    pub posting: bool,
    #[serde(default)]
    pub enabled: Option<bool>,
    /// Optional SOCKS5 proxy for this provider.
    pub proxy: Option<ProxyConfig>,
}

impl ProviderConfig {
    fn default_max_conns() -> usize {
        4
    }

    pub fn enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    pub fn has_credentials(&self) -> bool {
        self.username.is_some() && self.password.is_some()
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// SOCKS5 proxy settings for an upstream provider.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "ProxyConfig::default_enabled")]
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ProxyConfig {
    fn default_enabled() -> bool {
        true
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Configuration for one downstream peer articles are offered to.
#[derive(Debug, Clone, Deserialize)]
pub struct PeerConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub ssl: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Only offer articles from groups matching this wildmat.
    #[serde(default = "PeerConfig::default_groups")]
    pub groups: String,
}

impl PeerConfig {
    fn default_groups() -> String {
        "*".to_string()
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "text" or "json".
    #[serde(default = "LoggingConfig::default_format")]
    pub format: String,
    /// Log filter used when RUST_LOG is not set.
    #[serde(default = "LoggingConfig::default_filter")]
    pub filter: String,
}

impl LoggingConfig {
    fn default_format() -> String {
        DEFAULT_LOG_FORMAT.to_string()
    }

    fn default_filter() -> String {
        DEFAULT_LOG_FILTER.to_string()
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: Self::default_format(),
            filter: Self::default_filter(),
        }
    }
}
