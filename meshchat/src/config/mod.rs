//! Configuration system for the `MeshChat` client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/meshchat/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::engine::pending::RetryPolicy;
use crate::engine::{DEFAULT_MAX_MESSAGE_LEN, EngineConfig};
use crate::node::DEFAULT_CHANNEL_CAPACITY;
use crate::transport::udp::{self, UdpConfig};

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),

    /// The broadcast address is not an IP address.
    #[error("invalid broadcast address {0:?}")]
    InvalidBroadcastAddr(String),

    /// The message length limit does not fit in a single datagram.
    #[error("max_message_len {configured} exceeds the transport limit of {max} bytes")]
    MessageLimitTooLarge {
        /// Value from the config file.
        configured: usize,
        /// Largest value the transport can carry.
        max: usize,
    },
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    identity: IdentityFileConfig,
    reliability: ReliabilityFileConfig,
    transport: TransportFileConfig,
    chat: ChatFileConfig,
}

/// `[identity]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct IdentityFileConfig {
    name: Option<String>,
}

/// `[reliability]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ReliabilityFileConfig {
    ack_timeout_ms: Option<u64>,
    max_retries: Option<u32>,
    backoff_factor: Option<u32>,
}

/// `[transport]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct TransportFileConfig {
    port: Option<u16>,
    broadcast_addr: Option<String>,
    beacon_interval_ms: Option<u64>,
    peer_timeout_ms: Option<u64>,
}

/// `[chat]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ChatFileConfig {
    max_message_len: Option<usize>,
    channel_capacity: Option<usize>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // -- Identity --
    /// Display name announced to the neighborhood.
    pub name: Option<String>,

    // -- Reliability --
    /// Ack wait timeout for the first attempt.
    pub ack_timeout: Duration,
    /// Resends after the first timeout.
    pub max_retries: u32,
    /// Timeout multiplier per resend.
    pub backoff_factor: u32,

    // -- Transport --
    /// UDP port used for both binding and beacons.
    pub port: u16,
    /// Beacon destination address.
    pub broadcast_addr: IpAddr,
    /// Beacon period.
    pub beacon_interval: Duration,
    /// Silence after which a neighbor is dropped.
    pub peer_timeout: Duration,

    // -- Chat --
    /// Maximum length of a typed message in bytes.
    pub max_message_len: usize,
    /// Capacity of the node command channel.
    pub channel_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let transport = UdpConfig::default();
        let retry = RetryPolicy::default();
        Self {
            name: None,
            ack_timeout: retry.ack_timeout,
            max_retries: retry.max_retries,
            backoff_factor: retry.backoff_factor,
            port: UdpConfig::DEFAULT_PORT,
            broadcast_addr: IpAddr::V4(Ipv4Addr::BROADCAST),
            beacon_interval: transport.beacon_interval,
            peer_timeout: transport.peer_timeout,
            max_message_len: DEFAULT_MAX_MESSAGE_LEN,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// CLI args and env vars are parsed via `clap`. If `--config` is given
    /// and the file does not exist, returns an error. If no `--config` is
    /// given, the default path (`~/.config/meshchat/config.toml`) is tried
    /// and silently ignored if missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the config file cannot be read or parsed,
    /// if the broadcast address is malformed, or if `max_message_len` would
    /// not fit in a datagram.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Self::resolve(cli, &file)
    }

    /// Resolve a `ClientConfig` from CLI args alone, ignoring any config file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidBroadcastAddr`] if `--broadcast-addr`
    /// is malformed.
    pub fn from_cli(cli: &CliArgs) -> Result<Self, ConfigError> {
        Self::resolve(cli, &ConfigFile::default())
    }

    /// Resolve a `ClientConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let broadcast_addr = match cli
            .broadcast_addr
            .as_ref()
            .or(file.transport.broadcast_addr.as_ref())
        {
            Some(raw) => raw
                .parse()
                .map_err(|_| ConfigError::InvalidBroadcastAddr(raw.clone()))?,
            None => defaults.broadcast_addr,
        };

        let max_message_len = file
            .chat
            .max_message_len
            .unwrap_or(defaults.max_message_len);
        if max_message_len > udp::MAX_MESSAGE_LEN {
            return Err(ConfigError::MessageLimitTooLarge {
                configured: max_message_len,
                max: udp::MAX_MESSAGE_LEN,
            });
        }

        Ok(Self {
            name: cli.name.clone().or_else(|| file.identity.name.clone()),
            ack_timeout: cli
                .ack_timeout_ms
                .or(file.reliability.ack_timeout_ms)
                .map_or(defaults.ack_timeout, Duration::from_millis),
            max_retries: cli
                .max_retries
                .or(file.reliability.max_retries)
                .unwrap_or(defaults.max_retries),
            backoff_factor: file
                .reliability
                .backoff_factor
                .unwrap_or(defaults.backoff_factor),
            port: cli.port.or(file.transport.port).unwrap_or(defaults.port),
            broadcast_addr,
            beacon_interval: file
                .transport
                .beacon_interval_ms
                .map_or(defaults.beacon_interval, Duration::from_millis),
            peer_timeout: file
                .transport
                .peer_timeout_ms
                .map_or(defaults.peer_timeout, Duration::from_millis),
            max_message_len,
            channel_capacity: file
                .chat
                .channel_capacity
                .unwrap_or(defaults.channel_capacity),
        })
    }

    /// Build the engine configuration.
    #[must_use]
    pub const fn to_engine_config(&self) -> EngineConfig {
        EngineConfig {
            retry: RetryPolicy {
                ack_timeout: self.ack_timeout,
                max_retries: self.max_retries,
                backoff_factor: self.backoff_factor,
            },
            max_message_len: self.max_message_len,
        }
    }

    /// Build the UDP transport configuration.
    #[must_use]
    pub fn to_udp_config(&self) -> UdpConfig {
        UdpConfig {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.port),
            broadcast_addr: SocketAddr::new(self.broadcast_addr, self.port),
            beacon_interval: self.beacon_interval,
            peer_timeout: self.peer_timeout,
        }
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Infrastructure-less flooding chat for the local network")]
pub struct CliArgs {
    /// Display name announced to other peers (default: host user name).
    #[arg(long, short, env = "MESHCHAT_NAME")]
    pub name: Option<String>,

    /// UDP port shared by every peer on the segment.
    #[arg(long, env = "MESHCHAT_PORT")]
    pub port: Option<u16>,

    /// Address beacons are broadcast to.
    #[arg(long, env = "MESHCHAT_BROADCAST")]
    pub broadcast_addr: Option<String>,

    /// Milliseconds to wait for an acknowledgment.
    #[arg(long)]
    pub ack_timeout_ms: Option<u64>,

    /// Resends after an ack timeout (0 = report failure immediately).
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Path to config file (default: `~/.config/meshchat/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "MESHCHAT_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/meshchat.log`).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and missing file
/// is treated as empty config.
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(ConfigFile::default());
        };
        config_dir.join("meshchat").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
