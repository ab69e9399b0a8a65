//! Configuration for the development broker.
//!
//! Layered, highest priority first:
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/taskflow-broker/config.toml`)
//! 4. Compiled defaults

use std::net::SocketAddr;
use std::path::PathBuf;

use taskflow_proto::stomp::HeartBeat;

use crate::broker::DEFAULT_MAX_PAYLOAD_SIZE;

const DEFAULT_BIND: &str = "127.0.0.1:8080";

/// Errors that can occur when loading broker configuration.
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

    /// The bind address is not `ip:port`.
    #[error("invalid bind address {addr:?}: {source}")]
    InvalidBindAddr {
        /// Address as given.
        addr: String,
        /// Parse failure.
        source: std::net::AddrParseError,
    },
}

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct BrokerConfigFile {
    server: ServerFileConfig,
}

/// `[server]` section.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerFileConfig {
    bind_addr: Option<String>,
    heart_beat_ms: Option<u64>,
    max_payload_size: Option<usize>,
}

/// CLI arguments for the broker.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "taskflow development STOMP broker")]
pub struct BrokerCliArgs {
    /// Address to bind to, as `ip:port`. Port 0 picks a free port.
    #[arg(short, long, env = "TASKFLOW_BROKER_ADDR")]
    pub bind: Option<String>,

    /// Path to config file (default: `~/.config/taskflow-broker/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Heart-beat interval offered to clients, both directions. 0 disables.
    #[arg(long, env = "TASKFLOW_BROKER_HEART_BEAT_MS")]
    pub heart_beat_ms: Option<u64>,

    /// Maximum SEND body size in bytes.
    #[arg(long)]
    pub max_payload_size: Option<usize>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "TASKFLOW_BROKER_LOG")]
    pub log_level: String,
}

/// Fully resolved broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Socket the server listens on.
    pub bind_addr: SocketAddr,
    /// Heart-beat offered in CONNECTED.
    pub heart_beat: HeartBeat,
    /// Maximum SEND body size in bytes.
    pub max_payload_size: usize,
    /// Log level filter string.
    pub log_level: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            heart_beat: HeartBeat::new(4000, 4000),
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            log_level: "info".to_string(),
        }
    }
}

impl BrokerConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// An explicit `--config` that does not exist is an error; a missing
    /// default file is treated as empty.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the config file cannot be read or parsed,
    /// or the bind address is malformed.
    pub fn load(cli: &BrokerCliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Self::resolve(cli, &file)
    }

    /// Priority: CLI > file > default.
    fn resolve(cli: &BrokerCliArgs, file: &BrokerConfigFile) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let bind = cli
            .bind
            .as_deref()
            .or(file.server.bind_addr.as_deref())
            .unwrap_or(DEFAULT_BIND);

        Ok(Self {
            bind_addr: parse_bind(bind)?,
            heart_beat: cli
                .heart_beat_ms
                .or(file.server.heart_beat_ms)
                .map_or(defaults.heart_beat, |ms| HeartBeat::new(ms, ms)),
            max_payload_size: cli
                .max_payload_size
                .or(file.server.max_payload_size)
                .unwrap_or(defaults.max_payload_size),
            log_level: cli.log_level.clone(),
        })
    }
}

fn parse_bind(addr: &str) -> Result<SocketAddr, ConfigError> {
    addr.trim().parse().map_err(|source| ConfigError::InvalidBindAddr {
        addr: addr.to_string(),
        source,
    })
}

fn load_config_file(
    explicit_path: Option<&std::path::Path>,
) -> Result<BrokerConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(BrokerConfigFile::default());
        };
        config_dir.join("taskflow-broker").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BrokerConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
