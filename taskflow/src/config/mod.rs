//! Configuration system for the `taskflow` client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/taskflow/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

use taskflow_proto::model::{EntityId, TaskStatus};
use taskflow_proto::stomp::HeartBeat;

use crate::http::HttpConfig;
use crate::realtime::RealtimeConfig;

/// Default REST base URL of a local development server.
pub const DEFAULT_API_URL: &str = "http://localhost:8080/api";

/// Default raw WebSocket endpoint of a local development server.
pub const DEFAULT_WS_URL: &str = "ws://localhost:8080/ws/websocket";

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

    /// A configured URL could not be parsed.
    #[error("invalid {field} url {value:?}: {source}")]
    InvalidUrl {
        /// Which setting.
        field: &'static str,
        /// Offending value.
        value: String,
        /// Parser error.
        source: url::ParseError,
    },
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    api: ApiFileConfig,
    realtime: RealtimeFileConfig,
    cache: CacheFileConfig,
    session: SessionFileConfig,
}

/// `[api]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ApiFileConfig {
    base_url: Option<String>,
    request_timeout_secs: Option<u64>,
    refresh_timeout_secs: Option<u64>,
}

/// `[realtime]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct RealtimeFileConfig {
    url: Option<String>,
    connect_timeout_secs: Option<u64>,
    reconnect_delay_ms: Option<u64>,
    heartbeat_ms: Option<u64>,
}

/// `[cache]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct CacheFileConfig {
    stale_time_secs: Option<u64>,
    gc_time_secs: Option<u64>,
    activity_poll_secs: Option<u64>,
}

/// `[session]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct SessionFileConfig {
    file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // -- REST --
    /// Base URL every REST path is appended to.
    pub api_base_url: String,
    /// Per-request timeout for ordinary calls.
    pub request_timeout: Duration,
    /// Timeout for the refresh-token round trip.
    pub refresh_timeout: Duration,

    // -- Realtime --
    /// STOMP WebSocket endpoint.
    pub ws_url: String,
    /// Timeout for the socket connect and the STOMP handshake.
    pub connect_timeout: Duration,
    /// Fixed delay between reconnect attempts.
    pub reconnect_delay: Duration,
    /// Heart-beat interval offered in both directions; zero disables.
    pub heartbeat_ms: u64,

    // -- Cache --
    /// Age after which a cached entry is refetched on read.
    pub stale_time: Duration,
    /// How long an unwatched entry is kept after its last use.
    pub gc_time: Duration,
    /// How often the activity feed is refreshed.
    pub activity_poll_interval: Duration,

    // -- Session --
    /// Where credentials are persisted. `None` uses the platform data dir.
    pub session_file: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_URL.to_string(),
            request_timeout: Duration::from_secs(30),
            refresh_timeout: Duration::from_secs(10),
            ws_url: DEFAULT_WS_URL.to_string(),
            connect_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_millis(5000),
            heartbeat_ms: 4000,
            stale_time: Duration::from_secs(30),
            gc_time: Duration::from_secs(300),
            activity_poll_interval: Duration::from_secs(30),
            session_file: None,
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read
    /// or parsed, or if a resolved URL is malformed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        let config = Self::resolve(cli, &file);
        config.validate()?;
        Ok(config)
    }

    /// Priority: CLI > file > default. Kept apart from `load()` so it can be
    /// tested without CLI parsing or the filesystem.
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();

        Self {
            api_base_url: cli
                .api_url
                .clone()
                .or_else(|| file.api.base_url.clone())
                .unwrap_or(defaults.api_base_url),
            request_timeout: file
                .api
                .request_timeout_secs
                .map_or(defaults.request_timeout, Duration::from_secs),
            refresh_timeout: file
                .api
                .refresh_timeout_secs
                .map_or(defaults.refresh_timeout, Duration::from_secs),
            ws_url: cli
                .ws_url
                .clone()
                .or_else(|| file.realtime.url.clone())
                .unwrap_or(defaults.ws_url),
            connect_timeout: file
                .realtime
                .connect_timeout_secs
                .map_or(defaults.connect_timeout, Duration::from_secs),
            reconnect_delay: file
                .realtime
                .reconnect_delay_ms
                .map_or(defaults.reconnect_delay, Duration::from_millis),
            heartbeat_ms: file.realtime.heartbeat_ms.unwrap_or(defaults.heartbeat_ms),
            stale_time: file
                .cache
                .stale_time_secs
                .map_or(defaults.stale_time, Duration::from_secs),
            gc_time: file
                .cache
                .gc_time_secs
                .map_or(defaults.gc_time, Duration::from_secs),
            activity_poll_interval: file
                .cache
                .activity_poll_secs
                .map_or(defaults.activity_poll_interval, Duration::from_secs),
            session_file: cli
                .session_file
                .clone()
                .or_else(|| file.session.file.clone()),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [("api", &self.api_base_url), ("realtime", &self.ws_url)] {
            url::Url::parse(value).map_err(|source| ConfigError::InvalidUrl {
                field,
                value: value.clone(),
                source,
            })?;
        }
        Ok(())
    }

    /// Settings for [`crate::http::HttpClient`].
    #[must_use]
    pub fn to_http_config(&self) -> HttpConfig {
        HttpConfig {
            base_url: self.api_base_url.clone(),
            request_timeout: self.request_timeout,
            refresh_timeout: self.refresh_timeout,
        }
    }

    /// Settings for [`crate::realtime::RealtimeBridge`].
    #[must_use]
    pub fn to_realtime_config(&self) -> RealtimeConfig {
        RealtimeConfig {
            url: self.ws_url.clone(),
            connect_timeout: self.connect_timeout,
            reconnect_delay: self.reconnect_delay,
            heart_beat: HeartBeat::new(self.heartbeat_ms, self.heartbeat_ms),
        }
    }

    /// Credential file location: explicit setting, else
    /// `<data_dir>/taskflow/session.json`.
    #[must_use]
    pub fn session_path(&self) -> Option<PathBuf> {
        self.session_file.clone().or_else(|| {
            dirs::data_dir().map(|d| d.join("taskflow").join("session.json"))
        })
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Task manager client with live updates")]
pub struct CliArgs {
    /// REST API base URL.
    #[arg(long, global = true, env = "TASKFLOW_API_URL")]
    pub api_url: Option<String>,

    /// STOMP WebSocket endpoint.
    #[arg(long, global = true, env = "TASKFLOW_WS_URL")]
    pub ws_url: Option<String>,

    /// Path to config file (default: `~/.config/taskflow/config.toml`).
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Where to persist the session (default: platform data dir).
    #[arg(long, global = true)]
    pub session_file: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info", env = "TASKFLOW_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/taskflow.log`).
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    /// What to do.
    #[command(subcommand)]
    pub command: Option<CliCommand>,
}

/// Subcommands of the `taskflow` binary.
#[derive(clap::Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum CliCommand {
    /// Log in and persist the session.
    Login {
        /// Account name.
        username: String,
        /// Password; read from `TASKFLOW_PASSWORD` when omitted.
        #[arg(long, env = "TASKFLOW_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Create an account. Log in afterwards.
    Register {
        /// Account name.
        username: String,
        /// Address invitations are sent to.
        email: String,
        /// Password; read from `TASKFLOW_PASSWORD` when omitted.
        #[arg(long, env = "TASKFLOW_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// End the session.
    Logout,
    /// Print the logged-in user.
    Whoami,
    /// List tasks.
    Tasks {
        /// Only tasks in this column (`TO_DO`, `IN_PROGRESS`, `COMPLETED`).
        #[arg(long, value_parser = parse_status)]
        status: Option<TaskStatus>,
    },
    /// Move a task to another column.
    Move {
        /// Task id.
        id: EntityId,
        /// Target column.
        #[arg(value_parser = parse_status)]
        status: TaskStatus,
    },
    /// Stay connected and print task counts as they change.
    Watch {
        /// Also follow one group's task topic.
        #[arg(long)]
        group: Option<EntityId>,
    },
}

fn parse_status(s: &str) -> Result<TaskStatus, String> {
    TaskStatus::parse(s).ok_or_else(|| format!("unknown status {s:?}"))
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file.
///
/// An explicit path must exist. The default path is optional.
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
        config_dir.join("taskflow").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
