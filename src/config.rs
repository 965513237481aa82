use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::SessionConfig;

/// Default log filter when neither `RUST_LOG` nor the config file sets one.
pub const DEFAULT_LOG_FILTER: &str = "remote_dispatch=info,tower_http=info";

/// Top-level server config, loaded from TOML. Every field has a default, so an
/// empty file is valid.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Overrides the default tracing filter. `RUST_LOG` still wins.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_filter: Option<String>,
    pub server: ServerSection,
    pub sessions: SessionsSection,
    pub simulation: SimulationSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub bind: SocketAddr,
    /// Origins allowed to call the API from a browser. Empty means same-origin only.
    pub cors_origins: Vec<String>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8080)),
            cors_origins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsSection {
    pub session_timeout_secs: u64,
    pub long_poll_timeout_secs: u64,
}

impl Default for SessionsSection {
    fn default() -> Self {
        let d = SessionConfig::default();
        Self {
            session_timeout_secs: d.session_timeout.as_secs(),
            long_poll_timeout_secs: d.long_poll_timeout.as_secs(),
        }
    }
}

impl SessionsSection {
    pub fn to_session_config(&self) -> SessionConfig {
        SessionConfig {
            session_timeout: Duration::from_secs(self.session_timeout_secs),
            long_poll_timeout: Duration::from_secs(self.long_poll_timeout_secs),
        }
    }
}

/// Shape of the demo world generated at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationSection {
    pub tick_ms: u64,
    pub trainsets: u32,
    pub cars_per_trainset: u32,
    pub junctions: u32,
}

impl Default for SimulationSection {
    fn default() -> Self {
        Self {
            tick_ms: 100,
            trainsets: 4,
            cars_per_trainset: 5,
            junctions: 12,
        }
    }
}

impl SimulationSection {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", .path.display())]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {}: {source}", .path.display())]
    ParseFailed {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to serialize config: {0}")]
    SerializeFailed(#[from] toml::ser::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

impl Config {
    /// Load config from a TOML file. Returns `None` if the file doesn't exist.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFailed {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&contents).map_err(|source| ConfigError::ParseFailed {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Some(config))
    }

    /// Load from `path`, falling back to defaults when the file is absent.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        Ok(Self::load(path)?.unwrap_or_default())
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check cross-field constraints the types can't express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.sessions
            .to_session_config()
            .validate()
            .map_err(ConfigError::Invalid)?;
        if self.simulation.tick_ms == 0 {
            return Err(ConfigError::Invalid("simulation tick_ms must be greater than zero".into()));
        }
        Ok(())
    }

    pub fn log_filter(&self) -> &str {
        self.log_filter.as_deref().unwrap_or(DEFAULT_LOG_FILTER)
    }
}

/// `$XDG_CONFIG_HOME/remote-dispatch/config.toml` or the platform equivalent.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("remote-dispatch")
        .join("config.toml")
}
