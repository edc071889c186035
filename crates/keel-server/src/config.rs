//! Server configuration.
//!
//! Resolution order is defaults, then the TOML file, then CLI flags and
//! `KEEL_*` environment variables (applied by the binary). The resolved
//! [`ServerConfig`] is passed down explicitly; nothing reads it from a
//! global.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use keel_core::{ArenaConfig, PoolConfig};
use keel_persistence::RecoveryPolicy;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config file '{path}': {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("invalid bind address '{0}'")]
    BindAddr(String),

    #[error("{0}")]
    Invalid(String),
}

/// Everything `keel-server` needs to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind: String,
    pub port: u16,
    /// Listen backlog.
    pub backlog: u32,
    /// Concurrent sessions; extra connections are dropped on accept.
    pub max_connections: usize,
    /// Seconds a session may sit waiting for a command. 0 disables.
    pub idle_timeout_secs: u64,
    pub pool: PoolSection,
    pub arena: ArenaSection,
    pub store: StoreSection,
    pub controller: ControllerSection,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 7700,
            backlog: keel_net::DEFAULT_BACKLOG,
            max_connections: 128,
            idle_timeout_secs: 300,
            pool: PoolSection::default(),
            arena: ArenaSection::default(),
            store: StoreSection::default(),
            controller: ControllerSection::default(),
        }
    }
}

/// `[pool]`: the shared I/O page pool. Each session holds two pages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSection {
    pub page_size: usize,
    pub page_count: usize,
    pub high_priority_size: usize,
}

impl Default for PoolSection {
    fn default() -> Self {
        let d = PoolConfig::default();
        Self {
            page_size: d.page_size,
            page_count: d.page_count,
            high_priority_size: d.high_priority_size,
        }
    }
}

/// `[arena]`: per-session parse arena.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArenaSection {
    pub block_size: usize,
    /// Cap on one session's arena. Unlimited when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_bytes: Option<usize>,
}

impl Default for ArenaSection {
    fn default() -> Self {
        let d = ArenaConfig::default();
        Self {
            block_size: d.block_size,
            max_bytes: Some(1024 * 1024),
        }
    }
}

/// `[store]`: the versioned configuration store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub config_dir: PathBuf,
    /// Serve the clusters that load and report the rest as unavailable,
    /// instead of refusing to start.
    pub degraded: bool,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            config_dir: PathBuf::from("keel-config"),
            degraded: false,
        }
    }
}

/// `[controller]`: the node program `start node` launches. Lifecycle
/// directives answer `error` when no program is set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub program: Option<String>,
    /// Arguments placed before `--grid/--cluster/--node`.
    pub args: Vec<String>,
}

impl ServerConfig {
    /// Loads a TOML file. Missing keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        let raw = format!("{}:{}", self.bind, self.port);
        raw.parse().map_err(|_| ConfigError::BindAddr(raw))
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        match self.idle_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            page_size: self.pool.page_size,
            page_count: self.pool.page_count,
            high_priority_size: self.pool.high_priority_size,
        }
    }

    pub fn arena_config(&self) -> ArenaConfig {
        ArenaConfig {
            block_size: self.arena.block_size,
            max_bytes: self.arena.max_bytes,
        }
    }

    pub fn recovery_policy(&self) -> RecoveryPolicy {
        if self.store.degraded {
            RecoveryPolicy::Degraded
        } else {
            RecoveryPolicy::Strict
        }
    }

    /// Checks limits that the individual components can't see together.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "max_connections must be at least 1".into(),
            ));
        }
        if u32::try_from(self.max_connections).is_err() {
            return Err(ConfigError::Invalid(format!(
                "max_connections {} is too large",
                self.max_connections
            )));
        }
        if self.pool.page_count < 2 {
            return Err(ConfigError::Invalid(
                "pool.page_count must be at least 2 (one session needs two pages)".into(),
            ));
        }
        if self.controller.program.as_deref() == Some("") {
            return Err(ConfigError::Invalid("controller.program is empty".into()));
        }
        Ok(())
    }

    /// Sessions the pool can back at once.
    pub fn session_capacity(&self) -> usize {
        self.pool.page_count / 2
    }
}
