//! Device server configuration.
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! working server on `[::]:5683`.

use crate::capbac::{CapbacCli, DEFAULT_PROGRAM};
use crate::gate::Framing;
use crate::resource::DEFAULT_CONTENT;
use crate::token::{AccessRule, Action};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse TOML config: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Failed to parse JSON config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported config file format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: SocketAddr,

    /// Default `tracing` filter, overridden by `RUST_LOG`
    pub log_level: String,

    pub framing: Framing,

    /// Seconds between notifications to observers of the time resource
    pub observe_interval_secs: u64,

    pub time_path: String,
    pub resource_path: String,

    /// Initial content of the simple resource
    pub initial_content: String,

    pub capbac: CapbacConfig,
    pub bootstrap: BootstrapConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from((std::net::Ipv6Addr::UNSPECIFIED, crate::coap::DEFAULT_PORT)),
            log_level: "info".to_string(),
            framing: Framing::default(),
            observe_interval_secs: 5,
            time_path: "time".to_string(),
            resource_path: "resource".to_string(),
            initial_content: String::from_utf8_lossy(DEFAULT_CONTENT).into_owned(),
            capbac: CapbacConfig::default(),
            bootstrap: BootstrapConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn observe_interval(&self) -> Duration {
        Duration::from_secs(self.observe_interval_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.observe_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "observe_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.capbac.command.is_empty() {
            return Err(ConfigError::Invalid("capbac.command is empty".to_string()));
        }
        if self.capbac.worker && self.capbac.worker_queue == 0 {
            return Err(ConfigError::Invalid(
                "capbac.worker_queue must be greater than zero".to_string(),
            ));
        }
        for path in [&self.time_path, &self.resource_path] {
            if path.is_empty() || path.contains('/') {
                return Err(ConfigError::Invalid(format!(
                    "resource path {:?} must be a single non-empty segment",
                    path
                )));
            }
        }
        if self.time_path == self.resource_path {
            return Err(ConfigError::Invalid(
                "time_path and resource_path must differ".to_string(),
            ));
        }
        if self.bootstrap.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "bootstrap.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapbacConfig {
    /// Program followed by leading arguments
    pub command: Vec<String>,
    pub timeout_secs: u64,

    /// Funnel validations through one worker task instead of running them
    /// from each request task
    pub worker: bool,
    pub worker_queue: usize,
}

impl Default for CapbacConfig {
    fn default() -> Self {
        Self {
            command: vec![DEFAULT_PROGRAM.to_string()],
            timeout_secs: 10,
            worker: false,
            worker_queue: crate::validator::DEFAULT_WORKER_CAPACITY,
        }
    }
}

impl CapbacConfig {
    pub fn cli(&self) -> CapbacCli {
        CapbacCli::new(self.command.clone()).with_timeout(Duration::from_secs(self.timeout_secs))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    /// Issue and confirm the root token before serving
    pub enabled: bool,
    pub device: String,
    pub token_id: String,
    /// Unix seconds
    pub not_after: i64,
    pub max_delay_secs: u64,
    pub settle_delay_secs: u64,
    pub max_attempts: u32,
    /// Rules granted by the root token. Empty means GET and PUT on the
    /// resource plus GET on the time resource.
    pub rules: Vec<RuleConfig>,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            device: "coap://device".to_string(),
            token_id: "0000000000000000".to_string(),
            not_after: 2_000_000_000,
            max_delay_secs: 100,
            settle_delay_secs: 5,
            max_attempts: 1,
            rules: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleConfig {
    pub action: Action,
    pub resource: String,
}

impl ServerConfig {
    /// Access rules of the root token
    pub fn root_rules(&self) -> Vec<AccessRule> {
        let delay = self.bootstrap.max_delay_secs;
        if self.bootstrap.rules.is_empty() {
            return vec![
                AccessRule::new(Action::Get, self.time_path.clone(), delay),
                AccessRule::new(Action::Get, self.resource_path.clone(), delay),
                AccessRule::new(Action::Put, self.resource_path.clone(), delay),
            ];
        }
        self.bootstrap
            .rules
            .iter()
            .map(|rule| AccessRule::new(rule.action, rule.resource.clone(), delay))
            .collect()
    }
}

/// Load configuration from a `.toml` or `.json` file
pub fn load_config(path: &Path) -> Result<ServerConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let config: ServerConfig = match ext {
        "toml" => toml::from_str(&content)?,
        "json" => serde_json::from_str(&content)?,
        _ => return Err(ConfigError::UnsupportedFormat(ext.to_string())),
    };

    config.validate()?;
    Ok(config)
}
