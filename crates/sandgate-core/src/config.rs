//! sandgate.toml configuration parser.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::duration::serde_str;

/// Errors raised while loading or validating the configuration.
///
/// These are fatal at startup and never produced mid-request.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    pub backend: BackendConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Disables verification entirely. Never on unless set explicitly.
    #[serde(default)]
    pub dev_bypass: bool,
    pub jwks_url: Option<String>,
    pub audience: Option<String>,
    pub issuer: Option<String>,
    #[serde(default = "default_token_header")]
    pub token_header: String,
    pub token_cookie: Option<String>,
    #[serde(default = "default_cache_ttl", with = "serde_str")]
    pub cache_ttl: Duration,
    #[serde(default = "default_grace", with = "serde_str")]
    pub grace: Duration,
    #[serde(default = "default_fetch_timeout", with = "serde_str")]
    pub fetch_timeout: Duration,
    #[serde(default = "default_min_refresh", with = "serde_str")]
    pub min_refresh_interval: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            dev_bypass: false,
            jwks_url: None,
            audience: None,
            issuer: None,
            token_header: default_token_header(),
            token_cookie: None,
            cache_ttl: default_cache_ttl(),
            grace: default_grace(),
            fetch_timeout: default_fetch_timeout(),
            min_refresh_interval: default_min_refresh(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Program and arguments.
    pub command: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub working_dir: Option<PathBuf>,
    #[serde(default = "default_backend_port")]
    pub port: u16,
    #[serde(default = "default_readiness_path")]
    pub readiness_path: String,
    #[serde(default = "default_start_timeout", with = "serde_str")]
    pub start_timeout: Duration,
    #[serde(default = "default_probe_initial", with = "serde_str")]
    pub probe_initial: Duration,
    #[serde(default = "default_probe_max", with = "serde_str")]
    pub probe_max: Duration,
    #[serde(default = "default_max_probe_attempts")]
    pub max_probe_attempts: u32,
    #[serde(default = "default_probe_timeout", with = "serde_str")]
    pub probe_timeout: Duration,
    #[serde(default = "default_health_interval", with = "serde_str")]
    pub health_interval: Duration,
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,
}

impl BackendConfig {
    /// Loopback address the backend listens on.
    pub fn address(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    S3,
    Local,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub kind: StorageKind,
    pub bucket: Option<String>,
    pub endpoint: Option<String>,
    pub region: Option<String>,
    /// Root directory for `kind = "local"`.
    pub root: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_sync_interval", with = "serde_str")]
    pub interval: Duration,
    #[serde(default = "default_tick_timeout", with = "serde_str")]
    pub tick_timeout: Duration,
    #[serde(default)]
    pub entries: Vec<EntryConfig>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: default_sync_interval(),
            tick_timeout: default_tick_timeout(),
            entries: Vec::new(),
        }
    }
}

/// One manifest entry: a local directory mirrored under a remote prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryConfig {
    pub name: String,
    pub local_dir: PathBuf,
    pub remote_prefix: String,
}

impl GatewayConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: GatewayConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.auth.dev_bypass && self.auth.jwks_url.as_deref().is_none_or(str::is_empty) {
            return Err(ConfigError::Invalid(
                "auth.jwks_url is required unless auth.dev_bypass = true".into(),
            ));
        }
        if self.auth.token_header.trim().is_empty() {
            return Err(ConfigError::Invalid("auth.token_header must not be empty".into()));
        }

        if self.backend.command.is_empty() || self.backend.command[0].trim().is_empty() {
            return Err(ConfigError::Invalid("backend.command must name a program".into()));
        }
        if !self.backend.readiness_path.starts_with('/') {
            return Err(ConfigError::Invalid(
                "backend.readiness_path must start with '/'".into(),
            ));
        }
        if self.backend.max_probe_attempts == 0 {
            return Err(ConfigError::Invalid(
                "backend.max_probe_attempts must be at least 1".into(),
            ));
        }
        if self.backend.probe_initial > self.backend.probe_max {
            return Err(ConfigError::Invalid(
                "backend.probe_initial must not exceed backend.probe_max".into(),
            ));
        }

        match self.storage.kind {
            StorageKind::S3 => {
                if self.storage.bucket.as_deref().is_none_or(str::is_empty) {
                    return Err(ConfigError::Invalid(
                        "storage.bucket is required for kind = \"s3\"".into(),
                    ));
                }
            }
            StorageKind::Local => {
                if self.storage.root.is_none() {
                    return Err(ConfigError::Invalid(
                        "storage.root is required for kind = \"local\"".into(),
                    ));
                }
            }
        }

        if self.sync.interval.is_zero() {
            return Err(ConfigError::Invalid("sync.interval must be positive".into()));
        }

        let mut names = HashSet::new();
        let mut prefixes: Vec<&str> = Vec::new();
        for entry in &self.sync.entries {
            if !names.insert(entry.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate sync entry name: {}",
                    entry.name
                )));
            }
            let prefix = entry.remote_prefix.trim_matches('/');
            if prefix.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "sync entry {} has an empty remote_prefix",
                    entry.name
                )));
            }
            for other in &prefixes {
                if *other == prefix {
                    return Err(ConfigError::Invalid(format!(
                        "duplicate sync remote_prefix: {prefix}"
                    )));
                }
                if is_nested_prefix(other, prefix) || is_nested_prefix(prefix, other) {
                    return Err(ConfigError::Invalid(format!(
                        "sync remote_prefix {prefix} overlaps {other}"
                    )));
                }
            }
            prefixes.push(prefix);
            if !entry.local_dir.is_absolute() {
                return Err(ConfigError::Invalid(format!(
                    "sync entry {} local_dir must be absolute",
                    entry.name
                )));
            }
        }

        Ok(())
    }
}

/// `inner` lives under `outer`, e.g. `data/sub` under `data`.
fn is_nested_prefix(outer: &str, inner: &str) -> bool {
    inner
        .strip_prefix(outer)
        .is_some_and(|rest| rest.starts_with('/'))
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_token_header() -> String {
    "authorization".to_string()
}

fn default_cache_ttl() -> Duration {
    Duration::from_secs(300)
}

fn default_grace() -> Duration {
    Duration::from_secs(3600)
}

fn default_fetch_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_min_refresh() -> Duration {
    Duration::from_secs(30)
}

fn default_backend_port() -> u16 {
    18789
}

fn default_readiness_path() -> String {
    "/".to_string()
}

fn default_start_timeout() -> Duration {
    Duration::from_secs(180)
}

fn default_probe_initial() -> Duration {
    Duration::from_millis(500)
}

fn default_probe_max() -> Duration {
    Duration::from_secs(5)
}

fn default_max_probe_attempts() -> u32 {
    60
}

fn default_probe_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_health_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_unhealthy_threshold() -> u32 {
    3
}

fn default_sync_interval() -> Duration {
    Duration::from_secs(300)
}

fn default_tick_timeout() -> Duration {
    Duration::from_secs(120)
}
