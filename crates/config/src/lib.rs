//! Configuration loading and validation for the certrelay agent.
//!
//! Configuration is a TOML file with serde defaults for every field except
//! the controller endpoint and its token, which have no sensible defaults and
//! are rejected by [`AgentConfig::validate`] when missing. The binary layers
//! environment/CLI overrides on top of the file.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use url::Url;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Root agent configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    /// Control-channel connection settings.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Cache store backend settings.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Certificate issuance workflow settings.
    #[serde(default)]
    pub acme: AcmeConfig,

    /// Liveness signal settings.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Host filesystem layout consumed by the hooks.
    #[serde(default)]
    pub paths: PathsConfig,
}

/// Control-channel connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    /// Controller websocket URL (`ws://` or `wss://`).
    #[serde(default)]
    pub connect_url: String,

    /// Static token carried in the handshake `TOKEN` header.
    #[serde(default)]
    pub connect_token: String,

    /// Backoff after the controller rejects the handshake with a status
    /// code. Abrupt disconnects reconnect immediately; active refusal gets
    /// this fixed extended delay instead.
    #[serde(default = "default_rejected_backoff")]
    pub rejected_backoff_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            connect_url: String::new(),
            connect_token: String::new(),
            rejected_backoff_secs: default_rejected_backoff(),
        }
    }
}

impl GatewayConfig {
    pub fn rejected_backoff(&self) -> Duration {
        Duration::from_secs(self.rejected_backoff_secs)
    }
}

/// Cache store backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    /// Redis connection URL.
    #[serde(default = "default_cache_url")]
    pub url: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            url: default_cache_url(),
        }
    }
}

/// Certificate issuance workflow settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AcmeConfig {
    /// External issuance tool executable.
    #[serde(default = "default_issuance_tool")]
    pub issuance_tool: String,

    /// Manual auth hook invoked by the issuance tool.
    #[serde(default = "default_auth_hook")]
    pub auth_hook: PathBuf,

    /// Deploy hook invoked by the issuance tool after issuance.
    #[serde(default = "default_deploy_hook")]
    pub deploy_hook: PathBuf,

    /// ACME directory URL passed to the issuance tool.
    #[serde(default = "default_directory_url")]
    pub directory_url: String,

    /// Interval between DNS propagation polls.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Confirmation deadline for a domain workflow.
    #[serde(default = "default_continue_timeout")]
    pub continue_timeout_secs: u64,

    /// Default cache expiry for workflow records.
    #[serde(default = "default_cache_timeout")]
    pub cache_timeout_secs: u64,

    /// Nameservers queried for challenge TXT records.
    #[serde(default = "default_nameservers")]
    pub nameservers: Vec<IpAddr>,
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            issuance_tool: default_issuance_tool(),
            auth_hook: default_auth_hook(),
            deploy_hook: default_deploy_hook(),
            directory_url: default_directory_url(),
            poll_interval_secs: default_poll_interval(),
            continue_timeout_secs: default_continue_timeout(),
            cache_timeout_secs: default_cache_timeout(),
            nameservers: default_nameservers(),
        }
    }
}

impl AcmeConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Liveness signal settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeartbeatConfig {
    /// Interval between heartbeat events.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_secs: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_heartbeat_interval(),
        }
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Host filesystem layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PathsConfig {
    /// Reverse-proxy configuration directory (deploy hook output).
    #[serde(default = "default_proxy_config_dir")]
    pub proxy_config_dir: PathBuf,

    /// Issuance tool state directory (certificates, account storage).
    #[serde(default = "default_letsencrypt_dir")]
    pub letsencrypt_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            proxy_config_dir: default_proxy_config_dir(),
            letsencrypt_dir: default_letsencrypt_dir(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml(&content)?;
        debug!(path = %path.display(), "Loaded agent configuration");
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Validate the configuration.
    ///
    /// The controller URL and token carry no defaults: an agent without them
    /// has nothing to connect to and refuses to start.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.gateway.connect_url.is_empty() {
            return Err(ConfigError::Invalid(
                "gateway.connect_url is required".to_string(),
            ));
        }
        if self.gateway.connect_token.is_empty() {
            return Err(ConfigError::Invalid(
                "gateway.connect_token is required".to_string(),
            ));
        }

        let url = Url::parse(&self.gateway.connect_url)
            .map_err(|e| ConfigError::Invalid(format!("gateway.connect_url: {e}")))?;
        match url.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(ConfigError::Invalid(format!(
                    "gateway.connect_url: unsupported scheme '{other}', expected ws or wss"
                )));
            }
        }

        Url::parse(&self.cache.url)
            .map_err(|e| ConfigError::Invalid(format!("cache.url: {e}")))?;

        if self.acme.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "acme.poll_interval_secs must be nonzero".to_string(),
            ));
        }
        if self.acme.continue_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "acme.continue_timeout_secs must be nonzero".to_string(),
            ));
        }
        if self.heartbeat.interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat.interval_secs must be nonzero".to_string(),
            ));
        }

        Ok(())
    }
}

fn default_rejected_backoff() -> u64 {
    60
}

fn default_cache_url() -> String {
    "redis://127.0.0.1:6379/0".to_string()
}

fn default_issuance_tool() -> String {
    "certbot".to_string()
}

fn default_auth_hook() -> PathBuf {
    PathBuf::from("/usr/local/bin/certrelay-auth-hook")
}

fn default_deploy_hook() -> PathBuf {
    PathBuf::from("/usr/local/bin/certrelay-deploy-hook")
}

fn default_directory_url() -> String {
    "https://acme-v02.api.letsencrypt.org/directory".to_string()
}

fn default_poll_interval() -> u64 {
    5
}

fn default_continue_timeout() -> u64 {
    5 * 60
}

fn default_cache_timeout() -> u64 {
    11 * 60
}

fn default_nameservers() -> Vec<IpAddr> {
    vec![
        IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
        IpAddr::V4(Ipv4Addr::new(8, 8, 4, 4)),
    ]
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_proxy_config_dir() -> PathBuf {
    PathBuf::from("/etc/nginx")
}

fn default_letsencrypt_dir() -> PathBuf {
    PathBuf::from("/etc/letsencrypt")
}
