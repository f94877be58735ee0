//! Configuration for Cormorant

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Prefix for environment overrides, e.g. `CORMORANT__IMAP__BIND`
const ENV_PREFIX: &str = "CORMORANT";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// TLS configuration (enables STARTTLS)
    pub tls: Option<TlsConfig>,

    /// IMAP configuration
    #[serde(default)]
    pub imap: ImapConfig,

    /// Mailbox store configuration
    #[serde(default)]
    pub backend: BackendConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Hostname used in the greeting
    #[serde(default = "default_hostname")]
    pub hostname: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
        }
    }
}

fn default_hostname() -> String {
    "localhost".to_string()
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

/// TLS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Path to certificate file
    pub cert_path: PathBuf,

    /// Path to private key file
    pub key_path: PathBuf,
}

/// IMAP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImapConfig {
    /// IMAP server bind address
    #[serde(default = "default_imap_bind")]
    pub bind: String,

    /// Maximum concurrent connections
    #[serde(default = "default_imap_max_connections")]
    pub max_connections: usize,

    /// Permit LOGIN and AUTHENTICATE on a connection that is not TLS-protected
    #[serde(default)]
    pub allow_insecure_auth: bool,

    /// Idle time after which an authenticated session is logged out (0 disables)
    #[serde(default = "default_auto_logout")]
    pub auto_logout_secs: u64,

    /// Lower bound enforced on `auto_logout_secs`
    #[serde(default = "default_auto_logout")]
    pub min_auto_logout_secs: u64,

    /// Largest literal accepted from a client, in bytes
    #[serde(default = "default_max_literal_size")]
    pub max_literal_size: usize,

    /// Send an unsolicited CAPABILITY right after a STARTTLS handshake
    #[serde(default = "default_true")]
    pub announce_capabilities_after_starttls: bool,
}

impl Default for ImapConfig {
    fn default() -> Self {
        Self {
            bind: default_imap_bind(),
            max_connections: default_imap_max_connections(),
            allow_insecure_auth: false,
            auto_logout_secs: default_auto_logout(),
            min_auto_logout_secs: default_auto_logout(),
            max_literal_size: default_max_literal_size(),
            announce_capabilities_after_starttls: true,
        }
    }
}

impl ImapConfig {
    /// Effective auto-logout duration, with the configured minimum applied.
    /// `None` when auto-logout is disabled.
    pub fn auto_logout(&self) -> Option<Duration> {
        if self.auto_logout_secs == 0 {
            return None;
        }
        let secs = self.auto_logout_secs.max(self.min_auto_logout_secs);
        Some(Duration::from_secs(secs))
    }
}

fn default_imap_bind() -> String {
    "0.0.0.0:143".to_string()
}

fn default_imap_max_connections() -> usize {
    1000
}

fn default_auto_logout() -> u64 {
    30 * 60 // RFC 3501 section 5.4
}

fn default_max_literal_size() -> usize {
    25 * 1024 * 1024 // 25 MB
}

fn default_true() -> bool {
    true
}

/// How unknown usernames are handled at login
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provisioning {
    /// Unknown users are created on first login with the password given
    #[default]
    Auto,
    /// Only pre-provisioned users may log in
    Strict,
}

/// A user created at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedUser {
    pub username: String,
    pub password: String,
}

/// Mailbox store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Account provisioning policy
    #[serde(default)]
    pub provisioning: Provisioning,

    /// Capacity of the update bus
    #[serde(default = "default_update_buffer")]
    pub update_buffer: usize,

    /// Accounts created at startup
    #[serde(default)]
    pub seed_users: Vec<SeedUser>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            provisioning: Provisioning::default(),
            update_buffer: default_update_buffer(),
            seed_users: Vec::new(),
        }
    }
}

fn default_update_buffer() -> usize {
    256
}

impl Config {
    /// Load configuration from file, with environment overrides applied
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        Self::build(Some(path))
    }

    /// Load configuration from the default locations, falling back to
    /// defaults plus environment overrides when no file exists
    pub fn load() -> crate::Result<Self> {
        let paths = [
            PathBuf::from("./cormorant.toml"),
            PathBuf::from("/etc/cormorant/cormorant.toml"),
        ];

        match paths.iter().find(|path| path.exists()) {
            Some(path) => Self::from_file(path),
            None => {
                tracing::debug!("No configuration file found, using defaults");
                Self::build(None)
            }
        }
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
    }

    fn build(path: Option<&Path>) -> crate::Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path));
        }

        builder
            .add_source(::config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .and_then(|settings| settings.try_deserialize::<Config>())
            .map_err(|e| Error::Config(format!("Failed to load config: {}", e)))
    }
}
