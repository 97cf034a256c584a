//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration files (config/default.toml, config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::{net::IpAddr, path::PathBuf, time::Duration};

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub federation: FederationConfig,
    pub logging: LoggingConfig,
    /// Local accounts created (with fresh key pairs) on startup
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
}

/// A local account provisioned from configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    pub username: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub manually_approves_followers: bool,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
    /// Public domain (e.g., "books.example.com")
    pub domain: String,
    /// Protocol ("http" or "https")
    pub protocol: String,
}

impl ServerConfig {
    /// Get the base URL for the instance
    ///
    /// # Returns
    /// Full URL like "https://books.example.com"
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.protocol, self.domain)
    }
}

/// Database configuration (SQLite only)
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    pub path: PathBuf,
}

/// Federation settings handed to the resolver, dispatcher and broadcaster
///
/// Nothing in the federation layer reads global state; every component is
/// constructed with a clone of this value.
#[derive(Debug, Clone, Deserialize)]
pub struct FederationConfig {
    /// Local domain, used to tell local actors from remote ones
    pub domain: String,
    /// "http" or "https"
    pub protocol: String,
    /// Servers whose activities are dropped on arrival
    #[serde(default)]
    pub blocked_servers: Vec<String>,
    /// Activity verbs answered with success and otherwise ignored
    #[serde(default = "default_ignored_activity_types")]
    pub ignored_activity_types: Vec<String>,
    /// Object types ignored regardless of verb
    #[serde(default = "default_ignored_object_types")]
    pub ignored_object_types: Vec<String>,
    /// Maximum accepted clock skew for the signed Date header
    #[serde(default = "default_max_signature_age_secs")]
    pub max_signature_age_secs: i64,
    /// Timeout for outbound GET and POST requests
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Overall budget for processing one inbound request
    #[serde(default = "default_inbound_timeout_secs")]
    pub inbound_timeout_secs: u64,
    /// Concurrent delivery workers
    #[serde(default = "default_delivery_workers")]
    pub delivery_workers: usize,
    /// Attempts before a delivery job is dropped
    #[serde(default = "default_max_delivery_attempts")]
    pub max_delivery_attempts: u32,
    #[serde(default = "default_base_backoff_secs")]
    pub base_backoff_secs: u64,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
    /// How often idle workers look for due jobs
    #[serde(default = "default_queue_poll_interval_secs")]
    pub queue_poll_interval_secs: u64,
    /// Allow fetching from and delivering to loopback or private hosts
    #[serde(default)]
    pub allow_private_addresses: bool,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// RSA modulus size for keys of newly provisioned local accounts
    #[serde(default = "default_key_size_bits")]
    pub key_size_bits: usize,
}

impl FederationConfig {
    /// Base URL of this instance
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.protocol, self.domain)
    }

    /// URI of a local actor by username
    pub fn actor_uri(&self, username: &str) -> String {
        format!("{}/user/{}", self.base_url(), username)
    }

    /// URI of the shared inbox
    pub fn shared_inbox_uri(&self) -> String {
        format!("{}/inbox", self.base_url())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn inbound_timeout(&self) -> Duration {
        Duration::from_secs(self.inbound_timeout_secs)
    }

    /// Whether `host` (or a parent domain of it) is on the configured blocklist
    pub fn is_server_blocked(&self, host: &str) -> bool {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        self.blocked_servers.iter().any(|blocked| {
            let blocked = blocked.trim().trim_end_matches('.').to_ascii_lowercase();
            !blocked.is_empty() && (host == blocked || host.ends_with(&format!(".{blocked}")))
        })
    }

    pub fn is_ignored_activity(&self, activity_type: &str) -> bool {
        self.ignored_activity_types
            .iter()
            .any(|ignored| ignored == activity_type)
    }

    pub fn is_ignored_object(&self, object_type: &str) -> bool {
        self.ignored_object_types
            .iter()
            .any(|ignored| ignored == object_type)
    }
}

fn default_ignored_activity_types() -> Vec<String> {
    [
        "Question", "Listen", "View", "Read", "Arrive", "Leave", "Travel", "Invite", "Join",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_ignored_object_types() -> Vec<String> {
    ["Question", "Article", "Page", "Event", "Audio", "Video"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_max_signature_age_secs() -> i64 {
    300
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_inbound_timeout_secs() -> u64 {
    30
}

fn default_delivery_workers() -> usize {
    10
}

fn default_max_delivery_attempts() -> u32 {
    8
}

fn default_base_backoff_secs() -> u64 {
    30
}

fn default_max_backoff_secs() -> u64 {
    3600
}

fn default_queue_poll_interval_secs() -> u64 {
    5
}

fn default_key_size_bits() -> usize {
    2048
}

fn default_user_agent() -> String {
    format!("Fedshelf/{}", env!("CARGO_PKG_VERSION"))
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (FEDSHELF__*)
    ///
    /// `federation.domain` and `federation.protocol` default to the server's.
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("server.protocol", "http")?
            .set_default("database.path", "data/fedshelf.db")?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::with_prefix("FEDSHELF")
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("federation.blocked_servers")
                    .try_parsing(true),
            )
            .build()?;

        // Fill federation identity from the server section when absent.
        let domain = config.get_string("server.domain")?;
        let protocol = config.get_string("server.protocol")?;
        let config = Config::builder()
            .add_source(config)
            .set_default("federation.domain", domain)?
            .set_default("federation.protocol", protocol)?
            .build()?;

        let app_config: Self = config.try_deserialize()?;
        app_config.validate()?;
        Ok(app_config)
    }

    fn validate(&self) -> Result<(), crate::error::AppError> {
        use crate::error::AppError;

        if self.federation.delivery_workers == 0 {
            return Err(AppError::Config(
                "federation.delivery_workers must be greater than 0".to_string(),
            ));
        }

        if self.federation.max_delivery_attempts == 0 {
            return Err(AppError::Config(
                "federation.max_delivery_attempts must be greater than 0".to_string(),
            ));
        }

        if self.federation.max_signature_age_secs <= 0 {
            return Err(AppError::Config(
                "federation.max_signature_age_secs must be greater than 0".to_string(),
            ));
        }

        if self.federation.key_size_bits < 1024 {
            return Err(AppError::Config(
                "federation.key_size_bits must be at least 1024".to_string(),
            ));
        }

        if self.federation.base_backoff_secs > self.federation.max_backoff_secs {
            return Err(AppError::Config(
                "federation.base_backoff_secs must not exceed federation.max_backoff_secs"
                    .to_string(),
            ));
        }

        for account in &self.accounts {
            let valid = !account.username.is_empty()
                && account
                    .username
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.');
            if !valid {
                return Err(AppError::Config(format!(
                    "invalid account username: {:?}",
                    account.username
                )));
            }
        }

        if is_local_server_domain(&self.server.domain) {
            tracing::warn!(
                domain = %self.server.domain,
                "Running federation on a local domain; remote servers cannot reach this instance"
            );
        } else if !self.server.protocol.eq_ignore_ascii_case("https") {
            return Err(AppError::Config(
                "server.protocol must be https for non-local server domains".to_string(),
            ));
        }

        if self.federation.allow_private_addresses && !is_local_server_domain(&self.server.domain)
        {
            tracing::warn!("federation.allow_private_addresses is enabled on a public domain");
        }

        Ok(())
    }
}

fn normalized_server_host(domain: &str) -> String {
    let trimmed = domain.trim();
    let parsed_host = url::Url::parse(&format!("http://{trimmed}"))
        .ok()
        .and_then(|url| url.host_str().map(|host| host.to_string()));
    let host = parsed_host.unwrap_or_else(|| trimmed.to_string());
    host.trim_end_matches('.').to_ascii_lowercase()
}

fn is_local_server_domain(domain: &str) -> bool {
    let host = normalized_server_host(domain);
    if host == "localhost" || host.ends_with(".localhost") {
        return true;
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        return ip.is_loopback() || ip.is_unspecified();
    }

    false
}
