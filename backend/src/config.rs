//! Configuration for the identity service.

use config::{Config as ConfigLoader, ConfigError, Environment, File};
use serde::Deserialize;

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub identity_provider: IdentityProviderConfig,
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub cors: CorsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// External identity provider settings.
#[derive(Debug, Clone, Deserialize)]
pub struct IdentityProviderConfig {
    /// Token issuer URL, checked against the `iss` claim
    pub issuer: String,
    /// Expected `aud` claim. Empty disables the audience check.
    #[serde(default)]
    pub audience: String,
    /// JWKS endpoint. When unset it is discovered from
    /// `{issuer}/.well-known/openid-configuration`.
    #[serde(default)]
    pub jwks_url: Option<String>,
    /// Base URL of the provider's backend REST API
    #[serde(default = "default_api_url")]
    pub api_url: String,
    /// Secret key for the provider's backend REST API
    #[serde(default)]
    pub secret_key: String,
    /// Upper bound for every call to the provider, in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    /// Shared HMAC secret for delivery signatures
    pub secret: String,
    /// Maximum accepted age of a delivery timestamp, in seconds
    #[serde(default = "default_tolerance_secs")]
    pub tolerance_secs: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
        }
    }
}

/// Reconciliation sweep schedule.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Hour of day (UTC) at which the daily sweep runs
    #[serde(default = "default_run_at_hour")]
    pub run_at_hour: u32,
    /// Users fetched per page from the provider
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            run_at_hour: default_run_at_hour(),
            batch_size: default_batch_size(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CorsConfig {
    /// Comma-separated allowed origins, or `*`
    #[serde(default = "default_cors_origins")]
    pub origins: String,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            origins: default_cors_origins(),
        }
    }
}

// Default values
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    3001
}
fn default_api_url() -> String {
    "https://api.clerk.com/v1".to_string()
}
fn default_timeout_secs() -> u64 {
    5
}
fn default_tolerance_secs() -> i64 {
    300
}
fn default_database_url() -> String {
    "sqlite:./data/identity.db".to_string()
}
fn default_true() -> bool {
    true
}
fn default_run_at_hour() -> u32 {
    2
}
fn default_batch_size() -> u32 {
    100
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_cors_origins() -> String {
    "*".to_string()
}

impl Config {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration sources (in order of precedence):
    /// 1. Environment variables (THINKFORWARD__SECTION__KEY format)
    /// 2. config.toml file (if present)
    /// 3. Built-in defaults
    pub fn load() -> Result<Self, ConfigError> {
        let config = ConfigLoader::builder()
            .set_default("server.host", default_host())?
            .set_default("server.port", default_port() as i64)?
            .set_default("sync.run_at_hour", default_run_at_hour() as i64)?
            .set_default("sync.batch_size", default_batch_size() as i64)?
            .add_source(File::with_name("config").required(false))
            .add_source(
                Environment::with_prefix("THINKFORWARD")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.identity_provider.issuer.trim().is_empty() {
            return Err(ConfigError::Message(
                "identity_provider.issuer must not be empty".to_string(),
            ));
        }
        if self.webhook.secret.is_empty() {
            return Err(ConfigError::Message("webhook.secret must not be empty".to_string()));
        }
        if self.sync.run_at_hour > 23 {
            return Err(ConfigError::Message(format!(
                "sync.run_at_hour must be 0-23, got {}",
                self.sync.run_at_hour
            )));
        }
        if self.sync.batch_size == 0 {
            return Err(ConfigError::Message("sync.batch_size must be positive".to_string()));
        }
        Ok(())
    }
}
