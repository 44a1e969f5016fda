//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration file (config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::{net::IpAddr, path::PathBuf, time::Duration};

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub federation: FederationConfig,
    pub api: ApiConfig,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
    /// Public domain (e.g., "social.example.com")
    pub domain: String,
    /// Protocol ("http" or "https")
    pub protocol: String,
}

impl ServerConfig {
    /// Get the base URL for the instance
    ///
    /// # Returns
    /// Full URL like "https://social.example.com"
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

/// Federation tuning knobs
///
/// The numeric bounds are defaults, not protocol contracts; operators may
/// tighten or relax them per instance.
#[derive(Debug, Clone, Deserialize)]
pub struct FederationConfig {
    /// Remote actor cache freshness window in seconds (default: 86400)
    pub actor_cache_ttl_seconds: u64,
    /// Accepted clock skew for signed Date headers in seconds (default: 1800)
    pub clock_skew_seconds: i64,
    /// Maximum delivery attempts per task (default: 8)
    pub delivery_max_attempts: u32,
    /// Base delay for exponential delivery backoff in seconds (default: 30)
    pub delivery_base_backoff_seconds: u64,
    /// Concurrent in-flight deliveries (default: 8)
    pub delivery_concurrency: usize,
    /// Delivery worker poll interval in seconds (default: 5)
    pub delivery_poll_interval_seconds: u64,
    /// Timeout for outbound federation HTTP calls in seconds (default: 15)
    pub http_timeout_seconds: u64,
    /// Collection page size for outbox/followers/following (default: 10)
    pub collection_page_size: u32,
    /// Permit fetching from loopback/private hosts (default: false).
    /// Only for development and test instances.
    pub allow_private_addresses: bool,
}

impl FederationConfig {
    pub fn actor_cache_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.actor_cache_ttl_seconds as i64)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_seconds)
    }
}

/// Local publish API configuration
///
/// Real user authentication is an external collaborator; the publish
/// surface is guarded by a static bearer token instead.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// Bearer token required on /api/v1 publish endpoints (16+ bytes)
    pub publish_token: String,
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
    /// 4. Environment variables (DRIFTWOOD_*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            // Start with default values
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("server.protocol", "http")?
            .set_default("federation.actor_cache_ttl_seconds", 86_400)?
            .set_default("federation.clock_skew_seconds", 1800)?
            .set_default("federation.delivery_max_attempts", 8)?
            .set_default("federation.delivery_base_backoff_seconds", 30)?
            .set_default("federation.delivery_concurrency", 8)?
            .set_default("federation.delivery_poll_interval_seconds", 5)?
            .set_default("federation.http_timeout_seconds", 15)?
            .set_default("federation.collection_page_size", 10)?
            .set_default("federation.allow_private_addresses", false)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            // Load from config/default.toml if it exists
            .add_source(File::with_name("config/default").required(false))
            // Load from config/local.toml if it exists (overrides default)
            .add_source(File::with_name("config/local").required(false))
            // Load from environment variables (DRIFTWOOD_*)
            .add_source(
                Environment::with_prefix("DRIFTWOOD")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    fn validate(&self) -> Result<(), crate::error::AppError> {
        const MIN_PUBLISH_TOKEN_BYTES: usize = 16;

        if self.api.publish_token.as_bytes().len() < MIN_PUBLISH_TOKEN_BYTES {
            return Err(crate::error::AppError::Config(format!(
                "api.publish_token must be at least {} bytes",
                MIN_PUBLISH_TOKEN_BYTES
            )));
        }

        if self.federation.delivery_max_attempts == 0 {
            return Err(crate::error::AppError::Config(
                "federation.delivery_max_attempts must be greater than 0".to_string(),
            ));
        }

        if self.federation.clock_skew_seconds <= 0 {
            return Err(crate::error::AppError::Config(
                "federation.clock_skew_seconds must be greater than 0".to_string(),
            ));
        }

        if !is_local_server_domain(&self.server.domain)
            && !self.server.protocol.eq_ignore_ascii_case("https")
        {
            return Err(crate::error::AppError::Config(
                "server.protocol must be https for non-local server domains".to_string(),
            ));
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

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> AppConfig {
        AppConfig {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
                domain: "localhost".to_string(),
                protocol: "http".to_string(),
            },
            database: DatabaseConfig {
                path: PathBuf::from("/tmp/driftwood-test.db"),
            },
            federation: FederationConfig {
                actor_cache_ttl_seconds: 86_400,
                clock_skew_seconds: 1800,
                delivery_max_attempts: 8,
                delivery_base_backoff_seconds: 30,
                delivery_concurrency: 8,
                delivery_poll_interval_seconds: 5,
                http_timeout_seconds: 15,
                collection_page_size: 10,
                allow_private_addresses: false,
            },
            api: ApiConfig {
                publish_token: "x".repeat(32),
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        }
    }

    #[test]
    fn validate_accepts_http_on_localhost() {
        let config = valid_config();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_short_publish_token() {
        let mut config = valid_config();
        config.api.publish_token = "short".to_string();

        let error = config
            .validate()
            .expect_err("publish token shorter than 16 bytes must fail");
        assert!(matches!(
            error,
            crate::error::AppError::Config(message)
                if message.contains("api.publish_token")
        ));
    }

    #[test]
    fn validate_rejects_http_for_non_local_domain() {
        let mut config = valid_config();
        config.server.domain = "social.example.com".to_string();
        config.server.protocol = "http".to_string();

        let error = config
            .validate()
            .expect_err("public domains must require https");
        assert!(matches!(
            error,
            crate::error::AppError::Config(message)
                if message.contains("server.protocol must be https")
        ));
    }

    #[test]
    fn validate_rejects_zero_delivery_attempts() {
        let mut config = valid_config();
        config.federation.delivery_max_attempts = 0;

        assert!(config.validate().is_err());
    }
}
