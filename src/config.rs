//! Application configuration module
//! Handles environment variable loading, configuration validation, and application settings

use crate::payments::factory::PaymentFactoryConfig;
use crate::payments::types::ProviderName;
use crate::services::reconciliation::RedirectPages;
use std::env;

/// Main application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    /// `None` when running with `SKIP_EXTERNALS`.
    pub database: Option<DatabaseConfig>,
    /// `None` keeps provider tokens in process memory.
    pub cache: Option<CacheConfig>,
    pub logging: LoggingConfig,
    pub payments: PaymentsConfig,
    pub skip_externals: bool,
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connection_timeout: u64,   // seconds
    pub idle_timeout: Option<u64>, // seconds
}

/// Cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub redis_url: String,
    pub max_connections: u32,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Log format options
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Plain,
}

/// Payment routing configuration
#[derive(Debug, Clone)]
pub struct PaymentsConfig {
    pub enabled_providers: Vec<ProviderName>,
    pub redirect_pages: RedirectPages,
    /// Token required by the administrative routes. Those routes refuse every
    /// request when unset.
    pub admin_token: Option<String>,
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if it exists
        let _ = dotenv::dotenv().ok();

        let skip_externals = env_flag("SKIP_EXTERNALS")?;
        let database = if skip_externals {
            None
        } else {
            Some(DatabaseConfig::from_env()?)
        };
        let cache = if skip_externals {
            None
        } else {
            CacheConfig::from_env()?
        };

        Ok(AppConfig {
            server: ServerConfig::from_env()?,
            database,
            cache,
            logging: LoggingConfig::from_env()?,
            payments: PaymentsConfig::from_env()?,
            skip_externals,
        })
    }

    /// Validate the entire configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.validate()?;
        if let Some(database) = &self.database {
            database.validate()?;
        }
        if let Some(cache) = &self.cache {
            cache.validate()?;
        }
        self.logging.validate()?;
        self.payments.validate()?;

        Ok(())
    }
}

fn env_flag(name: &str) -> Result<bool, ConfigError> {
    match env::var(name) {
        Ok(value) => match value.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" | "" => Ok(false),
            _ => Err(ConfigError::InvalidValue(name.to_string())),
        },
        Err(_) => Ok(false),
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(ServerConfig {
            host: env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: env::var("SERVER_PORT")
                .unwrap_or_else(|_| "8000".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("SERVER_PORT".to_string()))?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidValue(
                "SERVER_PORT cannot be 0".to_string(),
            ));
        }

        if self.host.is_empty() {
            return Err(ConfigError::InvalidValue(
                "SERVER_HOST cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl DatabaseConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(DatabaseConfig {
            url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::MissingVariable("DATABASE_URL".to_string()))?,
            max_connections: env::var("DB_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "20".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("DB_MAX_CONNECTIONS".to_string()))?,
            min_connections: env::var("DB_MIN_CONNECTIONS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("DB_MIN_CONNECTIONS".to_string()))?,
            connection_timeout: env::var("DB_CONNECTION_TIMEOUT")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("DB_CONNECTION_TIMEOUT".to_string()))?,
            idle_timeout: env::var("DB_IDLE_TIMEOUT")
                .ok()
                .and_then(|val| val.parse().ok()),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.is_empty() {
            return Err(ConfigError::InvalidValue("DATABASE_URL".to_string()));
        }

        if self.max_connections == 0 {
            return Err(ConfigError::InvalidValue("DB_MAX_CONNECTIONS".to_string()));
        }

        if self.min_connections > self.max_connections {
            return Err(ConfigError::InvalidValue(
                "DB_MIN_CONNECTIONS must be <= DB_MAX_CONNECTIONS".to_string(),
            ));
        }

        Ok(())
    }
}

impl CacheConfig {
    /// `Ok(None)` when `REDIS_URL` is unset.
    pub fn from_env() -> Result<Option<Self>, ConfigError> {
        let redis_url = match env::var("REDIS_URL") {
            Ok(url) if !url.trim().is_empty() => url,
            _ => return Ok(None),
        };
        Ok(Some(CacheConfig {
            redis_url,
            max_connections: env::var("CACHE_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("CACHE_MAX_CONNECTIONS".to_string()))?,
        }))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.redis_url.starts_with("redis://") && !self.redis_url.starts_with("rediss://") {
            return Err(ConfigError::InvalidValue(
                "REDIS_URL must start with redis:// or rediss://".to_string(),
            ));
        }

        Ok(())
    }
}

impl LoggingConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "INFO".to_string()),
            format: match env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "plain".to_string())
                .as_str()
            {
                "json" => LogFormat::Json,
                _ => LogFormat::Plain,
            },
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["TRACE", "DEBUG", "INFO", "WARN", "ERROR"];
        if !valid_levels.contains(&self.level.to_uppercase().as_str()) {
            return Err(ConfigError::InvalidValue("LOG_LEVEL".to_string()));
        }

        Ok(())
    }
}

impl PaymentsConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let providers = PaymentFactoryConfig::from_env()
            .map_err(|e| ConfigError::InvalidValue(e.to_string()))?;
        let defaults = RedirectPages::default();

        Ok(PaymentsConfig {
            enabled_providers: providers.enabled_providers,
            redirect_pages: RedirectPages {
                success_url: env::var("PAYMENT_SUCCESS_URL").unwrap_or(defaults.success_url),
                failure_url: env::var("PAYMENT_FAILURE_URL").unwrap_or(defaults.failure_url),
                pending_url: env::var("PAYMENT_PENDING_URL").unwrap_or(defaults.pending_url),
            },
            admin_token: env::var("ADMIN_API_TOKEN")
                .ok()
                .filter(|token| !token.trim().is_empty()),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled_providers.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "at least one payment provider must be enabled".to_string(),
            ));
        }

        let pages = [
            ("PAYMENT_SUCCESS_URL", &self.redirect_pages.success_url),
            ("PAYMENT_FAILURE_URL", &self.redirect_pages.failure_url),
            ("PAYMENT_PENDING_URL", &self.redirect_pages.pending_url),
        ];
        for (name, url) in pages {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(ConfigError::InvalidValue(format!(
                    "{} must be a valid URL",
                    name
                )));
            }
        }

        Ok(())
    }

    pub fn factory_config(&self) -> PaymentFactoryConfig {
        PaymentFactoryConfig {
            enabled_providers: self.enabled_providers.clone(),
        }
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),

    #[error("Invalid value for configuration: {0}")]
    InvalidValue(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payments_config() -> PaymentsConfig {
        PaymentsConfig {
            enabled_providers: vec![ProviderName::Stripe],
            redirect_pages: RedirectPages::default(),
            admin_token: None,
        }
    }

    #[test]
    fn test_server_config_validation() {
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 8000,
        };

        assert!(config.validate().is_ok());
        assert_eq!(config.bind_address(), "127.0.0.1:8000");
    }

    #[test]
    fn test_invalid_port_validation() {
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0, // Invalid port
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_pool_bounds_validation() {
        let config = DatabaseConfig {
            url: "postgres://localhost/streamflix".to_string(),
            max_connections: 2,
            min_connections: 5,
            connection_timeout: 30,
            idle_timeout: None,
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_redis_scheme_validation() {
        let config = CacheConfig {
            redis_url: "http://localhost:6379".to_string(),
            max_connections: 10,
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_payments_config_validation() {
        assert!(payments_config().validate().is_ok());

        let mut no_providers = payments_config();
        no_providers.enabled_providers.clear();
        assert!(no_providers.validate().is_err());

        let mut bad_page = payments_config();
        bad_page.redirect_pages.failure_url = "/failed".to_string();
        assert!(bad_page.validate().is_err());
    }
}
