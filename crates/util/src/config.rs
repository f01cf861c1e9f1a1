use std::{env, fmt, net::SocketAddr, path::PathBuf, time::Duration};

use super::{database_url, server_bind_address};

const DEV_JWT_SECRET: &str = "cabinet-portal-dev-secret";
const DEFAULT_JWT_TTL_SECS: u64 = 3600;
const DEFAULT_REFRESH_THRESHOLD_SECS: u64 = 20 * 60;
const DEFAULT_UPLOAD_DIR: &str = "uploads";
const DEFAULT_UPLOAD_MAX_BYTES: usize = 50 * 1024 * 1024;
const DEFAULT_MAINTENANCE_INTERVAL_SECS: u64 = 300;
const DEFAULT_NOTIFICATION_RETENTION_DAYS: u32 = 90;

/// Application runtime environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => Err(ConfigError::InvalidEnvironment(other.to_string())),
        }
    }

    /// Returns `true` when the current environment should behave as development.
    pub fn is_development(self) -> bool {
        matches!(self, Self::Development)
    }

    /// Returns the canonical name used for logging/metrics labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        }
    }
}

/// Token signing settings.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub jwt_secret: Vec<u8>,
    pub token_ttl: Duration,
    /// Tokens with less lifetime than this left get a fresh one in `x-refresh-token`.
    pub refresh_threshold: Duration,
}

/// Cadence and retention of the background maintenance worker.
#[derive(Debug, Clone, Copy)]
pub struct MaintenanceConfig {
    pub interval: Duration,
    pub notification_retention_days: u32,
}

/// First administrator created on startup when no user exists yet.
#[derive(Debug, Clone)]
pub struct BootstrapAdmin {
    pub name: String,
    pub email: String,
    pub password: String,
}

/// Runtime configuration resolved from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub environment: Environment,
    pub database_url: String,
    pub auth: AuthConfig,
    pub upload_dir: PathBuf,
    pub upload_max_bytes: usize,
    pub maintenance: MaintenanceConfig,
    pub bootstrap_admin: Option<BootstrapAdmin>,
}

impl AppConfig {
    /// Constructs the configuration by reading and validating environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env_value = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
        let environment = Environment::from_str(&env_value)?;
        let bind_addr = server_bind_address().map_err(ConfigError::BindAddress)?;

        let jwt_secret = match env::var("JWT_SECRET") {
            Ok(value) if !value.trim().is_empty() => value.into_bytes(),
            _ if environment == Environment::Production => {
                return Err(ConfigError::MissingVar("JWT_SECRET"))
            }
            _ => DEV_JWT_SECRET.as_bytes().to_vec(),
        };

        let auth = AuthConfig {
            jwt_secret,
            token_ttl: Duration::from_secs(parse_var("JWT_TTL_SECS", DEFAULT_JWT_TTL_SECS)?),
            refresh_threshold: Duration::from_secs(parse_var(
                "JWT_REFRESH_THRESHOLD_SECS",
                DEFAULT_REFRESH_THRESHOLD_SECS,
            )?),
        };

        let upload_dir = env::var("UPLOAD_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_UPLOAD_DIR));

        let maintenance = MaintenanceConfig {
            interval: Duration::from_secs(parse_var(
                "MAINTENANCE_INTERVAL_SECS",
                DEFAULT_MAINTENANCE_INTERVAL_SECS,
            )?),
            notification_retention_days: parse_var(
                "NOTIFICATION_RETENTION_DAYS",
                DEFAULT_NOTIFICATION_RETENTION_DAYS,
            )?,
        };

        let bootstrap_admin = match (
            env::var("BOOTSTRAP_ADMIN_EMAIL"),
            env::var("BOOTSTRAP_ADMIN_PASSWORD"),
        ) {
            (Ok(email), Ok(password)) if !email.trim().is_empty() && !password.is_empty() => {
                Some(BootstrapAdmin {
                    name: env::var("BOOTSTRAP_ADMIN_NAME").unwrap_or_else(|_| "Administrator".to_string()),
                    email: email.trim().to_string(),
                    password,
                })
            }
            _ => None,
        };

        Ok(Self {
            bind_addr,
            environment,
            database_url: database_url(),
            auth,
            upload_dir,
            upload_max_bytes: parse_var("UPLOAD_MAX_BYTES", DEFAULT_UPLOAD_MAX_BYTES)?,
            maintenance,
            bootstrap_admin,
        })
    }
}

fn parse_var<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidNumber { name, value: raw }),
        Err(_) => Ok(default),
    }
}

/// Errors that can occur during configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    InvalidEnvironment(String),
    BindAddress(std::net::AddrParseError),
    MissingVar(&'static str),
    InvalidNumber { name: &'static str, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEnvironment(value) => write!(
                f,
                "APP_ENV must be one of 'development', 'production', or 'test' (got {value})"
            ),
            Self::BindAddress(err) => write!(f, "invalid APP_BIND_ADDR value: {err}"),
            Self::MissingVar(name) => write!(f, "{name} must be set in production"),
            Self::InvalidNumber { name, value } => {
                write!(f, "{name} must be a non-negative integer (got {value})")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DEFAULT_BIND_ADDR, ENV_GUARD};

    const VARS: &[&str] = &[
        "APP_ENV",
        "APP_BIND_ADDR",
        "JWT_SECRET",
        "JWT_TTL_SECS",
        "UPLOAD_MAX_BYTES",
        "MAINTENANCE_INTERVAL_SECS",
        "BOOTSTRAP_ADMIN_EMAIL",
        "BOOTSTRAP_ADMIN_PASSWORD",
        "BOOTSTRAP_ADMIN_NAME",
    ];

    fn clear_vars() {
        for name in VARS {
            env::remove_var(name);
        }
    }

    #[test]
    fn loads_defaults_in_development() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_vars();

        let config = AppConfig::from_env().expect("config should load with defaults");
        assert_eq!(config.environment, Environment::Development);
        assert_eq!(config.bind_addr.to_string(), DEFAULT_BIND_ADDR);
        assert_eq!(config.auth.jwt_secret, DEV_JWT_SECRET.as_bytes());
        assert_eq!(config.auth.token_ttl, Duration::from_secs(3600));
        assert_eq!(config.upload_max_bytes, DEFAULT_UPLOAD_MAX_BYTES);
        assert_eq!(config.maintenance.notification_retention_days, 90);
        assert!(config.bootstrap_admin.is_none());
    }

    #[test]
    fn bootstrap_admin_needs_email_and_password() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_vars();
        env::set_var("BOOTSTRAP_ADMIN_EMAIL", " owner@example.com ");

        let config = AppConfig::from_env().expect("config");
        assert!(config.bootstrap_admin.is_none());

        env::set_var("BOOTSTRAP_ADMIN_PASSWORD", "changeme");
        let config = AppConfig::from_env().expect("config");
        let admin = config.bootstrap_admin.expect("bootstrap admin");
        assert_eq!(admin.email, "owner@example.com");
        assert_eq!(admin.name, "Administrator");

        clear_vars();
    }

    #[test]
    fn rejects_invalid_environment() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_vars();
        env::set_var("APP_ENV", "invalid");

        let err = AppConfig::from_env().expect_err("invalid env should error");
        assert!(matches!(err, ConfigError::InvalidEnvironment(value) if value == "invalid"));

        env::remove_var("APP_ENV");
    }

    #[test]
    fn production_requires_jwt_secret() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_vars();
        env::set_var("APP_ENV", "production");

        let err = AppConfig::from_env().expect_err("secret is mandatory");
        assert!(matches!(err, ConfigError::MissingVar("JWT_SECRET")));

        env::set_var("JWT_SECRET", "prod-secret");
        env::set_var("APP_BIND_ADDR", "0.0.0.0:9000");
        let config = AppConfig::from_env().expect("config should load");
        assert_eq!(config.environment, Environment::Production);
        assert_eq!(config.bind_addr.to_string(), "0.0.0.0:9000");
        assert_eq!(config.auth.jwt_secret, b"prod-secret");

        clear_vars();
    }

    #[test]
    fn reports_unparsable_numbers() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_vars();
        env::set_var("JWT_TTL_SECS", "soon");

        let err = AppConfig::from_env().expect_err("ttl must be numeric");
        assert!(matches!(err, ConfigError::InvalidNumber { name: "JWT_TTL_SECS", .. }));

        clear_vars();
    }
}
