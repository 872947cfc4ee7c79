use crate::payments::providers::{AirtelConfig, MpesaConfig};
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub redis: Option<RedisConfig>,
    pub payments: PaymentsConfig,
    pub mpesa: Option<MpesaConfig>,
    pub airtel: Option<AirtelConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub environment: String,
    /// Emit JSON log lines instead of the human-readable format
    pub json_logs: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub run_migrations: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentsConfig {
    pub confirmation_window_secs: u64,
    /// Upper bound on one push, retries included; must be shorter than the window
    pub push_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub sweep_batch_size: i64,
    pub settle_grace_secs: u64,
}

impl Default for PaymentsConfig {
    fn default() -> Self {
        Self {
            confirmation_window_secs: 120,
            push_timeout_secs: 60,
            sweep_interval_secs: 5,
            sweep_batch_size: 100,
            settle_grace_secs: 30,
        }
    }
}

impl PaymentsConfig {
    pub fn confirmation_window(&self) -> Duration {
        Duration::from_secs(self.confirmation_window_secs)
    }

    pub fn push_timeout(&self) -> Duration {
        Duration::from_secs(self.push_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn settle_grace(&self) -> Duration {
        Duration::from_secs(self.settle_grace_secs)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| anyhow!("{} must be a valid number, got '{}'", name, value)),
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let server = ServerConfig {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("PORT")
                .context("PORT not set")?
                .parse()
                .context("PORT must be a valid number")?,
            environment: env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),
            json_logs: env::var("LOG_FORMAT")
                .map(|f| f.eq_ignore_ascii_case("json"))
                .unwrap_or(false),
        };

        let database = DatabaseConfig {
            url: env::var("DATABASE_URL").context("DATABASE_URL not set")?,
            max_connections: parse_var("DATABASE_MAX_CONNECTIONS", 10)?,
            run_migrations: env::var("DATABASE_RUN_MIGRATIONS")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(true),
        };

        let redis = env::var("REDIS_URL").ok().map(|url| RedisConfig { url });

        let defaults = PaymentsConfig::default();
        let payments = PaymentsConfig {
            confirmation_window_secs: parse_var(
                "PAYMENT_CONFIRMATION_WINDOW_SECS",
                defaults.confirmation_window_secs,
            )?,
            push_timeout_secs: parse_var("PAYMENT_PUSH_TIMEOUT_SECS", defaults.push_timeout_secs)?,
            sweep_interval_secs: parse_var(
                "PAYMENT_SWEEP_INTERVAL_SECS",
                defaults.sweep_interval_secs,
            )?,
            sweep_batch_size: parse_var("PAYMENT_SWEEP_BATCH_SIZE", defaults.sweep_batch_size)?,
            settle_grace_secs: parse_var("PAYMENT_SETTLE_GRACE_SECS", defaults.settle_grace_secs)?,
        };

        let config = Config {
            server,
            database,
            redis,
            payments,
            mpesa: MpesaConfig::from_env()?,
            airtel: AirtelConfig::from_env()?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.port < 1024 {
            return Err(anyhow!(
                "Port must be at least 1024, got {}",
                self.server.port
            ));
        }

        let valid_environments = ["development", "staging", "production"];
        if !valid_environments.contains(&self.server.environment.as_str()) {
            return Err(anyhow!(
                "Environment must be one of: {:?}, got {}",
                valid_environments,
                self.server.environment
            ));
        }

        if self.database.url.trim().is_empty() {
            return Err(anyhow!("DATABASE_URL cannot be empty"));
        }

        if self.database.max_connections == 0 {
            return Err(anyhow!("DATABASE_MAX_CONNECTIONS must be greater than 0"));
        }

        if let Some(redis) = &self.redis {
            if redis.url.trim().is_empty() {
                return Err(anyhow!("REDIS_URL cannot be empty"));
            }
        }

        if self.payments.confirmation_window_secs == 0 {
            return Err(anyhow!(
                "PAYMENT_CONFIRMATION_WINDOW_SECS must be greater than 0"
            ));
        }

        if self.payments.push_timeout_secs == 0
            || self.payments.push_timeout_secs >= self.payments.confirmation_window_secs
        {
            return Err(anyhow!(
                "PAYMENT_PUSH_TIMEOUT_SECS must be between 1 and {} (the confirmation window), got {}",
                self.payments.confirmation_window_secs.saturating_sub(1),
                self.payments.push_timeout_secs
            ));
        }

        if self.payments.sweep_interval_secs == 0 {
            return Err(anyhow!("PAYMENT_SWEEP_INTERVAL_SECS must be greater than 0"));
        }

        if self.payments.sweep_batch_size <= 0 {
            return Err(anyhow!("PAYMENT_SWEEP_BATCH_SIZE must be greater than 0"));
        }

        if let Some(mpesa) = &self.mpesa {
            if mpesa.shortcode.trim().is_empty() || mpesa.passkey.trim().is_empty() {
                return Err(anyhow!("MPESA_SHORTCODE and MPESA_PASSKEY are required"));
            }
            if mpesa.callback_url.trim().is_empty() {
                return Err(anyhow!("MPESA_CALLBACK_URL cannot be empty"));
            }
        }

        if self.mpesa.is_none() && self.airtel.is_none() {
            tracing::warn!("No mobile-money provider configured; payments will be refused");
        }

        Ok(())
    }
}
