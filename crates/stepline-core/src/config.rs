// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::time::Duration;

/// Default number of instances executing at once.
pub const DEFAULT_MAX_WORKERS: usize = 8;
/// Default interval at which waiters re-read an instance record.
pub const DEFAULT_WAIT_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Default database pool size.
pub const DEFAULT_MAX_DB_CONNECTIONS: u32 = 5;

/// Stepline engine configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL or SQLite connection URL
    pub database_url: String,
    /// Maximum instances executing concurrently
    pub max_workers: usize,
    /// Poll interval for `wait_for_instance`
    pub wait_poll_interval: Duration,
    /// Database pool size
    pub max_db_connections: u32,
}

impl Config {
    /// Configuration for `database_url` with default limits.
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_workers: DEFAULT_MAX_WORKERS,
            wait_poll_interval: DEFAULT_WAIT_POLL_INTERVAL,
            max_db_connections: DEFAULT_MAX_DB_CONNECTIONS,
        }
    }

    /// Load a `.env` file if present, then read the environment.
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_env()
    }

    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `STEPLINE_DATABASE_URL`: PostgreSQL or SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `STEPLINE_MAX_WORKERS`: concurrent instances (default: 8)
    /// - `STEPLINE_WAIT_POLL_INTERVAL_MS`: waiter poll interval (default: 500)
    /// - `STEPLINE_MAX_DB_CONNECTIONS`: pool size (default: 5)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("STEPLINE_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("STEPLINE_DATABASE_URL"))?;

        if !(database_url.starts_with("sqlite:")
            || database_url.starts_with("postgres://")
            || database_url.starts_with("postgresql://"))
        {
            return Err(ConfigError::Invalid(
                "STEPLINE_DATABASE_URL",
                "must be a sqlite: or postgres:// URL",
            ));
        }

        let max_workers: usize = std::env::var("STEPLINE_MAX_WORKERS")
            .unwrap_or_else(|_| DEFAULT_MAX_WORKERS.to_string())
            .parse()
            .ok()
            .filter(|n| *n > 0)
            .ok_or(ConfigError::Invalid(
                "STEPLINE_MAX_WORKERS",
                "must be a positive integer",
            ))?;

        let wait_poll_ms: u64 = std::env::var("STEPLINE_WAIT_POLL_INTERVAL_MS")
            .unwrap_or_else(|_| DEFAULT_WAIT_POLL_INTERVAL.as_millis().to_string())
            .parse()
            .ok()
            .filter(|n| *n > 0)
            .ok_or(ConfigError::Invalid(
                "STEPLINE_WAIT_POLL_INTERVAL_MS",
                "must be a positive number of milliseconds",
            ))?;

        let max_db_connections: u32 = std::env::var("STEPLINE_MAX_DB_CONNECTIONS")
            .unwrap_or_else(|_| DEFAULT_MAX_DB_CONNECTIONS.to_string())
            .parse()
            .ok()
            .filter(|n| *n > 0)
            .ok_or(ConfigError::Invalid(
                "STEPLINE_MAX_DB_CONNECTIONS",
                "must be a positive integer",
            ))?;

        Ok(Self {
            database_url,
            max_workers,
            wait_poll_interval: Duration::from_millis(wait_poll_ms),
            max_db_connections,
        })
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
