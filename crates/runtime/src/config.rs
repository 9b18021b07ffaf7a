//! Configuration loaded from environment variables.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

/// Execution bounds and capability settings for plugin code.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Per-listener timeout (default: 2000ms).
    pub listener_timeout: Duration,

    /// Per-hook-handler timeout (default: 500ms).
    pub hook_timeout: Duration,

    /// Per-controller timeout (default: 5000ms).
    pub controller_timeout: Duration,

    /// Per-widget render timeout (default: 1000ms).
    pub widget_timeout: Duration,

    /// Interpreter steps per invocation (default: 1,000,000).
    pub step_budget: u64,

    /// Largest value a single run may build, counted as nodes plus string
    /// bytes (default: 8 MiB).
    pub max_value_size: usize,

    /// Largest fragment body accepted by the compiler (default: 64 KiB).
    pub max_source_bytes: usize,

    /// Hosts the `http` capability may reach. Empty denies all outbound calls.
    pub http_allowed_hosts: Vec<String>,

    /// Outbound HTTP request timeout (default: 3000ms).
    pub http_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            listener_timeout: Duration::from_millis(2_000),
            hook_timeout: Duration::from_millis(500),
            controller_timeout: Duration::from_millis(5_000),
            widget_timeout: Duration::from_millis(1_000),
            step_budget: 1_000_000,
            max_value_size: 8 * 1024 * 1024,
            max_source_bytes: 64 * 1024,
            http_allowed_hosts: Vec::new(),
            http_timeout: Duration::from_millis(3_000),
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP server port (default: 3000).
    pub port: u16,

    /// PostgreSQL connection URL.
    pub database_url: String,

    /// Maximum database connections in pool (default: 10).
    pub database_max_connections: u32,

    /// CORS allowed origins (comma-separated, default: "*").
    pub cors_allowed_origins: Vec<String>,

    pub runtime: RuntimeConfig,
}

fn parse_var<T: FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{name} must be a valid {}", std::any::type_name::<T>())),
        Err(_) => Ok(default),
    }
}

fn millis_var(name: &str, default: Duration) -> Result<Duration> {
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    parse_var(name, default_ms).map(Duration::from_millis)
}

fn list_var(name: &str) -> Option<Vec<String>> {
    env::var(name).ok().map(|v| {
        v.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    })
}

impl RuntimeConfig {
    /// Load runtime knobs from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        Ok(Self {
            listener_timeout: millis_var("LISTENER_TIMEOUT_MS", defaults.listener_timeout)?,
            hook_timeout: millis_var("HOOK_TIMEOUT_MS", defaults.hook_timeout)?,
            controller_timeout: millis_var("CONTROLLER_TIMEOUT_MS", defaults.controller_timeout)?,
            widget_timeout: millis_var("WIDGET_TIMEOUT_MS", defaults.widget_timeout)?,
            step_budget: parse_var("SCRIPT_STEP_BUDGET", defaults.step_budget)?,
            max_value_size: parse_var("SCRIPT_MAX_VALUE_SIZE", defaults.max_value_size)?,
            max_source_bytes: parse_var("SCRIPT_MAX_SOURCE_BYTES", defaults.max_source_bytes)?,
            http_allowed_hosts: list_var("PLUGIN_HTTP_ALLOWED_HOSTS").unwrap_or_default(),
            http_timeout: millis_var("PLUGIN_HTTP_TIMEOUT_MS", defaults.http_timeout)?,
        })
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let port = parse_var("PORT", 3000u16)?;

        let database_url =
            env::var("DATABASE_URL").context("DATABASE_URL environment variable is required")?;

        let database_max_connections = parse_var("DATABASE_MAX_CONNECTIONS", 10u32)?;

        let cors_allowed_origins =
            list_var("CORS_ALLOWED_ORIGINS").unwrap_or_else(|| vec!["*".to_string()]);

        let runtime = RuntimeConfig::from_env()?;

        Ok(Self {
            port,
            database_url,
            database_max_connections,
            cors_allowed_origins,
            runtime,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn runtime_defaults_are_bounded() {
        let config = RuntimeConfig::default();
        assert!(config.http_allowed_hosts.is_empty());
        assert!(config.step_budget > 0);
        assert!(config.hook_timeout < config.controller_timeout);
    }

    #[test]
    fn missing_variables_fall_back_to_defaults() {
        let value = parse_var("BAZAAR_TEST_UNSET_VARIABLE", 42u64).unwrap();
        assert_eq!(value, 42);
        let d = millis_var("BAZAAR_TEST_UNSET_VARIABLE", Duration::from_millis(7)).unwrap();
        assert_eq!(d, Duration::from_millis(7));
    }
}
