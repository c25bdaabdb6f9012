//! Configuration for the sync binary.
//!
//! This module handles parsing configuration from environment variables.
//!
//! # Environment Variables
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `WORKMIRROR_SERVER_URL` | No | - | Receiving server; unset writes batches to stdout |
//! | `WORKMIRROR_AUTH_TOKEN` | No | - | Bearer token sent with every batch |
//! | `WORKMIRROR_IGNORE_FILE` | No | `.gitignore` | Ignore file name inside each workspace |
//! | `WORKMIRROR_DEBOUNCE_MS` | No | 500 | Quiet period before a flush |
//! | `WORKMIRROR_RETRY_DELAY_MS` | No | 2000 | Delay before retrying a failed flush |
//! | `WORKMIRROR_ECHO_TTL_MS` | No | 3000 | Echo suppression window |
//! | `WORKMIRROR_EMIT_TIMEOUT_SECS` | No | 60 | Upper bound per emitter call, `0` disables |
//! | `WORKMIRROR_STABILITY_MS` | No | 300 | Write stabilization threshold, `0` disables |
//!
//! # Example
//!
//! ```no_run
//! use workmirror_sync::config::Config;
//!
//! let config = Config::from_env().expect("Failed to load configuration");
//! let options = config.to_sync_options();
//! println!("Debounce: {:?}", options.debounce);
//! ```

use std::env;
use std::time::Duration;

use thiserror::Error;

use crate::echo::DEFAULT_ECHO_TTL_MS;
use crate::ignore_rules::DEFAULT_IGNORE_FILE;
use crate::session::{SyncOptions, DEFAULT_EMIT_TIMEOUT_SECS, DEFAULT_RETRY_DELAY_MS};
use crate::utils::debounce::DEFAULT_DEBOUNCE_MS;
use crate::watcher::{WriteStabilization, DEFAULT_STABILITY_THRESHOLD_MS};

/// Errors that can occur during configuration parsing.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Environment variable has an invalid value.
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Configuration for the sync binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Server receiving batches. `None` writes batches to stdout.
    pub server_url: Option<String>,

    /// Bearer token for the server.
    pub auth_token: Option<String>,

    /// Ignore file name looked up in each workspace root.
    pub ignore_file: String,

    /// Debounce delay in milliseconds.
    pub debounce_ms: u64,

    /// Retry delay in milliseconds.
    pub retry_delay_ms: u64,

    /// Echo suppression window in milliseconds.
    pub echo_ttl_ms: u64,

    /// Emitter call timeout in seconds, `0` for none.
    pub emit_timeout_secs: u64,

    /// Write stabilization threshold in milliseconds, `0` for none.
    pub stability_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: None,
            auth_token: None,
            ignore_file: DEFAULT_IGNORE_FILE.to_string(),
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            echo_ttl_ms: DEFAULT_ECHO_TTL_MS,
            emit_timeout_secs: DEFAULT_EMIT_TIMEOUT_SECS,
            stability_ms: DEFAULT_STABILITY_THRESHOLD_MS,
        }
    }
}

impl Config {
    /// Creates a new `Config` by parsing environment variables.
    ///
    /// Empty values are treated as unset.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if a numeric variable is set but is not a
    /// non-negative integer.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        Ok(Self {
            server_url: non_empty_var("WORKMIRROR_SERVER_URL"),
            auth_token: non_empty_var("WORKMIRROR_AUTH_TOKEN"),
            ignore_file: non_empty_var("WORKMIRROR_IGNORE_FILE").unwrap_or(defaults.ignore_file),
            debounce_ms: parse_u64("WORKMIRROR_DEBOUNCE_MS", defaults.debounce_ms)?,
            retry_delay_ms: parse_u64("WORKMIRROR_RETRY_DELAY_MS", defaults.retry_delay_ms)?,
            echo_ttl_ms: parse_u64("WORKMIRROR_ECHO_TTL_MS", defaults.echo_ttl_ms)?,
            emit_timeout_secs: parse_u64(
                "WORKMIRROR_EMIT_TIMEOUT_SECS",
                defaults.emit_timeout_secs,
            )?,
            stability_ms: parse_u64("WORKMIRROR_STABILITY_MS", defaults.stability_ms)?,
        })
    }

    /// Session options derived from this configuration.
    #[must_use]
    pub fn to_sync_options(&self) -> SyncOptions {
        let stabilization = (self.stability_ms > 0).then(|| WriteStabilization {
            stability_threshold: Duration::from_millis(self.stability_ms),
            ..WriteStabilization::default()
        });

        SyncOptions {
            debounce: Duration::from_millis(self.debounce_ms),
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            echo_ttl: Duration::from_millis(self.echo_ttl_ms),
            emit_timeout: (self.emit_timeout_secs > 0)
                .then(|| Duration::from_secs(self.emit_timeout_secs)),
            stabilization,
            ignore_file: self.ignore_file.clone(),
            ..SyncOptions::default()
        }
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_u64(key: &str, default: u64) -> Result<u64, ConfigError> {
    match non_empty_var(key) {
        Some(val) => val
            .trim()
            .parse::<u64>()
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("expected non-negative integer, got '{val}'"),
            }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    /// Helper to run tests with isolated environment variables.
    /// Clears all WORKMIRROR_* vars before the test and restores them after.
    fn with_clean_env<F, R>(f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let saved_vars: Vec<(String, String)> = env::vars()
            .filter(|(k, _)| k.starts_with("WORKMIRROR_"))
            .collect();

        for (key, _) in &saved_vars {
            env::remove_var(key);
        }

        let result = f();

        // Drop anything the test set, then restore
        let set_by_test: Vec<String> = env::vars()
            .map(|(k, _)| k)
            .filter(|k| k.starts_with("WORKMIRROR_"))
            .collect();
        for key in set_by_test {
            env::remove_var(key);
        }
        for (key, value) in saved_vars {
            env::set_var(key, value);
        }

        result
    }

    #[test]
    #[serial]
    fn test_defaults() {
        with_clean_env(|| {
            let config = Config::from_env().expect("should parse empty environment");

            assert_eq!(config, Config::default());
            assert!(config.server_url.is_none());
            assert_eq!(config.ignore_file, ".gitignore");
            assert_eq!(config.debounce_ms, 500);
            assert_eq!(config.retry_delay_ms, 2000);
            assert_eq!(config.echo_ttl_ms, 3000);
            assert_eq!(config.emit_timeout_secs, 60);
        });
    }

    #[test]
    #[serial]
    fn test_full_config() {
        with_clean_env(|| {
            env::set_var("WORKMIRROR_SERVER_URL", "https://mirror.example.com");
            env::set_var("WORKMIRROR_AUTH_TOKEN", "secret");
            env::set_var("WORKMIRROR_IGNORE_FILE", ".syncignore");
            env::set_var("WORKMIRROR_DEBOUNCE_MS", "250");
            env::set_var("WORKMIRROR_RETRY_DELAY_MS", "5000");
            env::set_var("WORKMIRROR_ECHO_TTL_MS", "1000");
            env::set_var("WORKMIRROR_EMIT_TIMEOUT_SECS", "10");
            env::set_var("WORKMIRROR_STABILITY_MS", "0");

            let config = Config::from_env().expect("should parse full config");

            assert_eq!(config.server_url.as_deref(), Some("https://mirror.example.com"));
            assert_eq!(config.auth_token.as_deref(), Some("secret"));
            assert_eq!(config.ignore_file, ".syncignore");
            assert_eq!(config.debounce_ms, 250);
            assert_eq!(config.retry_delay_ms, 5000);
            assert_eq!(config.echo_ttl_ms, 1000);
            assert_eq!(config.emit_timeout_secs, 10);
            assert_eq!(config.stability_ms, 0);
        });
    }

    #[test]
    #[serial]
    fn test_empty_values_are_unset() {
        with_clean_env(|| {
            env::set_var("WORKMIRROR_SERVER_URL", "");
            env::set_var("WORKMIRROR_DEBOUNCE_MS", "  ");

            let config = Config::from_env().unwrap();
            assert!(config.server_url.is_none());
            assert_eq!(config.debounce_ms, DEFAULT_DEBOUNCE_MS);
        });
    }

    #[test]
    #[serial]
    fn test_invalid_number() {
        with_clean_env(|| {
            env::set_var("WORKMIRROR_DEBOUNCE_MS", "soon");

            let err = Config::from_env().unwrap_err();
            assert!(
                matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "WORKMIRROR_DEBOUNCE_MS")
            );
            assert!(err.to_string().contains("'soon'"));
        });
    }

    #[test]
    #[serial]
    fn test_negative_number_rejected() {
        with_clean_env(|| {
            env::set_var("WORKMIRROR_RETRY_DELAY_MS", "-1");
            assert!(Config::from_env().is_err());
        });
    }

    #[test]
    fn test_to_sync_options() {
        let config = Config {
            debounce_ms: 100,
            retry_delay_ms: 200,
            echo_ttl_ms: 300,
            emit_timeout_secs: 4,
            stability_ms: 50,
            ignore_file: ".syncignore".to_string(),
            ..Config::default()
        };

        let options = config.to_sync_options();
        assert_eq!(options.debounce, Duration::from_millis(100));
        assert_eq!(options.retry_delay, Duration::from_millis(200));
        assert_eq!(options.echo_ttl, Duration::from_millis(300));
        assert_eq!(options.emit_timeout, Some(Duration::from_secs(4)));
        assert_eq!(
            options.stabilization.map(|s| s.stability_threshold),
            Some(Duration::from_millis(50))
        );
        assert_eq!(options.ignore_file, ".syncignore");
        assert_eq!(options.limits, crate::batch::BatchLimits::default());
    }

    #[test]
    fn test_zero_disables_timeout_and_stabilization() {
        let config = Config {
            emit_timeout_secs: 0,
            stability_ms: 0,
            ..Config::default()
        };

        let options = config.to_sync_options();
        assert!(options.emit_timeout.is_none());
        assert!(options.stabilization.is_none());
    }
}
