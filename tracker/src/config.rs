//! Configuration module for the DbListener tracker.
//!
//! This module handles parsing configuration from environment variables.
//!
//! # Environment Variables
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `DBLISTENER_DATA_DIR` | No | `~/.dblistener` | Directory holding the store and artifacts |
//! | `DBLISTENER_STORE_PATH` | No | `<data>/connections.db` | SQLite store file |
//! | `DBLISTENER_EXTRACTOR` | No | `ast` | `ast` (lexical fallback on parse errors) or `lexical` |
//! | `DBLISTENER_DIALECT` | No | `postgres` | SQL dialect used by the AST extractor |
//! | `DBLISTENER_ACTIVITY_VIEW` | No | `activity` | `activity` (`pg_stat_activity`) or `statements` (`pg_stat_statements`) |
//! | `DBLISTENER_RESET_STATS` | No | `false` | Reset statement counters before each session |
//! | `DBLISTENER_CONNECT_TIMEOUT_SECS` | No | 5 | Connect timeout for each sample (1-300) |
//! | `DBLISTENER_ARTIFACT_DIR` | No | `<data>/reports` | Where JSON usage artifacts go; `off` disables them |
//! | `DBLISTENER_LOG_FORMAT` | No | `pretty` | `pretty` or `json` |
//!
//! # Example
//!
//! ```no_run
//! use dblistener_tracker::config::Config;
//!
//! let config = Config::from_env().expect("Failed to load configuration");
//! println!("Store: {}", config.store_path.display());
//! ```

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use directories::BaseDirs;
use thiserror::Error;

use crate::extractor::{ExtractorConfig, ExtractorStrategy};
use crate::sampler::ActivityView;

/// Default data directory name relative to home.
const DEFAULT_DATA_DIR: &str = ".dblistener";

/// Default store file name inside the data directory.
const DEFAULT_STORE_FILE: &str = "connections.db";

/// Default artifact directory name inside the data directory.
const DEFAULT_ARTIFACT_DIR: &str = "reports";

/// Default SQL dialect for the AST extractor.
const DEFAULT_DIALECT: &str = "postgres";

/// Default connect timeout for a sample (in seconds).
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;

/// Maximum allowed connect timeout (in seconds).
const MAX_CONNECT_TIMEOUT_SECS: u64 = 300;

/// Errors that can occur during configuration parsing.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Environment variable has an invalid value.
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Failed to determine home directory.
    #[error("failed to determine home directory")]
    NoHomeDirectory,
}

/// Output format for the tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Configuration for the DbListener tracker.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the store and, by default, the artifacts.
    pub data_dir: PathBuf,

    /// SQLite file with connections, reports and noise.
    pub store_path: PathBuf,

    /// Which extraction strategy to run.
    pub extractor: ExtractorStrategy,

    /// Dialect name understood by the AST extractor.
    pub dialect: String,

    /// Which activity view the sampler reads.
    pub activity_view: ActivityView,

    /// Reset statement counters before capturing the baseline.
    pub reset_statistics: bool,

    /// Connect timeout applied to every sample.
    pub connect_timeout: Duration,

    /// Directory for per-session JSON usage artifacts.
    /// If `None`, artifacts are not written.
    pub artifact_dir: Option<PathBuf>,

    /// Log output format.
    pub log_format: LogFormat,
}

impl Config {
    /// Creates a new `Config` by parsing environment variables.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if any variable is set to a value that cannot be
    /// parsed, or if the home directory cannot be determined and
    /// `DBLISTENER_DATA_DIR` is not set.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Optional: DBLISTENER_DATA_DIR (default: ~/.dblistener)
        let data_dir = match env::var("DBLISTENER_DATA_DIR") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => {
                let base_dirs = BaseDirs::new().ok_or(ConfigError::NoHomeDirectory)?;
                base_dirs.home_dir().join(DEFAULT_DATA_DIR)
            }
        };

        let store_path = env::var("DBLISTENER_STORE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join(DEFAULT_STORE_FILE));

        let extractor = match env::var("DBLISTENER_EXTRACTOR") {
            Ok(val) => val
                .parse::<ExtractorStrategy>()
                .map_err(|message| invalid("DBLISTENER_EXTRACTOR", message))?,
            Err(_) => ExtractorStrategy::Ast,
        };

        let dialect = env::var("DBLISTENER_DIALECT")
            .map(|val| val.trim().to_ascii_lowercase())
            .unwrap_or_else(|_| DEFAULT_DIALECT.to_string());
        if sqlparser::dialect::dialect_from_str(&dialect).is_none() {
            return Err(invalid(
                "DBLISTENER_DIALECT",
                format!("unknown SQL dialect '{dialect}'"),
            ));
        }

        let activity_view = match env::var("DBLISTENER_ACTIVITY_VIEW") {
            Ok(val) => val
                .parse::<ActivityView>()
                .map_err(|message| invalid("DBLISTENER_ACTIVITY_VIEW", message))?,
            Err(_) => ActivityView::Activity,
        };

        let reset_statistics = match env::var("DBLISTENER_RESET_STATS") {
            Ok(val) => parse_bool("DBLISTENER_RESET_STATS", &val)?,
            Err(_) => false,
        };

        // Optional: DBLISTENER_CONNECT_TIMEOUT_SECS (default: 5, must be 1-300)
        let connect_timeout = match env::var("DBLISTENER_CONNECT_TIMEOUT_SECS") {
            Ok(val) => {
                let secs = val.parse::<u64>().map_err(|_| {
                    invalid(
                        "DBLISTENER_CONNECT_TIMEOUT_SECS",
                        format!("expected positive integer, got '{val}'"),
                    )
                })?;
                if !(1..=MAX_CONNECT_TIMEOUT_SECS).contains(&secs) {
                    return Err(invalid(
                        "DBLISTENER_CONNECT_TIMEOUT_SECS",
                        format!("timeout must be between 1 and {MAX_CONNECT_TIMEOUT_SECS}, got {secs}"),
                    ));
                }
                Duration::from_secs(secs)
            }
            Err(_) => Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
        };

        let artifact_dir = match env::var("DBLISTENER_ARTIFACT_DIR") {
            Ok(val) if val.trim().eq_ignore_ascii_case("off") => None,
            Ok(val) => Some(PathBuf::from(val)),
            Err(_) => Some(data_dir.join(DEFAULT_ARTIFACT_DIR)),
        };

        let log_format = match env::var("DBLISTENER_LOG_FORMAT") {
            Ok(val) => match val.trim().to_ascii_lowercase().as_str() {
                "pretty" => LogFormat::Pretty,
                "json" => LogFormat::Json,
                _ => {
                    return Err(invalid(
                        "DBLISTENER_LOG_FORMAT",
                        format!("expected 'pretty' or 'json', got '{val}'"),
                    ))
                }
            },
            Err(_) => LogFormat::Pretty,
        };

        Ok(Self {
            data_dir,
            store_path,
            extractor,
            dialect,
            activity_view,
            reset_statistics,
            connect_timeout,
            artifact_dir,
            log_format,
        })
    }

    /// Builds the extractor settings carried by this configuration.
    #[must_use]
    pub fn extractor_config(&self) -> ExtractorConfig {
        ExtractorConfig {
            strategy: self.extractor,
            dialect: self.dialect.clone(),
            ..ExtractorConfig::default()
        }
    }
}

fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.into(),
    }
}

fn parse_bool(key: &str, val: &str) -> Result<bool, ConfigError> {
    match val.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(key, format!("expected boolean, got '{val}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    /// Helper to run tests with isolated environment variables.
    /// Clears all DBLISTENER_* vars before the test and restores them after.
    fn with_clean_env<F, R>(f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let saved_vars: Vec<(String, String)> = env::vars()
            .filter(|(k, _)| k.starts_with("DBLISTENER_"))
            .collect();

        for (key, _) in &saved_vars {
            env::remove_var(key);
        }

        let result = f();

        let leftover: Vec<String> = env::vars()
            .map(|(k, _)| k)
            .filter(|k| k.starts_with("DBLISTENER_"))
            .collect();
        for key in leftover {
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
            env::set_var("DBLISTENER_DATA_DIR", "/var/lib/dblistener");

            let config = Config::from_env().expect("should parse default config");

            assert_eq!(config.data_dir, PathBuf::from("/var/lib/dblistener"));
            assert_eq!(
                config.store_path,
                PathBuf::from("/var/lib/dblistener/connections.db")
            );
            assert_eq!(config.extractor, ExtractorStrategy::Ast);
            assert_eq!(config.dialect, "postgres");
            assert_eq!(config.activity_view, ActivityView::Activity);
            assert!(!config.reset_statistics);
            assert_eq!(config.connect_timeout, Duration::from_secs(5));
            assert_eq!(
                config.artifact_dir,
                Some(PathBuf::from("/var/lib/dblistener/reports"))
            );
            assert_eq!(config.log_format, LogFormat::Pretty);
        });
    }

    #[test]
    #[serial]
    fn test_full_config() {
        with_clean_env(|| {
            env::set_var("DBLISTENER_DATA_DIR", "/data");
            env::set_var("DBLISTENER_STORE_PATH", "/custom/store.db");
            env::set_var("DBLISTENER_EXTRACTOR", "lexical");
            env::set_var("DBLISTENER_DIALECT", "MySQL");
            env::set_var("DBLISTENER_ACTIVITY_VIEW", "statements");
            env::set_var("DBLISTENER_RESET_STATS", "yes");
            env::set_var("DBLISTENER_CONNECT_TIMEOUT_SECS", "30");
            env::set_var("DBLISTENER_ARTIFACT_DIR", "off");
            env::set_var("DBLISTENER_LOG_FORMAT", "json");

            let config = Config::from_env().expect("should parse full config");

            assert_eq!(config.store_path, PathBuf::from("/custom/store.db"));
            assert_eq!(config.extractor, ExtractorStrategy::Lexical);
            assert_eq!(config.dialect, "mysql");
            assert_eq!(config.activity_view, ActivityView::StatementStats);
            assert!(config.reset_statistics);
            assert_eq!(config.connect_timeout, Duration::from_secs(30));
            assert!(config.artifact_dir.is_none());
            assert_eq!(config.log_format, LogFormat::Json);
        });
    }

    #[test]
    #[serial]
    fn test_unknown_dialect_rejected() {
        with_clean_env(|| {
            env::set_var("DBLISTENER_DATA_DIR", "/data");
            env::set_var("DBLISTENER_DIALECT", "cobol");

            let err = Config::from_env().unwrap_err();
            assert!(matches!(
                err,
                ConfigError::InvalidValue { ref key, .. } if key == "DBLISTENER_DIALECT"
            ));
        });
    }

    #[test]
    #[serial]
    fn test_invalid_extractor_rejected() {
        with_clean_env(|| {
            env::set_var("DBLISTENER_DATA_DIR", "/data");
            env::set_var("DBLISTENER_EXTRACTOR", "magic");

            let err = Config::from_env().unwrap_err();
            assert!(matches!(
                err,
                ConfigError::InvalidValue { ref key, .. } if key == "DBLISTENER_EXTRACTOR"
            ));
        });
    }

    #[test]
    #[serial]
    fn test_zero_timeout_rejected() {
        with_clean_env(|| {
            env::set_var("DBLISTENER_DATA_DIR", "/data");
            env::set_var("DBLISTENER_CONNECT_TIMEOUT_SECS", "0");

            let err = Config::from_env().unwrap_err();
            assert!(matches!(
                err,
                ConfigError::InvalidValue { ref key, ref message }
                    if key == "DBLISTENER_CONNECT_TIMEOUT_SECS" && message.contains("between 1 and 300")
            ));
        });
    }

    #[test]
    #[serial]
    fn test_invalid_bool_rejected() {
        with_clean_env(|| {
            env::set_var("DBLISTENER_DATA_DIR", "/data");
            env::set_var("DBLISTENER_RESET_STATS", "sometimes");

            let err = Config::from_env().unwrap_err();
            assert!(matches!(
                err,
                ConfigError::InvalidValue { ref key, .. } if key == "DBLISTENER_RESET_STATS"
            ));
        });
    }

    #[test]
    #[serial]
    fn test_invalid_log_format_rejected() {
        with_clean_env(|| {
            env::set_var("DBLISTENER_DATA_DIR", "/data");
            env::set_var("DBLISTENER_LOG_FORMAT", "xml");

            assert!(Config::from_env().is_err());
        });
    }

    #[test]
    #[serial]
    fn test_extractor_config_carries_strategy_and_dialect() {
        with_clean_env(|| {
            env::set_var("DBLISTENER_DATA_DIR", "/data");
            env::set_var("DBLISTENER_EXTRACTOR", "lexical");
            env::set_var("DBLISTENER_DIALECT", "sqlite");

            let config = Config::from_env().unwrap();
            let extractor_config = config.extractor_config();

            assert_eq!(extractor_config.strategy, ExtractorStrategy::Lexical);
            assert_eq!(extractor_config.dialect, "sqlite");
            assert!(!extractor_config.keywords.is_empty());
        });
    }
}
