// Configuration and logging setup

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use crate::output::errors::DispatchError;

/// Environment variable overriding `num_workers`
pub const ENV_NUM_WORKERS: &str = "NEXUS_DISPATCH_NUM_WORKERS";
/// Environment variable overriding `raise_on_error`
pub const ENV_RAISE_ON_ERROR: &str = "NEXUS_DISPATCH_RAISE_ON_ERROR";

/// Session configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Hosts to run on at once; 1 runs serially
    pub num_workers: usize,
    /// Turn any host failure into an error from `run`
    pub raise_on_error: bool,
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            num_workers: 20,
            raise_on_error: false,
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file(path: &Path) -> Result<Self, DispatchError> {
        let content = std::fs::read_to_string(path).map_err(|e| DispatchError::Config {
            message: format!("failed to read configuration: {}", e),
            path: Some(path.to_path_buf()),
        })?;

        Self::parse_str(&content).map_err(|e| match e {
            DispatchError::Config { message, .. } => DispatchError::Config {
                message,
                path: Some(path.to_path_buf()),
            },
            other => other,
        })
    }

    /// Parse configuration from a YAML string
    pub fn parse_str(content: &str) -> Result<Self, DispatchError> {
        // An empty document means all defaults
        if content.trim().is_empty() {
            return Ok(Config::default());
        }

        let config: Config = serde_yaml::from_str(content).map_err(|e| DispatchError::Config {
            message: format!("invalid configuration: {}", e),
            path: None,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from the process environment
    pub fn apply_env(self) -> Result<Self, DispatchError> {
        self.apply_vars(|key| std::env::var(key).ok())
    }

    fn apply_vars(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self, DispatchError> {
        if let Some(value) = lookup(ENV_NUM_WORKERS) {
            self.num_workers = value.trim().parse().map_err(|_| DispatchError::Config {
                message: format!("{} must be a positive integer, got '{}'", ENV_NUM_WORKERS, value),
                path: None,
            })?;
        }

        if let Some(value) = lookup(ENV_RAISE_ON_ERROR) {
            self.raise_on_error = match value.trim().to_lowercase().as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" => false,
                _ => {
                    return Err(DispatchError::Config {
                        message: format!("{} must be true or false, got '{}'", ENV_RAISE_ON_ERROR, value),
                        path: None,
                    })
                }
            };
        }

        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), DispatchError> {
        if self.num_workers == 0 {
            return Err(DispatchError::Config {
                message: "num_workers must be at least 1".to_string(),
                path: None,
            });
        }
        Ok(())
    }
}

/// Where and how much to log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub enabled: bool,
    /// Level for the listed loggers, or for everything if none are listed
    pub level: String,
    /// Append log lines to this file
    pub file: Option<PathBuf>,
    pub to_console: bool,
    /// Log targets to enable; everything else is silenced
    pub loggers: Vec<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            enabled: true,
            level: "debug".to_string(),
            file: Some(PathBuf::from("nexus-dispatch.log")),
            to_console: false,
            loggers: vec!["nexus_dispatch".to_string()],
        }
    }
}

impl LoggingConfig {
    /// Filter directives; `RUST_LOG` takes precedence in [`init_logging`]
    pub fn directives(&self) -> String {
        let level = self.level.to_lowercase();
        if self.loggers.is_empty() {
            return level;
        }

        let mut directives = vec!["off".to_string()];
        directives.extend(self.loggers.iter().map(|l| format!("{}={}", l, level)));
        directives.join(",")
    }
}

/// Install the global tracing subscriber described by `config`.
///
/// Does nothing if logging is disabled or has no output. Safe to call more
/// than once; only the first subscriber installed takes effect.
pub fn init_logging(config: &LoggingConfig) -> Result<(), DispatchError> {
    if !config.enabled || (config.file.is_none() && !config.to_console) {
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.directives()))
        .map_err(|e| DispatchError::Config {
            message: format!("invalid log level '{}': {}", config.level, e),
            path: None,
        })?;

    let file_layer = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| DispatchError::Config {
                    message: format!("failed to open log file: {}", e),
                    path: Some(path.clone()),
                })?;
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        }
        None => None,
    };

    let console_layer = if config.to_console {
        Some(fmt::layer().with_writer(std::io::stdout))
    } else {
        None
    };

    // Err only means a subscriber is already installed
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(console_layer)
        .try_init();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.num_workers, 20);
        assert!(!config.raise_on_error);
        assert_eq!(config.logging.loggers, vec!["nexus_dispatch".to_string()]);
    }

    #[test]
    fn test_parse_partial_yaml() {
        let config = Config::parse_str(
            r#"
num_workers: 5
logging:
  level: info
  to_console: true
"#,
        )
        .unwrap();

        assert_eq!(config.num_workers, 5);
        assert!(!config.raise_on_error);
        assert_eq!(config.logging.level, "info");
        assert!(config.logging.to_console);
        assert_eq!(config.logging.file, Some(PathBuf::from("nexus-dispatch.log")));
    }

    #[test]
    fn test_parse_empty_is_default() {
        assert_eq!(Config::parse_str("  \n").unwrap(), Config::default());
    }

    #[test]
    fn test_parse_rejects_zero_workers() {
        assert!(matches!(
            Config::parse_str("num_workers: 0"),
            Err(DispatchError::Config { .. })
        ));
    }

    #[test]
    fn test_from_file_reports_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "num_workers: [1, 2]").unwrap();

        match Config::from_file(file.path()) {
            Err(DispatchError::Config { path, .. }) => {
                assert_eq!(path.as_deref(), Some(file.path()));
            }
            other => panic!("expected config error, got {:?}", other),
        }
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "raise_on_error: true\nnum_workers: 1").unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert!(config.raise_on_error);
        assert_eq!(config.num_workers, 1);
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [(ENV_NUM_WORKERS, "4"), (ENV_RAISE_ON_ERROR, "yes")]
            .into_iter()
            .collect();

        let config = Config::default()
            .apply_vars(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.num_workers, 4);
        assert!(config.raise_on_error);

        let bad = Config::default().apply_vars(|key| {
            (key == ENV_NUM_WORKERS).then(|| "many".to_string())
        });
        assert!(bad.is_err());
    }

    #[test]
    fn test_directives() {
        let mut logging = LoggingConfig::default();
        assert_eq!(logging.directives(), "off,nexus_dispatch=debug");

        logging.loggers.clear();
        logging.level = "WARN".to_string();
        assert_eq!(logging.directives(), "warn");
    }

    #[test]
    fn test_init_logging_disabled_is_noop() {
        let logging = LoggingConfig {
            enabled: false,
            ..LoggingConfig::default()
        };
        assert!(init_logging(&logging).is_ok());

        let no_output = LoggingConfig {
            file: None,
            to_console: false,
            ..LoggingConfig::default()
        };
        assert!(init_logging(&no_output).is_ok());
    }

    #[test]
    fn test_init_logging_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let logging = LoggingConfig {
            file: Some(dir.path().join("dispatch.log")),
            ..LoggingConfig::default()
        };

        init_logging(&logging).unwrap();
        init_logging(&logging).unwrap();
        assert!(dir.path().join("dispatch.log").exists());
    }
}
