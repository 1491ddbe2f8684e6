//! Logging setup
//!
//! `tracing-subscriber` with an `EnvFilter`, a stderr layer and an optional
//! daily-rotated file layer from `tracing-appender`.

use crate::error::{BridgeError, Result};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Layer};

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Default level when `RUST_LOG` does not say otherwise
    pub level: Level,

    /// Also write to this file, rotated daily
    pub file_path: Option<PathBuf>,

    /// Emit JSON lines instead of the compact format
    pub json: bool,

    /// Include thread IDs
    pub thread_ids: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            file_path: None,
            json: false,
            thread_ids: false,
        }
    }
}

impl LogConfig {
    /// Create config from `LOG_LEVEL` and `CCU_BRIDGE_LOG_FILE`
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(level) = lookup("LOG_LEVEL").and_then(|l| parse_level(&l)) {
            config.level = level;
        }
        if let Some(path) = lookup("CCU_BRIDGE_LOG_FILE").filter(|p| !p.is_empty()) {
            config.file_path = Some(PathBuf::from(path));
        }
        if let Some(json) = lookup("CCU_BRIDGE_LOG_JSON") {
            config.json = matches!(json.to_lowercase().as_str(), "1" | "true" | "yes");
        }

        config
    }
}

/// Accepts `tracing` names and the Python-style `WARNING`/`CRITICAL`
fn parse_level(raw: &str) -> Option<Level> {
    match raw.trim().to_uppercase().as_str() {
        "WARNING" => Some(Level::WARN),
        "CRITICAL" | "FATAL" => Some(Level::ERROR),
        other => Level::from_str(other).ok(),
    }
}

/// Initialize the global subscriber
pub fn init_logging(config: LogConfig) -> Result<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(config.level.into())
        .from_env_lossy();

    let stderr_layer = if config.json {
        fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_thread_ids(config.thread_ids)
            .boxed()
    } else {
        fmt::layer()
            .compact()
            .with_writer(std::io::stderr)
            .with_thread_ids(config.thread_ids)
            .boxed()
    };

    let file_layer = match &config.file_path {
        Some(path) => Some(
            fmt::layer()
                .with_writer(file_appender(path)?)
                .with_ansi(false)
                .with_thread_ids(config.thread_ids)
                .boxed(),
        ),
        None => None,
    };

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer);

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| BridgeError::config(format!("Logging already initialized: {e}")))
}

fn file_appender(path: &Path) -> Result<tracing_appender::rolling::RollingFileAppender> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;

    let name = path
        .file_name()
        .unwrap_or_else(|| std::ffi::OsStr::new("ccu-event-bridge.log"));
    Ok(tracing_appender::rolling::daily(dir, name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("debug", Some(Level::DEBUG))]
    #[case("INFO", Some(Level::INFO))]
    #[case("WARNING", Some(Level::WARN))]
    #[case("critical", Some(Level::ERROR))]
    #[case("chatty", None)]
    fn test_parse_level(#[case] raw: &str, #[case] expected: Option<Level>) {
        assert_eq!(parse_level(raw), expected);
    }

    #[test]
    fn test_from_lookup() {
        let config = LogConfig::from_lookup(|key| match key {
            "LOG_LEVEL" => Some("WARNING".to_string()),
            "CCU_BRIDGE_LOG_FILE" => Some("/var/log/bridge.log".to_string()),
            "CCU_BRIDGE_LOG_JSON" => Some("true".to_string()),
            _ => None,
        });

        assert_eq!(config.level, Level::WARN);
        assert_eq!(config.file_path, Some(PathBuf::from("/var/log/bridge.log")));
        assert!(config.json);
    }

    #[test]
    fn test_file_appender_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("bridge.log");
        file_appender(&path).unwrap();
        assert!(dir.path().join("logs").is_dir());
    }
}
