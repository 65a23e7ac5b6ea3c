//! Application configuration.
//!
//! ```toml
//! [[listen]]
//! addr = "0.0.0.0:8080"
//!
//! [[listen]]
//! addr = "0.0.0.0:8443"
//! tls = "tls"
//! certfile = "cert.pem"
//! keyfile = "key.pem"
//!
//! [server]
//! grace = "30s"
//! log_sync = "80ms"
//!
//! [context]
//! body_limit = 10485760
//!
//! [logger]
//! level = "info,eudore=debug"
//! format = "json"
//! ```
//!
//! Every section and field is optional. Durations take literals such as
//! `"1h30m"` or integer nanoseconds.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::context::{DEFAULT_BODY_LIMIT, DEFAULT_MULTIPART_LIMIT};
use crate::server::{ServerConfig, ServerListenConfig, TlsMode};

/// Problems found by [`Config::validate`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("listen[{0}]: addr is required")]
    MissingAddr(usize),
    #[error("listen[{0}]: {1} is required for tls")]
    MissingTlsFile(usize, &'static str),
    #[error("listen[{0}]: {1} does not exist: {2}")]
    TlsFileNotFound(usize, &'static str, String),
    #[error("listen: address {0} is configured twice")]
    DuplicateAddr(String),
    #[error("server.max_buf_size must be 0 or at least 8192, got {0}")]
    BufferTooSmall(usize),
    #[error("server.log_sync must be positive")]
    ZeroLogSync,
    #[error("context.{0} must be positive")]
    ZeroLimit(&'static str),
    #[error("logger.level `{0}` is not a valid filter")]
    InvalidLevel(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config io: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("config invalid: {}", join(.0))]
    Validation(Vec<ValidationError>),
}

fn join(errors: &[ValidationError]) -> String {
    errors.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}

/// Per-request limits and the context pool.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ContextConfig {
    pub body_limit: usize,
    pub multipart_limit: usize,
    /// Idle contexts kept for reuse.
    pub pool_size: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            body_limit: DEFAULT_BODY_LIMIT,
            multipart_limit: DEFAULT_MULTIPART_LIMIT,
            pool_size: 1024,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggerConfig {
    /// An `EnvFilter` directive; `RUST_LOG` wins when set.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self { level: "info".to_owned(), format: LogFormat::Text }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub listen: Vec<ServerListenConfig>,
    pub server: ServerConfig,
    pub context: ContextConfig,
    pub logger: LoggerConfig,
}

impl Config {
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(text)?;
        config.validate().map_err(ConfigError::Validation)?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_toml(&std::fs::read_to_string(path)?)
    }

    /// Returns every problem found, not just the first.
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        let mut seen = std::collections::HashSet::new();
        for (i, l) in self.listen.iter().enumerate() {
            if l.addr.is_empty() {
                errors.push(ValidationError::MissingAddr(i));
            } else if !seen.insert(l.addr.as_str()) {
                errors.push(ValidationError::DuplicateAddr(l.addr.clone()));
            }
            if l.tls == TlsMode::Off {
                continue;
            }
            let mut files = vec![("certfile", &l.certfile), ("keyfile", &l.keyfile)];
            if l.tls == TlsMode::Mutual {
                files.push(("trustfile", &l.trustfile));
            }
            for (name, file) in files {
                match file {
                    None => errors.push(ValidationError::MissingTlsFile(i, name)),
                    Some(path) if !path.exists() => {
                        errors.push(ValidationError::TlsFileNotFound(i, name, path.display().to_string()))
                    }
                    Some(_) => {}
                }
            }
        }

        if self.server.max_buf_size != 0 && self.server.max_buf_size < 8192 {
            errors.push(ValidationError::BufferTooSmall(self.server.max_buf_size));
        }
        if self.server.log_sync.is_zero() {
            errors.push(ValidationError::ZeroLogSync);
        }
        if self.context.body_limit == 0 {
            errors.push(ValidationError::ZeroLimit("body_limit"));
        }
        if self.context.multipart_limit == 0 {
            errors.push(ValidationError::ZeroLimit("multipart_limit"));
        }
        if tracing_subscriber::EnvFilter::try_new(&self.logger.level).is_err() {
            errors.push(ValidationError::InvalidLevel(self.logger.level.clone()));
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn empty_document_is_default() {
        let cfg = Config::from_toml("").unwrap();
        assert!(cfg.listen.is_empty());
        assert_eq!(cfg.server.grace, Duration::from_secs(30));
        assert_eq!(cfg.context.body_limit, 10 << 20);
        assert_eq!(cfg.context.multipart_limit, 32 << 20);
        assert_eq!(cfg.logger.format, LogFormat::Text);
    }

    #[test]
    fn full_document() {
        let cfg = Config::from_toml(
            r#"
            [[listen]]
            addr = "127.0.0.1:8080"
            http2 = false

            [server]
            grace = "5s"
            log_sync = "1s"

            [context]
            body_limit = 1024

            [logger]
            level = "debug"
            format = "json"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.listen[0].addr, "127.0.0.1:8080");
        assert!(!cfg.listen[0].http2);
        assert_eq!(cfg.server.grace, Duration::from_secs(5));
        assert_eq!(cfg.server.log_sync, Duration::from_secs(1));
        assert_eq!(cfg.context.body_limit, 1024);
        assert_eq!(cfg.logger.format, LogFormat::Json);
    }

    #[test]
    fn validate_collects_every_problem() {
        let mut cfg = Config::default();
        cfg.listen.push(ServerListenConfig::new(""));
        cfg.listen.push(ServerListenConfig::tls("127.0.0.1:1", "/nonexistent.pem", "/nonexistent.key"));
        cfg.listen.push(ServerListenConfig::new("127.0.0.1:1"));
        cfg.server.max_buf_size = 10;
        cfg.context.body_limit = 0;

        let errors = cfg.validate().unwrap_err();
        assert!(errors.contains(&ValidationError::MissingAddr(0)));
        assert!(errors.contains(&ValidationError::DuplicateAddr("127.0.0.1:1".into())));
        assert!(errors.contains(&ValidationError::BufferTooSmall(10)));
        assert!(errors.contains(&ValidationError::ZeroLimit("body_limit")));
        assert_eq!(
            errors.iter().filter(|e| matches!(e, ValidationError::TlsFileNotFound(1, ..))).count(),
            2
        );
    }

    #[test]
    fn bad_duration_is_a_parse_error() {
        let err = Config::from_toml("[server]\ngrace = \"soon\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)), "{err}");
    }
}
