//! `tracing` subscriber setup.
//!
//! [`init`] installs a process-wide subscriber; [`dispatch`] builds one
//! without installing it, for [`AppOption::Logger`](crate::AppOption::Logger)
//! or tests. `RUST_LOG` overrides the configured level.

use tracing::Dispatch;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::{LogFormat, LoggerConfig};
use crate::error::Error;

fn filter(cfg: &LoggerConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cfg.level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// A subscriber for `cfg`, not yet installed.
pub fn dispatch(cfg: &LoggerConfig) -> Dispatch {
    let registry = tracing_subscriber::registry().with(filter(cfg));
    match cfg.format {
        LogFormat::Text => Dispatch::new(registry.with(fmt::layer().with_target(true))),
        LogFormat::Json => Dispatch::new(
            registry.with(fmt::layer().json().with_current_span(true).with_span_list(false)),
        ),
    }
}

/// Installs the subscriber for `cfg` as the global default. Fails if one is
/// already installed.
pub fn init(cfg: &LoggerConfig) -> Result<(), Error> {
    tracing::dispatcher::set_global_default(dispatch(cfg))
        .map_err(|e| Error::msg(format!("logger: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_routes_events() {
        let d = dispatch(&LoggerConfig { level: "debug".into(), format: LogFormat::Json });
        tracing::dispatcher::with_default(&d, || {
            assert!(tracing::enabled!(tracing::Level::DEBUG));
        });
    }
}
