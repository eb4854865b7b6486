//! Logging setup.
//!
//! The bridge reports through `tracing`; this module only installs a
//! subscriber for hosts that do not bring their own. `RUST_LOG` takes
//! precedence over the configured level when it is set.

use tracing_subscriber::EnvFilter;

use crate::config::{LogConfig, LogFormat};

/// Install a global `tracing` subscriber for the given configuration.
///
/// Returns `false` when a global subscriber was already installed, in
/// which case the existing one stays in place.
pub fn init(config: &LogConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str()));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = match config.format {
        LogFormat::Plain => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    result.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogLevel;

    #[test]
    fn test_second_init_is_noop() {
        let config = LogConfig {
            level: LogLevel::Warn,
            format: LogFormat::Plain,
        };
        // Some other test may have installed a subscriber first.
        let _ = init(&config);
        assert!(!init(&config));
    }
}
