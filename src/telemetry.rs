//! Tracing setup.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

use crate::config::{LogLevel, LoggingConfig};

/// Install the global tracing subscriber from a logging config.
///
/// The `TETHER_LOG` env var overrides the configured level. Safe to call
/// more than once; later calls are no-ops.
pub fn init(logging: &LoggingConfig) {
    let default = if logging.enabled {
        level_filter(logging.level)
    } else {
        LevelFilter::OFF
    };
    let filter = EnvFilter::builder()
        .with_default_directive(default.into())
        .with_env_var("TETHER_LOG")
        .from_env_lossy();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

fn level_filter(level: LogLevel) -> LevelFilter {
    match level {
        LogLevel::Debug => LevelFilter::DEBUG,
        LogLevel::Info => LevelFilter::INFO,
        LogLevel::Error => LevelFilter::ERROR,
        LogLevel::None => LevelFilter::OFF,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_map_onto_filters() {
        assert_eq!(level_filter(LogLevel::Debug), LevelFilter::DEBUG);
        assert_eq!(level_filter(LogLevel::Info), LevelFilter::INFO);
        assert_eq!(level_filter(LogLevel::Error), LevelFilter::ERROR);
        assert_eq!(level_filter(LogLevel::None), LevelFilter::OFF);
    }

    #[test]
    fn init_is_idempotent() {
        let logging = LoggingConfig::default();
        init(&logging);
        init(&logging);
    }
}
