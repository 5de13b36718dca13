//! Logging initialization.

use crate::config::LogLevel;
use std::sync::Once;
use tracing::Level;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Initialize the tracing subscriber at the configured level.
///
/// Safe to call on every engine start; only the first call installs a
/// subscriber (the process may host several start/stop cycles).
pub fn init(level: LogLevel) {
    let tracing_level = match level {
        LogLevel::Silent => return,
        LogLevel::Error => Level::ERROR,
        LogLevel::Warning => Level::WARN,
        LogLevel::Info => Level::INFO,
        LogLevel::Debug => Level::DEBUG,
    };

    INIT.call_once(|| {
        let filter = EnvFilter::from_default_env()
            .add_directive(
                format!("tunsocks={}", tracing_level)
                    .parse()
                    .unwrap_or_else(|_| LevelFilter::from_level(tracing_level).into()),
            )
            .add_directive(
                "tokio=warn"
                    .parse()
                    .unwrap_or_else(|_| LevelFilter::WARN.into()),
            );

        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .try_init();
    });
}
