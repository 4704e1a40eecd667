use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Installs the global fmt subscriber. `RUST_LOG` wins over the
/// configured level. Returns `false` if a subscriber was already set.
pub fn init_logging(config: &LoggingConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = if config.json {
        builder.json().try_init().is_ok()
    } else {
        builder.try_init().is_ok()
    };
    if installed {
        tracing::debug!(level = %config.level, json = config.json, "logging initialised");
    }
    installed
}
