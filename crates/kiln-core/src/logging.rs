//! Logger initialization on top of `tracing-subscriber`.

use std::sync::Once;

use tracing_subscriber::EnvFilter;

/// Filter used when neither the config nor `RUST_LOG` sets one.
pub const DEFAULT_FILTER: &str = "info,kiln_render=debug";

/// Logger configuration.
///
/// `filter` follows the `EnvFilter` directive syntax
/// (e.g. "warn,kiln_render::shared_buffer=trace").
#[derive(Debug, Clone, Default)]
pub struct LoggingConfig {
    pub filter: Option<String>,
    pub with_target: bool,
}

static INIT: Once = Once::new();

/// Installs the global subscriber with the default configuration.
pub fn init() {
    init_with(LoggingConfig::default());
}

/// Whether a subscriber install has been attempted.
pub fn is_initialized() -> bool {
    INIT.is_completed()
}

/// Installs the global subscriber once; later calls are ignored.
///
/// `RUST_LOG` wins over the configured filter so a run can be inspected
/// without recompiling.
pub fn init_with(config: LoggingConfig) {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(config.filter.as_deref().unwrap_or(DEFAULT_FILTER))
        });

        let result = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(config.with_target)
            .try_init();

        if result.is_ok() {
            tracing::debug!("logging initialized");
        }
    });
}
