//! Tracing setup.
//!
//! Level resolution, first match wins:
//! 1. `RUST_LOG` (any filter directive)
//! 2. `MODELFETCH_LOG_LEVEL` (debug, info, warn, error)
//! 3. `MODELFETCH_ENV` (local/development → debug, everything else → info)
//! 4. `[logging] level` from the config file

use crate::config::schema::LoggingConfig;
use tracing_subscriber::EnvFilter;

const LEVELS: &[&str] = &["debug", "info", "warn", "error"];

/// Resolve the filter directive from environment and config
#[must_use]
pub fn resolve_level(
    log_level_env: Option<&str>,
    deploy_env: Option<&str>,
    config: &LoggingConfig,
) -> String {
    if let Some(level) = log_level_env.map(str::to_lowercase) {
        if LEVELS.contains(&level.as_str()) {
            return level;
        }
    }

    if let Some(env) = deploy_env.map(str::to_lowercase) {
        return match env.as_str() {
            "local" | "development" => "debug",
            _ => "info",
        }
        .to_string();
    }

    config.level.clone()
}

/// Install the global subscriber
pub fn init(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = resolve_level(
            std::env::var("MODELFETCH_LOG_LEVEL").ok().as_deref(),
            std::env::var("MODELFETCH_ENV").ok().as_deref(),
            config,
        );
        EnvFilter::new(level)
    });

    tracing_subscriber::fmt().with_env_filter(filter).init();
}
