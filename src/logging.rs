//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Install a global `tracing` subscriber configured from `config`.
///
/// `RUST_LOG` takes precedence over the configured level. Calling this more
/// than once is a no-op; returns `false` when a subscriber was already set.
pub fn init_tracing(config: &LoggingConfig) -> bool {
    let level: tracing::Level = config.level.into();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_ascii_lowercase()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.include_targets);

    let installed = if config.json_format {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    installed.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FableConfig;

    #[test]
    fn test_init_is_idempotent() {
        let config = FableConfig::testing();
        init_tracing(&config.logging);
        assert!(!init_tracing(&config.logging));
    }
}
