//! Tracing initialisation.
//!
//! `RUST_LOG` takes precedence over the configured `application.log_level`:
//!
//! ```bash
//! RUST_LOG=sky_daq::actuator=debug sky_daq run --config config/sky_daq.toml
//! SKYDAQ_APPLICATION__LOG_FORMAT=json sky_daq run --config config/sky_daq.toml
//! ```

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{ApplicationConfig, LogFormat};

/// Install the global subscriber.
///
/// Returns false if a subscriber was already installed (tests, embedding),
/// in which case the existing one is left alone.
pub fn init(config: &ApplicationConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));
    let registry = tracing_subscriber::registry().with(filter);

    let result = match config.log_format {
        LogFormat::Pretty => registry.with(fmt::layer().with_target(true)).try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(false))
            .try_init(),
    };

    match result {
        Ok(()) => {
            tracing::debug!(
                level = %config.log_level,
                format = ?config.log_format,
                "Tracing initialised"
            );
            true
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_harmless() {
        let config = ApplicationConfig::default();
        let _ = init(&config);
        assert!(!init(&config));
    }
}
