//! Tracing/logging initialization.

use tracing_subscriber::EnvFilter;

/// Output format of the global subscriber.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// One JSON object per line.
    #[default]
    Json,
    /// Human-readable, for local runs and tests.
    Pretty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracingConfig {
    /// Filter used when `RUST_LOG` is unset or invalid.
    pub default_filter: String,
    pub format: LogFormat,
    /// Include the event target (e.g. `keystone::fallback`).
    pub with_target: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            default_filter: "info".to_string(),
            format: LogFormat::Json,
            with_target: true,
        }
    }
}

impl TracingConfig {
    /// Pretty output at `debug`, writing through the test harness capture.
    pub fn for_tests() -> Self {
        Self {
            default_filter: "debug".to_string(),
            format: LogFormat::Pretty,
            with_target: true,
        }
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.default_filter))
    }
}

/// Install the global subscriber described by `config`.
///
/// Returns `false` when a subscriber was already installed.
pub fn init_with(config: &TracingConfig) -> bool {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(config.filter())
        .with_target(config.with_target);

    match config.format {
        LogFormat::Json => builder
            .json()
            .with_timer(tracing_subscriber::fmt::time::SystemTime)
            .try_init()
            .is_ok(),
        LogFormat::Pretty => builder.with_test_writer().try_init().is_ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_a_no_op() {
        let config = TracingConfig::for_tests();
        init_with(&config);
        assert!(!init_with(&config));
        ::tracing::info!(target: "keystone::test", "still logging");
    }
}
