//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;

use crate::error::{AssayError, AssayResult};

/// Install a `fmt` subscriber at `level` for this crate.
///
/// `RUST_LOG`, when set, replaces the filter entirely. Calling this twice is
/// an error.
pub fn init(level: &str) -> AssayResult<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| filter_for(level))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| AssayError::Configuration(format!("logging already initialised: {e}")))
}

fn filter_for(level: &str) -> AssayResult<EnvFilter> {
    EnvFilter::try_new(format!("warn,flex_assay={level}"))
        .map_err(|e| AssayError::Configuration(format!("invalid log level '{level}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_for_levels() {
        for level in ["trace", "debug", "info", "warn", "error"] {
            assert!(filter_for(level).is_ok());
        }
    }
}
