//! Logging setup.
//!
//! Tenantry logs through `tracing`. Schema switches, fan-out progress and
//! selection decisions are emitted at `debug`; schema lifecycle changes at
//! `info`. Nothing is printed until a subscriber is installed, either by the
//! application or by [`init`] with the `tracing-subscriber` feature.
//!
//! # Environment Variables
//!
//! - `TENANTRY_DEBUG=true` - Enable debug logging
//! - `TENANTRY_LOG_LEVEL=debug|info|warn|error|trace` - Set specific log level
//! - `TENANTRY_LOG_FORMAT=json|pretty|compact` - Set output format (default: json)
//!
//! ```rust,no_run
//! use tenantry_core::logging;
//!
//! logging::init();
//! ```

use std::env;
use std::sync::Once;

static INIT: Once = Once::new();

/// Check if `TENANTRY_DEBUG` is set to "true", "1" or "yes".
#[inline]
pub fn is_debug_enabled() -> bool {
    env::var("TENANTRY_DEBUG")
        .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(false)
}

/// Log level from `TENANTRY_LOG_LEVEL`.
///
/// Defaults to "debug" if `TENANTRY_DEBUG` is enabled, otherwise "warn".
pub fn get_log_level() -> &'static str {
    let fallback = if is_debug_enabled() { "debug" } else { "warn" };
    match env::var("TENANTRY_LOG_LEVEL") {
        Ok(level) => normalize_level(&level).unwrap_or(fallback),
        Err(_) => fallback,
    }
}

/// Log format from `TENANTRY_LOG_FORMAT`, defaulting to "json".
pub fn get_log_format() -> &'static str {
    env::var("TENANTRY_LOG_FORMAT")
        .map(|f| match f.to_lowercase().as_str() {
            "pretty" => "pretty",
            "compact" => "compact",
            _ => "json",
        })
        .unwrap_or("json")
}

fn normalize_level(level: &str) -> Option<&'static str> {
    match level.to_lowercase().as_str() {
        "trace" => Some("trace"),
        "debug" => Some("debug"),
        "info" => Some("info"),
        "warn" => Some("warn"),
        "error" => Some("error"),
        _ => None,
    }
}

/// Initialize logging from the environment.
///
/// Does nothing unless `TENANTRY_DEBUG` or `TENANTRY_LOG_LEVEL` is set.
/// Subsequent calls are no-ops.
pub fn init() {
    if !is_debug_enabled() && env::var("TENANTRY_LOG_LEVEL").is_err() {
        return;
    }
    install(get_log_level());
}

/// Initialize logging at a fixed level, ignoring the environment.
pub fn init_with_level(level: &str) {
    install(normalize_level(level).unwrap_or("warn"));
}

/// Initialize debug-level logging.
pub fn init_debug() {
    install("debug");
}

fn install(level: &'static str) {
    INIT.call_once(|| {
        #[cfg(feature = "tracing-subscriber")]
        {
            use tracing_subscriber::{EnvFilter, fmt, prelude::*};

            let filter = EnvFilter::try_new(format!(
                "tenantry={level},tenantry_core={level},\
                 tenantry_postgres={level},tenantry_axum={level}"
            ))
            .unwrap_or_else(|_| EnvFilter::new("warn"));

            let format = get_log_format();
            let result = match format {
                "json" => tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt::layer().json())
                    .try_init(),
                "compact" => tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt::layer().compact())
                    .try_init(),
                _ => tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt::layer().pretty())
                    .try_init(),
            };

            if result.is_ok() {
                tracing::info!(level, format, "Tenantry logging initialized");
            }
        }

        #[cfg(not(feature = "tracing-subscriber"))]
        {
            let _ = level;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_level() {
        assert_eq!(normalize_level("DEBUG"), Some("debug"));
        assert_eq!(normalize_level("Trace"), Some("trace"));
        assert_eq!(normalize_level("loud"), None);
    }

    #[test]
    fn test_log_format_is_known() {
        assert!(matches!(get_log_format(), "json" | "pretty" | "compact"));
    }

    #[test]
    fn test_log_level_is_known() {
        assert!(normalize_level(get_log_level()).is_some());
    }
}
