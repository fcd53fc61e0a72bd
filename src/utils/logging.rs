//! Logging initialization for the host and for module processes
//!
//! - RUST_LOG takes precedence over any configured filter
//! - Output goes to stderr: a module's stdout is its bus channel, and the
//!   host mirrors that so both sides behave the same
//!
//! ## Host
//! ```no_run
//! use module_host::utils::init_logging;
//!
//! init_logging(None); // RUST_LOG, or "info"
//! ```
//!
//! ## Module
//! ```no_run
//! use module_host::utils::init_module_logging;
//!
//! init_module_logging("widget", None);
//! ```

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

const DEFAULT_FILTER: &str = "info";

/// RUST_LOG if set, otherwise `configured`, otherwise `fallback`
fn resolve_filter(configured: Option<&str>, fallback: &str) -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        return EnvFilter::from_default_env();
    }
    EnvFilter::new(configured.unwrap_or(fallback))
}

fn ansi() -> bool {
    std::env::var("NO_COLOR").is_err()
}

/// Initialize logging for the host process
///
/// # Arguments
/// * `filter` - Optional filter from config (e.g. "info", "module_host::module=debug").
///   Ignored when RUST_LOG is set.
pub fn init_logging(filter: Option<&str>) {
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(false)
                .with_ansi(ansi()),
        )
        .with(resolve_filter(filter, DEFAULT_FILTER))
        .init();
}

/// Initialize logging inside a module process
///
/// Without a filter everything logs at `info` and targets named after the
/// module at `debug`. Never writes to stdout.
pub fn init_module_logging(module_name: &str, filter: Option<&str>) {
    let default_filter = format!("info,{}=debug", module_name.replace('-', "_"));
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(false)
                .with_ansi(false),
        )
        .with(resolve_filter(filter, &default_filter))
        .init();
}

/// Initialize logging with JSON output for log aggregation
#[cfg(feature = "json-logging")]
pub fn init_json_logging(filter: Option<&str>) {
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_current_span(true)
                .with_span_list(true),
        )
        .with(resolve_filter(filter, DEFAULT_FILTER))
        .init();
}

/// Initialize host logging from the `logging` config section
pub fn init_logging_from_config(config: &LoggingConfig) {
    let filter = config.filter.as_deref();
    if config.json_format {
        #[cfg(feature = "json-logging")]
        {
            init_json_logging(filter);
            return;
        }
    }
    init_logging(filter);
}
