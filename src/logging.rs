//! Logging initialization
//!
//! Uses `tracing` with `tracing-subscriber`. Log lines go to stderr so they
//! never mix with command output.

use tracing_subscriber::{fmt, EnvFilter};

use crate::core::config::LogFormat;

/// Filter used when neither `RUST_LOG` nor configuration names one
pub const DEFAULT_FILTER: &str = "warn";

/// Initialize the global subscriber
///
/// `RUST_LOG` wins over `directive`, which usually comes from `--verbose`,
/// `TFLOW_LOG` or the `log_filter` config key. An unparsable directive falls
/// back to [`DEFAULT_FILTER`].
pub fn init(directive: Option<&str>, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .ok()
        .or_else(|| directive.and_then(|d| EnvFilter::try_new(d).ok()))
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER));

    let builder = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_line_number(true);

    // A subscriber may already be installed (e.g. when embedded); keep it
    let _ = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
}

/// Initialize logging for tests, captured by the test harness
pub fn init_test() {
    let _ = fmt()
        .with_env_filter(EnvFilter::new("tflow=debug"))
        .with_test_writer()
        .try_init();
}
