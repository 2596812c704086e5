//! Tracing setup for the sidecar.
//!
//! - ASSIGNMENTD_LOG sets the filter (default "info").
//! - ASSIGNMENTD_LOG_FORMAT=json switches to JSON lines.
//!
//! Everything goes to stderr; stdout is reserved for protocol responses.

use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let filter =
        EnvFilter::try_from_env("ASSIGNMENTD_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_ansi(false);

    match std::env::var("ASSIGNMENTD_LOG_FORMAT").as_deref() {
        Ok("json") => {
            builder.json().init();
        }
        _ => {
            builder.init();
        }
    }
}
