//! Logging setup for the command-line tool.
//!
//! The library only emits `tracing` events; installing a subscriber is the
//! binary's business. Filtering follows `CTRLFLOW_LOG`, falling back to
//! `RUST_LOG`, and defaults to warnings only. Output goes to stderr so it
//! never mixes with a dumped flow on stdout.

use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "CTRLFLOW_LOG";

/// Filter directives for the given verbosity, unless the environment has some.
fn build_filter(verbosity: u8) -> EnvFilter {
    if let Ok(directives) = std::env::var(LOG_ENV) {
        return EnvFilter::builder().parse_lossy(directives);
    }
    if std::env::var("RUST_LOG").is_ok() {
        return EnvFilter::from_default_env();
    }
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    EnvFilter::new(format!("ctrlflow={level}"))
}

/// Install the global subscriber. Calling it twice is harmless.
pub fn init_tracing(verbosity: u8) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(build_filter(verbosity))
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
