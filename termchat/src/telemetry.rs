//! Logging setup. Logs go to stderr; stdout is reserved for the conversation.

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Env var holding filter directives, e.g. `TERMCHAT_LOG=termchat=debug`.
pub const LOG_ENV: &str = "TERMCHAT_LOG";

pub fn level_from_verbosity(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

/// Install the global subscriber. Safe to call more than once; later calls are no-ops.
pub fn init(verbosity: u8) {
    let filter = EnvFilter::builder()
        .with_default_directive(level_from_verbosity(verbosity).into())
        .with_env_var(LOG_ENV)
        .from_env_lossy();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
