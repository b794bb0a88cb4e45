//! tracing-subscriber setup
//!
//! Precedence: `-v` flags, then `RUST_LOG`, then `[logging] level` from the
//! config file.

use tracing_subscriber::EnvFilter;

/// Filter directive for the given verbosity and configured level
pub fn filter_directive(verbose: u8, configured: &str) -> String {
    match verbose {
        0 => std::env::var("RUST_LOG").unwrap_or_else(|_| configured.to_string()),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    }
}

pub fn init(verbose: u8, configured: &str) {
    let directive = filter_directive(verbose, configured);
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
