//! Tracing subscriber setup for the `cyclesync` binary.
//!
//! `RUST_LOG` filters (default `cyclesync=info`); `RUST_LOG_FORMAT=json`
//! switches to JSON lines. Output goes to stderr so stdout stays for
//! command results.

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "cyclesync=info";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the global subscriber. Later calls are no-ops.
pub fn init() {
    let is_json = std::env::var("RUST_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(std::io::stderr)
        .with_target(true);

    if is_json {
        let _ = subscriber.json().try_init();
    } else {
        let _ = subscriber.try_init();
    }
}
