//! Tracing setup for the relay binary.
//!
//! Logs go to stderr. stdout is reserved for completion lines and the echoed
//! target console.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter directives read when `RUST_LOG` is unset, e.g. `codex_relay=debug`.
pub const LOG_ENV: &str = "CODEX_RELAY_LOG";
const DEFAULT_DIRECTIVES: &str = "codex_relay=info";

/// `RUST_LOG` wins when it parses, then `CODEX_RELAY_LOG`, then this crate at
/// info. `LOG_FORMAT=json` switches to JSON lines.
pub fn init_tracing() {
    let filter = build_filter(
        std::env::var(EnvFilter::DEFAULT_ENV).ok(),
        std::env::var(LOG_ENV).ok(),
    );
    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    let registry = tracing_subscriber::registry().with(filter);
    let _ = if use_json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };
}

fn build_filter(rust_log: Option<String>, relay_log: Option<String>) -> EnvFilter {
    [rust_log, relay_log]
        .into_iter()
        .flatten()
        .find_map(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_DIRECTIVES))
}
