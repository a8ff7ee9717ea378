//! Tracing setup for embedders.
//!
//! The crate itself only emits `tracing` events; installing a subscriber is
//! the embedding binary's job. [`init`] is a convenience for front ends that
//! do not need their own layering.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install a global subscriber filtered by `RUST_LOG` (default `info`).
///
/// Output goes to stderr; `CONDUCTOR_LOG_FORMAT=json` switches to one JSON
/// object per line for log shippers. Calling this twice panics, as with any
/// global subscriber installation.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("CONDUCTOR_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().with_writer(std::io::stderr).json())
            .init();
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr).compact())
            .init();
    }
}
