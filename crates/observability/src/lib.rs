//! Process-wide tracing setup.
//!
//! JSON lines on stdout, filtered by `RUST_LOG` (default `info`). Safe to call
//! more than once; only the first call installs a subscriber.

use tracing_subscriber::EnvFilter;

pub const DEFAULT_FILTER: &str = "info";

/// Initialize tracing with `RUST_LOG`, falling back to [`DEFAULT_FILTER`].
pub fn init() {
    init_with_filter(DEFAULT_FILTER);
}

/// Like [`init`], but with the given fallback filter when `RUST_LOG` is unset
/// or invalid (e.g. `"jobwatch_engine=debug,info"`).
pub fn init_with_filter(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false)
        .try_init()
        .is_ok();

    if installed {
        tracing::debug!("tracing initialized");
    }
}
