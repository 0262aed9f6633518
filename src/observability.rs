// Tracing initialization with a configurable and reloadable log level.
use std::sync::OnceLock;

use tracing_subscriber::{EnvFilter, fmt, prelude::*, reload};

static LOG_RELOAD_HANDLE: OnceLock<reload::Handle<EnvFilter, tracing_subscriber::Registry>> =
    OnceLock::new();

/// Installs a global `fmt` subscriber filtered by `RUST_LOG`, or by `level`
/// when `RUST_LOG` is unset or invalid.
///
/// Returns `false` when a global subscriber was already installed.
pub fn init_tracing(level: &str) -> bool {
    let filter = std::env::var("RUST_LOG")
        .ok()
        .and_then(|_| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(level));

    let (reload_layer, handle) = reload::Layer::new(filter);
    let installed = tracing_subscriber::registry()
        .with(reload_layer)
        .with(fmt::layer())
        .try_init()
        .is_ok();
    if installed {
        let _ = LOG_RELOAD_HANDLE.set(handle);
    }
    installed
}

/// Replaces the active filter, e.g. `"rs_civic=debug,info"`.
pub fn set_log_level(level: &str) -> bool {
    match LOG_RELOAD_HANDLE.get() {
        Some(handle) => handle.modify(|filter| *filter = EnvFilter::new(level)).is_ok(),
        None => false,
    }
}
