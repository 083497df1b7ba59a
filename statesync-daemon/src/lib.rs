//! statesync daemon runtime: filesystem change watcher and service assembly.

mod error;
pub mod service;
pub mod watcher;

pub use error::DaemonError;
pub use service::StateService;
pub use watcher::{ChangeWatcher, Debouncer};

/// Install the global tracing subscriber.
///
/// Honours `RUST_LOG` and defaults to `info`. `json` switches to one JSON
/// object per line. Calling this twice is a no-op.
pub fn init_tracing(json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        let _ = fmt().json().with_env_filter(filter).try_init();
    } else {
        let _ = fmt().with_env_filter(filter).with_target(false).try_init();
    }
}
