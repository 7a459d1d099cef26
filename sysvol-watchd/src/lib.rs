//! Watch daemon: bumps `GPT.INI` markers of authored policy directories
//! after their content changes, and serves a control socket.

pub mod debounce;
mod error;
pub mod paths;
pub mod protocol;
pub mod resolver;
mod runtime;
pub mod watcher;

pub use debounce::DebounceTimer;
pub use error::DaemonError;
pub use protocol::{
    request_dirs, request_status, request_stop, request_update_dirs, send_request, DaemonRequest,
    DaemonResponse,
};
pub use resolver::resolve;
pub use runtime::{run, start_blocking, DaemonOptions};
pub use watcher::{WatcherHandle, WatcherState};

/// Install the global `fmt` subscriber, writing to stderr.
///
/// `RUST_LOG` wins when set; otherwise 0 → info, 1 → debug, 2+ → trace.
pub fn init_tracing(verbosity: u8) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
