//! Logging setup.
//!
//! fmt subscriber behind an env-filter. The level comes from the config (or
//! the `--log-level` override) and stays adjustable at runtime through the
//! returned handle, which is the hot-reload target. `RUST_LOG` wins when set.

use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, reload};

pub struct LogHandle {
    handle: reload::Handle<EnvFilter, Registry>,
}

impl LogHandle {
    /// Swap the active level filter.
    pub fn set_level(&self, level: &str) {
        if let Err(e) = self.handle.reload(EnvFilter::new(level)) {
            eprintln!("log level reload failed: {}", e);
        }
    }
}

/// Install the global subscriber. `file` switches the sink from stdout to an
/// append-only log file; an unusable file falls back to stdout.
pub fn init(level: &str, file: Option<&str>) -> LogHandle {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let (filter_layer, handle) = reload::Layer::new(filter);

    let (writer, ansi) = match file {
        Some(path) => {
            if let Some(dir) = std::path::Path::new(path).parent() {
                let _ = std::fs::create_dir_all(dir);
            }
            match std::fs::OpenOptions::new().create(true).append(true).open(path) {
                Ok(f) => (BoxMakeWriter::new(std::sync::Mutex::new(f)), false),
                Err(e) => {
                    eprintln!("log file '{}' unusable ({}), using stdout", path, e);
                    (BoxMakeWriter::new(std::io::stdout), true)
                }
            }
        }
        None => (BoxMakeWriter::new(std::io::stdout), true),
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();

    LogHandle { handle }
}
