//! Logging setup.
//!
//! `tracing` + `tracing-subscriber`'s `EnvFilter`, the way `forest`'s
//! daemon entrypoint wires up logging: `RUST_LOG` controls verbosity,
//! defaulting to `info` when unset.

pub fn init() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
