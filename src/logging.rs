use tracing_subscriber::EnvFilter;

/// Log to stdout. `RUST_LOG` picks the level, `info` when unset.
pub fn init() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();
}
