use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Log at INFO unless `RUST_LOG` says otherwise.
pub fn init_logging() {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
