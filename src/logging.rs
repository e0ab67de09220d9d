use tracing::Level;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Initialize structured logging. `RUST_LOG` overrides the default level.
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();

    // Ignore the error if a subscriber is already installed (tests).
    tracing::subscriber::set_global_default(subscriber).ok();
}
