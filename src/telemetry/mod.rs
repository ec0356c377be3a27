use std::sync::OnceLock;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::infrastructure::config::ServerMode;

static TELEMETRY: OnceLock<()> = OnceLock::new();

/// Release mode logs JSON for machine ingestion; debug mode keeps the plain
/// human-readable formatter.
pub fn init(mode: ServerMode) {
    TELEMETRY.get_or_init(|| {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        match mode {
            ServerMode::Release => tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init(),
            ServerMode::Debug => tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .init(),
        }
    });
}
