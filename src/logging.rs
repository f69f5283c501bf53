use std::sync::OnceLock;

use tracing_subscriber::{fmt, EnvFilter};

static INIT: OnceLock<()> = OnceLock::new();

/// Installs the global tracing subscriber.
///
/// Filter comes from `SPECTRE_LOG` (falling back to the given default).
/// Safe to call more than once; only the first call wins.
pub fn init(default_directive: &str) {
    INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_env("SPECTRE_LOG")
            .unwrap_or_else(|_| EnvFilter::new(default_directive));
        fmt()
            .with_env_filter(filter)
            .with_target(true)
            .compact()
            .init();
    });
}
