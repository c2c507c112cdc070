use flexi_logger::Logger;
use std::sync::Once;

/// Log specification used when `RUST_LOG` is not set.
pub const DEFAULT_LOG_SPEC: &str = "info";

static INIT_LOG: Once = Once::new();

/// Installs the global logger once; later calls do nothing.
pub fn initialize() {
    initialize_with(DEFAULT_LOG_SPEC);
}

/// Like [`initialize`], with `spec` as the fallback when `RUST_LOG` is unset.
pub fn initialize_with(spec: &str) {
    INIT_LOG.call_once(|| {
        // Another logger may already be installed, e.g. by a test harness.
        if let Err(err) = Logger::try_with_env_or_str(spec).and_then(|logger| logger.start()) {
            eprintln!("logging disabled: {err}");
        }
    });
}
