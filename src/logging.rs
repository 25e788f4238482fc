use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber. `RUST_LOG` overrides the defaults.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cfg!(debug_assertions) {
            // Debug build: show debug logs for our crate, info for others
            EnvFilter::new("mailflow=debug,info")
        } else {
            EnvFilter::new("info")
        }
    });

    // try_init so tests and embedders that already set a subscriber don't panic
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Format a duration as milliseconds with one decimal, e.g. `12.3ms`
pub fn fmt_ms(elapsed: Duration) -> String {
    format!("{:.1}ms", elapsed.as_secs_f64() * 1000.0)
}
