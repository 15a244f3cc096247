//! Logging setup for the `spa_benchmark` binary and the criterion bench
//!
//! Library code only emits `tracing` events. The default filter applies the requested level to
//! `spa2d` targets and keeps every other target at WARN, so per-iteration solver output can be
//! switched on without noise from dependencies. Timestamps are uptime since the subscriber was
//! installed, which lines up with the timings the benchmark reports.

use tracing::Level;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::Uptime;

/// Filter used when `RUST_LOG` is unset: `default_level` for `spa2d`, WARN for the rest.
pub fn default_filter(default_level: Level) -> String {
    format!("warn,spa2d={}", default_level.to_string().to_lowercase())
}

/// Initialize logging at INFO for `spa2d`
///
/// # Example
/// ```no_run
/// use spa2d::init_logger;
///
/// fn main() {
///     init_logger();
///     tracing::info!("Benchmark started");
/// }
/// ```
///
/// # Environment Variables
/// `RUST_LOG` replaces the default filter entirely:
/// ```bash
/// RUST_LOG=spa2d::optimizer=debug cargo run --bin spa_benchmark -- --trials 1
/// ```
pub fn init_logger() {
    init_logger_with_level(Level::INFO)
}

/// Initialize logging with `default_level` for `spa2d` targets
///
/// Calling this more than once is harmless: later calls leave the first subscriber in place.
pub fn init_logger_with_level(default_level: Level) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(default_level)));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(Uptime::default())
        .with_target(true)
        .with_level(true)
        .compact()
        .try_init();
}
