//! Logger bootstrap for the server binary.
//!
//! Library crates log through the `log` macros; the binary installs a
//! tracing subscriber with the `tracing-log` bridge so everything ends
//! up in one formatted stream.

use tracing_subscriber::EnvFilter;

/// Environment variable that raises chunk-streaming timing logs.
pub const DEBUG_TIMINGS_ENV: &str = "VASTE_DEBUG_TIMINGS";

/// Installs the global subscriber.
///
/// `RUST_LOG` controls filtering; `VASTE_DEBUG_TIMINGS=1` additionally
/// enables the per-batch serialize timing logs in `vaste-core`.
pub fn init() {
    let mut filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if std::env::var(DEBUG_TIMINGS_ENV).is_ok_and(|value| value == "1") {
        filter = filter.add_directive(
            "vaste_core=debug"
                .parse()
                .expect("static directive parses"),
        );
    }
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
