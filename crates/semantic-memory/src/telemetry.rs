//! Tracing setup for the binary and for tests that want log output.
use tracing_subscriber::{fmt, EnvFilter};

/// Filter used when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "info,r2d2=warn";

/// Install the global fmt subscriber. Later calls are ignored.
pub fn init_tracing() {
    install(false);
}

/// Like `init_tracing`, but output goes through the test harness capture.
pub fn init_test_tracing() {
    install(true);
}

fn install(test_writer: bool) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_target(true)
        .with_level(true)
        .compact();

    let _ = if test_writer {
        tracing::subscriber::set_global_default(builder.with_test_writer().finish())
    } else {
        tracing::subscriber::set_global_default(builder.finish())
    };
}
