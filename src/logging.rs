//! Diagnostic sink setup.
//!
//! All components log through `tracing`; which subscriber receives the
//! records is decided once per process by [`init`], or per scope by
//! [`scoped`] in tests.

use std::sync::OnceLock;

use tracing::subscriber::DefaultGuard;
use tracing_subscriber::EnvFilter;

static INSTALLED: OnceLock<bool> = OnceLock::new();

fn filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Installs the global `fmt` subscriber. `RUST_LOG` overrides `default`.
///
/// Only the first call has an effect. Returns whether this call installed
/// the subscriber.
pub fn init(default: &str) -> bool {
    let mut installed_now = false;
    INSTALLED.get_or_init(|| {
        installed_now = tracing_subscriber::fmt()
            .with_env_filter(filter(default))
            .with_target(false)
            .try_init()
            .is_ok();
        installed_now
    });
    installed_now
}

/// Routes this thread's logs to the test writer until the guard is dropped.
pub fn scoped() -> DefaultGuard {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter("debug"))
        .with_test_writer()
        .finish();
    tracing::subscriber::set_default(subscriber)
}
