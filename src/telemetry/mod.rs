//! Telemetry initialization.
//!
//! Structured logging via tracing-subscriber. Metric instruments (see
//! [`metrics`]) use the OTel meter API against the globally-registered
//! provider; embedding applications that want exported metrics install
//! their own provider, otherwise the instruments are no-ops.

pub mod audit_span;
pub mod metrics;

use crate::error::{Error, Result};

/// Initialize the tracing subscriber.
///
/// `RUST_LOG` wins when set; `default_level` (e.g. "info") applies
/// otherwise.
///
/// # Errors
///
/// Returns an error if a subscriber was already installed.
pub fn init_telemetry(default_level: &str) -> Result<()> {
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::layer::SubscriberExt as _;
    use tracing_subscriber::util::SubscriberInitExt as _;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .map_err(|e| Error::Other(format!("failed to init tracing subscriber: {e}")))
}
