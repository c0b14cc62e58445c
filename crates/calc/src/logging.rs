//! Logging bootstrap for the calculators

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when neither an explicit filter nor `RUST_LOG` is given
pub const DEFAULT_FILTER: &str = "info";

/// Install a `fmt` subscriber filtered by `filter`, `RUST_LOG` or
/// [`DEFAULT_FILTER`], in this order.
///
/// Returns false when a global subscriber was already installed.
pub fn init(filter: Option<&str>) -> bool {
    let filter = match filter {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
}
