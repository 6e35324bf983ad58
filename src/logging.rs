//! Tracing setup for binaries and tests embedding the orchestrator.

use crate::error::{Error, Result};
use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Installs a compact `fmt` subscriber filtered by `RUST_LOG`.
///
/// Fails with `Configuration` when `RUST_LOG` does not parse or a global
/// subscriber is already installed.
pub fn init_tracing() -> Result<()> {
    let filter = match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(directives) => EnvFilter::try_new(&directives)
            .map_err(|e| Error::Configuration(format!("invalid RUST_LOG {directives:?}: {e}")))?,
        Err(_) => EnvFilter::new(DEFAULT_LOG_FILTER),
    };
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| Error::Configuration(format!("tracing already initialized: {e}")))
}
