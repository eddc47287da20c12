//! Backend plugins. Each module registers its metrics with the
//! [`cairn_engine::MetricRegistry`] at startup; a malformed declaration
//! aborts the node before it announces itself.

pub mod host;
pub mod synthetic;

use cairn_engine::{ConfigError, MetricRegistry};

/// Loads every built-in backend. The synthetic backend ships alongside
/// the host backend so a fleet can always exercise the full pipeline
/// without touching real system counters.
pub fn register_all(registry: &mut MetricRegistry, hostname: &str) -> Result<(), ConfigError> {
    host::register(registry, hostname)?;
    synthetic::register(registry, hostname)?;
    Ok(())
}
