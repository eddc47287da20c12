//! The contract a metric implementation satisfies. Concrete sources
//! (snapshot-delta counters, test doubles) implement it; the
//! instrumenter runtime drives it and never knows how a value is
//! computed.

use anyhow::Result;
use cairn_common::types::MetricValue;

pub trait MetricBackend: Send + Sync {
    /// Instruments the system to start collecting. Called once when the
    /// instrumentation is enabled on this node.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying source cannot be set up; the
    /// runtime reports it as `enable_failed` in the protocol ack.
    fn instrument(&mut self) -> Result<()>;

    /// Tears the instrumentation down. Called once on disable.
    ///
    /// # Errors
    ///
    /// Returns an error if teardown fails; the runtime reports it as
    /// `disable_failed` and keeps the instrumentation active.
    fn deinstrument(&mut self) -> Result<()>;

    /// Computes the current value, covering the interval since the
    /// previous call.
    ///
    /// # Errors
    ///
    /// Returns an error if the source cannot be read this tick; the
    /// runtime logs it and emits nothing for the tick.
    fn value(&mut self) -> Result<MetricValue>;
}
