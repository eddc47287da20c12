//! The instrumenter agent: holds active instrumentations, drives their
//! backends once a second, and ships values to each instrumentation's
//! aggregator.

pub mod backends;
pub mod config;
pub mod runtime;
pub mod service;

pub use config::InstrumenterConfig;
pub use runtime::Runtime;
pub use service::InstrumenterService;
