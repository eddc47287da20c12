//! Per-node metric value computation: predicates, bucketization, the
//! snapshot-delta decomposition engine, and the backend registry.

pub mod backend;
pub mod bucketize;
pub mod datapoint;
pub mod decompose;
pub mod predicate;
pub mod registry;
pub mod source;

pub use backend::MetricBackend;
pub use bucketize::Bucketizer;
pub use datapoint::DataPoint;
pub use decompose::{DecompositionError, DecompositionPlan};
pub use predicate::{Predicate, PredicateError};
pub use registry::{
    BackendFactory, BackendRequest, ConfigError, ImplField, Implementation, MetricDecl,
    MetricRegistry,
};
pub use source::{CounterSource, ExtractFn, FieldSpec, Snapshot, SnapshotMetric, SourceItem};
