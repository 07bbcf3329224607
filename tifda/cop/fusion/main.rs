//! Correlation, merge rules, and the store that owns fused entities.

/// Correlation test and nearest-candidate search.
pub mod correlation;
/// Store, snapshot publication, and ingest queue.
pub mod engine;
/// Pure merge rules.
pub mod merge;
/// Sensor reports ready for fusion.
pub mod observation;

pub use correlation::{best_match, correlate};
pub use engine::{FusionEngine, FusionError, IngestHandle, MergeOutcome, RemovalCause};
pub use merge::{create, merge};
pub use observation::Observation;
