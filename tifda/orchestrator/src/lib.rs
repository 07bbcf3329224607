#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rust_2018_idioms
)]
#![warn(missing_docs)]

//! TIFDA runtime: loads the configuration document and wires ingestion,
//! threat assessment, review, dissemination, and delivery together.

/// Configuration document.
#[path = "../config.rs"]
pub mod config;

/// Assembled runtime and its cycle.
#[path = "../pipeline.rs"]
pub mod pipeline;

pub use config::{TelemetrySection, TifdaConfig};
pub use pipeline::{CycleReport, DecisionOutcome, ReleaseOutcome, Tifda};
