#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rust_2018_idioms
)]
#![warn(missing_docs)]

//! TIFDA common operational picture: the shared entity model, the input
//! firewall, and the fusion engine that owns the canonical entity store.

/// Entity, sensor message, and classification model.
#[path = "../model.rs"]
pub mod model;

/// Great-circle helpers.
#[path = "../geo.rs"]
pub mod geo;

/// Firewall, sensor directory, and fusion configuration.
#[path = "../config.rs"]
pub mod config;

/// Telemetry helpers.
#[path = "../telemetry.rs"]
pub mod telemetry;

/// Exponential backoff policy shared by every retrying follower.
#[path = "../retry.rs"]
pub mod retry;

/// Input validation gate.
#[path = "../firewall/main.rs"]
pub mod firewall;

/// Sensor-type keyed parser registry.
#[path = "../parsers.rs"]
pub mod parsers;

/// Fusion/merge engine and canonical store.
#[path = "../fusion/main.rs"]
pub mod fusion;

/// Visualization mirror follower.
#[path = "../sync.rs"]
pub mod sync;

/// Ingestion front door: firewall, parsing, entity gate, fusion.
#[path = "../ingest.rs"]
pub mod ingest;

pub use config::{FirewallConfig, FusionConfig, SensorDirectory, SensorRegistration};
pub use firewall::{EntityGate, EntityRejection, InjectionScanner, MessageGate, Rejection, RejectionReason};
pub use fusion::{FusionEngine, IngestHandle, MergeOutcome, Observation, RemovalCause};
pub use ingest::{IngestPipeline, IngestReport};
pub use model::{
    CopSnapshot, EntityCop, IffClassification, InformationClassification, Location, SensorMessage,
    SensorType, ThreatAssessment, ThreatLevel, TrackPoint,
};
pub use parsers::{ParseError, ParserRegistry, SensorParser, StructuredEntityParser};
pub use retry::RetryPolicy;
pub use sync::{HttpMirror, MirrorOp, MirrorSync, SyncConfig, SyncError, SyncStats, VisualizationMirror};
pub use telemetry::{Telemetry, TelemetryBuilder};
