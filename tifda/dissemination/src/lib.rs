#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rust_2018_idioms
)]
#![warn(missing_docs)]

//! TIFDA dissemination: clearance policy over snapshots of the common
//! operational picture, need-to-know and deception routing, human review,
//! and tracked delivery to recipients.

/// Clearance hierarchy checks and downgraded views.
#[path = "../clearance.rs"]
pub mod clearance;

/// Thresholds and tunables for the decision engine.
#[path = "../config.rs"]
pub mod config;

/// Recipient configuration and policy errors.
#[path = "../recipient.rs"]
pub mod recipient;

/// Area, threat-link, and distance relevance rules.
#[path = "../need_to_know.rs"]
pub mod need_to_know;

/// Synthetic decoys for adversarial channels.
#[path = "../deception.rs"]
pub mod deception;

/// Threat evaluator boundary.
#[path = "../threat.rs"]
pub mod threat;

/// Human review queue.
#[path = "../review.rs"]
pub mod review;

/// Per-recipient decision engine.
#[path = "../engine.rs"]
pub mod engine;

/// Last check before anything leaves the process.
#[path = "../release.rs"]
pub mod release;

/// Per-recipient wire formats.
#[path = "../format.rs"]
pub mod format;

/// Transports, retries, and delivery accounting.
#[path = "../delivery/main.rs"]
pub mod delivery;

pub use clearance::{classification_summary, clearance_satisfies, downgrade, filter, public_view, rank};
pub use config::DisseminationConfig;
pub use delivery::{
    BrokerTransport, DeliveryConfig, DeliveryCounters, DeliveryRecord, DeliveryStatus,
    DeliveryTracker, Dispatcher, HttpTransport, MemoryTransport, Transport, TransportError,
};
pub use engine::{DecisionRound, DisseminationDecision, DisseminationEngine};
pub use format::{FormatAdapter, FormattedMessage, OutputFormat};
pub use need_to_know::{DistanceBand, DistanceBands, DistanceVerdict, Relevance, RelevanceBasis, ThreatIndex};
pub use recipient::{
    AccessLevel, AreaOfResponsibility, ConfigError, PolicyError, RecipientConfig, RecipientSpec,
    TransportKind, TransportSpec,
};
pub use release::{ReleaseGuard, ReleaseViolation};
pub use review::{ReviewError, ReviewItem, ReviewQueue, ReviewStatus, ReviewSubject, Verdict};
pub use threat::{AssessmentCycle, RuleThreatEvaluator, ThreatAssessor, ThreatEvaluator};
