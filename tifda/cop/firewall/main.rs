//! Input validation: message gate, entity re-validation, injection scanning.

/// Entity-level re-validation after parsing.
pub mod entity;
/// Message-level gate and reason codes.
pub mod gate;
/// Pattern scanner for prompt and code injection.
pub mod inspector;

pub use entity::{EntityGate, EntityRejection};
pub use gate::{FirewallStats, MessageGate, Rejection, RejectionReason};
pub use inspector::{InjectionFamily, InjectionScanner, InspectionFinding};
