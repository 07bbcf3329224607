//! Outbound delivery: transports, per-recipient workers with capped
//! exponential retry, and per-recipient delivery accounting.

/// Transport boundary and the broker, HTTP, and in-memory transports.
pub mod transport;

/// Per-message delivery records and windowed counters.
pub mod tracker;

/// Per-recipient queues and the retry loop.
pub mod dispatcher;

pub use dispatcher::{DeliveryConfig, Dispatcher};
pub use tracker::{DeliveryCounters, DeliveryRecord, DeliveryStatus, DeliveryTracker};
pub use transport::{BrokerTransport, HttpTransport, MemoryTransport, Transport, TransportError};
