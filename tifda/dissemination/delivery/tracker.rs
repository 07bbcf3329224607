use std::{
    collections::{BTreeMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::transport::TransportError;
use crate::format::FormattedMessage;

/// Where a message stands.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Queued, not attempted yet.
    Pending,
    /// Last attempt failed transiently; another one is scheduled.
    Retrying,
    /// Accepted by the transport.
    Delivered,
    /// Given up.
    Failed,
}

impl DeliveryStatus {
    /// No further attempts will happen.
    #[must_use]
    pub const fn is_final(self) -> bool {
        matches!(self, Self::Delivered | Self::Failed)
    }
}

/// Delivery state of one outbound message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeliveryRecord {
    /// Tracked message.
    pub message_id: Uuid,
    /// Decision the message renders.
    pub decision_id: Uuid,
    /// Recipient.
    pub recipient_id: String,
    /// Attempts made so far.
    pub attempts: u32,
    /// Current state.
    pub status: DeliveryStatus,
    /// Error of the latest failed attempt.
    pub last_error: Option<String>,
    /// When the next attempt is due, while retrying.
    pub next_retry_at: Option<DateTime<Utc>>,
    /// First seen.
    pub created_at: DateTime<Utc>,
    /// Last state change.
    pub updated_at: DateTime<Utc>,
}

/// Sent/failed counts within the window, plus everything still in flight.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeliveryCounters {
    /// Delivered within the window.
    pub sent: u64,
    /// Given up within the window.
    pub failed: u64,
    /// Queued or retrying.
    pub pending: u64,
    /// Delivered since startup.
    pub total_sent: u64,
    /// Given up since startup.
    pub total_failed: u64,
}

/// Running tally for one recipient.
#[derive(Debug, Default)]
struct Tally {
    counters: DeliveryCounters,
    finished: VecDeque<(DateTime<Utc>, DeliveryStatus)>,
}

impl Tally {
    fn snapshot(&self, since: DateTime<Utc>) -> DeliveryCounters {
        let start = self.finished.partition_point(|(at, _)| *at < since);
        let mut counters = DeliveryCounters {
            sent: 0,
            failed: 0,
            ..self.counters
        };
        for (_, status) in self.finished.range(start..) {
            match status {
                DeliveryStatus::Delivered => counters.sent += 1,
                _ => counters.failed += 1,
            }
        }
        counters
    }
}

#[derive(Debug, Default)]
struct Ledger {
    records: IndexMap<Uuid, DeliveryRecord>,
    finished: VecDeque<(DateTime<Utc>, Uuid)>,
    tallies: BTreeMap<String, Tally>,
}

impl Ledger {
    /// Drops finished records older than `retention` and window events older than `window`.
    fn evict(&mut self, now: DateTime<Utc>, window: chrono::Duration, retention: chrono::Duration) -> usize {
        let mut evicted = 0;
        while let Some((at, id)) = self.finished.front().copied() {
            if at >= now - retention {
                break;
            }
            self.finished.pop_front();
            if self.records.shift_remove(&id).is_some() {
                evicted += 1;
            }
        }
        for tally in self.tallies.values_mut() {
            while tally.finished.front().is_some_and(|(at, _)| *at < now - window) {
                tally.finished.pop_front();
            }
        }
        evicted
    }
}

/// Shared delivery ledger; clones see the same records.
///
/// Finished records are kept for `retention`, then evicted. Per-recipient
/// counters are maintained as records change, so reading them never walks
/// the records.
#[derive(Debug, Clone)]
pub struct DeliveryTracker {
    ledger: Arc<Mutex<Ledger>>,
    window: chrono::Duration,
    retention: chrono::Duration,
}

impl DeliveryTracker {
    /// Tracker counting finished deliveries over `window` and keeping
    /// finished records for `retention`.
    #[must_use]
    pub fn new(window: Duration, retention: Duration) -> Self {
        let span = |d: Duration| chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(1));
        Self {
            ledger: Arc::default(),
            window: span(window),
            retention: span(retention),
        }
    }

    pub(crate) fn track(&self, message: &FormattedMessage) {
        let now = Utc::now();
        let mut ledger = self.ledger.lock();
        ledger.evict(now, self.window, self.retention);
        ledger
            .tallies
            .entry(message.recipient_id.clone())
            .or_default()
            .counters
            .pending += 1;
        ledger.records.insert(
            message.message_id,
            DeliveryRecord {
                message_id: message.message_id,
                decision_id: message.decision_id,
                recipient_id: message.recipient_id.clone(),
                attempts: 0,
                status: DeliveryStatus::Pending,
                last_error: None,
                next_retry_at: None,
                created_at: now,
                updated_at: now,
            },
        );
    }

    pub(crate) fn retrying(&self, id: Uuid, attempts: u32, err: &TransportError, next_retry_at: DateTime<Utc>) {
        if let Some(record) = self.ledger.lock().records.get_mut(&id) {
            record.attempts = attempts;
            record.status = DeliveryStatus::Retrying;
            record.last_error = Some(err.to_string());
            record.next_retry_at = Some(next_retry_at);
            record.updated_at = Utc::now();
        }
    }

    pub(crate) fn delivered(&self, id: Uuid, attempts: u32) {
        self.finish(id, attempts, DeliveryStatus::Delivered, None);
    }

    pub(crate) fn failed(&self, id: Uuid, attempts: u32, err: &TransportError) {
        self.finish(id, attempts, DeliveryStatus::Failed, Some(err.to_string()));
    }

    fn finish(&self, id: Uuid, attempts: u32, status: DeliveryStatus, error: Option<String>) {
        let now = Utc::now();
        let mut ledger = self.ledger.lock();
        let Some(record) = ledger.records.get_mut(&id) else {
            return;
        };
        if record.status.is_final() {
            return;
        }
        record.attempts = attempts;
        record.status = status;
        if error.is_some() {
            record.last_error = error;
        }
        record.next_retry_at = None;
        record.updated_at = now;
        let recipient = record.recipient_id.clone();

        let tally = ledger.tallies.entry(recipient).or_default();
        tally.counters.pending = tally.counters.pending.saturating_sub(1);
        if status == DeliveryStatus::Delivered {
            tally.counters.total_sent += 1;
        } else {
            tally.counters.total_failed += 1;
        }
        tally.finished.push_back((now, status));
        ledger.finished.push_back((now, id));
        ledger.evict(now, self.window, self.retention);
    }

    /// Evicts finished records older than the retention as of `now`; returns
    /// how many went.
    pub fn evict_expired(&self, now: DateTime<Utc>) -> usize {
        self.ledger.lock().evict(now, self.window, self.retention)
    }

    /// Record for one message, while retained.
    #[must_use]
    pub fn record(&self, id: Uuid) -> Option<DeliveryRecord> {
        self.ledger.lock().records.get(&id).cloned()
    }

    /// Every retained record, oldest first.
    #[must_use]
    pub fn records(&self) -> Vec<DeliveryRecord> {
        self.ledger.lock().records.values().cloned().collect()
    }

    /// Counters for one recipient as of `now`.
    #[must_use]
    pub fn counters(&self, recipient_id: &str, now: DateTime<Utc>) -> DeliveryCounters {
        self.ledger
            .lock()
            .tallies
            .get(recipient_id)
            .map(|tally| tally.snapshot(now - self.window))
            .unwrap_or_default()
    }

    /// Counters for every recipient seen, as of `now`.
    #[must_use]
    pub fn totals(&self, now: DateTime<Utc>) -> BTreeMap<String, DeliveryCounters> {
        let since = now - self.window;
        self.ledger
            .lock()
            .tallies
            .iter()
            .map(|(recipient, tally)| (recipient.clone(), tally.snapshot(since)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::OutputFormat;
    use shared_event_bus::QualityOfService;

    fn message(recipient: &str) -> FormattedMessage {
        FormattedMessage {
            message_id: Uuid::new_v4(),
            decision_id: Uuid::new_v4(),
            recipient_id: recipient.into(),
            topic: format!("tifda/output/{recipient}"),
            qos: QualityOfService::AtMostOnce,
            format: OutputFormat::Json,
            body: String::new(),
        }
    }

    #[test]
    fn counters_follow_lifecycle() {
        let tracker = DeliveryTracker::new(Duration::from_secs(60), Duration::from_secs(600));
        let (a, b, c) = (message("alpha"), message("alpha"), message("bravo"));
        for m in [&a, &b, &c] {
            tracker.track(m);
        }
        tracker.delivered(a.message_id, 1);
        tracker.retrying(
            b.message_id,
            1,
            &TransportError::Timeout(3000),
            Utc::now() + chrono::Duration::milliseconds(200),
        );
        tracker.failed(c.message_id, 1, &TransportError::UnknownRecipient("bravo".into()));

        let now = Utc::now();
        assert_eq!(
            tracker.counters("alpha", now),
            DeliveryCounters { sent: 1, failed: 0, pending: 1, total_sent: 1, total_failed: 0 }
        );
        assert_eq!(
            tracker.counters("bravo", now),
            DeliveryCounters { sent: 0, failed: 1, pending: 0, total_sent: 0, total_failed: 1 }
        );
        let retrying = tracker.record(b.message_id).unwrap();
        assert_eq!(retrying.status, DeliveryStatus::Retrying);
        assert!(retrying.next_retry_at.is_some());
        assert_eq!(retrying.last_error.as_deref(), Some("timed out after 3000 ms"));
    }

    #[test]
    fn finished_deliveries_age_out_of_the_window() {
        let tracker = DeliveryTracker::new(Duration::from_secs(60), Duration::from_secs(600));
        let m = message("alpha");
        tracker.track(&m);
        tracker.delivered(m.message_id, 1);
        let later = Utc::now() + chrono::Duration::minutes(5);
        let counters = tracker.counters("alpha", later);
        assert_eq!((counters.sent, counters.failed, counters.pending), (0, 0, 0));
        assert_eq!(counters.total_sent, 1);
        assert_eq!(tracker.records().len(), 1);
    }

    #[test]
    fn finished_records_are_evicted_after_retention() {
        let tracker = DeliveryTracker::new(Duration::from_secs(60), Duration::from_secs(600));
        let (done, lost, open) = (message("alpha"), message("alpha"), message("alpha"));
        for m in [&done, &lost, &open] {
            tracker.track(m);
        }
        tracker.delivered(done.message_id, 1);
        tracker.failed(lost.message_id, 2, &TransportError::Timeout(500));
        tracker.delivered(done.message_id, 3);

        assert_eq!(tracker.evict_expired(Utc::now() + chrono::Duration::minutes(5)), 0);
        assert_eq!(tracker.records().len(), 3);

        let later = Utc::now() + chrono::Duration::minutes(11);
        assert_eq!(tracker.evict_expired(later), 2);
        assert!(tracker.record(done.message_id).is_none());
        assert!(tracker.record(lost.message_id).is_none());
        assert_eq!(tracker.record(open.message_id).unwrap().status, DeliveryStatus::Pending);
        assert_eq!(
            tracker.counters("alpha", later),
            DeliveryCounters { sent: 0, failed: 0, pending: 1, total_sent: 1, total_failed: 1 }
        );
        assert_eq!(tracker.totals(later).len(), 1);
    }
}
