use dashmap::DashMap;
use tracing::debug;

use crate::envelope::ReceiptKind;

/// Records are pruned once older than this.
const RETENTION_MS: i64 = 24 * 3600 * 1000;

#[derive(Debug, Clone, Copy, Default)]
pub struct DeliveryRecord {
    pub sent_at_ms: i64,
    pub delivered: bool,
    pub read: bool,
    pub viewed: bool,
}

/// Delivery state per outbound send, keyed by the transport's echoed
/// timestamp. Transitions are monotonic: a read implies delivered, a view
/// implies read.
pub struct DeliveryTracker {
    records: DashMap<i64, DeliveryRecord>,
}

impl DeliveryTracker {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
        }
    }

    /// Register a fresh send; prunes stale records as a side effect.
    pub fn register(&self, timestamp: i64, now_ms: i64) {
        self.records.retain(|_, r| now_ms - r.sent_at_ms < RETENTION_MS);
        self.records.insert(
            timestamp,
            DeliveryRecord {
                sent_at_ms: now_ms,
                ..Default::default()
            },
        );
    }

    /// Apply a receipt to every timestamp it covers. Unknown timestamps are
    /// ignored (they belong to a previous process lifetime).
    pub fn mark(&self, kind: ReceiptKind, timestamps: &[i64]) {
        for ts in timestamps {
            if let Some(mut record) = self.records.get_mut(ts) {
                match kind {
                    ReceiptKind::Delivery => record.delivered = true,
                    ReceiptKind::Read => {
                        record.delivered = true;
                        record.read = true;
                    }
                    ReceiptKind::Viewed => {
                        record.delivered = true;
                        record.read = true;
                        record.viewed = true;
                    }
                }
                debug!(timestamp = ts, ?kind, "receipt recorded");
            }
        }
    }

    pub fn get(&self, timestamp: i64) -> Option<DeliveryRecord> {
        self.records.get(&timestamp).map(|r| *r)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Default for DeliveryTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_implies_delivered() {
        let tracker = DeliveryTracker::new();
        tracker.register(100, 1_000);
        tracker.mark(ReceiptKind::Read, &[100]);
        let record = tracker.get(100).unwrap();
        assert!(record.delivered);
        assert!(record.read);
        assert!(!record.viewed);
    }

    #[test]
    fn delivery_then_read_is_monotonic() {
        let tracker = DeliveryTracker::new();
        tracker.register(100, 1_000);
        tracker.mark(ReceiptKind::Delivery, &[100]);
        tracker.mark(ReceiptKind::Read, &[100]);
        // A late delivery receipt never clears the read state.
        tracker.mark(ReceiptKind::Delivery, &[100]);
        let record = tracker.get(100).unwrap();
        assert!(record.delivered && record.read);
    }

    #[test]
    fn unknown_timestamps_are_ignored() {
        let tracker = DeliveryTracker::new();
        tracker.mark(ReceiptKind::Delivery, &[999]);
        assert!(tracker.get(999).is_none());
    }

    #[test]
    fn old_records_are_pruned_on_register() {
        let tracker = DeliveryTracker::new();
        tracker.register(1, 0);
        tracker.register(2, RETENTION_MS + 1);
        assert!(tracker.get(1).is_none());
        assert!(tracker.get(2).is_some());
    }

    #[test]
    fn one_receipt_can_cover_many_sends() {
        let tracker = DeliveryTracker::new();
        tracker.register(1, 1_000);
        tracker.register(2, 1_001);
        tracker.mark(ReceiptKind::Delivery, &[1, 2]);
        assert!(tracker.get(1).unwrap().delivered);
        assert!(tracker.get(2).unwrap().delivered);
    }
}
