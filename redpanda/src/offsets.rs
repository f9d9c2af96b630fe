//! Commit watermarks for concurrently settled messages.
//!
//! Kafka commits a single offset per partition: everything below it is
//! considered consumed. Deliveries settle out of order, so committing the
//! offset of whichever message settles last could skip one still in
//! flight. The tracker only ever commits the lowest offset that is still
//! in flight, or one past the highest seen once nothing is in flight.
//!
//! Partitions revoked by a rebalance are dropped through
//! [`RebalanceContext`]; late settlements on them commit nothing.

use rdkafka::ClientContext;
use rdkafka::TopicPartitionList;
use rdkafka::consumer::{BaseConsumer, ConsumerContext, Rebalance};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct PartitionOffsets {
    in_flight: BTreeSet<i64>,
    highest_seen: Option<i64>,
    committed: Option<i64>,
}

/// Per-partition in-flight offsets for one consumer.
#[derive(Debug, Default)]
pub struct OffsetTracker {
    partitions: HashMap<(String, i32), PartitionOffsets>,
}

impl OffsetTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a received message.
    pub fn received(&mut self, topic: &str, partition: i32, offset: i64) {
        let entry = self.partitions.entry((topic.to_string(), partition)).or_default();
        entry.in_flight.insert(offset);
        entry.highest_seen = Some(entry.highest_seen.map_or(offset, |h| h.max(offset)));
    }

    /// Record a settled message; returns the offset to commit if the
    /// watermark advanced.
    pub fn settled(&mut self, topic: &str, partition: i32, offset: i64) -> Option<i64> {
        let entry = self.partitions.get_mut(&(topic.to_string(), partition))?;
        entry.in_flight.remove(&offset);

        let watermark = match entry.in_flight.first() {
            Some(lowest) => *lowest,
            None => entry.highest_seen? + 1,
        };

        if entry.committed.is_some_and(|c| c >= watermark) {
            return None;
        }
        entry.committed = Some(watermark);
        Some(watermark)
    }

    /// Forget a partition, e.g. after a rebalance revoked it.
    pub fn forget(&mut self, topic: &str, partition: i32) {
        self.partitions.remove(&(topic.to_string(), partition));
    }

    /// Number of partitions with tracked offsets.
    #[must_use]
    pub fn tracked_partitions(&self) -> usize {
        self.partitions.len()
    }
}

/// Consumer context keeping one consumer's [`OffsetTracker`] in step with
/// its partition assignment.
pub(crate) struct RebalanceContext {
    consumer: String,
    offsets: Arc<Mutex<OffsetTracker>>,
}

impl RebalanceContext {
    pub(crate) const fn new(consumer: String, offsets: Arc<Mutex<OffsetTracker>>) -> Self {
        Self { consumer, offsets }
    }

    fn forget_revoked(&self, partitions: &TopicPartitionList) {
        let Ok(mut offsets) = self.offsets.lock() else {
            tracing::error!(consumer = %self.consumer, "Offset tracker poisoned during rebalance");
            return;
        };
        for element in partitions.elements() {
            offsets.forget(element.topic(), element.partition());
        }
        tracing::info!(
            consumer = %self.consumer,
            revoked = partitions.count(),
            "Partitions revoked"
        );
    }
}

impl ClientContext for RebalanceContext {}

impl ConsumerContext for RebalanceContext {
    fn post_rebalance(&self, _consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Revoke(partitions) => self.forget_revoked(partitions),
            Rebalance::Assign(partitions) => {
                tracing::info!(consumer = %self.consumer, assigned = partitions.count(), "Partitions assigned");
            },
            Rebalance::Error(e) => {
                tracing::warn!(consumer = %self.consumer, error = %e, "Rebalance failed");
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;

    #[test]
    fn in_order_settlement_commits_next_offset() {
        let mut tracker = OffsetTracker::new();
        tracker.received("user.created", 0, 10);

        assert_eq!(tracker.settled("user.created", 0, 10), Some(11));
    }

    #[test]
    fn out_of_order_settlement_holds_watermark() {
        let mut tracker = OffsetTracker::new();
        for offset in 10..=12 {
            tracker.received("user.created", 0, offset);
        }

        assert_eq!(tracker.settled("user.created", 0, 12), Some(10));
        assert_eq!(tracker.settled("user.created", 0, 11), None);
        assert_eq!(tracker.settled("user.created", 0, 10), Some(13));
    }

    #[test]
    fn partitions_are_independent() {
        let mut tracker = OffsetTracker::new();
        tracker.received("user.created", 0, 5);
        tracker.received("user.created", 1, 7);

        assert_eq!(tracker.settled("user.created", 1, 7), Some(8));
        assert_eq!(tracker.settled("user.created", 0, 5), Some(6));
    }

    #[test]
    fn revoked_partitions_are_forgotten() {
        let offsets = Arc::new(Mutex::new(OffsetTracker::new()));
        {
            let mut tracker = offsets.lock().unwrap();
            tracker.received("user.created", 0, 5);
            tracker.received("user.created", 1, 9);
        }
        let context = RebalanceContext::new("users".to_string(), Arc::clone(&offsets));

        let mut revoked = TopicPartitionList::new();
        revoked.add_partition("user.created", 0);
        context.forget_revoked(&revoked);

        let mut tracker = offsets.lock().unwrap();
        assert_eq!(tracker.tracked_partitions(), 1);
        assert_eq!(tracker.settled("user.created", 0, 5), None);
        assert_eq!(tracker.settled("user.created", 1, 9), Some(10));
    }

    #[test]
    fn unknown_partition_commits_nothing() {
        let mut tracker = OffsetTracker::new();
        assert_eq!(tracker.settled("user.created", 0, 1), None);
    }
}
