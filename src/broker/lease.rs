//! Lease bookkeeping
//!
//! A `Lease` is the exclusive claim a subscriber holds on a pulled message
//! until it acks or the deadline passes. The authoritative lease table of a
//! subscription lives inside that subscription's state, so pull, ack and
//! expiry are serialized by one lock.
//!
//! `LeaseManager` is the broker-wide timer: a min-heap of expiry instants
//! across all subscriptions. Entries are never removed eagerly; an ack or a
//! deadline change simply leaves a stale entry behind which the sweep
//! discards once the subscription reports the lease as no longer expired.

use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BinaryHeap};

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::broker::message::{LeaseId, MessageId};

/// An active lease on one message of one subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub message_id: MessageId,
    pub subscription: String,
    pub lease_id: LeaseId,
    pub expires_at: Instant,
}

impl Lease {
    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }
}

/// A scheduled expiry check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseExpiry {
    pub expires_at: Instant,
    pub subscription: String,
    pub lease_id: LeaseId,
}

impl Ord for LeaseExpiry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.expires_at
            .cmp(&other.expires_at)
            .then_with(|| self.subscription.cmp(&other.subscription))
            .then_with(|| self.lease_id.cmp(&other.lease_id))
    }
}

impl PartialOrd for LeaseExpiry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
pub struct LeaseManager {
    heap: Mutex<BinaryHeap<Reverse<LeaseExpiry>>>,
}

impl LeaseManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule an expiry check for `lease_id` at `expires_at`.
    pub fn track(&self, subscription: &str, lease_id: &str, expires_at: Instant) {
        self.heap.lock().push(Reverse(LeaseExpiry {
            expires_at,
            subscription: subscription.to_string(),
            lease_id: lease_id.to_string(),
        }));
    }

    /// Pop every entry due at or before `now`, grouped by subscription.
    ///
    /// Entries may be stale; the subscription decides whether the lease is
    /// really expired.
    pub fn drain_expired(&self, now: Instant) -> BTreeMap<String, Vec<LeaseId>> {
        let mut due: BTreeMap<String, Vec<LeaseId>> = BTreeMap::new();
        let mut heap = self.heap.lock();
        while let Some(Reverse(next)) = heap.peek() {
            if next.expires_at > now {
                break;
            }
            if let Some(Reverse(entry)) = heap.pop() {
                due.entry(entry.subscription).or_default().push(entry.lease_id);
            }
        }
        due
    }

    pub fn next_expiry(&self) -> Option<Instant> {
        self.heap.lock().peek().map(|Reverse(e)| e.expires_at)
    }

    /// Number of scheduled checks, stale ones included.
    pub fn scheduled(&self) -> usize {
        self.heap.lock().len()
    }

    pub fn clear(&self) {
        self.heap.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn drains_only_due_entries_in_expiry_order() {
        let manager = LeaseManager::new();
        let now = Instant::now();
        manager.track("a", "l3", now + Duration::from_secs(3));
        manager.track("a", "l1", now + Duration::from_secs(1));
        manager.track("b", "l2", now + Duration::from_secs(2));

        assert_eq!(manager.next_expiry(), Some(now + Duration::from_secs(1)));

        let due = manager.drain_expired(now + Duration::from_secs(2));
        assert_eq!(due.get("a"), Some(&vec!["l1".to_string()]));
        assert_eq!(due.get("b"), Some(&vec!["l2".to_string()]));
        assert_eq!(manager.scheduled(), 1);

        assert!(manager.drain_expired(now).is_empty());
    }

    #[test]
    fn lease_expiry_is_inclusive() {
        let now = Instant::now();
        let lease = Lease {
            message_id: 1,
            subscription: "s".to_string(),
            lease_id: "l".to_string(),
            expires_at: now,
        };
        assert!(lease.is_expired(now));
        assert!(!lease.is_expired(now - Duration::from_millis(1)));
    }
}
