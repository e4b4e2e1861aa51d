//! Subscription queues
//!
//! A `Subscription` is an independent delivery queue attached to one topic.
//! Its mutable state (pending queue, lease table, flow controller and dead
//! letters) sits behind a single lock, so pulls, acks and expiry
//! redelivery on the same subscription never interleave.
//!
//! Every fanned-out message gets a per-subscription sequence number. When
//! leases expire, the messages go back to the front of the pending queue,
//! sorted among the other redelivered messages by that sequence number.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::broker::flow::{FlowControlSettings, FlowController};
use crate::broker::lease::Lease;
use crate::broker::message::{LeaseId, Message, MessageId, ReceivedMessage};
use crate::utils::error::{BrokerError, Result};

pub const DEFAULT_ACK_DEADLINE: Duration = Duration::from_secs(10);

/// Per-subscription settings fixed at creation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    pub ack_deadline: Duration,
    #[serde(default)]
    pub flow_control: FlowControlSettings,
    /// Deliveries after which an expired message is dead-lettered instead
    /// of redelivered. `None` retries forever.
    #[serde(default)]
    pub max_delivery_attempts: Option<u32>,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            ack_deadline: DEFAULT_ACK_DEADLINE,
            flow_control: FlowControlSettings::default(),
            max_delivery_attempts: None,
        }
    }
}

impl SubscriptionConfig {
    pub fn new(ack_deadline: Duration) -> Self {
        Self {
            ack_deadline,
            ..Default::default()
        }
    }

    pub fn with_flow_control(mut self, flow_control: FlowControlSettings) -> Self {
        self.flow_control = flow_control;
        self
    }

    pub fn with_max_delivery_attempts(mut self, attempts: u32) -> Self {
        self.max_delivery_attempts = Some(attempts);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadLetterReason {
    MaxDeliveryAttemptsExceeded,
}

/// A message dropped from a subscription, kept for inspection.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub message: Arc<Message>,
    pub delivery_count: u32,
    pub reason: DeadLetterReason,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionStats {
    pub pending: usize,
    pub outstanding_messages: usize,
    pub outstanding_bytes: usize,
    pub dead_lettered: usize,
}

/// Result of an expiry pass over one subscription.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExpiryOutcome {
    pub redelivered: usize,
    pub dead_lettered: usize,
}

#[derive(Debug, Clone)]
struct Delivery {
    message: Arc<Message>,
    seq: u64,
    delivery_count: u32,
    redelivered: bool,
}

#[derive(Debug)]
struct Leased {
    delivery: Delivery,
    lease: Lease,
}

#[derive(Debug, Default)]
struct SubscriptionState {
    pending: VecDeque<Delivery>,
    leased: HashMap<LeaseId, Leased>,
    flow: FlowController,
    dead_letters: Vec<DeadLetter>,
    next_seq: u64,
    closed: bool,
}

impl SubscriptionState {
    fn push_back(&mut self, message: Arc<Message>, delivery_count: u32) {
        self.next_seq += 1;
        self.pending.push_back(Delivery {
            message,
            seq: self.next_seq,
            delivery_count,
            redelivered: delivery_count > 0,
        });
    }

    /// Put a delivery back at the front, behind earlier redeliveries with a
    /// lower sequence number.
    fn redeliver(&mut self, mut delivery: Delivery) {
        delivery.redelivered = true;
        let idx = self
            .pending
            .iter()
            .take_while(|d| d.redelivered && d.seq < delivery.seq)
            .count();
        self.pending.insert(idx, delivery);
    }

    /// Drop the lease and either requeue or dead-letter its message.
    /// Returns true when the message was requeued.
    fn release_expired(&mut self, leased: Leased, max_attempts: Option<u32>) -> bool {
        let Leased { delivery, lease } = leased;
        self.flow.release(delivery.message.size());
        match max_attempts {
            Some(max) if delivery.delivery_count >= max => {
                warn!(
                    subscription = %lease.subscription,
                    message_id = delivery.message.id,
                    attempts = delivery.delivery_count,
                    "dead-lettering message after max delivery attempts"
                );
                self.dead_letters.push(DeadLetter {
                    message: delivery.message,
                    delivery_count: delivery.delivery_count,
                    reason: DeadLetterReason::MaxDeliveryAttemptsExceeded,
                });
                false
            }
            _ => {
                debug!(
                    subscription = %lease.subscription,
                    message_id = delivery.message.id,
                    "lease expired, message requeued"
                );
                self.redeliver(delivery);
                true
            }
        }
    }
}

#[derive(Debug)]
pub struct Subscription {
    name: String,
    topic: String,
    config: SubscriptionConfig,
    state: Mutex<SubscriptionState>,
    notify: Notify,
}

impl Subscription {
    pub fn new(name: &str, topic: &str, config: SubscriptionConfig) -> Self {
        let state = SubscriptionState {
            flow: FlowController::new(config.flow_control.clone()),
            ..Default::default()
        };
        Self {
            name: name.to_string(),
            topic: topic.to_string(),
            config,
            state: Mutex::new(state),
            notify: Notify::new(),
        }
    }

    /// Rebuild a subscription from a snapshot. Every stored delivery comes
    /// back as pending, in the given order.
    pub(crate) fn restore(
        name: &str,
        topic: &str,
        config: SubscriptionConfig,
        deliveries: Vec<(Message, u32)>,
    ) -> Self {
        let subscription = Self::new(name, topic, config);
        {
            let mut state = subscription.state.lock();
            for (message, delivery_count) in deliveries {
                state.push_back(Arc::new(message), delivery_count);
            }
        }
        subscription
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the topic this subscription is attached to.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn config(&self) -> &SubscriptionConfig {
        &self.config
    }

    pub(crate) fn notify(&self) -> &Notify {
        &self.notify
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Append freshly published messages. A closed subscription ignores them.
    pub(crate) fn enqueue(&self, messages: &[Arc<Message>]) -> bool {
        {
            let mut state = self.state.lock();
            if state.closed {
                return false;
            }
            for message in messages {
                state.push_back(Arc::clone(message), 0);
            }
        }
        self.notify.notify_waiters();
        true
    }

    /// Lease up to `max` pending messages, as far as flow control allows.
    pub(crate) fn lease(
        &self,
        max: usize,
        ack_deadline: Duration,
        now: Instant,
    ) -> Result<Vec<ReceivedMessage>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(BrokerError::subscription_not_found(&self.name));
        }

        let expires_at = now + ack_deadline;
        let mut received = Vec::new();
        while received.len() < max {
            let Some(front) = state.pending.front() else {
                break;
            };
            let size = front.message.size();
            if !state.flow.try_acquire(size) {
                break;
            }
            let Some(mut delivery) = state.pending.pop_front() else {
                break;
            };
            delivery.delivery_count += 1;

            let lease_id = Uuid::new_v4().to_string();
            received.push(ReceivedMessage {
                message: Arc::clone(&delivery.message),
                lease_id: lease_id.clone(),
                delivery_count: delivery.delivery_count,
            });
            let lease = Lease {
                message_id: delivery.message.id,
                subscription: self.name.clone(),
                lease_id: lease_id.clone(),
                expires_at,
            };
            state.leased.insert(lease_id, Leased { delivery, lease });
        }

        if received.is_empty() && max > 0 && !state.pending.is_empty() && state.flow.rejects_when_full() {
            return Err(BrokerError::CapacityExceeded(self.name.clone()));
        }
        Ok(received)
    }

    /// Acknowledge an active lease, discarding its message for good.
    pub(crate) fn ack(&self, lease_id: &str, now: Instant) -> Result<Arc<Message>> {
        let message = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(BrokerError::subscription_not_found(&self.name));
            }
            match state.leased.get(lease_id) {
                Some(leased) if !leased.lease.is_expired(now) => {}
                _ => return Err(BrokerError::invalid_lease(&self.name, lease_id)),
            }
            let Some(leased) = state.leased.remove(lease_id) else {
                return Err(BrokerError::invalid_lease(&self.name, lease_id));
            };
            state.flow.release(leased.delivery.message.size());
            leased.delivery.message
        };
        // capacity freed for waiting pulls
        self.notify.notify_waiters();
        Ok(message)
    }

    /// Move an active lease's expiry to `now + deadline`. A zero deadline
    /// releases the message for redelivery straight away.
    pub(crate) fn modify_deadline(
        &self,
        lease_id: &str,
        deadline: Duration,
        now: Instant,
    ) -> Result<Instant> {
        let expires_at = now + deadline;
        let mut state = self.state.lock();
        if state.closed {
            return Err(BrokerError::subscription_not_found(&self.name));
        }
        match state.leased.get_mut(lease_id) {
            Some(leased) if !leased.lease.is_expired(now) => {
                leased.lease.expires_at = expires_at;
            }
            _ => return Err(BrokerError::invalid_lease(&self.name, lease_id)),
        }

        if deadline.is_zero() {
            if let Some(leased) = state.leased.remove(lease_id) {
                let requeued = state.release_expired(leased, self.config.max_delivery_attempts);
                drop(state);
                if requeued {
                    self.notify.notify_waiters();
                }
            }
        }
        Ok(expires_at)
    }

    /// Expire the given leases if their deadline has really passed.
    /// Leases that were acked or extended meanwhile are left alone.
    pub(crate) fn expire(&self, lease_ids: &[LeaseId], now: Instant) -> ExpiryOutcome {
        let mut outcome = ExpiryOutcome::default();
        {
            let mut state = self.state.lock();
            for lease_id in lease_ids {
                let due = state
                    .leased
                    .get(lease_id)
                    .is_some_and(|l| l.lease.is_expired(now));
                if !due {
                    continue;
                }
                if let Some(leased) = state.leased.remove(lease_id) {
                    if state.release_expired(leased, self.config.max_delivery_attempts) {
                        outcome.redelivered += 1;
                    } else {
                        outcome.dead_lettered += 1;
                    }
                }
            }
        }
        if outcome.redelivered > 0 {
            self.notify.notify_waiters();
        }
        outcome
    }

    /// Return every leased message to pending without counting an attempt
    /// against the dead-letter limit. Used on shutdown.
    pub(crate) fn requeue_all_leases(&self) -> usize {
        let mut state = self.state.lock();
        let mut leased: Vec<Leased> = state.leased.drain().map(|(_, l)| l).collect();
        leased.sort_by_key(|l| std::cmp::Reverse(l.delivery.seq));
        let count = leased.len();
        for l in leased {
            state.redeliver(l.delivery);
        }
        state.flow.reset();
        count
    }

    /// Mark the subscription deleted, releasing every lease and message.
    pub(crate) fn close(&self) -> usize {
        let released = {
            let mut state = self.state.lock();
            state.closed = true;
            let released = state.leased.len();
            state.leased.clear();
            state.pending.clear();
            state.flow.reset();
            released
        };
        self.notify.notify_waiters();
        released
    }

    /// Every unacknowledged message (pending and leased) in queue order,
    /// with its delivery count.
    pub(crate) fn snapshot(&self) -> Vec<(Arc<Message>, u32)> {
        let state = self.state.lock();
        let mut leased: Vec<&Delivery> = state.leased.values().map(|l| &l.delivery).collect();
        leased.sort_by_key(|d| d.seq);
        leased
            .into_iter()
            .chain(state.pending.iter())
            .map(|d| (Arc::clone(&d.message), d.delivery_count))
            .collect()
    }

    pub fn stats(&self) -> SubscriptionStats {
        let state = self.state.lock();
        SubscriptionStats {
            pending: state.pending.len(),
            outstanding_messages: state.flow.outstanding_messages(),
            outstanding_bytes: state.flow.outstanding_bytes(),
            dead_lettered: state.dead_letters.len(),
        }
    }

    /// Ids of pending messages in delivery order.
    pub fn pending_ids(&self) -> Vec<MessageId> {
        self.state.lock().pending.iter().map(|d| d.message.id).collect()
    }

    /// Active (not yet expired or acked) leases, sorted by message id.
    pub fn leases(&self) -> Vec<Lease> {
        let now = Instant::now();
        let state = self.state.lock();
        let mut leases: Vec<Lease> = state
            .leased
            .values()
            .filter(|l| !l.lease.is_expired(now))
            .map(|l| l.lease.clone())
            .collect();
        leases.sort_by_key(|l| l.message_id);
        leases
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().dead_letters.clone()
    }
}
