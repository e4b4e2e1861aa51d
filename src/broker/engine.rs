//! Broker engine
//!
//! This module contains the in-process broker responsible for:
//! - the registries of topics and subscriptions
//! - publishing messages and fanning them out to subscriptions
//! - leasing messages to pullers, acks and ack-deadline changes
//! - redelivering (or dead-lettering) messages whose lease expired
//! - snapshotting state through `Persistence` on shutdown
//!
//! Concurrency and usage notes:
//! - Every method takes `&self`; share the broker as `Arc<Broker>`.
//!   Registries, topics and subscriptions each have their own lock, so work
//!   on independent topics or subscriptions never contends.
//! - Lock order is broker topics, broker subscriptions, topic store, topic
//!   subscription list, subscription state. The lease heap is only locked on
//!   its own.
//! - Expired leases are swept lazily at the start of publish, pull, ack and
//!   modify-ack-deadline, and periodically by `start_lease_sweeper`.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::lease::LeaseManager;
use crate::broker::message::{Message, MessageId, OutgoingMessage, ReceivedMessage};
use crate::broker::store::MessageStore;
use crate::broker::subscription::{
    DeadLetter, ExpiryOutcome, Subscription, SubscriptionConfig, SubscriptionStats,
};
use crate::broker::topic::Topic;
use crate::config::{BrokerSettings, Settings};
use crate::persistence::{Persistence, Snapshot, StoredDelivery, StoredSubscription, StoredTopic};
use crate::utils::error::{BrokerError, ResourceKind, Result, validate_name};

#[derive(Debug)]
pub struct Broker {
    settings: BrokerSettings,
    topics: RwLock<HashMap<String, Arc<Topic>>>,
    subscriptions: RwLock<HashMap<String, Arc<Subscription>>>,
    leases: LeaseManager,
    persistence: Option<Persistence>,
    shutdown: CancellationToken,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(BrokerSettings::default())
    }
}

impl Broker {
    /// An empty, memory-only broker.
    pub fn new(settings: BrokerSettings) -> Self {
        Self {
            settings,
            topics: RwLock::new(HashMap::new()),
            subscriptions: RwLock::new(HashMap::new()),
            leases: LeaseManager::new(),
            persistence: None,
            shutdown: CancellationToken::new(),
        }
    }

    /// A broker restored from (and later snapshotted to) `persistence`.
    pub fn open(settings: BrokerSettings, persistence: Persistence) -> Result<Self> {
        let snapshot = persistence.load()?;
        let mut broker = Self::new(settings);
        broker.restore(snapshot);
        broker.persistence = Some(persistence);
        Ok(broker)
    }

    /// Build a broker from application settings, opening the snapshot store
    /// when storage is enabled.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        if settings.storage.enabled {
            let persistence = Persistence::open(&settings.storage.path)?;
            Self::open(settings.broker.clone(), persistence)
        } else {
            Ok(Self::new(settings.broker.clone()))
        }
    }

    pub fn settings(&self) -> &BrokerSettings {
        &self.settings
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_shut_down() {
            return Err(BrokerError::ShutDown);
        }
        Ok(())
    }

    fn topic(&self, name: &str) -> Result<Arc<Topic>> {
        self.topics
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| BrokerError::topic_not_found(name))
    }

    /// Look up a live subscription by name.
    pub fn subscription(&self, name: &str) -> Result<Arc<Subscription>> {
        self.subscriptions
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| BrokerError::subscription_not_found(name))
    }

    pub fn create_topic(&self, name: &str) -> Result<()> {
        self.ensure_open()?;
        validate_name(name)?;
        let mut topics = self.topics.write();
        if topics.contains_key(name) {
            return Err(BrokerError::AlreadyExists {
                kind: ResourceKind::Topic,
                name: name.to_string(),
            });
        }
        topics.insert(
            name.to_string(),
            Arc::new(Topic::new(name, self.settings.max_messages_per_topic)),
        );
        info!(topic = name, "topic created");
        Ok(())
    }

    /// Delete a topic. Without `cascade` this fails while subscriptions are
    /// attached; with it, they are deleted first.
    pub fn delete_topic(&self, name: &str, cascade: bool) -> Result<()> {
        self.ensure_open()?;
        let mut topics = self.topics.write();
        let topic = topics
            .get(name)
            .cloned()
            .ok_or_else(|| BrokerError::topic_not_found(name))?;

        let count = topic.subscription_count();
        if count > 0 && !cascade {
            return Err(BrokerError::HasSubscriptions {
                topic: name.to_string(),
                count,
            });
        }

        if count > 0 {
            let mut subs = self.subscriptions.write();
            for sub in topic.subscriptions() {
                topic.remove_subscription(sub.name());
                subs.remove(sub.name());
                let released = sub.close();
                info!(
                    subscription = sub.name(),
                    topic = name,
                    released,
                    "subscription deleted with topic"
                );
            }
        }

        topics.remove(name);
        info!(topic = name, "topic deleted");
        Ok(())
    }

    /// Topic names, sorted.
    pub fn list_topics(&self) -> Vec<String> {
        let mut names: Vec<String> = self.topics.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Messages still held in the topic's history, oldest first.
    pub fn topic_history(&self, topic: &str) -> Result<Vec<Arc<Message>>> {
        Ok(self.topic(topic)?.history())
    }

    pub fn create_subscription(&self, name: &str, topic: &str, ack_deadline: Duration) -> Result<()> {
        let config = self.settings.subscription_config(ack_deadline);
        self.create_subscription_with(name, topic, config)
    }

    pub fn create_subscription_with(
        &self,
        name: &str,
        topic: &str,
        config: SubscriptionConfig,
    ) -> Result<()> {
        self.ensure_open()?;
        validate_name(name)?;

        // Holding the topic registry keeps a concurrent delete_topic out.
        let topics = self.topics.read();
        let topic_ref = topics
            .get(topic)
            .ok_or_else(|| BrokerError::topic_not_found(topic))?;

        let mut subs = self.subscriptions.write();
        if subs.contains_key(name) {
            return Err(BrokerError::AlreadyExists {
                kind: ResourceKind::Subscription,
                name: name.to_string(),
            });
        }

        let ack_deadline = config.ack_deadline;
        let subscription = Arc::new(Subscription::new(name, topic, config));
        topic_ref.add_subscription(Arc::clone(&subscription));
        subs.insert(name.to_string(), subscription);
        info!(
            subscription = name,
            topic,
            ack_deadline_ms = ack_deadline.as_millis() as u64,
            "subscription created"
        );
        Ok(())
    }

    /// Delete a subscription, releasing its leases and waking blocked pulls.
    pub fn delete_subscription(&self, name: &str) -> Result<()> {
        self.ensure_open()?;
        let topics = self.topics.read();
        let mut subs = self.subscriptions.write();
        let subscription = subs
            .remove(name)
            .ok_or_else(|| BrokerError::subscription_not_found(name))?;

        if let Some(topic) = topics.get(subscription.topic()) {
            topic.remove_subscription(name);
        }
        let released = subscription.close();
        info!(subscription = name, released, "subscription deleted");
        Ok(())
    }

    /// Subscription names across all topics, sorted.
    pub fn list_subscriptions(&self) -> Vec<String> {
        let mut names: Vec<String> = self.subscriptions.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Names of the subscriptions attached to `topic`, sorted.
    pub fn list_topic_subscriptions(&self, topic: &str) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .topic(topic)?
            .subscriptions()
            .iter()
            .map(|s| s.name().to_string())
            .collect();
        names.sort();
        Ok(names)
    }

    pub fn subscription_stats(&self, name: &str) -> Result<SubscriptionStats> {
        Ok(self.subscription(name)?.stats())
    }

    pub fn dead_letters(&self, name: &str) -> Result<Vec<DeadLetter>> {
        Ok(self.subscription(name)?.dead_letters())
    }

    /// Publish one message, returning its id.
    pub fn publish(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
        attributes: HashMap<String, String>,
    ) -> Result<MessageId> {
        self.ensure_open()?;
        self.sweep_expired_leases();
        let topic_ref = self.topic(topic)?;
        let id = topic_ref.publish_one(OutgoingMessage {
            payload: payload.into(),
            attributes,
        });
        debug!(topic, id, "published");
        Ok(id)
    }

    /// Publish several messages under one serialization point. The ids are
    /// contiguous and every subscription sees the batch in order.
    pub fn publish_batch(&self, topic: &str, messages: Vec<OutgoingMessage>) -> Result<Vec<MessageId>> {
        self.ensure_open()?;
        self.sweep_expired_leases();
        let topic_ref = self.topic(topic)?;
        let ids = topic_ref.publish(messages);
        debug!(topic, count = ids.len(), "published");
        Ok(ids)
    }

    /// Non-blocking pull using the subscription's ack deadline.
    pub fn pull(&self, subscription: &str, max_messages: usize) -> Result<Vec<ReceivedMessage>> {
        let sub = self.subscription(subscription)?;
        let ack_deadline = sub.config().ack_deadline;
        self.pull_from(&sub, max_messages, ack_deadline)
    }

    /// Non-blocking pull overriding the ack deadline for this receive.
    pub fn pull_with_deadline(
        &self,
        subscription: &str,
        max_messages: usize,
        ack_deadline: Duration,
    ) -> Result<Vec<ReceivedMessage>> {
        let sub = self.subscription(subscription)?;
        self.pull_from(&sub, max_messages, ack_deadline)
    }

    fn pull_from(
        &self,
        sub: &Subscription,
        max_messages: usize,
        ack_deadline: Duration,
    ) -> Result<Vec<ReceivedMessage>> {
        self.ensure_open()?;
        self.sweep_expired_leases();

        let now = Instant::now();
        let received = sub.lease(max_messages, ack_deadline, now)?;
        let expires_at = now + ack_deadline;
        for msg in &received {
            self.leases.track(sub.name(), &msg.lease_id, expires_at);
        }
        if !received.is_empty() {
            debug!(subscription = sub.name(), count = received.len(), "leased");
        }
        Ok(received)
    }

    /// Long-poll pull: waits up to `timeout` for at least one message.
    ///
    /// Returns an empty list on timeout or when `cancel` fires. A cancelled
    /// call never leaves a lease behind.
    pub async fn pull_wait(
        &self,
        subscription: &str,
        max_messages: usize,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<ReceivedMessage>> {
        let deadline = Instant::now() + timeout;
        loop {
            if cancel.is_cancelled() {
                debug!(subscription, "pull cancelled");
                return Ok(Vec::new());
            }
            let sub = self.subscription(subscription)?;
            let notified = sub.notify().notified();
            tokio::pin!(notified);
            // register before checking so a publish in between is not missed
            notified.as_mut().enable();

            let received = self.pull_from(&sub, max_messages, sub.config().ack_deadline)?;
            if !received.is_empty() || max_messages == 0 {
                return Ok(received);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(received);
            }
            let mut wake_at = deadline.min(now + self.settings.lease_sweep_interval());
            if let Some(next) = self.leases.next_expiry() {
                wake_at = wake_at.min(next.max(now));
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(subscription, "pull cancelled");
                    return Ok(Vec::new());
                }
                _ = self.shutdown.cancelled() => return Err(BrokerError::ShutDown),
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    pub fn ack(&self, subscription: &str, lease_id: &str) -> Result<()> {
        self.ensure_open()?;
        self.sweep_expired_leases();
        let sub = self.subscription(subscription)?;
        match sub.ack(lease_id, Instant::now()) {
            Ok(message) => {
                debug!(subscription, message_id = message.id, "acked");
                Ok(())
            }
            Err(err) => {
                warn!(subscription, lease_id, "ack rejected: {err}");
                Err(err)
            }
        }
    }

    /// Reset an active lease to expire `ack_deadline` from now. Zero makes
    /// the message redeliverable immediately.
    pub fn modify_ack_deadline(
        &self,
        subscription: &str,
        lease_id: &str,
        ack_deadline: Duration,
    ) -> Result<()> {
        self.ensure_open()?;
        self.sweep_expired_leases();
        let sub = self.subscription(subscription)?;
        let expires_at = sub.modify_deadline(lease_id, ack_deadline, Instant::now())?;
        if !ack_deadline.is_zero() {
            self.leases.track(subscription, lease_id, expires_at);
        }
        debug!(
            subscription,
            lease_id,
            ack_deadline_ms = ack_deadline.as_millis() as u64,
            "ack deadline modified"
        );
        Ok(())
    }

    /// Requeue (or dead-letter) every message whose lease has expired.
    pub fn sweep_expired_leases(&self) -> ExpiryOutcome {
        let now = Instant::now();
        let due = self.leases.drain_expired(now);
        let mut total = ExpiryOutcome::default();
        for (name, lease_ids) in due {
            // leases of deleted subscriptions were already released
            let Ok(sub) = self.subscription(&name) else {
                continue;
            };
            let outcome = sub.expire(&lease_ids, now);
            total.redelivered += outcome.redelivered;
            total.dead_lettered += outcome.dead_lettered;
        }
        if total.redelivered + total.dead_lettered > 0 {
            debug!(
                redelivered = total.redelivered,
                dead_lettered = total.dead_lettered,
                "lease sweep"
            );
        }
        total
    }

    /// Run the periodic lease sweep until the broker is shut down or dropped.
    pub async fn start_lease_sweeper(broker: Weak<Broker>) {
        let (interval, shutdown) = match broker.upgrade() {
            Some(b) => (b.settings.lease_sweep_interval(), b.shutdown.clone()),
            None => return,
        };
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.cancelled() => break,
            }
            let Some(broker) = broker.upgrade() else {
                break;
            };
            broker.sweep_expired_leases();
        }
        debug!("lease sweeper stopped");
    }

    /// Spawn `start_lease_sweeper` on the current tokio runtime.
    pub fn spawn_lease_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(Self::start_lease_sweeper(Arc::downgrade(self)))
    }

    /// Stop the broker: wake blocked pulls, stop the sweeper, return every
    /// leased message to pending and write a snapshot if storage is
    /// attached. Without storage the queued messages are lost with the
    /// process. Calling it twice is a no-op.
    pub fn shutdown(&self) -> Result<()> {
        if self.is_shut_down() {
            return Ok(());
        }
        self.shutdown.cancel();

        let subs: Vec<Arc<Subscription>> = self.subscriptions.read().values().cloned().collect();
        let requeued: usize = subs.iter().map(|s| s.requeue_all_leases()).sum();
        self.leases.clear();

        match &self.persistence {
            Some(persistence) => {
                persistence.save(&self.snapshot())?;
                info!(requeued, "broker shut down, snapshot written");
            }
            None => {
                info!(
                    requeued,
                    "broker shut down, in-memory state discarded"
                );
            }
        }
        Ok(())
    }

    /// Capture topics, histories and unacknowledged deliveries.
    pub fn snapshot(&self) -> Snapshot {
        let topics = self.topics.read();
        let mut snapshot = Snapshot::default();
        for topic in topics.values() {
            snapshot.topics.push(StoredTopic {
                name: topic.name.clone(),
                last_id: topic.last_message_id(),
                history: topic.history().iter().map(|m| (**m).clone()).collect(),
            });
            for (position, sub) in topic.subscriptions().iter().enumerate() {
                snapshot.subscriptions.push(StoredSubscription {
                    name: sub.name().to_string(),
                    topic: topic.name.clone(),
                    position,
                    config: sub.config().clone(),
                    deliveries: sub
                        .snapshot()
                        .into_iter()
                        .map(|(message, delivery_count)| StoredDelivery {
                            message: (*message).clone(),
                            delivery_count,
                        })
                        .collect(),
                });
            }
        }
        snapshot.topics.sort_by(|a, b| a.name.cmp(&b.name));
        snapshot
            .subscriptions
            .sort_by(|a, b| a.topic.cmp(&b.topic).then(a.position.cmp(&b.position)));
        snapshot
    }

    fn restore(&mut self, snapshot: Snapshot) {
        let max_messages = self.settings.max_messages_per_topic;
        let topics = self.topics.get_mut();
        let subs = self.subscriptions.get_mut();

        for stored in snapshot.topics {
            let store = MessageStore::restore(stored.last_id, stored.history, max_messages);
            topics.insert(stored.name.clone(), Arc::new(Topic::with_store(&stored.name, store)));
        }
        for stored in snapshot.subscriptions {
            let Some(topic) = topics.get(&stored.topic) else {
                warn!(
                    subscription = %stored.name,
                    topic = %stored.topic,
                    "skipping stored subscription without topic"
                );
                continue;
            };
            let deliveries = stored
                .deliveries
                .into_iter()
                .map(|d| (d.message, d.delivery_count))
                .collect();
            let sub = Arc::new(Subscription::restore(
                &stored.name,
                &stored.topic,
                stored.config,
                deliveries,
            ));
            topic.add_subscription(Arc::clone(&sub));
            subs.insert(stored.name, sub);
        }
        info!(
            topics = topics.len(),
            subscriptions = subs.len(),
            "broker state restored"
        );
    }
}
