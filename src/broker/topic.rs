//! Topic management
//!
//! A `Topic` owns its `MessageStore` and the ordered list of subscriptions
//! attached to it. Publishing holds the store lock across append and
//! fan-out, which makes each publish a single serialization point: a
//! subscription registered before the publish starts receives the
//! message, one registered after does not.
//!
//! Lock order inside a topic: store, then subscription list, then each
//! subscription's own state.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::broker::message::{Message, MessageId, OutgoingMessage};
use crate::broker::store::MessageStore;
use crate::broker::subscription::Subscription;

#[derive(Debug)]
pub struct Topic {
    pub name: String,
    store: Mutex<MessageStore>,
    subscriptions: RwLock<Vec<Arc<Subscription>>>,
}

impl Topic {
    /// Create a new topic with the given name.
    pub fn new(name: &str, max_messages: Option<usize>) -> Self {
        Self::with_store(name, MessageStore::new(max_messages))
    }

    pub(crate) fn with_store(name: &str, store: MessageStore) -> Self {
        Self {
            name: name.to_string(),
            store: Mutex::new(store),
            subscriptions: RwLock::new(Vec::new()),
        }
    }

    /// Attach a subscription. Fan-out follows attachment order.
    pub fn add_subscription(&self, subscription: Arc<Subscription>) {
        self.subscriptions.write().push(subscription);
    }

    /// Detach a subscription by name, returning it if it was attached.
    pub fn remove_subscription(&self, name: &str) -> Option<Arc<Subscription>> {
        let mut subs = self.subscriptions.write();
        let idx = subs.iter().position(|s| s.name() == name)?;
        Some(subs.remove(idx))
    }

    pub fn subscriptions(&self) -> Vec<Arc<Subscription>> {
        self.subscriptions.read().clone()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    /// Append `messages` to the store and fan them out to every attached
    /// subscription. Returns the assigned ids in order.
    pub fn publish(&self, messages: Vec<OutgoingMessage>) -> Vec<MessageId> {
        let mut store = self.store.lock();
        let appended: Vec<Arc<Message>> = messages
            .into_iter()
            .map(|m| store.append(m.payload, m.attributes))
            .collect();
        self.fanout(&appended);
        appended.iter().map(|m| m.id).collect()
    }

    pub fn publish_one(&self, message: OutgoingMessage) -> MessageId {
        let mut store = self.store.lock();
        let appended = store.append(message.payload, message.attributes);
        self.fanout(std::slice::from_ref(&appended));
        appended.id
    }

    /// Hand a reference to each message to every current subscription.
    fn fanout(&self, messages: &[Arc<Message>]) {
        let subs = self.subscriptions.read();
        for sub in subs.iter() {
            sub.enqueue(messages);
        }
    }

    pub fn history(&self) -> Vec<Arc<Message>> {
        self.store.lock().history()
    }

    pub fn last_message_id(&self) -> MessageId {
        self.store.lock().last_id()
    }

    pub fn message(&self, id: MessageId) -> Option<Arc<Message>> {
        self.store.lock().get(id)
    }
}
