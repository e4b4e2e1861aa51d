//! Per-topic message log
//!
//! `MessageStore` assigns message ids and keeps the publish history of one
//! topic. When a size bound is configured the oldest entries are evicted
//! first; ids keep increasing regardless.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::Utc;

use crate::broker::message::{Message, MessageId};

#[derive(Debug, Default)]
pub struct MessageStore {
    last_id: MessageId,
    history: VecDeque<Arc<Message>>,
    max_messages: Option<usize>,
}

impl MessageStore {
    pub fn new(max_messages: Option<usize>) -> Self {
        Self {
            last_id: 0,
            history: VecDeque::new(),
            max_messages,
        }
    }

    /// Rebuild a store from a snapshot.
    pub(crate) fn restore(
        last_id: MessageId,
        history: Vec<Message>,
        max_messages: Option<usize>,
    ) -> Self {
        let mut store = Self {
            last_id,
            history: history.into_iter().map(Arc::new).collect(),
            max_messages,
        };
        store.evict();
        store
    }

    /// Append a new message, returning the shared record.
    pub fn append(&mut self, payload: Vec<u8>, attributes: HashMap<String, String>) -> Arc<Message> {
        self.last_id += 1;
        let message = Arc::new(Message {
            id: self.last_id,
            payload,
            attributes,
            publish_time: Utc::now(),
        });
        self.history.push_back(Arc::clone(&message));
        self.evict();
        message
    }

    fn evict(&mut self) {
        if let Some(max) = self.max_messages {
            while self.history.len() > max {
                self.history.pop_front();
            }
        }
    }

    pub fn last_id(&self) -> MessageId {
        self.last_id
    }

    pub fn get(&self, id: MessageId) -> Option<Arc<Message>> {
        // ids in history are strictly increasing
        let idx = self.history.partition_point(|m| m.id < id);
        self.history.get(idx).filter(|m| m.id == id).cloned()
    }

    pub fn history(&self) -> Vec<Arc<Message>> {
        self.history.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }
}
