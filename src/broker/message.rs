//! Message definitions for the broker
//!
//! `Message` is the immutable record created by a publish. The broker
//! shares one `Arc<Message>` between the topic history and every
//! subscription queue it was fanned out to.
//!
//! Notes on fields:
//! - `id`: per-topic sequence number, starts at 1 and never repeats
//! - `payload`: opaque bytes
//! - `attributes`: free-form string key/value pairs
//! - `publish_time`: set by the broker when the message is appended

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type MessageId = u64;
pub type LeaseId = String;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub payload: Vec<u8>,
    pub attributes: HashMap<String, String>,
    pub publish_time: DateTime<Utc>,
}

impl Message {
    /// Size used for byte-based flow control.
    pub fn size(&self) -> usize {
        self.payload.len()
            + self
                .attributes
                .iter()
                .map(|(k, v)| k.len() + v.len())
                .sum::<usize>()
    }

    /// Payload as UTF-8 text, replacing invalid sequences.
    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// A message handed to `Broker::publish_batch` before it gets an id.
#[derive(Debug, Clone, Default)]
pub struct OutgoingMessage {
    pub payload: Vec<u8>,
    pub attributes: HashMap<String, String>,
}

impl OutgoingMessage {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            attributes: HashMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// A message returned by a pull, together with the lease that must be used
/// to acknowledge it.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub message: Arc<Message>,
    pub lease_id: LeaseId,
    /// 1 on first delivery, incremented on every redelivery.
    pub delivery_count: u32,
}

impl ReceivedMessage {
    pub fn message_id(&self) -> MessageId {
        self.message.id
    }

    pub fn payload(&self) -> &[u8] {
        &self.message.payload
    }

    pub fn attributes(&self) -> &HashMap<String, String> {
        &self.message.attributes
    }
}
