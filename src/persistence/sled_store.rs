use std::path::Path;

use serde::{Deserialize, Serialize};
use sled::{Batch, Db};
use tracing::debug;

use crate::broker::message::{Message, MessageId};
use crate::broker::subscription::SubscriptionConfig;
use crate::utils::error::Result;

const TOPIC_PREFIX: &str = "topic/";
const SUBSCRIPTION_PREFIX: &str = "subscription/";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StoredTopic {
    pub name: String,
    pub last_id: MessageId,
    pub history: Vec<Message>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StoredDelivery {
    pub message: Message,
    pub delivery_count: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StoredSubscription {
    pub name: String,
    pub topic: String,
    /// Position in the topic's fan-out order.
    pub position: usize,
    pub config: SubscriptionConfig,
    pub deliveries: Vec<StoredDelivery>,
}

/// Full broker state as written on shutdown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub topics: Vec<StoredTopic>,
    pub subscriptions: Vec<StoredSubscription>,
}

#[derive(Clone)]
pub struct Persistence {
    db: Db,
}

impl Persistence {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    /// Replace the stored snapshot in one atomic batch.
    pub fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let mut batch = Batch::default();
        for key in self.db.iter().keys() {
            batch.remove(key?);
        }
        for topic in &snapshot.topics {
            let key = format!("{TOPIC_PREFIX}{}", topic.name);
            batch.insert(key.as_bytes(), serde_json::to_vec(topic)?);
        }
        for sub in &snapshot.subscriptions {
            let key = format!("{SUBSCRIPTION_PREFIX}{}", sub.name);
            batch.insert(key.as_bytes(), serde_json::to_vec(sub)?);
        }
        self.db.apply_batch(batch)?;
        self.db.flush()?;
        debug!(
            topics = snapshot.topics.len(),
            subscriptions = snapshot.subscriptions.len(),
            "snapshot saved"
        );
        Ok(())
    }

    pub fn load(&self) -> Result<Snapshot> {
        let mut topics: Vec<StoredTopic> = Vec::new();
        for entry in self.db.scan_prefix(TOPIC_PREFIX) {
            let (_, value) = entry?;
            topics.push(serde_json::from_slice(&value)?);
        }
        let mut subscriptions: Vec<StoredSubscription> = Vec::new();
        for entry in self.db.scan_prefix(SUBSCRIPTION_PREFIX) {
            let (_, value) = entry?;
            subscriptions.push(serde_json::from_slice(&value)?);
        }
        subscriptions.sort_by(|a, b| a.topic.cmp(&b.topic).then(a.position.cmp(&b.position)));
        Ok(Snapshot {
            topics,
            subscriptions,
        })
    }
}

impl std::fmt::Debug for Persistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Persistence")
            .field("db", &"sled::Db")
            .finish()
    }
}
