use std::time::Duration;

use serde::Deserialize;

use crate::broker::flow::FlowControlSettings;
use crate::broker::subscription::SubscriptionConfig;

/// Top-level configuration settings for the application.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct Settings {
    pub broker: BrokerSettings,
    pub storage: StorageSettings,
    pub logging: LoggingSettings,
}

/// Broker defaults applied to new topics and subscriptions.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct BrokerSettings {
    pub ack_deadline_secs: u64,
    pub max_delivery_attempts: Option<u32>,
    pub max_messages_per_topic: Option<usize>,
    pub max_outstanding_messages: Option<usize>,
    pub max_outstanding_bytes: Option<usize>,
    pub lease_sweep_interval_ms: u64,
}

/// Where the snapshot store lives.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct StorageSettings {
    pub enabled: bool,
    pub path: String,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct LoggingSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Missing values are filled in from `Settings::default()`.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub broker: Option<PartialBrokerSettings>,
    pub storage: Option<PartialStorageSettings>,
    pub logging: Option<PartialLoggingSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialBrokerSettings {
    pub ack_deadline_secs: Option<u64>,
    pub max_delivery_attempts: Option<u32>,
    pub max_messages_per_topic: Option<usize>,
    pub max_outstanding_messages: Option<usize>,
    pub max_outstanding_bytes: Option<usize>,
    pub lease_sweep_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialStorageSettings {
    pub enabled: Option<bool>,
    pub path: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            broker: BrokerSettings::default(),
            storage: StorageSettings {
                enabled: true,
                path: "pullsub_db".to_string(),
            },
            logging: LoggingSettings {
                level: "info".to_string(),
            },
        }
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            ack_deadline_secs: 10,
            max_delivery_attempts: None,
            max_messages_per_topic: None,
            max_outstanding_messages: None,
            max_outstanding_bytes: None,
            lease_sweep_interval_ms: 1000,
        }
    }
}

impl BrokerSettings {
    pub fn ack_deadline(&self) -> Duration {
        Duration::from_secs(self.ack_deadline_secs)
    }

    pub fn lease_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.lease_sweep_interval_ms.max(1))
    }

    /// Subscription config used when a caller only supplies an ack deadline.
    pub fn subscription_config(&self, ack_deadline: Duration) -> SubscriptionConfig {
        SubscriptionConfig {
            ack_deadline,
            flow_control: FlowControlSettings {
                max_outstanding_messages: self.max_outstanding_messages,
                max_outstanding_bytes: self.max_outstanding_bytes,
                ..Default::default()
            },
            max_delivery_attempts: self.max_delivery_attempts,
        }
    }
}

impl PartialSettings {
    /// Overlay the values that were provided onto `defaults`.
    pub fn merge(self, defaults: Settings) -> Settings {
        let broker = self.broker.unwrap_or_default();
        let storage = self.storage.unwrap_or_default();
        let logging = self.logging.unwrap_or_default();
        let d = defaults;

        Settings {
            broker: BrokerSettings {
                ack_deadline_secs: broker
                    .ack_deadline_secs
                    .unwrap_or(d.broker.ack_deadline_secs),
                max_delivery_attempts: broker
                    .max_delivery_attempts
                    .or(d.broker.max_delivery_attempts),
                max_messages_per_topic: broker
                    .max_messages_per_topic
                    .or(d.broker.max_messages_per_topic),
                max_outstanding_messages: broker
                    .max_outstanding_messages
                    .or(d.broker.max_outstanding_messages),
                max_outstanding_bytes: broker
                    .max_outstanding_bytes
                    .or(d.broker.max_outstanding_bytes),
                lease_sweep_interval_ms: broker
                    .lease_sweep_interval_ms
                    .unwrap_or(d.broker.lease_sweep_interval_ms),
            },
            storage: StorageSettings {
                enabled: storage.enabled.unwrap_or(d.storage.enabled),
                path: storage.path.unwrap_or(d.storage.path),
            },
            logging: LoggingSettings {
                level: logging.level.unwrap_or(d.logging.level),
            },
        }
    }
}
