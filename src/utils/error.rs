//! The `error` module defines the error type returned by every fallible
//! broker operation.
//!
//! Errors are always handed back to the caller as values. Lease expiry and
//! redelivery are internal housekeeping and never show up here.

use std::fmt;

/// Which registry a `NotFound` / `AlreadyExists` error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Topic,
    Subscription,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Topic => f.write_str("topic"),
            ResourceKind::Subscription => f.write_str("subscription"),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum BrokerError {
    #[error("{kind} not found: {name}")]
    NotFound { kind: ResourceKind, name: String },

    #[error("{kind} already exists: {name}")]
    AlreadyExists { kind: ResourceKind, name: String },

    #[error("topic {topic} still has {count} subscription(s)")]
    HasSubscriptions { topic: String, count: usize },

    #[error("lease {lease_id} is not active on subscription {subscription}")]
    InvalidLease {
        subscription: String,
        lease_id: String,
    },

    #[error("subscription {0} has no outstanding capacity left")]
    CapacityExceeded(String),

    #[error("invalid resource name: {0:?}")]
    InvalidName(String),

    #[error("broker is shut down")]
    ShutDown,

    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BrokerError {
    pub(crate) fn topic_not_found(name: &str) -> Self {
        BrokerError::NotFound {
            kind: ResourceKind::Topic,
            name: name.to_string(),
        }
    }

    pub(crate) fn subscription_not_found(name: &str) -> Self {
        BrokerError::NotFound {
            kind: ResourceKind::Subscription,
            name: name.to_string(),
        }
    }

    pub(crate) fn invalid_lease(subscription: &str, lease_id: &str) -> Self {
        BrokerError::InvalidLease {
            subscription: subscription.to_string(),
            lease_id: lease_id.to_string(),
        }
    }

    /// True for the `NotFound` family, regardless of resource kind.
    pub fn is_not_found(&self) -> bool {
        matches!(self, BrokerError::NotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;

/// Topic and subscription names: 1..=255 chars of `[A-Za-z0-9-_.~+%]`.
pub(crate) fn validate_name(name: &str) -> Result<()> {
    let valid_char = |c: char| c.is_ascii_alphanumeric() || "-_.~+%".contains(c);
    if name.is_empty() || name.len() > 255 || !name.chars().all(valid_char) {
        return Err(BrokerError::InvalidName(name.to_string()));
    }
    Ok(())
}
