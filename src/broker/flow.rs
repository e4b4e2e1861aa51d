//! Admission control for pulls
//!
//! Each subscription owns a `FlowController` counting the messages (and
//! bytes) that are leased but not yet acknowledged. A pull only leases as
//! many messages as the remaining capacity allows.

use serde::{Deserialize, Serialize};

/// What a pull does when the subscription has no capacity left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitExceededBehavior {
    /// Return fewer (possibly zero) messages.
    #[default]
    Truncate,
    /// Fail with `CapacityExceeded` when nothing can be admitted.
    Reject,
}

/// Limits on leased-but-unacknowledged messages. `None` means unlimited.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowControlSettings {
    pub max_outstanding_messages: Option<usize>,
    pub max_outstanding_bytes: Option<usize>,
    #[serde(default)]
    pub limit_exceeded_behavior: LimitExceededBehavior,
}

#[derive(Debug, Default)]
pub struct FlowController {
    settings: FlowControlSettings,
    outstanding_messages: usize,
    outstanding_bytes: usize,
}

impl FlowController {
    pub fn new(settings: FlowControlSettings) -> Self {
        Self {
            settings,
            outstanding_messages: 0,
            outstanding_bytes: 0,
        }
    }

    pub fn settings(&self) -> &FlowControlSettings {
        &self.settings
    }

    /// Reserve room for one message of `size` bytes.
    ///
    /// A message bigger than the byte limit is still admitted when nothing
    /// is outstanding, otherwise it could never be delivered.
    pub fn try_acquire(&mut self, size: usize) -> bool {
        if let Some(max) = self.settings.max_outstanding_messages {
            if self.outstanding_messages >= max {
                return false;
            }
        }
        if let Some(max) = self.settings.max_outstanding_bytes {
            if self.outstanding_messages > 0 && self.outstanding_bytes + size > max {
                return false;
            }
        }
        self.outstanding_messages += 1;
        self.outstanding_bytes += size;
        true
    }

    pub fn release(&mut self, size: usize) {
        self.outstanding_messages = self.outstanding_messages.saturating_sub(1);
        self.outstanding_bytes = self.outstanding_bytes.saturating_sub(size);
    }

    pub fn reset(&mut self) {
        self.outstanding_messages = 0;
        self.outstanding_bytes = 0;
    }

    pub fn outstanding_messages(&self) -> usize {
        self.outstanding_messages
    }

    pub fn outstanding_bytes(&self) -> usize {
        self.outstanding_bytes
    }

    pub fn rejects_when_full(&self) -> bool {
        self.settings.limit_exceeded_behavior == LimitExceededBehavior::Reject
    }
}
