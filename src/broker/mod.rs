pub mod engine;
pub mod flow;
pub mod lease;
pub mod message;
pub mod store;
pub mod subscription;
pub mod topic;

pub use engine::Broker;
pub use flow::{FlowControlSettings, LimitExceededBehavior};
pub use message::{LeaseId, Message, MessageId, OutgoingMessage, ReceivedMessage};
pub use subscription::{DeadLetter, DeadLetterReason, SubscriptionConfig, SubscriptionStats};
