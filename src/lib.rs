//! # PullSub
//!
//! `pullsub` is an in-process publish/subscribe broker with pull delivery.
//! Published messages are fanned out to every subscription of a topic;
//! subscribers pull them under a lease, acknowledge them, and get them
//! redelivered when a lease runs out. Delivery is at-least-once.
//!
//! ## Core Modules
//!
//! - `broker`: topics, subscriptions, leases, flow control and the `Broker` itself.
//! - `config`: loading settings from defaults, `config/default.*` and the environment.
//! - `persistence`: a `sled` snapshot store so state survives a restart.
//! - `utils`: the error type and logging setup.
//!
//! ```no_run
//! use std::collections::HashMap;
//! use std::time::Duration;
//! use pullsub::Broker;
//!
//! let broker = Broker::default();
//! broker.create_topic("orders")?;
//! broker.create_subscription("billing", "orders", Duration::from_secs(10))?;
//! broker.publish("orders", "hello", HashMap::new())?;
//! for msg in broker.pull("billing", 10)? {
//!     broker.ack("billing", &msg.lease_id)?;
//! }
//! # Ok::<(), pullsub::BrokerError>(())
//! ```

pub mod broker;
pub mod config;
pub mod persistence;
pub mod utils;

pub use broker::Broker;
pub use utils::error::{BrokerError, ResourceKind, Result};
