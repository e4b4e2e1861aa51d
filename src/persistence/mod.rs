//! The `persistence` module lets a broker outlive its process.
//!
//! The broker core keeps everything in memory. On shutdown it can hand a
//! `Snapshot` to `Persistence`, which writes it into an embedded `sled`
//! database; `Broker::open` reads it back on the next start. Messages that
//! were leased but not acknowledged at shutdown are restored as pending.

pub mod sled_store;

pub use sled_store::{Persistence, Snapshot, StoredDelivery, StoredSubscription, StoredTopic};
