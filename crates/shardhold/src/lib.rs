//! Sharded, event-sourced entity runtime.
//!
//! One durable entity per owner key, single-writer across the cluster:
//! commands are routed by key to the shard region owning the key's shard,
//! handled by the key's only live [`Entity`](entity::Entity), and persisted
//! write-ahead to an [`EventJournal`](journal::EventJournal) before the
//! in-memory state changes. A [`ShardCoordinator`](coordinator::ShardCoordinator)
//! assigns shards to regions and moves them with an acknowledged handoff.
//!
//! ```text
//! use shardhold::prelude::*;
//!
//! #[derive(Clone)]
//! struct Counter;
//!
//! impl Behavior for Counter {
//!     type State = i64;
//!     type Event = i64;
//!
//!     fn name(&self) -> &str { "Counter" }
//!     fn apply(&self, state: &mut i64, delta: &i64) { *state += delta; }
//!     fn handlers(&self) -> HandlerTable<i64, i64> {
//!         HandlerTable::<i64, i64>::new()
//!             .on::<Add, _>(|_, add| Ok(Effect::persist(vec![add.by]).then_reply(|s: &i64| *s)))
//!     }
//! }
//!
//! let total = region.ask("user-1", &Add { by: 2 }).await?;
//! ```

pub mod allocation;
pub mod config;
pub mod coordinator;
pub mod entity;
pub mod envelope;
pub mod error;
pub mod hash;
pub mod journal;
pub mod membership;
pub mod metrics;
pub mod reaper;
pub mod region;
pub mod reply;
pub mod request_id;
pub mod shard;
pub mod storage;
pub mod testing;
pub mod transport;
pub mod types;

/// Commonly used items for defining behaviors and running regions.
pub mod prelude {
    pub use crate::config::RuntimeConfig;
    pub use crate::coordinator::{AssignmentTable, ShardCoordinator, ShardLocation};
    pub use crate::entity::{Behavior, Effect, EntityStatus, HandlerTable};
    pub use crate::envelope::{Command, InboundCommand};
    pub use crate::error::ClusterError;
    pub use crate::journal::EventJournal;
    pub use crate::region::{AssignmentFeed, ShardRegion};
    pub use crate::reply::Reply;
    pub use crate::request_id::RequestId;
    pub use crate::types::{OwnerKey, RegionAddress, ShardId};
}
