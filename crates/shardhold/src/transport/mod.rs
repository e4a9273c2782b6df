//! Communication between regions and with the coordinator.
//!
//! [`RegionTransport`] and [`CoordinatorClient`] are the client side;
//! [`RegionEndpoint`] is what a region exposes to its peers. Implementations:
//! [`local`] for in-process clusters and tests, [`tcp`] for real networks.

pub mod local;
pub mod tcp;

use async_trait::async_trait;

use crate::coordinator::{AssignmentTable, ShardLocation};
use crate::envelope::{CommandEnvelope, InboundCommand};
use crate::error::ClusterError;
use crate::reply::Reply;
use crate::types::{RegionAddress, ShardId};

/// Region-to-region operations.
#[async_trait]
pub trait RegionTransport: Send + Sync {
    /// Deliver an envelope to the shard on `target` and return the entity's reply.
    async fn forward(
        &self,
        target: &RegionAddress,
        envelope: CommandEnvelope,
    ) -> Result<Vec<u8>, ClusterError>;

    /// Ask `target` to hand off `shard`. Resolves once every entity of the
    /// shard is passivated; returns how many were stopped.
    async fn handoff(&self, target: &RegionAddress, shard: ShardId) -> Result<usize, ClusterError>;

    async fn ping(&self, target: &RegionAddress) -> Result<(), ClusterError>;
}

/// Region-to-coordinator operations.
#[async_trait]
pub trait CoordinatorClient: Send + Sync {
    /// Owner of `shard`, allocating it if it has none yet.
    async fn allocate(
        &self,
        shard: ShardId,
        requester: &RegionAddress,
    ) -> Result<RegionAddress, ClusterError>;

    async fn lookup(&self, shard: ShardId) -> Result<Option<ShardLocation>, ClusterError>;

    /// Current assignment table.
    async fn table(&self) -> Result<AssignmentTable, ClusterError>;
}

/// Operations a region serves to its peers.
#[async_trait]
pub trait RegionEndpoint: Send + Sync {
    /// Deliver to a locally hosted shard. Fails with `RoutingStale` when the
    /// shard is not hosted here.
    async fn deliver_local(&self, envelope: CommandEnvelope) -> Result<Vec<u8>, ClusterError>;

    async fn handoff_shard(&self, shard: ShardId) -> Result<usize, ClusterError>;

    /// Route an external command from its entry point.
    async fn handle_inbound(&self, command: InboundCommand) -> Reply;
}
