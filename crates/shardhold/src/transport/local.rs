//! In-process transport: regions of one process reach each other directly.
//!
//! Used by [`TestCluster`](crate::testing::TestCluster) and single-process
//! deployments. Links can be cut and restored to simulate partitions.

use std::collections::HashSet;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use crate::envelope::CommandEnvelope;
use crate::error::ClusterError;
use crate::transport::{RegionEndpoint, RegionTransport};
use crate::types::{RegionAddress, ShardId};

enum Slot {
    Endpoint(Weak<dyn RegionEndpoint>),
    /// Answers pings but hosts nothing.
    PingOnly,
}

/// Registry of in-process region endpoints.
#[derive(Default)]
pub struct LocalTransport {
    endpoints: DashMap<RegionAddress, Slot>,
    disconnected: parking_lot::Mutex<HashSet<RegionAddress>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `endpoint` reachable at `address`. Replaces any earlier registration.
    ///
    /// Only a weak reference is kept; a dropped region becomes unavailable.
    pub fn register<E: RegionEndpoint + 'static>(&self, address: RegionAddress, endpoint: &Arc<E>) {
        let endpoint: Arc<dyn RegionEndpoint> = endpoint.clone();
        debug!(region = %address, "local endpoint registered");
        self.endpoints
            .insert(address, Slot::Endpoint(Arc::downgrade(&endpoint)));
    }

    pub fn register_ping_only(&self, address: RegionAddress) {
        self.endpoints.insert(address, Slot::PingOnly);
    }

    pub fn unregister(&self, address: &RegionAddress) {
        self.endpoints.remove(address);
    }

    /// Cut the link to `address`: every call fails until [`reconnect`](Self::reconnect).
    pub fn disconnect(&self, address: &RegionAddress) {
        self.disconnected.lock().insert(address.clone());
    }

    pub fn reconnect(&self, address: &RegionAddress) {
        self.disconnected.lock().remove(address);
    }

    fn unavailable(address: &RegionAddress) -> ClusterError {
        ClusterError::RegionUnavailable {
            address: address.clone(),
            source: None,
        }
    }

    fn slot_is_ping_only(&self, address: &RegionAddress) -> bool {
        matches!(self.endpoints.get(address).as_deref(), Some(Slot::PingOnly))
    }

    fn endpoint(&self, address: &RegionAddress) -> Result<Arc<dyn RegionEndpoint>, ClusterError> {
        if self.disconnected.lock().contains(address) {
            return Err(Self::unavailable(address));
        }
        match self.endpoints.get(address).as_deref() {
            Some(Slot::Endpoint(weak)) => weak.upgrade().ok_or_else(|| Self::unavailable(address)),
            _ => Err(Self::unavailable(address)),
        }
    }
}

#[async_trait]
impl RegionTransport for LocalTransport {
    async fn forward(
        &self,
        target: &RegionAddress,
        envelope: CommandEnvelope,
    ) -> Result<Vec<u8>, ClusterError> {
        let endpoint = self.endpoint(target)?;
        endpoint.deliver_local(envelope).await
    }

    async fn handoff(&self, target: &RegionAddress, shard: ShardId) -> Result<usize, ClusterError> {
        let endpoint = self.endpoint(target)?;
        endpoint.handoff_shard(shard).await
    }

    async fn ping(&self, target: &RegionAddress) -> Result<(), ClusterError> {
        if self.slot_is_ping_only(target) && !self.disconnected.lock().contains(target) {
            return Ok(());
        }
        self.endpoint(target).map(|_| ())
    }
}

/// Transport for a region that is alone in its cluster.
///
/// There is no peer to forward to, and a shard handoff has nothing to wait
/// for: the region drops the shard when the next table moves it.
pub struct NoopTransport;

#[async_trait]
impl RegionTransport for NoopTransport {
    async fn forward(
        &self,
        target: &RegionAddress,
        _envelope: CommandEnvelope,
    ) -> Result<Vec<u8>, ClusterError> {
        Err(LocalTransport::unavailable(target))
    }

    async fn handoff(&self, _target: &RegionAddress, _shard: ShardId) -> Result<usize, ClusterError> {
        Ok(0)
    }

    async fn ping(&self, _target: &RegionAddress) -> Result<(), ClusterError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::InboundCommand;
    use crate::reply::Reply;
    use crate::request_id::RequestId;
    use crate::types::OwnerKey;

    struct Echo;

    #[async_trait]
    impl RegionEndpoint for Echo {
        async fn deliver_local(&self, envelope: CommandEnvelope) -> Result<Vec<u8>, ClusterError> {
            Ok(envelope.payload)
        }

        async fn handoff_shard(&self, _shard: ShardId) -> Result<usize, ClusterError> {
            Ok(2)
        }

        async fn handle_inbound(&self, _command: InboundCommand) -> Reply {
            Reply::Success(vec![])
        }
    }

    fn envelope() -> CommandEnvelope {
        CommandEnvelope::new(RequestId(1), OwnerKey::new("k"), "echo", vec![7], 4)
    }

    #[tokio::test]
    async fn forwards_to_registered_endpoint() {
        let transport = LocalTransport::new();
        let addr = RegionAddress::new("a", 1);
        let echo = Arc::new(Echo);
        transport.register(addr.clone(), &echo);

        assert_eq!(transport.forward(&addr, envelope()).await.unwrap(), vec![7]);
        assert_eq!(transport.handoff(&addr, ShardId::new(0)).await.unwrap(), 2);
        transport.ping(&addr).await.unwrap();
    }

    #[tokio::test]
    async fn unknown_disconnected_and_dropped_are_unavailable() {
        let transport = LocalTransport::new();
        let addr = RegionAddress::new("a", 1);
        let err = transport.forward(&addr, envelope()).await.unwrap_err();
        assert!(matches!(err, ClusterError::RegionUnavailable { .. }));

        let echo = Arc::new(Echo);
        transport.register(addr.clone(), &echo);
        transport.disconnect(&addr);
        assert!(transport.ping(&addr).await.is_err());
        transport.reconnect(&addr);
        assert!(transport.ping(&addr).await.is_ok());

        drop(echo);
        assert!(transport.ping(&addr).await.is_err());
    }

    #[tokio::test]
    async fn noop_transport_has_no_peers() {
        let addr = RegionAddress::new("a", 1);
        assert!(NoopTransport.forward(&addr, envelope()).await.is_err());
        assert_eq!(NoopTransport.handoff(&addr, ShardId::new(1)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn ping_only_answers_pings() {
        let transport = LocalTransport::new();
        let addr = RegionAddress::new("a", 1);
        transport.register_ping_only(addr.clone());
        transport.ping(&addr).await.unwrap();
        assert!(transport.forward(&addr, envelope()).await.is_err());
    }
}
