//! In-process cluster for unit and integration testing.
//!
//! Every region, the coordinator and the journal live in one process and
//! talk through a [`LocalTransport`]. Membership is driven by hand, and a
//! region can be crashed (nothing flushed) and restarted on the same address.

use std::sync::Arc;

use crate::allocation::LeastShardsStrategy;
use crate::config::RuntimeConfig;
use crate::coordinator::ShardCoordinator;
use crate::entity::Behavior;
use crate::error::ClusterError;
use crate::metrics::RegionMetrics;
use crate::region::{AssignmentFeed, ShardRegion};
use crate::storage::memory_journal::MemoryJournal;
use crate::storage::memory_membership::MemoryMembership;
use crate::transport::local::LocalTransport;
use crate::types::RegionAddress;

/// A multi-region in-memory cluster.
///
/// ```ignore
/// let cluster = TestCluster::new(Counter, 2).await?;
/// let total = cluster.region(0).ask("U1", &Increment { by: 1 }).await?;
/// cluster.shutdown().await;
/// ```
pub struct TestCluster<B: Behavior + Clone> {
    behavior: B,
    config: RuntimeConfig,
    addresses: Vec<RegionAddress>,
    regions: parking_lot::Mutex<Vec<Arc<ShardRegion<B>>>>,
    coordinator: Arc<ShardCoordinator>,
    journal: Arc<MemoryJournal>,
    transport: Arc<LocalTransport>,
    membership: Arc<MemoryMembership>,
}

impl<B: Behavior + Clone> TestCluster<B> {
    /// `regions` regions named `region-0`, `region-1`, ... with test-friendly timings.
    pub async fn new(behavior: B, regions: usize) -> Result<Self, ClusterError> {
        let config = RuntimeConfig {
            num_shards: 16,
            ask_timeout: std::time::Duration::from_secs(5),
            handoff_timeout: std::time::Duration::from_secs(2),
            entity_stop_timeout: std::time::Duration::from_secs(2),
            resend_backoff: std::time::Duration::from_millis(5),
            rebalance_interval: std::time::Duration::from_secs(3600),
            ..Default::default()
        };
        Self::with_config(behavior, regions, config).await
    }

    /// Cluster using `config` for every region; only the address differs.
    pub async fn with_config(
        behavior: B,
        regions: usize,
        config: RuntimeConfig,
    ) -> Result<Self, ClusterError> {
        config.validate()?;
        let addresses: Vec<RegionAddress> = (0..regions)
            .map(|i| RegionAddress::new(format!("region-{i}"), 7400))
            .collect();
        let journal = Arc::new(MemoryJournal::new());
        let transport = Arc::new(LocalTransport::new());
        let membership = Arc::new(MemoryMembership::with_members(addresses.iter().cloned()));

        let coordinator = ShardCoordinator::recover(
            Arc::new(config.clone()),
            journal.clone(),
            Arc::new(LeastShardsStrategy::new(
                config.rebalance_threshold,
                config.max_simultaneous_rebalance,
            )),
            transport.clone(),
            membership.clone(),
            Arc::new(RegionMetrics::unregistered()),
        )
        .await?;
        coordinator.start();

        let cluster = Self {
            behavior,
            config,
            addresses,
            regions: parking_lot::Mutex::new(Vec::new()),
            coordinator,
            journal,
            transport,
            membership,
        };
        let mut started = Vec::with_capacity(regions);
        for i in 0..regions {
            started.push(cluster.start_region(i)?);
        }
        *cluster.regions.lock() = started;
        Ok(cluster)
    }

    fn start_region(&self, index: usize) -> Result<Arc<ShardRegion<B>>, ClusterError> {
        let address = self.addresses[index].clone();
        let config = RuntimeConfig {
            region_address: address.clone(),
            ..self.config.clone()
        };
        let region = ShardRegion::new(
            Arc::new(config),
            self.behavior.clone(),
            self.journal.clone(),
            self.coordinator.clone(),
            self.transport.clone(),
            Arc::new(RegionMetrics::unregistered()),
        )?;
        self.transport.register(address, &region);
        region.start(
            AssignmentFeed::Watch(self.coordinator.subscribe()),
            Some(self.membership.clone()),
        );
        Ok(region)
    }

    pub fn region(&self, index: usize) -> Arc<ShardRegion<B>> {
        Arc::clone(&self.regions.lock()[index])
    }

    pub fn address(&self, index: usize) -> &RegionAddress {
        &self.addresses[index]
    }

    /// Index of the region at `address`.
    pub fn index_of(&self, address: &RegionAddress) -> Option<usize> {
        self.addresses.iter().position(|a| a == address)
    }

    pub fn coordinator(&self) -> &Arc<ShardCoordinator> {
        &self.coordinator
    }

    pub fn journal(&self) -> &Arc<MemoryJournal> {
        &self.journal
    }

    pub fn transport(&self) -> &Arc<LocalTransport> {
        &self.transport
    }

    pub fn membership(&self) -> &Arc<MemoryMembership> {
        &self.membership
    }

    /// Kill a region without flushing and cut its link. Membership is not
    /// told; call [`MemoryMembership::leave`] to report it down.
    pub fn crash_region(&self, index: usize) {
        let region = self.region(index);
        self.transport.disconnect(region.address());
        region.halt();
    }

    /// Start a fresh region on the address of a crashed one.
    pub fn restart_region(&self, index: usize) -> Result<Arc<ShardRegion<B>>, ClusterError> {
        let region = self.start_region(index)?;
        self.transport.reconnect(&self.addresses[index]);
        self.membership.join(self.addresses[index].clone());
        self.regions.lock()[index] = Arc::clone(&region);
        Ok(region)
    }

    /// Shut down every region gracefully, then the coordinator.
    pub async fn shutdown(&self) {
        let regions: Vec<_> = self.regions.lock().clone();
        for region in regions {
            region.shutdown().await;
        }
        self.coordinator.shutdown().await;
    }
}
