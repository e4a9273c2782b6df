//! Cluster membership as consumed by the coordinator and regions.
//!
//! Membership itself (gossip, consensus, service discovery) lives outside
//! this crate; it is seen here only as a current member list plus a stream
//! of change notifications.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ClusterError;
use crate::storage::memory_membership::MemoryMembership;
use crate::transport::RegionTransport;
use crate::types::RegionAddress;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MembershipEvent {
    /// Region joined the cluster.
    Up(RegionAddress),
    /// Region left or was declared dead.
    Down(RegionAddress),
    /// Region stopped answering but has not left.
    Unreachable(RegionAddress),
    /// Previously unreachable region answers again.
    Reachable(RegionAddress),
}

impl MembershipEvent {
    pub fn region(&self) -> &RegionAddress {
        match self {
            MembershipEvent::Up(r)
            | MembershipEvent::Down(r)
            | MembershipEvent::Unreachable(r)
            | MembershipEvent::Reachable(r) => r,
        }
    }
}

pub type MembershipStream = Pin<Box<dyn Stream<Item = MembershipEvent> + Send>>;

/// Source of membership information.
#[async_trait]
pub trait Membership: Send + Sync {
    /// Regions currently up and reachable.
    async fn members(&self) -> Result<Vec<RegionAddress>, ClusterError>;

    /// Subscribe to membership changes from now on.
    fn subscribe(&self) -> MembershipStream;
}

/// Ping-based failure detector.
///
/// Pings every known region each `interval`. A region failing `threshold`
/// consecutive pings is marked unreachable; one successful ping marks it
/// reachable again. A ping not answered within `ping_timeout` (the interval
/// unless set) counts as a failure.
pub struct HealthMonitor {
    transport: Arc<dyn RegionTransport>,
    membership: Arc<MemoryMembership>,
    interval: Duration,
    ping_timeout: Duration,
    threshold: u32,
    failures: parking_lot::Mutex<HashMap<RegionAddress, u32>>,
}

impl HealthMonitor {
    pub fn new(
        transport: Arc<dyn RegionTransport>,
        membership: Arc<MemoryMembership>,
        interval: Duration,
        threshold: u32,
    ) -> Self {
        Self {
            transport,
            membership,
            interval,
            ping_timeout: interval,
            threshold: threshold.max(1),
            failures: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    pub fn with_ping_timeout(mut self, ping_timeout: Duration) -> Self {
        self.ping_timeout = ping_timeout;
        self
    }

    /// Run until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {
                    self.check_all().await;
                }
            }
        }
    }

    /// One round of pings, sent to every region at once.
    pub async fn check_all(&self) {
        let pings = self.membership.known().into_iter().map(|region| async move {
            let healthy = match tokio::time::timeout(self.ping_timeout, self.transport.ping(&region)).await {
                Ok(result) => result.is_ok(),
                Err(_) => {
                    debug!(region = %region, timeout_ms = self.ping_timeout.as_millis() as u64, "health ping timed out");
                    false
                }
            };
            (region, healthy)
        });
        for (region, healthy) in futures::future::join_all(pings).await {
            self.record(&region, healthy);
        }
    }

    fn record(&self, region: &RegionAddress, healthy: bool) {
        let mut failures = self.failures.lock();
        if healthy {
            let was_failing = failures.remove(region).unwrap_or(0) >= self.threshold;
            if was_failing || self.membership.is_unreachable(region) {
                info!(region = %region, "region reachable again");
                self.membership.mark_reachable(region);
            }
            return;
        }
        let count = failures.entry(region.clone()).or_insert(0);
        *count += 1;
        debug!(region = %region, failures = *count, "health ping failed");
        if *count == self.threshold {
            warn!(region = %region, "region unreachable after {} failed pings", self.threshold);
            self.membership.mark_unreachable(region);
        }
    }
}
