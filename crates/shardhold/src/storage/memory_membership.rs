use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;

use crate::error::ClusterError;
use crate::membership::{Membership, MembershipEvent, MembershipStream};
use crate::types::RegionAddress;

/// Push-driven membership source.
///
/// Suitable for tests and for static seed lists combined with a
/// [`HealthMonitor`](crate::membership::HealthMonitor).
pub struct MemoryMembership {
    inner: Mutex<Inner>,
}

struct Inner {
    /// Known regions and whether they are currently reachable.
    regions: BTreeMap<RegionAddress, bool>,
    watchers: Vec<UnboundedSender<MembershipEvent>>,
}

impl MemoryMembership {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                regions: BTreeMap::new(),
                watchers: Vec::new(),
            }),
        }
    }

    /// Membership seeded with regions that are all up. No events are emitted for them.
    pub fn with_members(regions: impl IntoIterator<Item = RegionAddress>) -> Self {
        let membership = Self::new();
        {
            let mut inner = membership.inner.lock();
            for region in regions {
                inner.regions.insert(region, true);
            }
        }
        membership
    }

    fn emit(inner: &mut Inner, event: MembershipEvent) {
        inner.watchers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn join(&self, region: RegionAddress) {
        let mut inner = self.inner.lock();
        if inner.regions.insert(region.clone(), true) != Some(true) {
            Self::emit(&mut inner, MembershipEvent::Up(region));
        }
    }

    pub fn leave(&self, region: &RegionAddress) {
        let mut inner = self.inner.lock();
        if inner.regions.remove(region).is_some() {
            Self::emit(&mut inner, MembershipEvent::Down(region.clone()));
        }
    }

    pub fn mark_unreachable(&self, region: &RegionAddress) {
        let mut inner = self.inner.lock();
        if let Some(reachable) = inner.regions.get_mut(region) {
            if *reachable {
                *reachable = false;
                Self::emit(&mut inner, MembershipEvent::Unreachable(region.clone()));
            }
        }
    }

    pub fn mark_reachable(&self, region: &RegionAddress) {
        let mut inner = self.inner.lock();
        if let Some(reachable) = inner.regions.get_mut(region) {
            if !*reachable {
                *reachable = true;
                Self::emit(&mut inner, MembershipEvent::Reachable(region.clone()));
            }
        }
    }

    pub fn is_unreachable(&self, region: &RegionAddress) -> bool {
        self.inner.lock().regions.get(region) == Some(&false)
    }

    /// All known regions, reachable or not.
    pub fn known(&self) -> Vec<RegionAddress> {
        self.inner.lock().regions.keys().cloned().collect()
    }
}

impl Default for MemoryMembership {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Membership for MemoryMembership {
    async fn members(&self) -> Result<Vec<RegionAddress>, ClusterError> {
        Ok(self
            .inner
            .lock()
            .regions
            .iter()
            .filter(|(_, reachable)| **reachable)
            .map(|(region, _)| region.clone())
            .collect())
    }

    fn subscribe(&self) -> MembershipStream {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        self.inner.lock().watchers.push(tx);
        Box::pin(tokio_stream::wrappers::UnboundedReceiverStream::new(rx))
    }
}
