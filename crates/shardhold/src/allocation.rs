//! Pluggable shard placement policies.
//!
//! Strategies are pure functions of the [`ClusterView`]: the same view always
//! yields the same decision, which keeps the coordinator from oscillating.

use std::collections::{BTreeMap, BTreeSet};
use std::hash::{Hash, Hasher};

use hashring::HashRing;

use crate::types::{RegionAddress, ShardId};

/// What a strategy sees: reachable regions and the current owner of every
/// allocated shard.
#[derive(Debug, Clone, Default)]
pub struct ClusterView {
    pub regions: BTreeSet<RegionAddress>,
    pub owners: BTreeMap<ShardId, RegionAddress>,
}

impl ClusterView {
    /// Shards per reachable region, including regions that own nothing.
    pub fn load(&self) -> BTreeMap<RegionAddress, Vec<ShardId>> {
        let mut load: BTreeMap<RegionAddress, Vec<ShardId>> = self
            .regions
            .iter()
            .map(|region| (region.clone(), Vec::new()))
            .collect();
        for (shard, owner) in &self.owners {
            if let Some(shards) = load.get_mut(owner) {
                shards.push(*shard);
            }
        }
        load
    }
}

/// One shard relocation decided by a rebalance round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardMove {
    pub shard: ShardId,
    pub from: RegionAddress,
    pub to: RegionAddress,
}

pub trait AllocationStrategy: Send + Sync {
    /// Pick the owner of an unallocated shard. `None` when no region is available.
    fn allocate(
        &self,
        shard: ShardId,
        requester: &RegionAddress,
        view: &ClusterView,
    ) -> Option<RegionAddress>;

    /// Moves that reduce skew. Only shards owned by reachable regions are considered.
    fn rebalance(&self, view: &ClusterView) -> Vec<ShardMove>;
}

/// Allocates to the region owning the fewest shards.
///
/// Ties go to the requester, then to the lowest address.
pub struct LeastShardsStrategy {
    /// Tolerated difference between the most and least loaded regions.
    pub threshold: usize,
    /// Maximum moves per rebalance round.
    pub max_moves: usize,
}

impl LeastShardsStrategy {
    pub fn new(threshold: usize, max_moves: usize) -> Self {
        Self {
            threshold,
            max_moves,
        }
    }
}

impl AllocationStrategy for LeastShardsStrategy {
    fn allocate(
        &self,
        _shard: ShardId,
        requester: &RegionAddress,
        view: &ClusterView,
    ) -> Option<RegionAddress> {
        let load = view.load();
        let min = load.values().map(Vec::len).min()?;
        if load.get(requester).is_some_and(|shards| shards.len() == min) {
            return Some(requester.clone());
        }
        load.into_iter()
            .find(|(_, shards)| shards.len() == min)
            .map(|(region, _)| region)
    }

    fn rebalance(&self, view: &ClusterView) -> Vec<ShardMove> {
        let mut load = view.load();
        let mut moves = Vec::new();
        while moves.len() < self.max_moves {
            // Most loaded: highest count, lowest address on ties. Least loaded likewise.
            let Some((most, most_count)) = load
                .iter()
                .map(|(r, s)| (r.clone(), s.len()))
                .fold(None, |best: Option<(RegionAddress, usize)>, (r, n)| match best {
                    Some((_, bn)) if bn >= n => best,
                    _ => Some((r, n)),
                })
            else {
                break;
            };
            let Some((least, least_count)) = load
                .iter()
                .map(|(r, s)| (r.clone(), s.len()))
                .fold(None, |best: Option<(RegionAddress, usize)>, (r, n)| match best {
                    Some((_, bn)) if bn <= n => best,
                    _ => Some((r, n)),
                })
            else {
                break;
            };
            if most_count - least_count <= self.threshold.max(1) {
                break;
            }
            let Some(shard) = load.get_mut(&most).and_then(|shards| shards.pop()) else {
                break;
            };
            if let Some(shards) = load.get_mut(&least) {
                shards.push(shard);
                shards.sort();
            }
            moves.push(ShardMove {
                shard,
                from: most,
                to: least,
            });
        }
        moves
    }
}

/// Hash-ring node: one virtual replica of a region.
#[derive(Debug, Clone, Eq, PartialEq)]
struct RegionNode {
    address: RegionAddress,
    replica: u32,
}

impl Hash for RegionNode {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.host.hash(state);
        self.address.port.hash(state);
        self.replica.hash(state);
    }
}

/// Places shards on a consistent-hash ring of the reachable regions.
///
/// Adding or removing a region only moves the shards whose ring owner changes.
pub struct ConsistentHashStrategy {
    vnodes: u32,
    max_moves: usize,
}

impl ConsistentHashStrategy {
    /// Consistent hashing needs ~100 virtual nodes per region for an even spread.
    pub const DEFAULT_VNODES: u32 = 100;

    pub fn new(max_moves: usize) -> Self {
        Self {
            vnodes: Self::DEFAULT_VNODES,
            max_moves,
        }
    }

    pub fn with_vnodes(mut self, vnodes: u32) -> Self {
        self.vnodes = vnodes.max(1);
        self
    }

    fn ring(&self, view: &ClusterView) -> HashRing<RegionNode> {
        let mut ring = HashRing::new();
        for region in &view.regions {
            for replica in 0..self.vnodes {
                ring.add(RegionNode {
                    address: region.clone(),
                    replica,
                });
            }
        }
        ring
    }

    fn ring_owner(ring: &HashRing<RegionNode>, shard: ShardId) -> Option<RegionAddress> {
        ring.get(&format!("shard-{}", shard.value()))
            .map(|node| node.address.clone())
    }
}

impl AllocationStrategy for ConsistentHashStrategy {
    fn allocate(
        &self,
        shard: ShardId,
        _requester: &RegionAddress,
        view: &ClusterView,
    ) -> Option<RegionAddress> {
        Self::ring_owner(&self.ring(view), shard)
    }

    fn rebalance(&self, view: &ClusterView) -> Vec<ShardMove> {
        let ring = self.ring(view);
        view.owners
            .iter()
            .filter(|(_, owner)| view.regions.contains(*owner))
            .filter_map(|(shard, owner)| {
                let target = Self::ring_owner(&ring, *shard)?;
                (target != *owner).then(|| ShardMove {
                    shard: *shard,
                    from: owner.clone(),
                    to: target,
                })
            })
            .take(self.max_moves)
            .collect()
    }
}
