//! Shard coordinator: the cluster-wide authority for shard ownership.
//!
//! Every assignment change is appended to the coordinator's own journal key
//! before it takes effect, so a restarted (or newly elected) coordinator
//! rebuilds the same table by replaying it. The current table is published on
//! a `watch` channel; regions cache it and only ask the coordinator on a miss.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::allocation::{AllocationStrategy, ClusterView, ShardMove};
use crate::config::RuntimeConfig;
use crate::envelope::{decode, encode};
use crate::error::ClusterError;
use crate::journal::{EventJournal, SeqNr};
use crate::membership::{Membership, MembershipEvent};
use crate::metrics::RegionMetrics;
use crate::transport::{CoordinatorClient, RegionTransport};
use crate::types::{OwnerKey, RegionAddress, ShardId};

/// Journal key holding the coordinator's assignment log. Reserved.
pub const COORDINATOR_KEY: &str = "__shardhold/coordinator";

/// Ownership state of one shard as tracked by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardState {
    Unallocated,
    Allocating,
    Allocated(RegionAddress),
    Rebalancing {
        owner: RegionAddress,
        target: RegionAddress,
    },
}

/// Where a shard lives, as published to regions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardLocation {
    Allocated(RegionAddress),
    /// In handoff: the old owner no longer serves it, the new one not yet.
    Migrating {
        from: RegionAddress,
        to: RegionAddress,
    },
}

/// Versioned shard assignment table. Every change bumps `generation`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentTable {
    pub generation: u64,
    pub shards: BTreeMap<ShardId, ShardLocation>,
}

impl AssignmentTable {
    pub fn location(&self, shard: ShardId) -> Option<&ShardLocation> {
        self.shards.get(&shard)
    }

    /// Current owner, if the shard is allocated and not migrating.
    pub fn owner(&self, shard: ShardId) -> Option<&RegionAddress> {
        match self.shards.get(&shard) {
            Some(ShardLocation::Allocated(owner)) => Some(owner),
            _ => None,
        }
    }

    /// Shards allocated to `region`.
    pub fn shards_of(&self, region: &RegionAddress) -> Vec<ShardId> {
        self.shards
            .iter()
            .filter(|(_, location)| matches!(location, ShardLocation::Allocated(r) if r == region))
            .map(|(shard, _)| *shard)
            .collect()
    }

    fn from_states(generation: u64, states: &BTreeMap<ShardId, ShardState>) -> Self {
        let shards = states
            .iter()
            .filter_map(|(shard, state)| {
                let location = match state {
                    ShardState::Allocated(owner) => ShardLocation::Allocated(owner.clone()),
                    ShardState::Rebalancing { owner, target } => ShardLocation::Migrating {
                        from: owner.clone(),
                        to: target.clone(),
                    },
                    ShardState::Unallocated | ShardState::Allocating => return None,
                };
                Some((*shard, location))
            })
            .collect();
        Self { generation, shards }
    }
}

/// One assignment change as recorded in the coordinator journal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssignmentChange {
    Allocated {
        shard: ShardId,
        region: RegionAddress,
    },
    RebalanceStarted {
        shard: ShardId,
        from: RegionAddress,
        to: RegionAddress,
    },
    /// `acknowledged` is false when the old owner never confirmed the handoff.
    Reassigned {
        shard: ShardId,
        from: RegionAddress,
        to: RegionAddress,
        acknowledged: bool,
    },
    Deallocated {
        shard: ShardId,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentEvent {
    pub generation: u64,
    pub at: DateTime<Utc>,
    pub change: AssignmentChange,
}

/// Result of moving one shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RebalanceOutcome {
    /// The old owner acknowledged the handoff.
    HandedOff {
        shard: ShardId,
        from: RegionAddress,
        to: RegionAddress,
    },
    /// The old owner did not acknowledge in time; reassigned anyway.
    FailedOpen {
        shard: ShardId,
        from: RegionAddress,
        to: RegionAddress,
    },
    /// The shard had no owner and was allocated directly.
    Allocated { shard: ShardId, to: RegionAddress },
    /// The shard already lives on the target.
    Unchanged { shard: ShardId },
}

#[derive(Serialize, Deserialize)]
struct CoordinatorSnapshot {
    generation: u64,
    shards: BTreeMap<ShardId, ShardState>,
}

#[derive(Default)]
struct CoordinatorState {
    /// Absent shards are `Unallocated`.
    shards: BTreeMap<ShardId, ShardState>,
    generation: u64,
    sequence: SeqNr,
    snapshot_sequence: SeqNr,
}

impl CoordinatorState {
    fn apply(&mut self, event: &AssignmentEvent) {
        match &event.change {
            AssignmentChange::Allocated { shard, region } => {
                self.shards.insert(*shard, ShardState::Allocated(region.clone()));
            }
            AssignmentChange::RebalanceStarted { shard, from, to } => {
                self.shards.insert(
                    *shard,
                    ShardState::Rebalancing {
                        owner: from.clone(),
                        target: to.clone(),
                    },
                );
            }
            AssignmentChange::Reassigned { shard, to, .. } => {
                self.shards.insert(*shard, ShardState::Allocated(to.clone()));
            }
            AssignmentChange::Deallocated { shard } => {
                self.shards.remove(shard);
            }
        }
        self.generation = event.generation;
    }

    fn state_of(&self, shard: ShardId) -> ShardState {
        self.shards
            .get(&shard)
            .cloned()
            .unwrap_or(ShardState::Unallocated)
    }

    fn owners(&self) -> BTreeMap<ShardId, RegionAddress> {
        self.shards
            .iter()
            .filter_map(|(shard, state)| match state {
                ShardState::Allocated(owner) => Some((*shard, owner.clone())),
                ShardState::Rebalancing { target, .. } => Some((*shard, target.clone())),
                _ => None,
            })
            .collect()
    }
}

/// Cluster-wide shard ownership authority.
pub struct ShardCoordinator {
    config: Arc<RuntimeConfig>,
    journal: Arc<dyn EventJournal>,
    strategy: Arc<dyn AllocationStrategy>,
    transport: Arc<dyn RegionTransport>,
    membership: Arc<dyn Membership>,
    metrics: Arc<RegionMetrics>,
    key: OwnerKey,
    state: Mutex<CoordinatorState>,
    table_tx: watch::Sender<AssignmentTable>,
    /// Reachable regions as last reported by membership.
    regions: parking_lot::RwLock<BTreeSet<RegionAddress>>,
    /// Shards with a migration in progress in this process.
    in_flight: parking_lot::Mutex<HashSet<ShardId>>,
    cancel: CancellationToken,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl ShardCoordinator {
    /// Rebuild the coordinator from its journal (snapshot plus later changes).
    ///
    /// A fresh journal yields an empty table. Shards left `Rebalancing` are
    /// finished by [`start`](Self::start).
    #[instrument(skip_all)]
    pub async fn recover(
        config: Arc<RuntimeConfig>,
        journal: Arc<dyn EventJournal>,
        strategy: Arc<dyn AllocationStrategy>,
        transport: Arc<dyn RegionTransport>,
        membership: Arc<dyn Membership>,
        metrics: Arc<RegionMetrics>,
    ) -> Result<Arc<Self>, ClusterError> {
        let key = OwnerKey::new(COORDINATOR_KEY);
        let state = Self::replay(journal.as_ref(), &key).await?;
        let regions: BTreeSet<RegionAddress> = membership.members().await?.into_iter().collect();

        info!(
            generation = state.generation,
            shards = state.shards.len(),
            regions = regions.len(),
            "coordinator recovered"
        );
        metrics.generation.set(state.generation as i64);
        let (table_tx, _) = watch::channel(AssignmentTable::from_states(
            state.generation,
            &state.shards,
        ));

        Ok(Arc::new(Self {
            config,
            journal,
            strategy,
            transport,
            membership,
            metrics,
            key,
            state: Mutex::new(state),
            table_tx,
            regions: parking_lot::RwLock::new(regions),
            in_flight: parking_lot::Mutex::new(HashSet::new()),
            cancel: CancellationToken::new(),
            tasks: parking_lot::Mutex::new(Vec::new()),
        }))
    }

    async fn replay(
        journal: &dyn EventJournal,
        key: &OwnerKey,
    ) -> Result<CoordinatorState, ClusterError> {
        let failure = |reason: String| ClusterError::RecoveryFailure {
            owner_key: key.clone(),
            reason,
            source: None,
        };

        let mut state = CoordinatorState::default();
        if let Some(record) = journal.load_snapshot(key).await? {
            let snapshot: CoordinatorSnapshot = decode(&record.state)
                .map_err(|e| failure(format!("undecodable coordinator snapshot: {e}")))?;
            state.generation = snapshot.generation;
            state.shards = snapshot.shards;
            state.sequence = record.sequence;
            state.snapshot_sequence = record.sequence;
        }

        let mut events = journal.read_from(key, state.sequence + 1);
        while let Some(persisted) = events.next().await {
            let persisted = persisted.map_err(|e| failure(format!("failed to read assignment log: {e}")))?;
            if persisted.sequence != state.sequence + 1 {
                return Err(failure(format!(
                    "assignment log gap: expected sequence {}, found {}",
                    state.sequence + 1,
                    persisted.sequence
                )));
            }
            let event: AssignmentEvent = decode(&persisted.payload)
                .map_err(|e| failure(format!("undecodable assignment event: {e}")))?;
            state.apply(&event);
            state.sequence = persisted.sequence;
        }
        Ok(state)
    }

    /// Start the membership listener and the periodic rebalance loop, and
    /// finish any rebalance interrupted by a previous coordinator.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();

        let coordinator = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            coordinator.resume_pending().await;
        }));

        let coordinator = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            let mut events = coordinator.membership.subscribe();
            loop {
                tokio::select! {
                    _ = coordinator.cancel.cancelled() => break,
                    event = events.next() => {
                        let Some(event) = event else { break };
                        coordinator.on_membership_event(event).await;
                    }
                }
            }
        }));

        let coordinator = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(coordinator.config.rebalance_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = coordinator.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = coordinator.rebalance().await {
                            warn!(error = %e, "rebalance round failed");
                        }
                    }
                }
            }
        }));
    }

    /// Stop background tasks. In-progress migrations are left for the next
    /// coordinator to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
            let _ = task.await;
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<AssignmentTable> {
        self.table_tx.subscribe()
    }

    pub fn table(&self) -> AssignmentTable {
        self.table_tx.borrow().clone()
    }

    pub fn lookup(&self, shard: ShardId) -> Option<ShardLocation> {
        self.table_tx.borrow().location(shard).cloned()
    }

    pub async fn shard_state(&self, shard: ShardId) -> ShardState {
        self.state.lock().await.state_of(shard)
    }

    /// Reachable regions as currently known.
    pub fn regions(&self) -> Vec<RegionAddress> {
        self.regions.read().iter().cloned().collect()
    }

    /// All recorded assignment changes, oldest first.
    pub async fn history(&self) -> Result<Vec<AssignmentEvent>, ClusterError> {
        self.journal
            .read_from(&self.key, 1)
            .and_then(|persisted| async move { decode::<AssignmentEvent>(&persisted.payload) })
            .try_collect()
            .await
    }

    fn view(&self, state: &CoordinatorState) -> ClusterView {
        ClusterView {
            regions: self.regions.read().clone(),
            owners: state.owners(),
        }
    }

    /// Append a change, then apply and publish it.
    async fn persist(
        &self,
        state: &mut CoordinatorState,
        change: AssignmentChange,
    ) -> Result<AssignmentEvent, ClusterError> {
        let event = AssignmentEvent {
            generation: state.generation + 1,
            at: Utc::now(),
            change,
        };
        let sequence = state.sequence + 1;
        self.journal
            .append(&self.key, sequence, encode(&event)?)
            .await?;
        state.apply(&event);
        state.sequence = sequence;
        debug!(generation = event.generation, change = ?event.change, "assignment change recorded");

        let every = self.config.snapshot_every;
        if every > 0 && state.sequence - state.snapshot_sequence >= every {
            let snapshot = CoordinatorSnapshot {
                generation: state.generation,
                shards: state.shards.clone(),
            };
            match encode(&snapshot) {
                Ok(bytes) => match self.journal.save_snapshot(&self.key, sequence, bytes).await {
                    Ok(()) => state.snapshot_sequence = sequence,
                    Err(e) => warn!(error = %e, "coordinator snapshot failed"),
                },
                Err(e) => warn!(error = %e, "failed to encode coordinator snapshot"),
            }
        }

        self.metrics.generation.set(state.generation as i64);
        self.table_tx
            .send_replace(AssignmentTable::from_states(state.generation, &state.shards));
        Ok(event)
    }

    /// Owner of `shard`, allocating it through the strategy if it has none.
    #[instrument(skip(self), fields(shard_id = %shard, requester = %requester))]
    pub async fn allocate(
        &self,
        shard: ShardId,
        requester: &RegionAddress,
    ) -> Result<RegionAddress, ClusterError> {
        let mut state = self.state.lock().await;
        match state.state_of(shard) {
            ShardState::Allocated(owner) => return Ok(owner),
            ShardState::Rebalancing { .. } | ShardState::Allocating => {
                return Err(ClusterError::ShardMigrating { shard_id: shard })
            }
            ShardState::Unallocated => {}
        }

        let view = self.view(&state);
        let region = self
            .strategy
            .allocate(shard, requester, &view)
            .ok_or(ClusterError::NoRegionsAvailable { shard_id: shard })?;

        state.shards.insert(shard, ShardState::Allocating);
        let change = AssignmentChange::Allocated {
            shard,
            region: region.clone(),
        };
        if let Err(e) = self.persist(&mut state, change).await {
            state.shards.remove(&shard);
            return Err(e);
        }
        info!(shard_id = %shard, region = %region, "shard allocated");
        Ok(region)
    }

    /// Move `shard` from `from` to `to`.
    ///
    /// With `graceful`, the old owner is asked to hand off first; if it does
    /// not acknowledge within `handoff_timeout` the shard is reassigned
    /// anyway. Without it (the owner is known dead) the shard is reassigned
    /// directly.
    #[instrument(skip(self), fields(shard_id = %shard, from = %from, to = %to))]
    async fn migrate(
        &self,
        shard: ShardId,
        from: RegionAddress,
        to: RegionAddress,
        graceful: bool,
    ) -> Result<RebalanceOutcome, ClusterError> {
        if !self.in_flight.lock().insert(shard) {
            return Err(ClusterError::ShardMigrating { shard_id: shard });
        }
        let result = self.migrate_inner(shard, from, to, graceful).await;
        self.in_flight.lock().remove(&shard);
        result
    }

    async fn migrate_inner(
        &self,
        shard: ShardId,
        from: RegionAddress,
        to: RegionAddress,
        graceful: bool,
    ) -> Result<RebalanceOutcome, ClusterError> {
        {
            let mut state = self.state.lock().await;
            match state.state_of(shard) {
                ShardState::Allocated(owner) if owner == from => {}
                ShardState::Rebalancing { owner, .. } if owner == from => {}
                ShardState::Allocated(owner) if owner == to => {
                    return Ok(RebalanceOutcome::Unchanged { shard })
                }
                ShardState::Unallocated => {
                    return self.allocate_to(&mut state, shard, to).await;
                }
                _ => return Err(ClusterError::ShardMigrating { shard_id: shard }),
            }
            if graceful && !matches!(state.state_of(shard), ShardState::Rebalancing { .. }) {
                let change = AssignmentChange::RebalanceStarted {
                    shard,
                    from: from.clone(),
                    to: to.clone(),
                };
                self.persist(&mut state, change).await?;
            }
        }

        let acknowledged = graceful && self.request_handoff(shard, &from).await;

        let mut state = self.state.lock().await;
        // The target may have gone away while the old owner was draining.
        let to = if self.regions.read().contains(&to) {
            to
        } else {
            let view = self.view(&state);
            self.strategy
                .allocate(shard, &from, &view)
                .filter(|region| *region != from)
                .ok_or(ClusterError::NoRegionsAvailable { shard_id: shard })?
        };
        let change = AssignmentChange::Reassigned {
            shard,
            from: from.clone(),
            to: to.clone(),
            acknowledged,
        };
        self.persist(&mut state, change).await?;
        self.metrics.rebalanced_shards.inc();

        if acknowledged {
            info!(shard_id = %shard, from = %from, to = %to, "shard handed off");
            Ok(RebalanceOutcome::HandedOff { shard, from, to })
        } else {
            warn!(
                shard_id = %shard,
                from = %from,
                to = %to,
                "shard reassigned without handoff acknowledgement; unflushed state on the old owner is lost"
            );
            self.metrics.fail_open_handoffs.inc();
            Ok(RebalanceOutcome::FailedOpen { shard, from, to })
        }
    }

    async fn allocate_to(
        &self,
        state: &mut CoordinatorState,
        shard: ShardId,
        to: RegionAddress,
    ) -> Result<RebalanceOutcome, ClusterError> {
        let change = AssignmentChange::Allocated {
            shard,
            region: to.clone(),
        };
        self.persist(state, change).await?;
        Ok(RebalanceOutcome::Allocated { shard, to })
    }

    /// Whether the owner acknowledged the handoff within the timeout.
    async fn request_handoff(&self, shard: ShardId, owner: &RegionAddress) -> bool {
        let timeout = self.config.handoff_timeout;
        match tokio::time::timeout(timeout, self.transport.handoff(owner, shard)).await {
            Ok(Ok(stopped)) => {
                debug!(shard_id = %shard, owner = %owner, entities = stopped, "handoff acknowledged");
                true
            }
            Ok(Err(e)) => {
                let err = ClusterError::HandoffTimeout {
                    shard_id: shard,
                    owner: owner.clone(),
                };
                warn!(error = %err, cause = %e, "handoff failed");
                false
            }
            Err(_) => {
                let err = ClusterError::HandoffTimeout {
                    shard_id: shard,
                    owner: owner.clone(),
                };
                warn!(error = %err, timeout_ms = timeout.as_millis() as u64, "no handoff acknowledgement");
                false
            }
        }
    }

    /// Operator command: move `shard` to `target`.
    pub async fn move_shard(
        &self,
        shard: ShardId,
        target: RegionAddress,
    ) -> Result<RebalanceOutcome, ClusterError> {
        if !self.regions.read().contains(&target) {
            return Err(ClusterError::RegionUnavailable {
                address: target,
                source: None,
            });
        }
        let current = self.state.lock().await.state_of(shard);
        match current {
            ShardState::Allocated(owner) if owner == target => {
                Ok(RebalanceOutcome::Unchanged { shard })
            }
            ShardState::Allocated(owner) => self.migrate(shard, owner, target, true).await,
            ShardState::Unallocated => {
                let mut state = self.state.lock().await;
                if state.state_of(shard) != ShardState::Unallocated {
                    return Err(ClusterError::ShardMigrating { shard_id: shard });
                }
                self.allocate_to(&mut state, shard, target).await
            }
            ShardState::Allocating | ShardState::Rebalancing { .. } => {
                Err(ClusterError::ShardMigrating { shard_id: shard })
            }
        }
    }

    /// One rebalance round: finish interrupted migrations, move shards off
    /// regions that are no longer members, then apply the strategy's moves.
    #[instrument(skip(self))]
    pub async fn rebalance(&self) -> Result<Vec<RebalanceOutcome>, ClusterError> {
        let mut outcomes = self.resume_pending().await;

        let moves = {
            let state = self.state.lock().await;
            let mut view = self.view(&state);
            if view.regions.is_empty() {
                return Ok(outcomes);
            }
            let mut moves = Vec::new();
            let orphaned: Vec<(ShardId, RegionAddress)> = view
                .owners
                .iter()
                .filter(|(shard, owner)| {
                    !view.regions.contains(*owner)
                        && matches!(state.state_of(**shard), ShardState::Allocated(_))
                })
                .map(|(shard, owner)| (*shard, owner.clone()))
                .collect();
            for (shard, owner) in orphaned {
                if let Some(to) = self.strategy.allocate(shard, &owner, &view) {
                    view.owners.insert(shard, to.clone());
                    moves.push(ShardMove {
                        shard,
                        from: owner,
                        to,
                    });
                }
            }
            if moves.is_empty() {
                moves = self.strategy.rebalance(&view);
            }
            moves.truncate(self.config.max_simultaneous_rebalance.max(1));
            moves
        };

        outcomes.extend(self.run_moves(moves, true).await);
        Ok(outcomes)
    }

    async fn run_moves(&self, moves: Vec<ShardMove>, graceful: bool) -> Vec<RebalanceOutcome> {
        let results = futures::future::join_all(
            moves
                .into_iter()
                .map(|m| self.migrate(m.shard, m.from, m.to, graceful)),
        )
        .await;
        results
            .into_iter()
            .filter_map(|result| match result {
                Ok(outcome) => Some(outcome),
                Err(e) => {
                    warn!(error = %e, "shard move failed");
                    None
                }
            })
            .collect()
    }

    /// Finish migrations recorded as started but never completed.
    async fn resume_pending(&self) -> Vec<RebalanceOutcome> {
        let pending: Vec<ShardMove> = {
            let state = self.state.lock().await;
            let in_flight = self.in_flight.lock();
            state
                .shards
                .iter()
                .filter(|(shard, _)| !in_flight.contains(*shard))
                .filter_map(|(shard, s)| match s {
                    ShardState::Rebalancing { owner, target } => Some(ShardMove {
                        shard: *shard,
                        from: owner.clone(),
                        to: target.clone(),
                    }),
                    _ => None,
                })
                .collect()
        };
        if !pending.is_empty() {
            info!(count = pending.len(), "resuming interrupted rebalances");
        }
        self.run_moves(pending, true).await
    }

    /// Move every shard off `region`, with or without a handoff attempt.
    async fn evacuate(&self, region: &RegionAddress, graceful: bool) -> Vec<RebalanceOutcome> {
        let mut moves = Vec::new();
        let mut orphaned = Vec::new();
        {
            let state = self.state.lock().await;
            let mut view = self.view(&state);
            view.regions.remove(region);
            let owned: Vec<ShardId> = state
                .shards
                .iter()
                .filter(|(_, s)| matches!(s, ShardState::Allocated(owner) if owner == region))
                .map(|(shard, _)| *shard)
                .collect();
            for shard in owned {
                match self.strategy.allocate(shard, region, &view) {
                    Some(to) => {
                        view.owners.insert(shard, to.clone());
                        moves.push(ShardMove {
                            shard,
                            from: region.clone(),
                            to,
                        });
                    }
                    None => orphaned.push(shard),
                }
            }
        }

        if !orphaned.is_empty() {
            let mut state = self.state.lock().await;
            for shard in orphaned {
                if let Err(e) = self
                    .persist(&mut state, AssignmentChange::Deallocated { shard })
                    .await
                {
                    warn!(shard_id = %shard, error = %e, "failed to deallocate shard");
                }
            }
        }
        self.run_moves(moves, graceful).await
    }

    #[instrument(skip(self))]
    async fn on_membership_event(&self, event: MembershipEvent) {
        debug!(?event, "membership event");
        match event {
            MembershipEvent::Down(region) => {
                self.regions.write().remove(&region);
                let outcomes = self.evacuate(&region, false).await;
                info!(region = %region, moved = outcomes.len(), "region down; shards reassigned");
            }
            MembershipEvent::Unreachable(region) => {
                self.regions.write().remove(&region);
                let outcomes = self.evacuate(&region, true).await;
                info!(region = %region, moved = outcomes.len(), "region unreachable; shards moved");
            }
            MembershipEvent::Up(region) | MembershipEvent::Reachable(region) => {
                self.regions.write().insert(region);
                if let Err(e) = self.rebalance().await {
                    warn!(error = %e, "rebalance after membership change failed");
                }
            }
        }
    }
}

#[async_trait]
impl CoordinatorClient for ShardCoordinator {
    async fn allocate(
        &self,
        shard: ShardId,
        requester: &RegionAddress,
    ) -> Result<RegionAddress, ClusterError> {
        ShardCoordinator::allocate(self, shard, requester).await
    }

    async fn lookup(&self, shard: ShardId) -> Result<Option<ShardLocation>, ClusterError> {
        Ok(ShardCoordinator::lookup(self, shard))
    }

    async fn table(&self) -> Result<AssignmentTable, ClusterError> {
        Ok(ShardCoordinator::table(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::LeastShardsStrategy;
    use crate::storage::memory_journal::MemoryJournal;
    use crate::storage::memory_membership::MemoryMembership;
    use crate::transport::local::LocalTransport;
    use std::time::Duration;

    fn addr(port: u16) -> RegionAddress {
        RegionAddress::new("node", port)
    }

    fn config() -> Arc<RuntimeConfig> {
        Arc::new(RuntimeConfig {
            num_shards: 8,
            snapshot_every: 3,
            handoff_timeout: Duration::from_millis(200),
            ..Default::default()
        })
    }

    struct Fixture {
        journal: Arc<MemoryJournal>,
        membership: Arc<MemoryMembership>,
        transport: Arc<LocalTransport>,
    }

    impl Fixture {
        fn new(regions: &[u16]) -> Self {
            Self {
                journal: Arc::new(MemoryJournal::new()),
                membership: Arc::new(MemoryMembership::with_members(
                    regions.iter().map(|p| addr(*p)),
                )),
                transport: Arc::new(LocalTransport::new()),
            }
        }

        async fn coordinator(&self) -> Arc<ShardCoordinator> {
            ShardCoordinator::recover(
                config(),
                self.journal.clone(),
                Arc::new(LeastShardsStrategy::new(1, 3)),
                self.transport.clone(),
                self.membership.clone(),
                Arc::new(RegionMetrics::unregistered()),
            )
            .await
            .unwrap()
        }
    }

    #[tokio::test]
    async fn allocate_is_sticky_and_bumps_generation() {
        let fx = Fixture::new(&[1, 2]);
        let coordinator = fx.coordinator().await;
        let rx = coordinator.subscribe();

        let owner = coordinator.allocate(ShardId::new(3), &addr(2)).await.unwrap();
        assert_eq!(owner, addr(2));
        assert_eq!(
            coordinator.allocate(ShardId::new(3), &addr(1)).await.unwrap(),
            addr(2)
        );
        assert_eq!(rx.borrow().generation, 1);
        assert_eq!(rx.borrow().owner(ShardId::new(3)), Some(&addr(2)));
        assert_eq!(
            coordinator.shard_state(ShardId::new(3)).await,
            ShardState::Allocated(addr(2))
        );
        assert_eq!(
            coordinator.shard_state(ShardId::new(4)).await,
            ShardState::Unallocated
        );
    }

    #[tokio::test]
    async fn allocate_without_regions_fails() {
        let fx = Fixture::new(&[]);
        let coordinator = fx.coordinator().await;
        let err = coordinator
            .allocate(ShardId::new(0), &addr(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::NoRegionsAvailable { .. }));
        assert_eq!(coordinator.table().generation, 0);
    }

    #[tokio::test]
    async fn failed_append_does_not_allocate() {
        let fx = Fixture::new(&[1]);
        let coordinator = fx.coordinator().await;
        fx.journal.fail_next_appends(1);
        assert!(coordinator.allocate(ShardId::new(0), &addr(1)).await.is_err());
        assert_eq!(
            coordinator.shard_state(ShardId::new(0)).await,
            ShardState::Unallocated
        );
        assert!(coordinator.allocate(ShardId::new(0), &addr(1)).await.is_ok());
    }

    #[tokio::test]
    async fn recovery_replays_snapshot_and_log() {
        let fx = Fixture::new(&[1, 2]);
        let coordinator = fx.coordinator().await;
        for shard in 0..5 {
            coordinator
                .allocate(ShardId::new(shard), &addr(1))
                .await
                .unwrap();
        }
        let before = coordinator.table();
        assert!(fx.journal.snapshot(&OwnerKey::new(COORDINATOR_KEY)).is_some());

        let recovered = fx.coordinator().await;
        assert_eq!(recovered.table(), before);
        assert_eq!(recovered.history().await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn unacknowledged_move_fails_open() {
        let fx = Fixture::new(&[1, 2]);
        let coordinator = fx.coordinator().await;
        coordinator.allocate(ShardId::new(7), &addr(1)).await.unwrap();

        // Nothing is registered on the transport, so the handoff request fails.
        let outcome = coordinator.move_shard(ShardId::new(7), addr(2)).await.unwrap();
        assert_eq!(
            outcome,
            RebalanceOutcome::FailedOpen {
                shard: ShardId::new(7),
                from: addr(1),
                to: addr(2),
            }
        );
        assert_eq!(coordinator.table().owner(ShardId::new(7)), Some(&addr(2)));

        let history = coordinator.history().await.unwrap();
        assert!(matches!(
            history.last().map(|e| &e.change),
            Some(AssignmentChange::Reassigned { acknowledged: false, .. })
        ));
        assert_eq!(
            coordinator.move_shard(ShardId::new(7), addr(2)).await.unwrap(),
            RebalanceOutcome::Unchanged {
                shard: ShardId::new(7)
            }
        );
    }

    #[tokio::test]
    async fn interrupted_rebalance_is_resumed_after_recovery() {
        let fx = Fixture::new(&[1, 2]);
        let coordinator = fx.coordinator().await;
        coordinator.allocate(ShardId::new(1), &addr(1)).await.unwrap();
        {
            let mut state = coordinator.state.lock().await;
            coordinator
                .persist(
                    &mut state,
                    AssignmentChange::RebalanceStarted {
                        shard: ShardId::new(1),
                        from: addr(1),
                        to: addr(2),
                    },
                )
                .await
                .unwrap();
        }
        assert!(matches!(
            coordinator.lookup(ShardId::new(1)),
            Some(ShardLocation::Migrating { .. })
        ));

        let recovered = fx.coordinator().await;
        assert!(matches!(
            recovered.shard_state(ShardId::new(1)).await,
            ShardState::Rebalancing { .. }
        ));
        let outcomes = recovered.rebalance().await.unwrap();
        assert!(outcomes.contains(&RebalanceOutcome::FailedOpen {
            shard: ShardId::new(1),
            from: addr(1),
            to: addr(2),
        }));
        assert_eq!(recovered.table().owner(ShardId::new(1)), Some(&addr(2)));
    }

    #[tokio::test]
    async fn rebalance_evens_out_load() {
        let fx = Fixture::new(&[1]);
        let coordinator = fx.coordinator().await;
        for shard in 0..4 {
            coordinator
                .allocate(ShardId::new(shard), &addr(1))
                .await
                .unwrap();
        }
        fx.membership.join(addr(2));
        coordinator.on_membership_event(MembershipEvent::Up(addr(2))).await;

        let table = coordinator.table();
        assert_eq!(table.shards_of(&addr(1)).len(), 2);
        assert_eq!(table.shards_of(&addr(2)).len(), 2);
    }

    #[tokio::test]
    async fn down_region_is_evacuated_without_handoff() {
        let fx = Fixture::new(&[1, 2]);
        let coordinator = fx.coordinator().await;
        coordinator.allocate(ShardId::new(0), &addr(1)).await.unwrap();
        coordinator.allocate(ShardId::new(1), &addr(2)).await.unwrap();

        coordinator.on_membership_event(MembershipEvent::Down(addr(1))).await;
        let table = coordinator.table();
        assert_eq!(table.owner(ShardId::new(0)), Some(&addr(2)));
        assert!(table.shards_of(&addr(1)).is_empty());

        let history = coordinator.history().await.unwrap();
        assert!(!history
            .iter()
            .any(|e| matches!(e.change, AssignmentChange::RebalanceStarted { .. })));
    }

    #[tokio::test]
    async fn last_region_down_deallocates() {
        let fx = Fixture::new(&[1]);
        let coordinator = fx.coordinator().await;
        coordinator.allocate(ShardId::new(0), &addr(1)).await.unwrap();
        coordinator.on_membership_event(MembershipEvent::Down(addr(1))).await;
        assert_eq!(
            coordinator.shard_state(ShardId::new(0)).await,
            ShardState::Unallocated
        );
    }
}
