//! Shard region: the per-node front door for routing.
//!
//! A region resolves an owner key to its shard, serves the shards the
//! coordinator assigned to it, and forwards everything else to the owning
//! region in one hop. The assignment table is cached locally and refreshed
//! from the coordinator's updates; the coordinator is only asked directly
//! on a miss or after a staleness signal.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::RuntimeConfig;
use crate::coordinator::{AssignmentTable, ShardLocation};
use crate::entity::{Behavior, EntityStatus, HandlerTable};
use crate::envelope::{decode, Command, CommandEnvelope, InboundCommand};
use crate::error::ClusterError;
use crate::hash::shard_for_key;
use crate::journal::EventJournal;
use crate::membership::{Membership, MembershipEvent};
use crate::metrics::RegionMetrics;
use crate::reaper::{EntityReaper, IdleSweep};
use crate::reply::Reply;
use crate::request_id::{RequestId, RequestIdGenerator};
use crate::shard::Shard;
use crate::transport::{CoordinatorClient, RegionEndpoint, RegionTransport};
use crate::types::{OwnerKey, RegionAddress, ShardId};

/// How a region learns about new assignment tables.
pub enum AssignmentFeed {
    /// Subscribe to an in-process coordinator.
    Watch(watch::Receiver<AssignmentTable>),
    /// Fetch the table every `assignment_poll_interval`.
    Poll,
}

#[derive(Default)]
struct RouteCache {
    generation: u64,
    locations: BTreeMap<ShardId, ShardLocation>,
}

/// Per-node router and host for the shards assigned to this node.
pub struct ShardRegion<B: Behavior> {
    address: RegionAddress,
    config: Arc<RuntimeConfig>,
    behavior: Arc<B>,
    handlers: Arc<HandlerTable<B::State, B::Event>>,
    journal: Arc<dyn EventJournal>,
    coordinator: Arc<dyn CoordinatorClient>,
    transport: Arc<dyn RegionTransport>,
    metrics: Arc<RegionMetrics>,
    ids: RequestIdGenerator,
    shards: DashMap<ShardId, Arc<Shard<B>>>,
    routes: parking_lot::RwLock<RouteCache>,
    /// Shards this region handed off, with the table generation at the time.
    /// They are only served again once the coordinator assigns them back.
    handed_off: DashMap<ShardId, u64>,
    closing: AtomicBool,
    cancel: CancellationToken,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl<B: Behavior> ShardRegion<B> {
    pub fn new(
        config: Arc<RuntimeConfig>,
        behavior: B,
        journal: Arc<dyn EventJournal>,
        coordinator: Arc<dyn CoordinatorClient>,
        transport: Arc<dyn RegionTransport>,
        metrics: Arc<RegionMetrics>,
    ) -> Result<Arc<Self>, ClusterError> {
        config.validate()?;
        let handlers = Arc::new(behavior.handlers());
        let address = config.region_address.clone();
        Ok(Arc::new(Self {
            ids: RequestIdGenerator::for_node(&address.to_string()),
            address,
            config,
            behavior: Arc::new(behavior),
            handlers,
            journal,
            coordinator,
            transport,
            metrics,
            shards: DashMap::new(),
            routes: parking_lot::RwLock::new(RouteCache::default()),
            handed_off: DashMap::new(),
            closing: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            tasks: parking_lot::Mutex::new(Vec::new()),
        }))
    }

    pub fn address(&self) -> &RegionAddress {
        &self.address
    }

    pub fn behavior(&self) -> &B {
        &self.behavior
    }

    /// Spawn the passivation reaper, the assignment feed loop and, if given,
    /// the membership listener.
    pub fn start(self: &Arc<Self>, feed: AssignmentFeed, membership: Option<Arc<dyn Membership>>) {
        let mut tasks = self.tasks.lock();

        let reaper = Arc::new(EntityReaper::new(
            self.config.passivation_min_interval,
            self.cancel.child_token(),
        ));
        let sweep: Arc<dyn IdleSweep> = Arc::clone(self) as Arc<dyn IdleSweep>;
        let idle_timeout = self.config.entity_idle_timeout;
        tasks.push(tokio::spawn(async move {
            reaper.register(sweep, idle_timeout).await;
            reaper.run().await;
        }));

        let region = Arc::clone(self);
        tasks.push(match feed {
            AssignmentFeed::Watch(rx) => tokio::spawn(async move { region.follow(rx).await }),
            AssignmentFeed::Poll => tokio::spawn(async move { region.poll().await }),
        });

        if let Some(membership) = membership {
            let region = Arc::clone(self);
            tasks.push(tokio::spawn(async move {
                let mut events = membership.subscribe();
                loop {
                    tokio::select! {
                        _ = region.cancel.cancelled() => break,
                        event = events.next() => {
                            let Some(event) = event else { break };
                            region.on_membership_event(event);
                        }
                    }
                }
            }));
        }
        debug!(region = %self.address, "region started");
    }

    async fn follow(&self, mut rx: watch::Receiver<AssignmentTable>) {
        let initial = rx.borrow_and_update().clone();
        self.apply_table(initial);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                changed = rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let table = rx.borrow_and_update().clone();
                    self.apply_table(table);
                }
            }
        }
    }

    async fn poll(&self) {
        let mut ticker = tokio::time::interval(self.config.assignment_poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => match self.coordinator.table().await {
                    Ok(table) => {
                        self.apply_table(table);
                    }
                    Err(e) => debug!(error = %e, "failed to fetch assignment table"),
                },
            }
        }
    }

    fn on_membership_event(&self, event: MembershipEvent) {
        match event {
            MembershipEvent::Down(region) | MembershipEvent::Unreachable(region) => {
                let mut routes = self.routes.write();
                routes.locations.retain(|_, location| match location {
                    ShardLocation::Allocated(owner) => *owner != region,
                    ShardLocation::Migrating { from, to } => *from != region && *to != region,
                });
                debug!(region = %region, "dropped cached routes to region");
            }
            MembershipEvent::Up(_) | MembershipEvent::Reachable(_) => {}
        }
    }

    /// Adopt a newer assignment table. Returns false if it is not newer than
    /// the cached one.
    ///
    /// Shards this region still hosts but the table assigns elsewhere are
    /// stopped, so an owner that missed its handoff never keeps writing.
    pub fn apply_table(&self, table: AssignmentTable) -> bool {
        {
            let mut routes = self.routes.write();
            if table.generation <= routes.generation {
                return false;
            }
            routes.generation = table.generation;
            routes.locations = table.shards.clone();
        }
        self.metrics.generation.set(table.generation as i64);

        self.handed_off.retain(|shard, handed_at| {
            !(table.generation > *handed_at && table.owner(*shard) == Some(&self.address))
        });

        let displaced: Vec<ShardId> = self
            .shards
            .iter()
            .filter(|entry| {
                matches!(table.location(*entry.key()), Some(ShardLocation::Allocated(owner)) if *owner != self.address)
            })
            .map(|entry| *entry.key())
            .collect();
        for shard_id in displaced {
            if let Some((_, shard)) = self.shards.remove(&shard_id) {
                warn!(
                    shard_id = %shard_id,
                    generation = table.generation,
                    "shard assigned elsewhere while still hosted; stopping its entities"
                );
                let timeout = self.config.entity_stop_timeout;
                tokio::spawn(async move {
                    shard.handoff(timeout).await;
                });
            }
        }
        self.refresh_gauges();
        debug!(generation = table.generation, "assignment table applied");
        true
    }

    fn cached(&self, shard: ShardId) -> Option<ShardLocation> {
        self.routes.read().locations.get(&shard).cloned()
    }

    fn cache_route(&self, shard: ShardId, location: ShardLocation) {
        self.routes.write().locations.insert(shard, location);
    }

    fn invalidate(&self, shard: ShardId) {
        self.routes.write().locations.remove(&shard);
    }

    /// Where `shard` lives, asking the coordinator on a miss and requesting
    /// allocation if it has no owner yet.
    async fn resolve(&self, shard: ShardId) -> Result<RegionAddress, ClusterError> {
        let location = match self.cached(shard) {
            Some(location) => location,
            None => {
                let location = match self.coordinator.lookup(shard).await? {
                    Some(location) => location,
                    None => {
                        let owner = self.coordinator.allocate(shard, &self.address).await?;
                        debug!(shard_id = %shard, owner = %owner, "shard activated");
                        ShardLocation::Allocated(owner)
                    }
                };
                self.cache_route(shard, location.clone());
                location
            }
        };
        match location {
            ShardLocation::Allocated(owner) => Ok(owner),
            ShardLocation::Migrating { .. } => Err(ClusterError::ShardMigrating { shard_id: shard }),
        }
    }

    /// Route a command to its entity wherever it lives and wait for the reply.
    ///
    /// Stale or unavailable routes are re-resolved up to `stale_route_retries`
    /// times. Commands bounced by passivation or an in-progress handoff are
    /// resent after `resend_backoff`. The whole call is bounded by
    /// `ask_timeout`; on timeout the command may still complete.
    #[instrument(skip(self, envelope), fields(
        region = %self.address,
        owner_key = %envelope.owner_key,
        shard_id = %envelope.shard_id,
        request_id = %envelope.request_id,
    ))]
    pub async fn route(&self, envelope: CommandEnvelope) -> Result<Vec<u8>, ClusterError> {
        if self.closing.load(Ordering::Acquire) {
            return Err(ClusterError::ShuttingDown);
        }
        let request_id = envelope.request_id;
        let timeout = self.config.ask_timeout;
        match tokio::time::timeout(timeout, self.route_with_retries(envelope)).await {
            Ok(result) => result,
            Err(_) => Err(ClusterError::Timeout {
                request_id,
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    async fn route_with_retries(&self, envelope: CommandEnvelope) -> Result<Vec<u8>, ClusterError> {
        let shard_id = envelope.shard_id;
        let mut stale_retries = 0;
        loop {
            let result = match self.resolve(shard_id).await {
                Ok(owner) if owner == self.address => self.deliver_local(envelope.clone()).await,
                Ok(owner) => self.transport.forward(&owner, envelope.clone()).await,
                Err(e) => Err(e),
            };
            match result {
                Err(e @ (ClusterError::RoutingStale { .. } | ClusterError::RegionUnavailable { .. })) => {
                    if stale_retries >= self.config.stale_route_retries {
                        return Err(e);
                    }
                    stale_retries += 1;
                    self.metrics.routing_retries.inc();
                    self.invalidate(shard_id);
                    debug!(error = %e, "re-resolving stale route");
                }
                Err(e @ (ClusterError::Resend { .. } | ClusterError::ShardMigrating { .. })) => {
                    self.metrics.routing_retries.inc();
                    if matches!(e, ClusterError::ShardMigrating { .. }) {
                        self.invalidate(shard_id);
                    }
                    debug!(error = %e, "resending after backoff");
                    tokio::time::sleep(self.config.resend_backoff).await;
                }
                other => return other,
            }
        }
    }

    /// Send a typed command to the entity of `owner_key`.
    pub async fn ask<C: Command>(
        &self,
        owner_key: impl Into<OwnerKey>,
        command: &C,
    ) -> Result<C::Reply, ClusterError> {
        self.ask_with_id(self.ids.next(), owner_key, command).await
    }

    /// Like [`ask`](Self::ask) with a caller-chosen request id, so a retry
    /// after an unknown outcome is not executed twice.
    pub async fn ask_with_id<C: Command>(
        &self,
        request_id: RequestId,
        owner_key: impl Into<OwnerKey>,
        command: &C,
    ) -> Result<C::Reply, ClusterError> {
        let envelope = CommandEnvelope::for_command(
            request_id,
            owner_key.into(),
            command,
            self.config.num_shards,
        )?;
        let bytes = self.route(envelope).await?;
        decode(&bytes)
    }

    pub fn next_request_id(&self) -> RequestId {
        self.ids.next()
    }

    /// Route an external command and render the outcome as a [`Reply`].
    pub async fn handle_inbound(&self, command: InboundCommand) -> Reply {
        let request_id = command.request_id.unwrap_or_else(|| self.ids.next());
        let envelope = CommandEnvelope::new(
            request_id,
            command.owner_key,
            command.command_type,
            command.payload,
            self.config.num_shards,
        );
        Reply::from(self.route(envelope).await)
    }

    /// Deliver to a shard hosted here. Fails with `RoutingStale` when this
    /// region does not own the shard.
    pub async fn deliver_local(&self, envelope: CommandEnvelope) -> Result<Vec<u8>, ClusterError> {
        let shard_id = envelope.shard_id;
        if self.closing.load(Ordering::Acquire) || !self.owns(shard_id).await? {
            return Err(ClusterError::RoutingStale {
                shard_id,
                region: self.address.clone(),
            });
        }
        let Some(shard) = self.shard(shard_id) else {
            return Err(ClusterError::RoutingStale {
                shard_id,
                region: self.address.clone(),
            });
        };
        shard.deliver(envelope).await
    }

    async fn owns(&self, shard: ShardId) -> Result<bool, ClusterError> {
        let handed_at = self.handed_off.get(&shard).map(|entry| *entry);
        if let Some(handed_at) = handed_at {
            return self.reclaims(shard, handed_at).await;
        }
        match self.cached(shard) {
            Some(ShardLocation::Allocated(owner)) if owner == self.address => return Ok(true),
            Some(ShardLocation::Migrating { .. }) => {
                return Err(ClusterError::ShardMigrating { shard_id: shard })
            }
            _ => {}
        }

        // Not ours as far as the cache knows; the coordinator decides.
        match self.coordinator.lookup(shard).await? {
            Some(ShardLocation::Allocated(owner)) => {
                // A handoff that started during the lookup wins.
                let ours = owner == self.address && !self.handed_off.contains_key(&shard);
                self.cache_route(shard, ShardLocation::Allocated(owner));
                Ok(ours)
            }
            Some(location @ ShardLocation::Migrating { .. }) => {
                self.cache_route(shard, location);
                Err(ClusterError::ShardMigrating { shard_id: shard })
            }
            None => Ok(false),
        }
    }

    /// A shard handed off by this region comes back only through a table
    /// issued after the handoff; older answers still name this region.
    async fn reclaims(&self, shard: ShardId, handed_at: u64) -> Result<bool, ClusterError> {
        let table = self.coordinator.table().await?;
        if table.generation <= handed_at {
            debug!(shard_id = %shard, generation = table.generation, handed_at, "ignoring table older than handoff");
            return Ok(false);
        }
        let location = table.location(shard).cloned();
        self.apply_table(table);
        match location {
            Some(ShardLocation::Allocated(owner)) if owner == self.address => {
                self.handed_off.remove_if(&shard, |_, at| *at == handed_at);
                Ok(!self.handed_off.contains_key(&shard))
            }
            Some(ShardLocation::Migrating { .. }) => Err(ClusterError::ShardMigrating { shard_id: shard }),
            _ => Ok(false),
        }
    }

    /// The hosted shard, created on first use. `None` while the shard is
    /// handed off.
    fn shard(&self, shard_id: ShardId) -> Option<Arc<Shard<B>>> {
        if self.handed_off.contains_key(&shard_id) {
            return None;
        }
        let mut created = false;
        let shard = self
            .shards
            .entry(shard_id)
            .or_insert_with(|| {
                created = true;
                Arc::new(Shard::new(
                    shard_id,
                    Arc::clone(&self.behavior),
                    Arc::clone(&self.handlers),
                    Arc::clone(&self.journal),
                    Arc::clone(&self.config),
                    Arc::clone(&self.metrics),
                ))
            })
            .clone();
        if created {
            // Re-check: a handoff may have begun between the check and the insert.
            if self.handed_off.contains_key(&shard_id) {
                self.shards.remove_if(&shard_id, |_, hosted| Arc::ptr_eq(hosted, &shard));
                return None;
            }
            debug!(shard_id = %shard_id, "hosting shard");
            self.metrics.shards.set(self.shards.len() as i64);
        }
        Some(shard)
    }

    /// Hand off `shard`: stop accepting its commands, let in-flight ones
    /// finish, and passivate its entities. Returns the number of entities
    /// stopped.
    #[instrument(skip(self), fields(region = %self.address))]
    pub async fn handoff(&self, shard_id: ShardId) -> Result<usize, ClusterError> {
        let generation = self.routes.read().generation;
        self.handed_off.insert(shard_id, generation);
        self.invalidate(shard_id);

        let stopped = match self.shards.remove(&shard_id) {
            Some((_, shard)) => shard.handoff(self.config.entity_stop_timeout).await,
            None => 0,
        };
        self.metrics.handoffs.inc();
        self.refresh_gauges();
        info!(shard_id = %shard_id, entities = stopped, "shard handed off");
        Ok(stopped)
    }

    /// Let a key whose recovery failed be activated again.
    pub fn clear_recovery_failure(&self, owner_key: &OwnerKey) -> bool {
        let shard_id = shard_for_key(owner_key, self.config.num_shards);
        self.shards
            .get(&shard_id)
            .is_some_and(|shard| shard.clear_failure(owner_key))
    }

    pub fn entity_status(&self, owner_key: &OwnerKey) -> Option<EntityStatus> {
        let shard_id = shard_for_key(owner_key, self.config.num_shards);
        self.shards.get(&shard_id)?.entity_status(owner_key)
    }

    pub fn hosted_shards(&self) -> Vec<ShardId> {
        let mut shards: Vec<ShardId> = self.shards.iter().map(|entry| *entry.key()).collect();
        shards.sort();
        shards
    }

    /// Live entity instances across hosted shards.
    pub fn entity_count(&self) -> usize {
        self.shards.iter().map(|entry| entry.value().active_count()).sum()
    }

    fn refresh_gauges(&self) {
        self.metrics.shards.set(self.shards.len() as i64);
        self.metrics.entities.set(self.entity_count() as i64);
    }

    /// Graceful stop: reject new commands, hand off every hosted shard, then
    /// stop background tasks.
    #[instrument(skip(self), fields(region = %self.address))]
    pub async fn shutdown(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        let shards: Vec<Arc<Shard<B>>> = self.shards.iter().map(|e| Arc::clone(e.value())).collect();
        self.shards.clear();
        let timeout = self.config.entity_stop_timeout;
        let stopped: usize = futures::future::join_all(shards.iter().map(|s| s.handoff(timeout)))
            .await
            .into_iter()
            .sum();

        self.cancel.cancel();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let abort = task.abort_handle();
            if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
                abort.abort();
            }
        }
        self.refresh_gauges();
        info!(shards = shards.len(), entities = stopped, "region shut down");
    }

    /// Stop immediately without flushing anything, as a crash would.
    pub fn halt(&self) {
        self.closing.store(true, Ordering::Release);
        self.cancel.cancel();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        for entry in self.shards.iter() {
            entry.value().abort();
        }
        self.shards.clear();
        warn!(region = %self.address, "region halted");
    }
}

#[async_trait]
impl<B: Behavior> IdleSweep for ShardRegion<B> {
    fn label(&self) -> String {
        format!("region {}", self.address)
    }

    async fn reap_idle(&self, max_idle: Duration) -> usize {
        let shards: Vec<Arc<Shard<B>>> = self.shards.iter().map(|e| Arc::clone(e.value())).collect();
        let mut reaped = 0;
        for shard in shards {
            reaped += shard.reap_idle(max_idle).await;
        }
        self.refresh_gauges();
        reaped
    }
}

#[async_trait]
impl<B: Behavior> RegionEndpoint for ShardRegion<B> {
    async fn deliver_local(&self, envelope: CommandEnvelope) -> Result<Vec<u8>, ClusterError> {
        ShardRegion::deliver_local(self, envelope).await
    }

    async fn handoff_shard(&self, shard: ShardId) -> Result<usize, ClusterError> {
        self.handoff(shard).await
    }

    async fn handle_inbound(&self, command: InboundCommand) -> Reply {
        ShardRegion::handle_inbound(self, command).await
    }
}
