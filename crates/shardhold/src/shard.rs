//! A shard: the live entities of one shard id on one region.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, instrument, warn};

use crate::config::RuntimeConfig;
use crate::entity::{Behavior, Entity, EntitySettings, EntityStatus, HandlerTable};
use crate::envelope::CommandEnvelope;
use crate::error::ClusterError;
use crate::journal::EventJournal;
use crate::metrics::RegionMetrics;
use crate::types::{OwnerKey, ShardId};

type SpawnLocks = DashMap<OwnerKey, Arc<Mutex<()>>>;
type ReplyTx = oneshot::Sender<Result<Vec<u8>, ClusterError>>;

enum Mail {
    Command {
        envelope: CommandEnvelope,
        reply_tx: ReplyTx,
    },
    /// Stop after the commands queued ahead of this one.
    Passivate,
}

/// Handle to a running entity task.
struct EntityInstance {
    owner_key: OwnerKey,
    mailbox_tx: mpsc::UnboundedSender<Mail>,
    /// Accepted commands not yet answered.
    pending: AtomicUsize,
    last_active_ms: AtomicI64,
    passivating: AtomicBool,
    status: parking_lot::Mutex<EntityStatus>,
    /// Stored synchronously right after `tokio::spawn` so a stop request can
    /// always await the task.
    join_handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl EntityInstance {
    fn touch(&self) {
        self.last_active_ms.store(now_millis(), Ordering::Release);
    }

    fn set_status(&self, status: EntityStatus) {
        *self.status.lock() = status;
    }

    fn begin_passivation(&self) -> bool {
        let first = !self.passivating.swap(true, Ordering::AcqRel);
        if first {
            let _ = self.mailbox_tx.send(Mail::Passivate);
        }
        first
    }
}

/// State shared between a shard and its entity tasks.
struct ShardShared<B: Behavior> {
    shard_id: ShardId,
    behavior: Arc<B>,
    handlers: Arc<HandlerTable<B::State, B::Event>>,
    journal: Arc<dyn EventJournal>,
    config: Arc<RuntimeConfig>,
    metrics: Arc<RegionMetrics>,
    instances: DashMap<OwnerKey, Arc<EntityInstance>>,
    spawn_locks: SpawnLocks,
    /// Keys whose recovery failed, with the reason. Cleared by an operator.
    failed: DashMap<OwnerKey, String>,
}

/// Owns the live entities of one shard on this region.
///
/// Every key has at most one instance. An instance stays in the map until its
/// task has finished, including a passivating one, so a replacement is never
/// started while the old one may still write.
pub struct Shard<B: Behavior> {
    shared: Arc<ShardShared<B>>,
    accepting: AtomicBool,
}

impl<B: Behavior> Shard<B> {
    pub fn new(
        shard_id: ShardId,
        behavior: Arc<B>,
        handlers: Arc<HandlerTable<B::State, B::Event>>,
        journal: Arc<dyn EventJournal>,
        config: Arc<RuntimeConfig>,
        metrics: Arc<RegionMetrics>,
    ) -> Self {
        Self {
            shared: Arc::new(ShardShared {
                shard_id,
                behavior,
                handlers,
                journal,
                config,
                metrics,
                instances: DashMap::new(),
                spawn_locks: DashMap::new(),
                failed: DashMap::new(),
            }),
            accepting: AtomicBool::new(true),
        }
    }

    pub fn shard_id(&self) -> ShardId {
        self.shared.shard_id
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Number of live entity instances, passivating ones included.
    pub fn active_count(&self) -> usize {
        self.shared.instances.len()
    }

    pub fn entity_status(&self, owner_key: &OwnerKey) -> Option<EntityStatus> {
        self.shared
            .instances
            .get(owner_key)
            .map(|instance| *instance.status.lock())
    }

    /// Allow a key whose recovery failed to be activated again.
    pub fn clear_failure(&self, owner_key: &OwnerKey) -> bool {
        self.shared.failed.remove(owner_key).is_some()
    }

    /// Deliver a command to its entity, activating the entity if needed, and
    /// wait for the reply.
    ///
    /// Commands for one key are handled strictly in arrival order, including
    /// those that arrive while the entity is still recovering.
    #[instrument(skip(self, envelope), fields(
        shard_id = %self.shared.shard_id,
        owner_key = %envelope.owner_key,
        request_id = %envelope.request_id,
    ))]
    pub async fn deliver(&self, envelope: CommandEnvelope) -> Result<Vec<u8>, ClusterError> {
        if !self.is_accepting() {
            return Err(ClusterError::ShardMigrating {
                shard_id: self.shared.shard_id,
            });
        }
        let owner_key = envelope.owner_key.clone();
        if let Some(reason) = self.shared.failed.get(&owner_key) {
            return Err(recovery_failure(&owner_key, reason.value()));
        }

        let instance = self.get_or_spawn(&owner_key).await?;
        if instance.passivating.load(Ordering::Acquire) {
            return Err(ClusterError::Resend { owner_key });
        }
        if instance.pending.load(Ordering::Acquire) >= self.shared.config.entity_mailbox_capacity {
            return Err(ClusterError::MailboxFull { owner_key });
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        instance.pending.fetch_add(1, Ordering::AcqRel);
        if instance
            .mailbox_tx
            .send(Mail::Command { envelope, reply_tx })
            .is_err()
        {
            instance.pending.fetch_sub(1, Ordering::AcqRel);
            return Err(ClusterError::Resend { owner_key });
        }
        instance.touch();

        match reply_rx.await {
            Ok(result) => result,
            // The task ended without answering; the next attempt starts a fresh instance.
            Err(_) => Err(ClusterError::Resend { owner_key }),
        }
    }

    async fn get_or_spawn(&self, owner_key: &OwnerKey) -> Result<Arc<EntityInstance>, ClusterError> {
        if let Some(entry) = self.shared.instances.get(owner_key) {
            return Ok(Arc::clone(entry.value()));
        }

        let lock = self
            .shared
            .spawn_locks
            .entry(owner_key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        if let Some(entry) = self.shared.instances.get(owner_key) {
            return Ok(Arc::clone(entry.value()));
        }
        if !self.is_accepting() {
            return Err(ClusterError::ShardMigrating {
                shard_id: self.shared.shard_id,
            });
        }

        let settings = EntitySettings {
            snapshot_every: self.shared.config.snapshot_every,
            delete_events_on_snapshot: self.shared.config.delete_events_on_snapshot,
            dedup_window: self.shared.config.request_dedup_window,
        };
        let entity = Entity::new(
            owner_key.clone(),
            Arc::clone(&self.shared.behavior),
            Arc::clone(&self.shared.handlers),
            Arc::clone(&self.shared.journal),
            settings,
        );

        let (mailbox_tx, mailbox_rx) = mpsc::unbounded_channel();
        let instance = Arc::new(EntityInstance {
            owner_key: owner_key.clone(),
            mailbox_tx,
            pending: AtomicUsize::new(0),
            last_active_ms: AtomicI64::new(now_millis()),
            passivating: AtomicBool::new(false),
            status: parking_lot::Mutex::new(EntityStatus::Recovering),
            join_handle: parking_lot::Mutex::new(None),
        });

        // Insert before spawning so the task's cleanup always finds its own entry.
        self.shared
            .instances
            .insert(owner_key.clone(), Arc::clone(&instance));

        let shared = Arc::clone(&self.shared);
        let task_instance = Arc::clone(&instance);
        let handle = tokio::spawn(async move {
            run_entity(&shared, entity, &task_instance, mailbox_rx).await;
            shared.spawn_locks.remove(&task_instance.owner_key);
        });
        *instance.join_handle.lock() = Some(handle);

        debug!(owner_key = %owner_key, "entity activated");
        Ok(instance)
    }

    /// Passivate one entity: commands queued ahead of the request are handled,
    /// later ones are bounced with `Resend`, and a final snapshot is written.
    #[instrument(skip(self), fields(shard_id = %self.shared.shard_id, owner_key = %owner_key))]
    pub async fn passivate(&self, owner_key: &OwnerKey) -> bool {
        let Some(instance) = self
            .shared
            .instances
            .get(owner_key)
            .map(|entry| Arc::clone(entry.value()))
        else {
            return false;
        };
        if !instance.begin_passivation() {
            return false;
        }
        self.await_stopped(vec![instance]).await;
        self.shared.metrics.passivations.inc();
        true
    }

    /// Passivate entities idle for at least `max_idle` with nothing pending.
    /// Returns the number passivated.
    pub async fn reap_idle(&self, max_idle: Duration) -> usize {
        let now = now_millis();
        let max_idle_ms = max_idle.as_millis() as i64;
        let idle: Vec<OwnerKey> = self
            .shared
            .instances
            .iter()
            .filter(|entry| {
                let instance = entry.value();
                now - instance.last_active_ms.load(Ordering::Acquire) >= max_idle_ms
                    && instance.pending.load(Ordering::Acquire) == 0
            })
            .map(|entry| entry.key().clone())
            .collect();

        let mut reaped = 0;
        for key in idle {
            if self.passivate(&key).await {
                reaped += 1;
            }
        }
        if reaped > 0 {
            debug!(shard_id = %self.shared.shard_id, reaped, "passivated idle entities");
        }
        reaped
    }

    /// Stop accepting commands and passivate every entity.
    ///
    /// In-flight and queued commands complete first. Entities still running
    /// after `timeout` are aborted; their unacknowledged work was never
    /// durable. Returns the number of entities stopped.
    #[instrument(skip(self), fields(shard_id = %self.shared.shard_id))]
    pub async fn handoff(&self, timeout: Duration) -> usize {
        self.accepting.store(false, Ordering::Release);
        let mut count = 0;
        // Repeat until empty: an activation that raced the flag may have
        // inserted an instance after the first sweep.
        let drain = async {
            loop {
                let instances: Vec<Arc<EntityInstance>> = self
                    .shared
                    .instances
                    .iter()
                    .map(|entry| Arc::clone(entry.value()))
                    .collect();
                if instances.is_empty() {
                    break;
                }
                for instance in &instances {
                    if instance.begin_passivation() {
                        count += 1;
                    }
                }
                self.await_stopped(instances).await;
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        if tokio::time::timeout(timeout, drain).await.is_err() {
            warn!(
                shard_id = %self.shared.shard_id,
                "entities did not stop within handoff timeout; aborting them"
            );
            for entry in self.shared.instances.iter() {
                if let Some(handle) = entry.value().join_handle.lock().take() {
                    handle.abort();
                }
            }
            self.shared.instances.clear();
        }
        self.shared.metrics.passivations.inc_by(count as u64);
        debug!(shard_id = %self.shared.shard_id, entities = count, "shard handed off");
        count
    }

    /// Kill every entity task without flushing, as a process crash would.
    pub fn abort(&self) {
        self.accepting.store(false, Ordering::Release);
        for entry in self.shared.instances.iter() {
            if let Some(handle) = entry.value().join_handle.lock().take() {
                handle.abort();
            }
        }
        self.shared.instances.clear();
        self.shared.spawn_locks.clear();
    }

    async fn await_stopped(&self, instances: Vec<Arc<EntityInstance>>) {
        let stop_timeout = self.shared.config.entity_stop_timeout;
        for instance in instances {
            let handle = { instance.join_handle.lock().take() };
            let Some(handle) = handle else { continue };
            let abort = handle.abort_handle();
            match tokio::time::timeout(stop_timeout, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "entity task failed"),
                Err(_) => {
                    warn!(
                        timeout_ms = stop_timeout.as_millis() as u64,
                        "entity did not stop in time, aborting"
                    );
                    abort.abort();
                    remove_instance(&self.shared, &instance);
                    self.shared.spawn_locks.remove(&instance.owner_key);
                }
            }
        }
    }
}

async fn run_entity<B: Behavior>(
    shared: &ShardShared<B>,
    mut entity: Entity<B>,
    instance: &EntityInstance,
    mut mailbox_rx: mpsc::UnboundedReceiver<Mail>,
) {
    let owner_key = entity.owner_key().clone();

    if let Err(e) = entity.recover().await {
        fail_entity(shared, instance, &owner_key, &e, mailbox_rx).await;
        return;
    }
    instance.set_status(EntityStatus::Ready);

    while let Some(mail) = mailbox_rx.recv().await {
        match mail {
            Mail::Command { envelope, reply_tx } => {
                instance.touch();
                instance.set_status(EntityStatus::Persisting);
                let result = entity
                    .handle(envelope.request_id, &envelope.command_type, &envelope.payload)
                    .await;
                instance.set_status(EntityStatus::Ready);
                shared.metrics.commands.inc();
                if matches!(result, Err(ClusterError::PersistenceFailure { .. })) {
                    shared.metrics.persistence_failures.inc();
                }
                instance.pending.fetch_sub(1, Ordering::AcqRel);
                // Replaying after a failed append can itself fail.
                let stopped = match &result {
                    Err(ClusterError::RecoveryFailure { reason, .. })
                        if entity.status() == EntityStatus::Stopped =>
                    {
                        Some(recovery_failure(&owner_key, reason))
                    }
                    _ => None,
                };
                if reply_tx.send(result).is_err() {
                    debug!(owner_key = %owner_key, "caller went away before the reply");
                }
                if let Some(e) = stopped {
                    fail_entity(shared, instance, &owner_key, &e, mailbox_rx).await;
                    return;
                }
                instance.touch();
            }
            Mail::Passivate => break,
        }
    }

    instance.passivating.store(true, Ordering::Release);
    instance.set_status(EntityStatus::Passivating);
    mailbox_rx.close();
    while let Some(mail) = mailbox_rx.recv().await {
        if let Mail::Command { reply_tx, .. } = mail {
            instance.pending.fetch_sub(1, Ordering::AcqRel);
            let _ = reply_tx.send(Err(ClusterError::Resend {
                owner_key: owner_key.clone(),
            }));
        }
    }
    entity.passivate().await;
    instance.set_status(EntityStatus::Stopped);
    remove_instance(shared, instance);
}

/// Stop an entity whose recovery failed: answer queued commands with the
/// failure and remember it for later routing.
async fn fail_entity<B: Behavior>(
    shared: &ShardShared<B>,
    instance: &EntityInstance,
    owner_key: &OwnerKey,
    e: &ClusterError,
    mut mailbox_rx: mpsc::UnboundedReceiver<Mail>,
) {
    error!(owner_key = %owner_key, error = %e, "entity recovery failed");
    let reason = match e {
        ClusterError::RecoveryFailure { reason, .. } => reason.clone(),
        other => other.to_string(),
    };
    shared.metrics.recovery_failures.inc();
    shared.failed.insert(owner_key.clone(), reason.clone());
    instance.set_status(EntityStatus::Stopped);
    mailbox_rx.close();
    while let Some(mail) = mailbox_rx.recv().await {
        if let Mail::Command { reply_tx, .. } = mail {
            instance.pending.fetch_sub(1, Ordering::AcqRel);
            let _ = reply_tx.send(Err(recovery_failure(owner_key, &reason)));
        }
    }
    remove_instance(shared, instance);
}

fn remove_instance<B: Behavior>(shared: &ShardShared<B>, instance: &EntityInstance) {
    shared.instances.remove_if(&instance.owner_key, |_, candidate| {
        std::ptr::eq(Arc::as_ptr(candidate), instance)
    });
}

fn recovery_failure(owner_key: &OwnerKey, reason: &str) -> ClusterError {
    ClusterError::RecoveryFailure {
        owner_key: owner_key.clone(),
        reason: reason.to_string(),
        source: None,
    }
}

fn now_millis() -> i64 {
    match std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) {
        Ok(duration) => duration.as_millis() as i64,
        Err(err) => {
            warn!("system clock before Unix epoch: {err}");
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::test_support::{Counter, Get, Increment};
    use crate::envelope::{decode, Command};
    use crate::request_id::RequestId;
    use crate::storage::memory_journal::MemoryJournal;
    use std::sync::atomic::AtomicI64 as Counter64;

    fn test_config() -> Arc<RuntimeConfig> {
        Arc::new(RuntimeConfig {
            num_shards: 1,
            snapshot_every: 2,
            entity_mailbox_capacity: 10,
            entity_stop_timeout: Duration::from_secs(2),
            ..Default::default()
        })
    }

    fn make_shard(journal: &Arc<MemoryJournal>, config: Arc<RuntimeConfig>) -> Shard<Counter> {
        let behavior = Arc::new(Counter);
        let handlers = Arc::new(behavior.handlers());
        Shard::new(
            ShardId::new(0),
            behavior,
            handlers,
            journal.clone(),
            config,
            Arc::new(RegionMetrics::unregistered()),
        )
    }

    fn envelope<C: Command>(key: &str, cmd: &C) -> CommandEnvelope {
        static NEXT_ID: Counter64 = Counter64::new(1);
        CommandEnvelope::for_command(
            RequestId(NEXT_ID.fetch_add(1, Ordering::Relaxed)),
            OwnerKey::new(key),
            cmd,
            1,
        )
        .unwrap()
    }

    async fn ask<C: Command>(shard: &Shard<Counter>, key: &str, cmd: &C) -> Result<C::Reply, ClusterError> {
        let bytes = shard.deliver(envelope(key, cmd)).await?;
        decode(&bytes)
    }

    #[tokio::test]
    async fn activates_entity_on_first_command() {
        let journal = Arc::new(MemoryJournal::new());
        let shard = make_shard(&journal, test_config());
        assert_eq!(shard.active_count(), 0);

        assert_eq!(ask(&shard, "U1", &Increment { by: 3 }).await.unwrap(), 3);
        assert_eq!(shard.active_count(), 1);
        assert_eq!(shard.entity_status(&OwnerKey::new("U1")), Some(EntityStatus::Ready));

        ask(&shard, "U2", &Get).await.unwrap();
        assert_eq!(shard.active_count(), 2);
    }

    #[tokio::test]
    async fn commands_for_one_key_run_in_arrival_order() {
        let journal = Arc::new(MemoryJournal::new());
        journal.set_append_delay(Some(Duration::from_millis(5)));
        let shard = make_shard(&journal, test_config());

        let futures: Vec<_> = (1..=5)
            .map(|by| shard.deliver(envelope("U2", &Increment { by })))
            .collect();
        let replies: Vec<i64> = futures::future::join_all(futures)
            .await
            .into_iter()
            .map(|r| decode(&r.unwrap()).unwrap())
            .collect();

        assert_eq!(replies, vec![1, 3, 6, 10, 15]);
        assert_eq!(journal.max_concurrent_appends_per_key(), 1);
        let seqs: Vec<_> = journal
            .events(&OwnerKey::new("U2"))
            .iter()
            .map(|e| e.sequence)
            .collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn mailbox_capacity_is_enforced() {
        let journal = Arc::new(MemoryJournal::new());
        journal.set_append_delay(Some(Duration::from_millis(50)));
        let config = Arc::new(RuntimeConfig {
            entity_mailbox_capacity: 1,
            ..(*test_config()).clone()
        });
        let shard = make_shard(&journal, config);

        let (first, second) = tokio::join!(
            shard.deliver(envelope("U1", &Increment { by: 1 })),
            shard.deliver(envelope("U1", &Increment { by: 1 })),
        );
        assert!(first.is_ok());
        assert!(matches!(second, Err(ClusterError::MailboxFull { .. })));
    }

    #[tokio::test]
    async fn passivation_flushes_and_reactivation_recovers() {
        let journal = Arc::new(MemoryJournal::new());
        let shard = make_shard(&journal, test_config());
        for _ in 0..3 {
            ask(&shard, "U1", &Increment { by: 2 }).await.unwrap();
        }

        assert!(shard.passivate(&OwnerKey::new("U1")).await);
        assert_eq!(shard.active_count(), 0);
        assert_eq!(journal.snapshot(&OwnerKey::new("U1")).unwrap().sequence, 3);

        assert_eq!(ask(&shard, "U1", &Get).await.unwrap(), 6);
        assert!(!shard.passivate(&OwnerKey::new("missing")).await);
    }

    #[tokio::test]
    async fn reap_idle_passivates_only_idle_entities() {
        let journal = Arc::new(MemoryJournal::new());
        let shard = make_shard(&journal, test_config());
        ask(&shard, "U1", &Increment { by: 1 }).await.unwrap();

        assert_eq!(shard.reap_idle(Duration::from_secs(3600)).await, 0);
        assert_eq!(shard.active_count(), 1);
        assert_eq!(shard.reap_idle(Duration::ZERO).await, 1);
        assert_eq!(shard.active_count(), 0);
    }

    #[tokio::test]
    async fn handoff_stops_all_entities_and_rejects_new_commands() {
        let journal = Arc::new(MemoryJournal::new());
        let shard = make_shard(&journal, test_config());
        for key in ["a", "b", "c"] {
            ask(&shard, key, &Increment { by: 1 }).await.unwrap();
        }

        assert_eq!(shard.handoff(Duration::from_secs(5)).await, 3);
        assert_eq!(shard.active_count(), 0);
        assert!(!shard.is_accepting());
        let err = ask(&shard, "a", &Get).await.unwrap_err();
        assert!(matches!(err, ClusterError::ShardMigrating { .. }));

        for key in ["a", "b", "c"] {
            assert_eq!(journal.snapshot(&OwnerKey::new(key)).unwrap().sequence, 1);
        }
    }

    #[tokio::test]
    async fn recovery_failure_is_scoped_to_key_until_cleared() {
        let journal = Arc::new(MemoryJournal::new());
        let shard = make_shard(&journal, test_config());
        ask(&shard, "bad", &Increment { by: 1 }).await.unwrap();
        shard.passivate(&OwnerKey::new("bad")).await;

        journal.corrupt(&OwnerKey::new("bad"));
        let err = ask(&shard, "bad", &Get).await.unwrap_err();
        assert!(matches!(err, ClusterError::RecoveryFailure { .. }));
        let err = ask(&shard, "bad", &Get).await.unwrap_err();
        assert!(matches!(err, ClusterError::RecoveryFailure { .. }));

        // Other keys are unaffected.
        assert_eq!(ask(&shard, "good", &Increment { by: 4 }).await.unwrap(), 4);

        journal.repair(&OwnerKey::new("bad"));
        assert!(shard.clear_failure(&OwnerKey::new("bad")));
        assert_eq!(ask(&shard, "bad", &Get).await.unwrap(), 1);
    }
}
