//! Event-sourced entity: one owner key's state plus its lifecycle.
//!
//! Domain logic is supplied through [`Behavior`]. The entity owns the state
//! exclusively and persists events write-ahead through an injected
//! [`EventJournal`]: a command's events are appended before they are folded
//! into memory, so every acknowledged mutation is recoverable.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use crate::envelope::{decode, encode, Command};
use crate::error::ClusterError;
use crate::journal::{EventJournal, SeqNr};
use crate::request_id::RequestId;
use crate::types::OwnerKey;

/// Domain behavior of an entity type.
pub trait Behavior: Send + Sync + 'static {
    type State: Default + Clone + Serialize + DeserializeOwned + Send + Sync + 'static;
    type Event: Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Entity type name, used in logs.
    fn name(&self) -> &str;

    /// Fold one event onto the state. Must be deterministic: recovery relies
    /// on replaying the same events producing the same state.
    fn apply(&self, state: &mut Self::State, event: &Self::Event);

    /// Command handlers keyed by command type.
    fn handlers(&self) -> HandlerTable<Self::State, Self::Event>;
}

type ReplyFn<S> = Box<dyn FnOnce(&S) -> Result<Vec<u8>, ClusterError> + Send>;

/// What a handler decided: events to persist and how to build the reply.
///
/// The reply closure sees the state after the events were applied.
pub struct Effect<S, E> {
    events: Vec<E>,
    reply: ReplyFn<S>,
}

impl<S: 'static, E> Effect<S, E> {
    /// Persist `events`; reply with unit unless [`then_reply`](Self::then_reply) is used.
    pub fn persist(events: Vec<E>) -> Self {
        Self {
            events,
            reply: Box::new(|_: &S| encode(&())),
        }
    }

    /// No state change, unit reply.
    pub fn none() -> Self {
        Self::persist(Vec::new())
    }

    /// No state change, reply with `value`.
    pub fn reply<R: Serialize>(value: R) -> Self {
        let encoded = encode(&value);
        Self {
            events: Vec::new(),
            reply: Box::new(move |_: &S| encoded),
        }
    }

    /// Build the reply from the post-apply state.
    pub fn then_reply<R, F>(mut self, f: F) -> Self
    where
        R: Serialize,
        F: FnOnce(&S) -> R + Send + 'static,
    {
        self.reply = Box::new(move |state: &S| encode(&f(state)));
        self
    }

    pub fn events(&self) -> &[E] {
        &self.events
    }
}

type Handler<S, E> = Arc<dyn Fn(&S, &[u8]) -> Result<Effect<S, E>, ClusterError> + Send + Sync>;

/// Handler functions keyed by command type.
pub struct HandlerTable<S, E> {
    handlers: HashMap<String, Handler<S, E>>,
}

impl<S: 'static, E: 'static> HandlerTable<S, E> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler over the raw command payload.
    pub fn register<F>(mut self, command_type: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&S, &[u8]) -> Result<Effect<S, E>, ClusterError> + Send + Sync + 'static,
    {
        self.handlers.insert(command_type.into(), Arc::new(handler));
        self
    }

    /// Register a typed handler; the payload is decoded as `C`.
    pub fn on<C, F>(self, handler: F) -> Self
    where
        C: Command,
        F: Fn(&S, C) -> Result<Effect<S, E>, ClusterError> + Send + Sync + 'static,
    {
        self.register(C::TYPE, move |state, payload| {
            let command: C = decode(payload)?;
            handler(state, command)
        })
    }

    fn get(&self, command_type: &str) -> Option<&Handler<S, E>> {
        self.handlers.get(command_type)
    }

    pub fn command_types(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}

impl<S: 'static, E: 'static> Default for HandlerTable<S, E> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityStatus {
    Recovering,
    Ready,
    Persisting,
    Passivating,
    Stopped,
}

impl fmt::Display for EntityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntityStatus::Recovering => "recovering",
            EntityStatus::Ready => "ready",
            EntityStatus::Persisting => "persisting",
            EntityStatus::Passivating => "passivating",
            EntityStatus::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Per-entity persistence settings.
#[derive(Debug, Clone, Copy)]
pub struct EntitySettings {
    /// Applied events between snapshots; 0 disables snapshots.
    pub snapshot_every: u64,
    pub delete_events_on_snapshot: bool,
    pub dedup_window: usize,
}

/// Journal payload of one event: the event plus the request that produced it.
#[derive(Serialize, Deserialize)]
struct StoredEvent<E> {
    request_id: Option<RequestId>,
    event: E,
}

/// Snapshot payload. Recent request ids travel with the state so duplicate
/// detection survives event retention.
#[derive(Serialize, Deserialize)]
struct SnapshotPayload<S> {
    state: S,
    recent_requests: Vec<RequestId>,
}

/// Bounded memory of recent request ids.
///
/// A reply is cached only for requests this instance executed itself; ids
/// learned during recovery map to `None`.
struct DedupWindow {
    capacity: usize,
    order: VecDeque<RequestId>,
    replies: HashMap<RequestId, Option<Vec<u8>>>,
}

impl DedupWindow {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::new(),
            replies: HashMap::new(),
        }
    }

    fn get(&self, request_id: &RequestId) -> Option<&Option<Vec<u8>>> {
        self.replies.get(request_id)
    }

    fn record(&mut self, request_id: RequestId, reply: Option<Vec<u8>>) {
        if self.capacity == 0 {
            return;
        }
        if self.replies.insert(request_id, reply).is_none() {
            self.order.push_back(request_id);
        }
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.replies.remove(&evicted);
            }
        }
    }

    fn ids(&self) -> Vec<RequestId> {
        self.order.iter().copied().collect()
    }
}

/// A single live entity.
pub struct Entity<B: Behavior> {
    owner_key: OwnerKey,
    behavior: Arc<B>,
    handlers: Arc<HandlerTable<B::State, B::Event>>,
    journal: Arc<dyn EventJournal>,
    settings: EntitySettings,
    state: B::State,
    sequence: SeqNr,
    /// Highest sequence known to be covered by a stored snapshot.
    snapshot_sequence: SeqNr,
    status: EntityStatus,
    dedup: DedupWindow,
    /// Background snapshot write and the sequence it covers.
    snapshot_task: Option<(SeqNr, JoinHandle<bool>)>,
    /// Set after a failed append: the write may still have landed, so the
    /// in-memory view must be checked against the log before the next command.
    needs_resync: bool,
}

impl<B: Behavior> Entity<B> {
    pub fn new(
        owner_key: OwnerKey,
        behavior: Arc<B>,
        handlers: Arc<HandlerTable<B::State, B::Event>>,
        journal: Arc<dyn EventJournal>,
        settings: EntitySettings,
    ) -> Self {
        Self {
            owner_key,
            behavior,
            handlers,
            journal,
            settings,
            state: B::State::default(),
            sequence: 0,
            snapshot_sequence: 0,
            status: EntityStatus::Recovering,
            dedup: DedupWindow::new(settings.dedup_window),
            snapshot_task: None,
            needs_resync: false,
        }
    }

    pub fn owner_key(&self) -> &OwnerKey {
        &self.owner_key
    }

    pub fn status(&self) -> EntityStatus {
        self.status
    }

    pub fn state(&self) -> &B::State {
        &self.state
    }

    /// Sequence of the last applied event.
    pub fn sequence(&self) -> SeqNr {
        self.sequence
    }

    /// Load the latest snapshot and replay the events after it.
    ///
    /// On failure the entity is `Stopped` and the error is a `RecoveryFailure`.
    #[instrument(skip(self), fields(owner_key = %self.owner_key, entity = self.behavior.name()))]
    pub async fn recover(&mut self) -> Result<(), ClusterError> {
        self.status = EntityStatus::Recovering;
        match self.replay().await {
            Ok(()) => {
                self.needs_resync = false;
                self.status = EntityStatus::Ready;
                debug!(sequence = self.sequence, "entity recovered");
                Ok(())
            }
            Err(reason) => {
                self.status = EntityStatus::Stopped;
                Err(ClusterError::RecoveryFailure {
                    owner_key: self.owner_key.clone(),
                    reason,
                    source: None,
                })
            }
        }
    }

    async fn replay(&mut self) -> Result<(), String> {
        let journal = Arc::clone(&self.journal);
        let key = self.owner_key.clone();

        self.state = B::State::default();
        self.sequence = 0;
        self.snapshot_sequence = 0;
        self.dedup = DedupWindow::new(self.settings.dedup_window);

        let snapshot = journal
            .load_snapshot(&key)
            .await
            .map_err(|e| format!("failed to load snapshot: {e}"))?;
        if let Some(record) = snapshot {
            match decode::<SnapshotPayload<B::State>>(&record.state) {
                Ok(payload) => {
                    self.state = payload.state;
                    self.sequence = record.sequence;
                    self.snapshot_sequence = record.sequence;
                    for id in payload.recent_requests {
                        self.dedup.record(id, None);
                    }
                }
                Err(e) => {
                    // Snapshots are an optimization; fall back to a full replay.
                    warn!(error = %e, "ignoring undecodable snapshot");
                }
            }
        }

        let mut events = journal.read_from(&key, self.sequence + 1);
        while let Some(event) = events.next().await {
            let event = event.map_err(|e| format!("failed to read events: {e}"))?;
            let expected = self.sequence + 1;
            if event.sequence != expected {
                return Err(format!(
                    "event log gap: expected sequence {expected}, found {}",
                    event.sequence
                ));
            }
            let stored: StoredEvent<B::Event> = decode(&event.payload)
                .map_err(|e| format!("undecodable event at sequence {}: {e}", event.sequence))?;
            self.behavior.apply(&mut self.state, &stored.event);
            self.sequence = event.sequence;
            if let Some(id) = stored.request_id {
                self.dedup.record(id, None);
            }
        }
        drop(events);

        let highest = journal
            .highest_sequence(&key)
            .await
            .map_err(|e| format!("failed to read highest sequence: {e}"))?;
        if highest != self.sequence {
            return Err(format!(
                "replay stopped at sequence {} but the log ends at {highest}",
                self.sequence
            ));
        }
        Ok(())
    }

    /// Bring memory back in line with the log after a failed append.
    ///
    /// A failed append is ambiguous: the journal may have stored the events
    /// and lost only the acknowledgement. If the log moved past our sequence
    /// the entity is rebuilt from it, which also re-learns the request ids.
    async fn resync(&mut self) -> Result<(), ClusterError> {
        let highest = self.journal.highest_sequence(&self.owner_key).await?;
        if highest == self.sequence {
            self.needs_resync = false;
            return Ok(());
        }
        warn!(
            sequence = self.sequence,
            highest, "log moved past in-memory state; replaying"
        );
        self.recover().await
    }

    /// Handle one command.
    ///
    /// Events are appended before they are applied. If the append fails the
    /// state is untouched and the error is returned; the next command first
    /// reconciles with whatever the journal actually stored.
    #[instrument(skip(self, payload), fields(owner_key = %self.owner_key, request_id = %request_id))]
    pub async fn handle(
        &mut self,
        request_id: RequestId,
        command_type: &str,
        payload: &[u8],
    ) -> Result<Vec<u8>, ClusterError> {
        if self.status != EntityStatus::Ready {
            return Err(ClusterError::Resend {
                owner_key: self.owner_key.clone(),
            });
        }
        if self.needs_resync {
            self.resync().await?;
        }

        match self.dedup.get(&request_id) {
            Some(Some(reply)) => {
                debug!("returning cached reply for repeated request");
                return Ok(reply.clone());
            }
            Some(None) => return Err(ClusterError::DuplicateRequest { request_id }),
            None => {}
        }

        let handler = self
            .handlers
            .get(command_type)
            .ok_or_else(|| ClusterError::UnknownCommand {
                command_type: command_type.to_string(),
            })?;
        let effect = handler(&self.state, payload)?;

        if effect.events.is_empty() {
            return (effect.reply)(&self.state);
        }

        let first_sequence = self.sequence + 1;
        let mut encoded = Vec::with_capacity(effect.events.len());
        for event in &effect.events {
            encoded.push(encode(&StoredEvent {
                request_id: Some(request_id),
                event,
            })?);
        }

        self.status = EntityStatus::Persisting;
        let appended = self
            .journal
            .append_batch(&self.owner_key, first_sequence, encoded)
            .await;
        self.status = EntityStatus::Ready;
        if let Err(e) = appended {
            warn!(error = %e, sequence = first_sequence, "append failed; state unchanged");
            self.needs_resync = true;
            return Err(e);
        }

        for event in &effect.events {
            self.behavior.apply(&mut self.state, event);
        }
        self.sequence += effect.events.len() as SeqNr;
        debug!(sequence = self.sequence, events = effect.events.len(), "events applied");

        let reply = (effect.reply)(&self.state);
        self.dedup.record(request_id, reply.as_ref().ok().cloned());
        self.maybe_snapshot().await;
        reply
    }

    fn snapshot_due(&self) -> bool {
        self.settings.snapshot_every > 0
            && self.sequence - self.snapshot_sequence >= self.settings.snapshot_every
    }

    fn snapshot_payload(&self) -> Result<Vec<u8>, ClusterError> {
        encode(&SnapshotPayload {
            state: &self.state,
            recent_requests: self.dedup.ids(),
        })
    }

    /// Collect the outcome of the background snapshot write, if it is done
    /// or `wait` is set. Only a successful write moves `snapshot_sequence`.
    async fn settle_snapshot(&mut self, wait: bool) {
        let finished = match &self.snapshot_task {
            Some((_, task)) => wait || task.is_finished(),
            None => false,
        };
        if !finished {
            return;
        }
        if let Some((sequence, task)) = self.snapshot_task.take() {
            if let Ok(true) = task.await {
                self.snapshot_sequence = self.snapshot_sequence.max(sequence);
            }
        }
    }

    /// Write a snapshot in the background if enough events were applied since the last one.
    async fn maybe_snapshot(&mut self) {
        self.settle_snapshot(false).await;
        if !self.snapshot_due() || self.snapshot_task.is_some() {
            return;
        }
        let state = match self.snapshot_payload() {
            Ok(state) => state,
            Err(e) => {
                warn!(owner_key = %self.owner_key, error = %e, "failed to encode snapshot");
                return;
            }
        };
        let sequence = self.sequence;
        let journal = Arc::clone(&self.journal);
        let key = self.owner_key.clone();
        let retention = self.settings.delete_events_on_snapshot;
        let task = tokio::spawn(async move {
            write_snapshot(journal.as_ref(), &key, sequence, state, retention).await
        });
        self.snapshot_task = Some((sequence, task));
    }

    /// Flush and stop: waits for a running snapshot and writes a final one.
    #[instrument(skip(self), fields(owner_key = %self.owner_key))]
    pub async fn passivate(&mut self) {
        self.status = EntityStatus::Passivating;
        self.settle_snapshot(true).await;
        if self.settings.snapshot_every > 0 && self.sequence > self.snapshot_sequence {
            match self.snapshot_payload() {
                Ok(state) => {
                    let written = write_snapshot(
                        self.journal.as_ref(),
                        &self.owner_key,
                        self.sequence,
                        state,
                        self.settings.delete_events_on_snapshot,
                    )
                    .await;
                    if written {
                        self.snapshot_sequence = self.sequence;
                    }
                }
                Err(e) => warn!(error = %e, "failed to encode final snapshot"),
            }
        }
        self.status = EntityStatus::Stopped;
        debug!(sequence = self.sequence, "entity passivated");
    }
}

async fn write_snapshot(
    journal: &dyn EventJournal,
    owner_key: &OwnerKey,
    sequence: SeqNr,
    state: Vec<u8>,
    retention: bool,
) -> bool {
    if let Err(e) = journal.save_snapshot(owner_key, sequence, state).await {
        warn!(owner_key = %owner_key, sequence, error = %e, "snapshot write failed");
        return false;
    }
    debug!(owner_key = %owner_key, sequence, "snapshot written");
    if retention {
        if let Err(e) = journal.delete_events_up_to(owner_key, sequence).await {
            warn!(owner_key = %owner_key, sequence, error = %e, "event retention failed");
        }
    }
    true
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::storage::memory_journal::MemoryJournal;

    fn settings(snapshot_every: u64) -> EntitySettings {
        EntitySettings {
            snapshot_every,
            delete_events_on_snapshot: false,
            dedup_window: 16,
        }
    }

    fn entity(journal: &Arc<MemoryJournal>, snapshot_every: u64) -> Entity<Counter> {
        let behavior = Arc::new(Counter);
        let handlers = Arc::new(behavior.handlers());
        Entity::new(
            OwnerKey::new("U1"),
            behavior,
            handlers,
            journal.clone(),
            settings(snapshot_every),
        )
    }

    async fn send<C: Command>(e: &mut Entity<Counter>, id: i64, cmd: &C) -> Result<C::Reply, ClusterError> {
        let bytes = e.handle(RequestId(id), C::TYPE, &encode(cmd).unwrap()).await?;
        decode(&bytes)
    }

    #[tokio::test]
    async fn fresh_entity_recovers_to_default() {
        let journal = Arc::new(MemoryJournal::new());
        let mut e = entity(&journal, 0);
        assert_eq!(e.status(), EntityStatus::Recovering);
        e.recover().await.unwrap();
        assert_eq!(e.status(), EntityStatus::Ready);
        assert_eq!(*e.state(), 0);
        assert_eq!(e.sequence(), 0);
    }

    #[tokio::test]
    async fn commands_append_then_apply() {
        let journal = Arc::new(MemoryJournal::new());
        let mut e = entity(&journal, 0);
        e.recover().await.unwrap();

        assert_eq!(send(&mut e, 1, &Increment { by: 1 }).await.unwrap(), 1);
        assert_eq!(send(&mut e, 2, &Increment { by: 1 }).await.unwrap(), 2);
        assert_eq!(send(&mut e, 3, &Decrement { by: 1 }).await.unwrap(), 1);

        let seqs: Vec<_> = journal
            .events(&OwnerKey::new("U1"))
            .iter()
            .map(|e| e.sequence)
            .collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn failed_append_leaves_state_unchanged() {
        let journal = Arc::new(MemoryJournal::new());
        let mut e = entity(&journal, 0);
        e.recover().await.unwrap();
        send(&mut e, 1, &Increment { by: 5 }).await.unwrap();

        journal.fail_next_appends(1);
        let err = send(&mut e, 2, &Increment { by: 1 }).await.unwrap_err();
        assert!(matches!(err, ClusterError::PersistenceFailure { .. }));
        assert_eq!(*e.state(), 5);
        assert_eq!(e.sequence(), 1);
        assert_eq!(e.status(), EntityStatus::Ready);

        // A retry with a fresh id goes through.
        assert_eq!(send(&mut e, 3, &Increment { by: 1 }).await.unwrap(), 6);
        assert_eq!(e.sequence(), 2);
    }

    #[tokio::test]
    async fn reads_and_rejections_do_not_persist() {
        let journal = Arc::new(MemoryJournal::new());
        let mut e = entity(&journal, 0);
        e.recover().await.unwrap();

        assert_eq!(send(&mut e, 1, &Get).await.unwrap(), 0);
        let err = send(&mut e, 2, &Increment { by: -3 }).await.unwrap_err();
        assert!(matches!(err, ClusterError::Rejected { .. }));
        assert!(journal.events(&OwnerKey::new("U1")).is_empty());
    }

    #[tokio::test]
    async fn unknown_command_type() {
        let journal = Arc::new(MemoryJournal::new());
        let mut e = entity(&journal, 0);
        e.recover().await.unwrap();
        let err = e.handle(RequestId(1), "explode", &[]).await.unwrap_err();
        assert!(matches!(err, ClusterError::UnknownCommand { command_type } if command_type == "explode"));
    }

    #[tokio::test]
    async fn repeated_request_returns_cached_reply() {
        let journal = Arc::new(MemoryJournal::new());
        let mut e = entity(&journal, 0);
        e.recover().await.unwrap();

        assert_eq!(send(&mut e, 7, &Increment { by: 2 }).await.unwrap(), 2);
        assert_eq!(send(&mut e, 7, &Increment { by: 2 }).await.unwrap(), 2);
        assert_eq!(*e.state(), 2);
        assert_eq!(journal.events(&OwnerKey::new("U1")).len(), 1);
    }

    #[tokio::test]
    async fn request_seen_before_restart_is_duplicate() {
        let journal = Arc::new(MemoryJournal::new());
        let mut e = entity(&journal, 0);
        e.recover().await.unwrap();
        send(&mut e, 7, &Increment { by: 2 }).await.unwrap();

        let mut restarted = entity(&journal, 0);
        restarted.recover().await.unwrap();
        let err = send(&mut restarted, 7, &Increment { by: 2 }).await.unwrap_err();
        assert!(matches!(err, ClusterError::DuplicateRequest { request_id } if request_id == RequestId(7)));
        assert_eq!(*restarted.state(), 2);
    }

    #[tokio::test]
    async fn snapshot_replay_matches_full_replay() {
        let journal = Arc::new(MemoryJournal::new());
        let mut e = entity(&journal, 3);
        e.recover().await.unwrap();
        for i in 1..=7 {
            send(&mut e, i, &Increment { by: i }).await.unwrap();
        }
        e.passivate().await;
        let snapshot = journal.snapshot(&OwnerKey::new("U1")).unwrap();
        assert_eq!(snapshot.sequence, 7);

        let mut from_snapshot = entity(&journal, 3);
        from_snapshot.recover().await.unwrap();
        let full = full_replay(&journal).await;

        assert_eq!(from_snapshot.state(), full.state());
        assert_eq!(from_snapshot.sequence(), full.sequence());
        assert_eq!(*full.state(), 28);
    }

    /// Full replay of a copy of `journal`'s events, without snapshots.
    async fn full_replay(journal: &MemoryJournal) -> Entity<Counter> {
        let plain = Arc::new(MemoryJournal::new());
        for event in journal.events(&OwnerKey::new("U1")) {
            plain
                .append(&OwnerKey::new("U1"), event.sequence, event.payload)
                .await
                .unwrap();
        }
        let mut full = entity(&plain, 0);
        full.recover().await.unwrap();
        full
    }

    #[tokio::test]
    async fn snapshot_at_every_cut_point_matches_full_replay() {
        for cut in 0..=7 {
            let journal = Arc::new(MemoryJournal::new());
            let mut before = entity(&journal, 100);
            before.recover().await.unwrap();
            for i in 1..=cut {
                send(&mut before, i, &Increment { by: i }).await.unwrap();
            }
            // Periodic snapshots are out of reach; passivation writes the only one.
            before.passivate().await;
            let snapshot = journal.snapshot(&OwnerKey::new("U1")).map(|s| s.sequence);
            assert_eq!(snapshot, (cut > 0).then_some(cut as SeqNr), "cut {cut}");

            let mut after = entity(&journal, 100);
            after.recover().await.unwrap();
            for i in cut + 1..=7 {
                send(&mut after, i, &Increment { by: i }).await.unwrap();
            }

            let mut from_snapshot = entity(&journal, 100);
            from_snapshot.recover().await.unwrap();
            let full = full_replay(&journal).await;
            assert_eq!(from_snapshot.state(), full.state(), "cut {cut}");
            assert_eq!(from_snapshot.sequence(), full.sequence(), "cut {cut}");
            assert_eq!(*full.state(), 28, "cut {cut}");
        }
    }

    #[tokio::test]
    async fn failed_snapshot_is_retried_on_passivation() {
        let journal = Arc::new(MemoryJournal::new());
        let mut e = entity(&journal, 2);
        e.recover().await.unwrap();

        journal.set_fail_snapshots(true);
        send(&mut e, 1, &Increment { by: 1 }).await.unwrap();
        send(&mut e, 2, &Increment { by: 1 }).await.unwrap();
        // Let the background write run and fail.
        e.settle_snapshot(true).await;
        assert!(e.snapshot_task.is_none());
        assert_eq!(e.snapshot_sequence, 0);
        assert!(journal.snapshot(&OwnerKey::new("U1")).is_none());

        journal.set_fail_snapshots(false);
        e.passivate().await;
        assert_eq!(journal.snapshot(&OwnerKey::new("U1")).unwrap().sequence, 2);
        assert_eq!(e.snapshot_sequence, 2);
    }

    #[tokio::test]
    async fn failed_snapshot_is_retried_by_next_event() {
        let journal = Arc::new(MemoryJournal::new());
        let mut e = entity(&journal, 2);
        e.recover().await.unwrap();

        journal.set_fail_snapshots(true);
        send(&mut e, 1, &Increment { by: 1 }).await.unwrap();
        send(&mut e, 2, &Increment { by: 1 }).await.unwrap();
        while e.snapshot_task.as_ref().is_some_and(|(_, t)| !t.is_finished()) {
            tokio::task::yield_now().await;
        }
        journal.set_fail_snapshots(false);

        // The failed write is collected and a new one starts for sequence 3.
        send(&mut e, 3, &Increment { by: 1 }).await.unwrap();
        assert_eq!(e.snapshot_task.as_ref().map(|(seq, _)| *seq), Some(3));
        e.settle_snapshot(true).await;
        assert_eq!(e.snapshot_sequence, 3);
        assert_eq!(journal.snapshot(&OwnerKey::new("U1")).unwrap().sequence, 3);
    }

    /// Stores appends but reports the next one as failed, like a connection
    /// dropped after the write reached the store.
    struct LostAckJournal {
        inner: Arc<MemoryJournal>,
        lose_next_ack: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl EventJournal for LostAckJournal {
        async fn append_batch(
            &self,
            owner_key: &OwnerKey,
            first_sequence: SeqNr,
            events: Vec<Vec<u8>>,
        ) -> Result<(), ClusterError> {
            self.inner.append_batch(owner_key, first_sequence, events).await?;
            if self.lose_next_ack.swap(false, std::sync::atomic::Ordering::SeqCst) {
                return Err(ClusterError::PersistenceFailure {
                    reason: "connection reset before acknowledgement".into(),
                    source: None,
                });
            }
            Ok(())
        }

        fn read_from<'a>(
            &'a self,
            owner_key: &'a OwnerKey,
            from_sequence: SeqNr,
        ) -> crate::journal::EventStream<'a> {
            self.inner.read_from(owner_key, from_sequence)
        }

        async fn highest_sequence(&self, owner_key: &OwnerKey) -> Result<SeqNr, ClusterError> {
            self.inner.highest_sequence(owner_key).await
        }

        async fn save_snapshot(
            &self,
            owner_key: &OwnerKey,
            sequence: SeqNr,
            state: Vec<u8>,
        ) -> Result<(), ClusterError> {
            self.inner.save_snapshot(owner_key, sequence, state).await
        }

        async fn load_snapshot(
            &self,
            owner_key: &OwnerKey,
        ) -> Result<Option<crate::journal::SnapshotRecord>, ClusterError> {
            self.inner.load_snapshot(owner_key).await
        }

        async fn delete_events_up_to(&self, owner_key: &OwnerKey, up_to: SeqNr) -> Result<(), ClusterError> {
            self.inner.delete_events_up_to(owner_key, up_to).await
        }
    }

    #[tokio::test]
    async fn lost_append_ack_resyncs_before_next_command() {
        let store = Arc::new(MemoryJournal::new());
        let journal = Arc::new(LostAckJournal {
            inner: Arc::clone(&store),
            lose_next_ack: std::sync::atomic::AtomicBool::new(false),
        });
        let behavior = Arc::new(Counter);
        let handlers = Arc::new(behavior.handlers());
        let mut e = Entity::new(OwnerKey::new("U1"), behavior, handlers, journal.clone(), settings(0));
        e.recover().await.unwrap();
        send(&mut e, 1, &Increment { by: 5 }).await.unwrap();

        journal.lose_next_ack.store(true, std::sync::atomic::Ordering::SeqCst);
        let err = send(&mut e, 2, &Increment { by: 1 }).await.unwrap_err();
        assert!(matches!(err, ClusterError::PersistenceFailure { .. }));
        assert_eq!(*e.state(), 5);

        // The retry finds the event already in the log.
        let err = send(&mut e, 2, &Increment { by: 1 }).await.unwrap_err();
        assert!(matches!(err, ClusterError::DuplicateRequest { request_id } if request_id == RequestId(2)));
        assert_eq!(*e.state(), 6);
        assert_eq!(e.sequence(), 2);

        assert_eq!(send(&mut e, 3, &Increment { by: 1 }).await.unwrap(), 7);
        let seqs: Vec<_> = store
            .events(&OwnerKey::new("U1"))
            .iter()
            .map(|e| e.sequence)
            .collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn corrupt_log_stops_entity() {
        let journal = Arc::new(MemoryJournal::new());
        let mut e = entity(&journal, 0);
        e.recover().await.unwrap();
        send(&mut e, 1, &Increment { by: 1 }).await.unwrap();

        journal.corrupt(&OwnerKey::new("U1"));
        let mut restarted = entity(&journal, 0);
        let err = restarted.recover().await.unwrap_err();
        assert!(matches!(err, ClusterError::RecoveryFailure { .. }));
        assert_eq!(restarted.status(), EntityStatus::Stopped);

        let err = send(&mut restarted, 2, &Get).await.unwrap_err();
        assert!(matches!(err, ClusterError::Resend { .. }));
    }

    #[tokio::test]
    async fn retention_gap_without_snapshot_is_recovery_failure() {
        let journal = Arc::new(MemoryJournal::new());
        let mut e = entity(&journal, 0);
        e.recover().await.unwrap();
        for i in 1..=3 {
            send(&mut e, i, &Increment { by: 1 }).await.unwrap();
        }
        journal
            .delete_events_up_to(&OwnerKey::new("U1"), 2)
            .await
            .unwrap();

        let mut restarted = entity(&journal, 0);
        let err = restarted.recover().await.unwrap_err();
        assert!(err.to_string().contains("gap"), "got: {err}");
    }

    #[tokio::test]
    async fn stale_writer_is_fenced() {
        let journal = Arc::new(MemoryJournal::new());
        let mut old = entity(&journal, 0);
        old.recover().await.unwrap();
        let mut new = entity(&journal, 0);
        new.recover().await.unwrap();

        send(&mut new, 1, &Increment { by: 1 }).await.unwrap();
        let err = send(&mut old, 2, &Increment { by: 1 }).await.unwrap_err();
        assert!(matches!(err, ClusterError::PersistenceFailure { .. }));
        assert_eq!(*old.state(), 0);
    }

    #[test]
    fn dedup_window_evicts_oldest() {
        let mut window = DedupWindow::new(2);
        window.record(RequestId(1), None);
        window.record(RequestId(2), None);
        window.record(RequestId(3), Some(vec![1]));
        assert!(window.get(&RequestId(1)).is_none());
        assert_eq!(window.ids(), vec![RequestId(2), RequestId(3)]);
    }
}
