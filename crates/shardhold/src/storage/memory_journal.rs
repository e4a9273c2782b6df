use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream;
use parking_lot::Mutex;

use crate::error::ClusterError;
use crate::journal::{
    sequence_conflict, EventJournal, EventStream, PersistedEvent, SeqNr, SnapshotRecord,
};
use crate::types::OwnerKey;

/// In-memory journal for tests and single-process use.
///
/// Each key's events live in an append-only arena indexed by
/// `sequence - base - 1`; retention advances `base` instead of shifting
/// sequence numbers. Faults can be injected to exercise the failure paths.
pub struct MemoryJournal {
    logs: DashMap<OwnerKey, KeyLog>,
    faults: Mutex<Faults>,
    in_flight: DashMap<OwnerKey, usize>,
    max_in_flight: AtomicUsize,
}

#[derive(Default)]
struct KeyLog {
    /// Sequence of the last deleted event.
    base: SeqNr,
    events: Vec<Vec<u8>>,
    snapshot: Option<SnapshotRecord>,
}

impl KeyLog {
    fn highest(&self) -> SeqNr {
        self.base + self.events.len() as SeqNr
    }
}

#[derive(Default)]
struct Faults {
    failing_appends: u32,
    fail_all_appends: bool,
    fail_snapshots: bool,
    corrupt: HashSet<OwnerKey>,
    append_delay: Option<Duration>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self {
            logs: DashMap::new(),
            faults: Mutex::new(Faults::default()),
            in_flight: DashMap::new(),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Fail the next `n` appends with `PersistenceFailure`.
    pub fn fail_next_appends(&self, n: u32) {
        self.faults.lock().failing_appends = n;
    }

    /// Fail every append until switched off.
    pub fn set_fail_appends(&self, fail: bool) {
        self.faults.lock().fail_all_appends = fail;
    }

    pub fn set_fail_snapshots(&self, fail: bool) {
        self.faults.lock().fail_snapshots = fail;
    }

    /// Make reads of the key's log fail as if the data were unreadable.
    pub fn corrupt(&self, owner_key: &OwnerKey) {
        self.faults.lock().corrupt.insert(owner_key.clone());
    }

    pub fn repair(&self, owner_key: &OwnerKey) {
        self.faults.lock().corrupt.remove(owner_key);
    }

    /// Delay every append, widening the window in which concurrent writers could overlap.
    pub fn set_append_delay(&self, delay: Option<Duration>) {
        self.faults.lock().append_delay = delay;
    }

    /// Highest number of appends that were ever in flight for one key at the same time.
    pub fn max_concurrent_appends_per_key(&self) -> usize {
        self.max_in_flight.load(Ordering::Acquire)
    }

    /// All stored events of a key, in order.
    pub fn events(&self, owner_key: &OwnerKey) -> Vec<PersistedEvent> {
        let Some(log) = self.logs.get(owner_key) else {
            return Vec::new();
        };
        log.events
            .iter()
            .enumerate()
            .map(|(i, payload)| PersistedEvent {
                sequence: log.base + 1 + i as SeqNr,
                payload: payload.clone(),
            })
            .collect()
    }

    pub fn snapshot(&self, owner_key: &OwnerKey) -> Option<SnapshotRecord> {
        self.logs.get(owner_key).and_then(|log| log.snapshot.clone())
    }

    fn take_append_fault(&self) -> bool {
        let mut faults = self.faults.lock();
        if faults.fail_all_appends {
            return true;
        }
        if faults.failing_appends > 0 {
            faults.failing_appends -= 1;
            return true;
        }
        false
    }

    fn enter(&self, owner_key: &OwnerKey) {
        let mut count = self.in_flight.entry(owner_key.clone()).or_insert(0);
        *count += 1;
        self.max_in_flight.fetch_max(*count, Ordering::AcqRel);
    }

    fn exit(&self, owner_key: &OwnerKey) {
        if let Some(mut count) = self.in_flight.get_mut(owner_key) {
            *count = count.saturating_sub(1);
        }
    }

    fn append_now(
        &self,
        owner_key: &OwnerKey,
        first_sequence: SeqNr,
        events: Vec<Vec<u8>>,
    ) -> Result<(), ClusterError> {
        if self.take_append_fault() {
            return Err(ClusterError::PersistenceFailure {
                reason: format!("injected append failure for {owner_key}"),
                source: None,
            });
        }
        let mut log = self.logs.entry(owner_key.clone()).or_default();
        let expected = log.highest() + 1;
        if first_sequence != expected {
            return Err(sequence_conflict(owner_key, expected, first_sequence));
        }
        log.events.extend(events);
        Ok(())
    }
}

impl Default for MemoryJournal {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventJournal for MemoryJournal {
    async fn append_batch(
        &self,
        owner_key: &OwnerKey,
        first_sequence: SeqNr,
        events: Vec<Vec<u8>>,
    ) -> Result<(), ClusterError> {
        if events.is_empty() {
            return Ok(());
        }
        self.enter(owner_key);
        let delay = self.faults.lock().append_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let result = self.append_now(owner_key, first_sequence, events);
        self.exit(owner_key);
        result
    }

    fn read_from<'a>(&'a self, owner_key: &'a OwnerKey, from_sequence: SeqNr) -> EventStream<'a> {
        if self.faults.lock().corrupt.contains(owner_key) {
            let err = ClusterError::PersistenceFailure {
                reason: format!("event log for {owner_key} is unreadable"),
                source: None,
            };
            return Box::pin(stream::iter([Err(err)]));
        }
        Box::pin(stream::unfold(from_sequence.max(1), move |sequence| async move {
            let log = self.logs.get(owner_key)?;
            let sequence = sequence.max(log.base + 1);
            let payload = log.events.get((sequence - log.base - 1) as usize)?.clone();
            Some((Ok(PersistedEvent { sequence, payload }), sequence + 1))
        }))
    }

    async fn highest_sequence(&self, owner_key: &OwnerKey) -> Result<SeqNr, ClusterError> {
        Ok(self.logs.get(owner_key).map(|l| l.highest()).unwrap_or(0))
    }

    async fn save_snapshot(
        &self,
        owner_key: &OwnerKey,
        sequence: SeqNr,
        state: Vec<u8>,
    ) -> Result<(), ClusterError> {
        if self.faults.lock().fail_snapshots {
            return Err(ClusterError::PersistenceFailure {
                reason: format!("injected snapshot failure for {owner_key}"),
                source: None,
            });
        }
        let mut log = self.logs.entry(owner_key.clone()).or_default();
        if log.snapshot.as_ref().is_some_and(|s| s.sequence > sequence) {
            return Ok(());
        }
        log.snapshot = Some(SnapshotRecord { sequence, state });
        Ok(())
    }

    async fn load_snapshot(
        &self,
        owner_key: &OwnerKey,
    ) -> Result<Option<SnapshotRecord>, ClusterError> {
        if self.faults.lock().corrupt.contains(owner_key) {
            return Err(ClusterError::PersistenceFailure {
                reason: format!("snapshot for {owner_key} is unreadable"),
                source: None,
            });
        }
        Ok(self.snapshot(owner_key))
    }

    async fn delete_events_up_to(
        &self,
        owner_key: &OwnerKey,
        up_to: SeqNr,
    ) -> Result<(), ClusterError> {
        let Some(mut log) = self.logs.get_mut(owner_key) else {
            return Ok(());
        };
        let up_to = up_to.min(log.highest());
        if up_to <= log.base {
            return Ok(());
        }
        let remove = (up_to - log.base) as usize;
        log.events.drain(..remove);
        log.base = up_to;
        Ok(())
    }
}
