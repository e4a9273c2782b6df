//! Durable log store: per-key append-only event logs plus latest snapshots.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::error::ClusterError;
use crate::types::OwnerKey;

/// Per-key event sequence number. The first event of a key is 1; 0 means
/// "nothing persisted yet".
pub type SeqNr = u64;

/// One event as stored in the journal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedEvent {
    pub sequence: SeqNr,
    pub payload: Vec<u8>,
}

/// Latest materialized state of a key and the sequence it covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub sequence: SeqNr,
    pub state: Vec<u8>,
}

/// Lazy, finite, forward-ordered stream of events for one key.
pub type EventStream<'a> = Pin<Box<dyn Stream<Item = Result<PersistedEvent, ClusterError>> + Send + 'a>>;

/// Storage backend for entity events and snapshots.
///
/// Appends are ordered per key: a write at sequence `N + 1` is only accepted
/// when `N` is the highest durable sequence. Anything else fails with
/// `PersistenceFailure`, which also fences a writer whose view of the log is
/// stale. Success is returned only once the write is stable.
#[async_trait]
pub trait EventJournal: Send + Sync {
    /// Append one event at `sequence`.
    async fn append(
        &self,
        owner_key: &OwnerKey,
        sequence: SeqNr,
        event: Vec<u8>,
    ) -> Result<(), ClusterError> {
        self.append_batch(owner_key, sequence, vec![event]).await
    }

    /// Append events at `first_sequence`, `first_sequence + 1`, ... atomically:
    /// either all of them become durable or none do.
    async fn append_batch(
        &self,
        owner_key: &OwnerKey,
        first_sequence: SeqNr,
        events: Vec<Vec<u8>>,
    ) -> Result<(), ClusterError>;

    /// Read events with `sequence >= from_sequence` in increasing order.
    ///
    /// Restartable: calling again with the same or another offset reads the
    /// log afresh.
    fn read_from<'a>(&'a self, owner_key: &'a OwnerKey, from_sequence: SeqNr) -> EventStream<'a>;

    /// Highest durable sequence for the key, 0 if none.
    async fn highest_sequence(&self, owner_key: &OwnerKey) -> Result<SeqNr, ClusterError>;

    /// Store a snapshot. A snapshot older than the stored one is ignored.
    async fn save_snapshot(
        &self,
        owner_key: &OwnerKey,
        sequence: SeqNr,
        state: Vec<u8>,
    ) -> Result<(), ClusterError>;

    async fn load_snapshot(
        &self,
        owner_key: &OwnerKey,
    ) -> Result<Option<SnapshotRecord>, ClusterError>;

    /// Remove events with `sequence <= up_to`. The highest sequence is
    /// unaffected, so later appends keep counting from it.
    async fn delete_events_up_to(
        &self,
        owner_key: &OwnerKey,
        up_to: SeqNr,
    ) -> Result<(), ClusterError>;
}

/// Error for an append whose sequence does not follow the stored log.
pub(crate) fn sequence_conflict(owner_key: &OwnerKey, expected: SeqNr, got: SeqNr) -> ClusterError {
    ClusterError::PersistenceFailure {
        reason: format!(
            "sequence conflict for {owner_key}: expected {expected}, got {got}"
        ),
        source: None,
    }
}
