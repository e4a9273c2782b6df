use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Custom epoch: 2025-01-01T00:00:00Z in milliseconds since Unix epoch.
const CUSTOM_EPOCH_MS: i64 = 1_735_689_600_000;

const NODE_ID_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;
const NODE_ID_SHIFT: u32 = SEQUENCE_BITS;
const TIMESTAMP_SHIFT: u32 = NODE_ID_BITS + SEQUENCE_BITS;
const SEQUENCE_MASK: i64 = (1 << SEQUENCE_BITS) - 1;

/// Largest node id that fits in the id layout.
pub const MAX_NODE_ID: u16 = (1 << NODE_ID_BITS) - 1;

/// Caller-visible identifier of one command submission.
///
/// Layout: 42-bit timestamp (ms since custom epoch), 10-bit node id, 12-bit sequence.
/// Retrying a command with the same id lets the owning entity recognise the
/// duplicate instead of executing it twice.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct RequestId(pub i64);

impl RequestId {
    /// Millisecond timestamp (Unix epoch) the id was minted at.
    pub fn timestamp_ms(self) -> i64 {
        (self.0 >> TIMESTAMP_SHIFT) + CUSTOM_EPOCH_MS
    }

    pub fn node_id(self) -> u16 {
        ((self.0 >> NODE_ID_SHIFT) & i64::from(MAX_NODE_ID)) as u16
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lock-free request id generator.
///
/// `ts_seq` packs the last timestamp (upper bits) and sequence (lower 12 bits)
/// so both advance in a single CAS. When the wall clock stalls or steps
/// backwards the generator keeps issuing ids from the last timestamp and
/// borrows the next millisecond once the sequence is exhausted, so ids stay
/// strictly increasing per generator.
pub struct RequestIdGenerator {
    node_id: u16,
    ts_seq: AtomicI64,
}

fn pack(timestamp: i64, sequence: i64) -> i64 {
    (timestamp << SEQUENCE_BITS) | sequence
}

impl RequestIdGenerator {
    /// Create a generator for the given node. Node ids above [`MAX_NODE_ID`] wrap.
    pub fn new(node_id: u16) -> Self {
        Self {
            node_id: node_id & MAX_NODE_ID,
            ts_seq: AtomicI64::new(pack(0, 0)),
        }
    }

    /// Derive a node id from an arbitrary string, e.g. a region address.
    pub fn for_node(name: &str) -> Self {
        Self::new((crate::hash::djb2_hash(name.as_bytes()) & u32::from(MAX_NODE_ID)) as u16)
    }

    fn now_ms() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(CUSTOM_EPOCH_MS)
            .max(CUSTOM_EPOCH_MS)
            - CUSTOM_EPOCH_MS
    }

    pub fn next(&self) -> RequestId {
        loop {
            let now = Self::now_ms();
            let current = self.ts_seq.load(Ordering::Acquire);
            let last_ts = current >> SEQUENCE_BITS;
            let last_seq = current & SEQUENCE_MASK;

            let (ts, seq) = if now > last_ts {
                (now, 0)
            } else if last_seq < SEQUENCE_MASK {
                (last_ts, last_seq + 1)
            } else {
                (last_ts + 1, 0)
            };

            if self
                .ts_seq
                .compare_exchange(current, pack(ts, seq), Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return RequestId(
                    (ts << TIMESTAMP_SHIFT) | (i64::from(self.node_id) << NODE_ID_SHIFT) | seq,
                );
            }
        }
    }
}
