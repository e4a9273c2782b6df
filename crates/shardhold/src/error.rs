use crate::request_id::RequestId;
use crate::types::{OwnerKey, RegionAddress, ShardId};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur in the entity runtime.
///
/// Failures are scoped to a single owner key or shard; none of them is a
/// reason to take down the whole node.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// The event log for a key could not be replayed. Not retried; an
    /// operator has to repair the log and clear the failure.
    #[error("recovery failed for {owner_key}: {reason}")]
    RecoveryFailure {
        owner_key: OwnerKey,
        reason: String,
        #[source]
        source: Option<BoxError>,
    },

    /// An append or snapshot write failed. State is unchanged and the caller may retry.
    #[error("persistence failure: {reason}")]
    PersistenceFailure {
        reason: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("{shard_id} is not owned by region {region}")]
    RoutingStale {
        shard_id: ShardId,
        region: RegionAddress,
    },

    #[error("handoff of {shard_id} from {owner} timed out")]
    HandoffTimeout {
        shard_id: ShardId,
        owner: RegionAddress,
    },

    /// The caller stopped waiting. The command may still complete.
    #[error("request {request_id} timed out after {timeout_ms}ms; outcome unknown")]
    Timeout {
        request_id: RequestId,
        timeout_ms: u64,
    },

    #[error("entity {owner_key} is passivating; resend")]
    Resend { owner_key: OwnerKey },

    #[error("{shard_id} is migrating")]
    ShardMigrating { shard_id: ShardId },

    #[error("unknown command type {command_type:?}")]
    UnknownCommand { command_type: String },

    #[error("command rejected: {reason}")]
    Rejected { reason: String },

    #[error("request {request_id} was already applied")]
    DuplicateRequest { request_id: RequestId },

    #[error("malformed message: {reason}")]
    MalformedMessage {
        reason: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("region unavailable: {address}")]
    RegionUnavailable {
        address: RegionAddress,
        #[source]
        source: Option<BoxError>,
    },

    #[error("mailbox full for {owner_key}")]
    MailboxFull { owner_key: OwnerKey },

    #[error("no regions available to own {shard_id}")]
    NoRegionsAvailable { shard_id: ShardId },

    #[error("runtime is shutting down")]
    ShuttingDown,

    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },
}

impl ClusterError {
    /// Whether routing should re-resolve and try again instead of surfacing the error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClusterError::RoutingStale { .. }
                | ClusterError::RegionUnavailable { .. }
                | ClusterError::Resend { .. }
                | ClusterError::ShardMigrating { .. }
        )
    }

    pub(crate) fn persistence(
        reason: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        ClusterError::PersistenceFailure {
            reason: reason.into(),
            source: Some(Box::new(source)),
        }
    }

    pub(crate) fn malformed(
        reason: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        ClusterError::MalformedMessage {
            reason: reason.into(),
            source: Some(Box::new(source)),
        }
    }
}
