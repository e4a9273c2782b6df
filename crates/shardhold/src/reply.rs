use serde::{Deserialize, Serialize};

use crate::error::ClusterError;
use crate::request_id::RequestId;
use crate::types::{OwnerKey, RegionAddress, ShardId};

/// Outcome of a routed command, as seen by the external caller.
///
/// Serialized as `{"success": <bytes>}` or `{"failure": {"kind": ..., ...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reply {
    Success(Vec<u8>),
    Failure(Failure),
}

impl Reply {
    pub fn into_result(self) -> Result<Vec<u8>, ClusterError> {
        match self {
            Reply::Success(bytes) => Ok(bytes),
            Reply::Failure(failure) => Err(failure.into()),
        }
    }
}

impl From<Result<Vec<u8>, ClusterError>> for Reply {
    fn from(result: Result<Vec<u8>, ClusterError>) -> Self {
        match result {
            Ok(bytes) => Reply::Success(bytes),
            Err(err) => Reply::Failure(Failure::from(&err)),
        }
    }
}

/// Wire form of [`ClusterError`]. Everything but the error source survives
/// the trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Failure {
    RecoveryFailure { owner_key: OwnerKey, reason: String },
    PersistenceFailure { reason: String },
    RoutingStale { shard_id: ShardId, region: RegionAddress },
    HandoffTimeout { shard_id: ShardId, owner: RegionAddress },
    Timeout { request_id: RequestId, timeout_ms: u64 },
    Resend { owner_key: OwnerKey },
    ShardMigrating { shard_id: ShardId },
    UnknownCommand { command_type: String },
    Rejected { reason: String },
    DuplicateRequest { request_id: RequestId },
    MalformedMessage { reason: String },
    RegionUnavailable { address: RegionAddress },
    MailboxFull { owner_key: OwnerKey },
    NoRegionsAvailable { shard_id: ShardId },
    ShuttingDown,
    InvalidConfig { reason: String },
}

impl From<&ClusterError> for Failure {
    fn from(err: &ClusterError) -> Self {
        match err {
            ClusterError::RecoveryFailure {
                owner_key, reason, ..
            } => Failure::RecoveryFailure {
                owner_key: owner_key.clone(),
                reason: reason.clone(),
            },
            ClusterError::PersistenceFailure { reason, .. } => Failure::PersistenceFailure {
                reason: reason.clone(),
            },
            ClusterError::RoutingStale { shard_id, region } => Failure::RoutingStale {
                shard_id: *shard_id,
                region: region.clone(),
            },
            ClusterError::HandoffTimeout { shard_id, owner } => Failure::HandoffTimeout {
                shard_id: *shard_id,
                owner: owner.clone(),
            },
            ClusterError::Timeout {
                request_id,
                timeout_ms,
            } => Failure::Timeout {
                request_id: *request_id,
                timeout_ms: *timeout_ms,
            },
            ClusterError::Resend { owner_key } => Failure::Resend {
                owner_key: owner_key.clone(),
            },
            ClusterError::ShardMigrating { shard_id } => Failure::ShardMigrating {
                shard_id: *shard_id,
            },
            ClusterError::UnknownCommand { command_type } => Failure::UnknownCommand {
                command_type: command_type.clone(),
            },
            ClusterError::Rejected { reason } => Failure::Rejected {
                reason: reason.clone(),
            },
            ClusterError::DuplicateRequest { request_id } => Failure::DuplicateRequest {
                request_id: *request_id,
            },
            ClusterError::MalformedMessage { reason, .. } => Failure::MalformedMessage {
                reason: reason.clone(),
            },
            ClusterError::RegionUnavailable { address, .. } => Failure::RegionUnavailable {
                address: address.clone(),
            },
            ClusterError::MailboxFull { owner_key } => Failure::MailboxFull {
                owner_key: owner_key.clone(),
            },
            ClusterError::NoRegionsAvailable { shard_id } => Failure::NoRegionsAvailable {
                shard_id: *shard_id,
            },
            ClusterError::ShuttingDown => Failure::ShuttingDown,
            ClusterError::InvalidConfig { reason } => Failure::InvalidConfig {
                reason: reason.clone(),
            },
        }
    }
}

impl From<Failure> for ClusterError {
    fn from(failure: Failure) -> Self {
        match failure {
            Failure::RecoveryFailure { owner_key, reason } => ClusterError::RecoveryFailure {
                owner_key,
                reason,
                source: None,
            },
            Failure::PersistenceFailure { reason } => ClusterError::PersistenceFailure {
                reason,
                source: None,
            },
            Failure::RoutingStale { shard_id, region } => {
                ClusterError::RoutingStale { shard_id, region }
            }
            Failure::HandoffTimeout { shard_id, owner } => {
                ClusterError::HandoffTimeout { shard_id, owner }
            }
            Failure::Timeout {
                request_id,
                timeout_ms,
            } => ClusterError::Timeout {
                request_id,
                timeout_ms,
            },
            Failure::Resend { owner_key } => ClusterError::Resend { owner_key },
            Failure::ShardMigrating { shard_id } => ClusterError::ShardMigrating { shard_id },
            Failure::UnknownCommand { command_type } => {
                ClusterError::UnknownCommand { command_type }
            }
            Failure::Rejected { reason } => ClusterError::Rejected { reason },
            Failure::DuplicateRequest { request_id } => {
                ClusterError::DuplicateRequest { request_id }
            }
            Failure::MalformedMessage { reason } => ClusterError::MalformedMessage {
                reason,
                source: None,
            },
            Failure::RegionUnavailable { address } => ClusterError::RegionUnavailable {
                address,
                source: None,
            },
            Failure::MailboxFull { owner_key } => ClusterError::MailboxFull { owner_key },
            Failure::NoRegionsAvailable { shard_id } => {
                ClusterError::NoRegionsAvailable { shard_id }
            }
            Failure::ShuttingDown => ClusterError::ShuttingDown,
            Failure::InvalidConfig { reason } => ClusterError::InvalidConfig { reason },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_reply_json_shape() {
        let reply = Reply::Success(vec![1, 2]);
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json, serde_json::json!({ "success": [1, 2] }));
    }

    #[test]
    fn failure_reply_json_shape() {
        let reply = Reply::Failure(Failure::PersistenceFailure {
            reason: "disk full".into(),
        });
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "failure": { "kind": "persistence_failure", "reason": "disk full" }
            })
        );
    }

    #[test]
    fn failure_survives_msgpack() {
        let reply = Reply::Failure(Failure::RoutingStale {
            shard_id: ShardId::new(3),
            region: RegionAddress::new("node-b", 7400),
        });
        let bytes = rmp_serde::to_vec(&reply).unwrap();
        let decoded: Reply = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(decoded, reply);
    }

    #[test]
    fn error_to_failure_and_back_keeps_fields() {
        let err = ClusterError::RecoveryFailure {
            owner_key: OwnerKey::new("U9"),
            reason: "gap at sequence 4".into(),
            source: Some(Box::new(std::io::Error::new(
                std::io::ErrorKind::Other,
                "inner",
            ))),
        };
        let back = ClusterError::from(Failure::from(&err));
        assert_eq!(back.to_string(), err.to_string());
        assert!(matches!(back, ClusterError::RecoveryFailure { .. }));
    }

    #[test]
    fn into_result_maps_failure() {
        let reply = Reply::from(Err::<Vec<u8>, _>(ClusterError::ShuttingDown));
        assert!(matches!(reply.into_result(), Err(ClusterError::ShuttingDown)));
    }
}
