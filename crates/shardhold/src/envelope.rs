use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ClusterError;
use crate::hash::shard_for_key;
use crate::request_id::RequestId;
use crate::types::{OwnerKey, ShardId};

/// A typed command understood by some entity behavior.
///
/// `TYPE` is the dispatch tag carried on the wire; the handler table of the
/// behavior maps it back to a handler.
pub trait Command: Serialize + DeserializeOwned + Send + 'static {
    const TYPE: &'static str;
    type Reply: Serialize + DeserializeOwned + Send + 'static;
}

/// Tagged command as it arrives from an external caller.
///
/// The runtime routes purely on `owner_key` and dispatches on `command_type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundCommand {
    pub owner_key: OwnerKey,
    pub command_type: String,
    /// MessagePack-encoded command body.
    #[serde(default)]
    pub payload: Vec<u8>,
    /// Caller-chosen id for idempotent retries. A fresh id is minted when absent.
    #[serde(default)]
    pub request_id: Option<RequestId>,
}

/// A command envelope travelling between regions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub request_id: RequestId,
    pub owner_key: OwnerKey,
    pub shard_id: ShardId,
    pub command_type: String,
    /// MessagePack-encoded command body.
    pub payload: Vec<u8>,
}

impl CommandEnvelope {
    /// Build an envelope, computing the shard from the owner key.
    pub fn new(
        request_id: RequestId,
        owner_key: OwnerKey,
        command_type: impl Into<String>,
        payload: Vec<u8>,
        num_shards: u32,
    ) -> Self {
        let shard_id = shard_for_key(&owner_key, num_shards);
        Self {
            request_id,
            owner_key,
            shard_id,
            command_type: command_type.into(),
            payload,
        }
    }

    /// Build an envelope for a typed command.
    pub fn for_command<C: Command>(
        request_id: RequestId,
        owner_key: OwnerKey,
        command: &C,
        num_shards: u32,
    ) -> Result<Self, ClusterError> {
        let payload = encode(command)?;
        Ok(Self::new(request_id, owner_key, C::TYPE, payload, num_shards))
    }
}

/// Encode a value as MessagePack.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, ClusterError> {
    rmp_serde::to_vec(value).map_err(|e| ClusterError::malformed("failed to encode value", e))
}

/// Decode a MessagePack value.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ClusterError> {
    rmp_serde::from_slice(bytes).map_err(|e| ClusterError::malformed("failed to decode value", e))
}
