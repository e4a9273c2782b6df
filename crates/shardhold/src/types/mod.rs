mod owner_key;
mod region_address;
mod shard_id;

pub use owner_key::OwnerKey;
pub use region_address::{ParseRegionAddressError, RegionAddress};
pub use shard_id::ShardId;
