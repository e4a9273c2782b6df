use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Network address of a shard region (host:port).
///
/// Ordering is used as the final deterministic tie-break by allocation
/// strategies.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct RegionAddress {
    pub host: String,
    pub port: u16,
}

impl RegionAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for RegionAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Error returned when parsing a `host:port` string fails.
#[derive(Debug, thiserror::Error)]
#[error("invalid region address {input:?}: expected host:port")]
pub struct ParseRegionAddressError {
    input: String,
}

impl FromStr for RegionAddress {
    type Err = ParseRegionAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseRegionAddressError {
            input: s.to_string(),
        };
        let (host, port) = s.rsplit_once(':').ok_or_else(err)?;
        if host.is_empty() {
            return Err(err());
        }
        let port = port.parse::<u16>().map_err(|_| err())?;
        Ok(Self::new(host, port))
    }
}
