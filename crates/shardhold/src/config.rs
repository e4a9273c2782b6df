use crate::error::ClusterError;
use crate::types::RegionAddress;
use std::time::Duration;

/// Configuration for a shard region and, where hosted, the coordinator.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Address this region advertises to the rest of the cluster.
    pub region_address: RegionAddress,
    /// Number of shards in the cluster. Fixed for the cluster's lifetime. Default: 100.
    pub num_shards: u32,
    /// Idle time after which an entity is passivated. Default: 120s.
    pub entity_idle_timeout: Duration,
    /// Floor for the passivation reaper's check interval. Default: 5s.
    pub passivation_min_interval: Duration,
    /// Maximum commands queued or in flight per entity. Default: 1000.
    pub entity_mailbox_capacity: usize,
    /// How long to wait for an entity to drain and stop during passivation
    /// or shard handoff before it is cancelled. Default: 15s.
    pub entity_stop_timeout: Duration,
    /// Applied events between snapshots. 0 disables snapshots. Default: 100.
    pub snapshot_every: u64,
    /// Delete events covered by a snapshot once it is written. Default: false.
    pub delete_events_on_snapshot: bool,
    /// Recent request ids remembered per entity for duplicate detection. Default: 256.
    pub request_dedup_window: usize,
    /// Caller-side timeout for `ask`/`route`. Default: 10s.
    pub ask_timeout: Duration,
    /// Re-resolutions allowed after a stale or unavailable route. Default: 1.
    pub stale_route_retries: u32,
    /// Delay before resending a command bounced by passivation or migration. Default: 25ms.
    pub resend_backoff: Duration,
    /// How long the coordinator waits for a handoff acknowledgement before
    /// reassigning anyway. Default: 30s.
    pub handoff_timeout: Duration,
    /// Interval between coordinator rebalance rounds. Default: 10s.
    pub rebalance_interval: Duration,
    /// Shard-count difference between the most and least loaded regions
    /// tolerated before shards are moved. Default: 1.
    pub rebalance_threshold: usize,
    /// Maximum shards moved per rebalance round. Default: 3.
    pub max_simultaneous_rebalance: usize,
    /// How often a region polls the coordinator's table when it is not
    /// subscribed in-process. Default: 5s.
    pub assignment_poll_interval: Duration,
    /// Interval between health pings. Default: 5s.
    pub health_check_interval: Duration,
    /// Consecutive failed pings before a region is marked unreachable. Default: 3.
    pub health_failure_threshold: u32,
    /// Timeout for establishing a connection to another node. Default: 5s.
    pub connect_timeout: Duration,
}

impl RuntimeConfig {
    /// Validate configuration values.
    ///
    /// Checks:
    /// - `num_shards >= 1` (shard computation divides by it)
    /// - `entity_mailbox_capacity >= 1`
    /// - `max_simultaneous_rebalance >= 1`
    /// - `health_failure_threshold >= 1`
    /// - all timing fields are non-zero, except `resend_backoff`
    pub fn validate(&self) -> Result<(), ClusterError> {
        if self.num_shards < 1 {
            return Err(ClusterError::InvalidConfig {
                reason: format!("num_shards must be >= 1, got {}", self.num_shards),
            });
        }
        if self.entity_mailbox_capacity == 0 {
            return Err(ClusterError::InvalidConfig {
                reason: "entity_mailbox_capacity must be >= 1".to_string(),
            });
        }
        if self.max_simultaneous_rebalance == 0 {
            return Err(ClusterError::InvalidConfig {
                reason: "max_simultaneous_rebalance must be >= 1".to_string(),
            });
        }
        if self.health_failure_threshold == 0 {
            return Err(ClusterError::InvalidConfig {
                reason: "health_failure_threshold must be >= 1".to_string(),
            });
        }
        let durations = [
            ("entity_idle_timeout", self.entity_idle_timeout),
            ("passivation_min_interval", self.passivation_min_interval),
            ("entity_stop_timeout", self.entity_stop_timeout),
            ("ask_timeout", self.ask_timeout),
            ("handoff_timeout", self.handoff_timeout),
            ("rebalance_interval", self.rebalance_interval),
            ("assignment_poll_interval", self.assignment_poll_interval),
            ("health_check_interval", self.health_check_interval),
            ("connect_timeout", self.connect_timeout),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(ClusterError::InvalidConfig {
                    reason: format!("{name} must be > 0"),
                });
            }
        }
        Ok(())
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            region_address: RegionAddress::new("127.0.0.1", 7400),
            num_shards: 100,
            entity_idle_timeout: Duration::from_secs(120),
            passivation_min_interval: Duration::from_secs(5),
            entity_mailbox_capacity: 1000,
            entity_stop_timeout: Duration::from_secs(15),
            snapshot_every: 100,
            delete_events_on_snapshot: false,
            request_dedup_window: 256,
            ask_timeout: Duration::from_secs(10),
            stale_route_retries: 1,
            resend_backoff: Duration::from_millis(25),
            handoff_timeout: Duration::from_secs(30),
            rebalance_interval: Duration::from_secs(10),
            rebalance_threshold: 1,
            max_simultaneous_rebalance: 3,
            assignment_poll_interval: Duration::from_secs(5),
            health_check_interval: Duration::from_secs(5),
            health_failure_threshold: 3,
            connect_timeout: Duration::from_secs(5),
        }
    }
}
