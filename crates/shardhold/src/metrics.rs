use prometheus::{IntCounter, IntGauge, Opts, Registry};

/// Prometheus metrics for one region and, where hosted, the coordinator.
pub struct RegionMetrics {
    /// Number of live entity instances.
    pub entities: IntGauge,
    /// Number of shards hosted by this region.
    pub shards: IntGauge,
    /// Generation of the latest assignment table seen.
    pub generation: IntGauge,
    /// Commands handled by local entities.
    pub commands: IntCounter,
    pub persistence_failures: IntCounter,
    pub recovery_failures: IntCounter,
    pub passivations: IntCounter,
    /// Shards handed off by this region.
    pub handoffs: IntCounter,
    /// Reassignments the coordinator made without a handoff acknowledgement.
    pub fail_open_handoffs: IntCounter,
    /// Shards moved by rebalancing.
    pub rebalanced_shards: IntCounter,
    /// Route attempts repeated after a stale, unavailable or bounced delivery.
    pub routing_retries: IntCounter,
}

impl RegionMetrics {
    /// Create metrics and register them with the given prometheus registry.
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let metrics = Self::build()?;
        registry.register(Box::new(metrics.entities.clone()))?;
        registry.register(Box::new(metrics.shards.clone()))?;
        registry.register(Box::new(metrics.generation.clone()))?;
        registry.register(Box::new(metrics.commands.clone()))?;
        registry.register(Box::new(metrics.persistence_failures.clone()))?;
        registry.register(Box::new(metrics.recovery_failures.clone()))?;
        registry.register(Box::new(metrics.passivations.clone()))?;
        registry.register(Box::new(metrics.handoffs.clone()))?;
        registry.register(Box::new(metrics.fail_open_handoffs.clone()))?;
        registry.register(Box::new(metrics.rebalanced_shards.clone()))?;
        registry.register(Box::new(metrics.routing_retries.clone()))?;
        Ok(metrics)
    }

    /// Create metrics without registering (for testing).
    pub fn unregistered() -> Self {
        Self::build().expect("valid metric names")
    }

    fn build() -> Result<Self, prometheus::Error> {
        let gauge = |name: &str, help: &str| IntGauge::with_opts(Opts::new(name, help));
        let counter = |name: &str, help: &str| IntCounter::with_opts(Opts::new(name, help));
        Ok(Self {
            entities: gauge("shardhold_entities", "Number of live entity instances")?,
            shards: gauge("shardhold_shards", "Number of shards hosted by this region")?,
            generation: gauge(
                "shardhold_assignment_generation",
                "Generation of the latest assignment table",
            )?,
            commands: counter("shardhold_commands_total", "Commands handled by local entities")?,
            persistence_failures: counter(
                "shardhold_persistence_failures_total",
                "Failed event appends",
            )?,
            recovery_failures: counter(
                "shardhold_recovery_failures_total",
                "Entities whose event log could not be replayed",
            )?,
            passivations: counter("shardhold_passivations_total", "Passivated entities")?,
            handoffs: counter("shardhold_handoffs_total", "Shards handed off by this region")?,
            fail_open_handoffs: counter(
                "shardhold_fail_open_handoffs_total",
                "Shards reassigned without a handoff acknowledgement",
            )?,
            rebalanced_shards: counter(
                "shardhold_rebalanced_shards_total",
                "Shards moved by rebalancing",
            )?,
            routing_retries: counter(
                "shardhold_routing_retries_total",
                "Route attempts repeated after a retryable failure",
            )?,
        })
    }
}
