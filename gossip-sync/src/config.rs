//! Configuration for the gossip sync control plane.
//!
//! Everything here is immutable once a [`GossipController`] has been built.
//! The snarf thresholds deliberately have no production default: they depend
//! on the intake pipeline's sizing and must be supplied by the operator.
//!
//! [`GossipController`]: crate::controller::GossipController

use {
    crate::error::{GossipSyncError, Result},
    std::time::Duration,
};

/// How the permit pool capacity is determined.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PermitCapacity {
    /// A fixed number of concurrent exchanges.
    Fixed(usize),
    /// One permit per configured neighbor.
    OnePerPeer,
}

/// Policy deciding when the set of fallen-behind reports means *we* are behind.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FallenBehindThreshold {
    /// A single report is enough.
    AnyPeer,
    /// At least this many distinct peers must report.
    MinPeers(usize),
    /// Strictly more than this fraction of all neighbors must report.
    FractionOfNeighbors(f64),
}

/// Piecewise-linear mapping from intake backlog to permits held idle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnarfConfig {
    /// At or below this backlog no permits are snarfed.
    pub lower_threshold: usize,
    /// At or above this backlog `max_snarf` permits are snarfed.
    pub upper_threshold: usize,
    /// Maximum number of permits the snarfer will hold.
    pub max_snarf: usize,
    /// Minimum period between snarfer ticks (ms).
    pub poll_period_ms: u64,
}

impl SnarfConfig {
    pub fn poll_period(&self) -> Duration {
        Duration::from_millis(self.poll_period_ms)
    }
}

/// Configuration for the gossip sync control plane.
#[derive(Debug, Clone)]
pub struct GossipSyncConfig {
    /// Size of the permit pool.
    pub permit_capacity: PermitCapacity,

    /// Backpressure thresholds for the permit snarfer.
    pub snarf: SnarfConfig,

    /// Rate (permits per second) at which suspension pressure decays.
    pub suspension_decay_rate: f64,

    /// Upper bound on a single wait inside the pool drain loop (ms).
    pub drain_poll_interval_ms: u64,

    /// How long a worker sleeps when it found nothing to do (ms).
    pub idle_sleep_ms: u64,

    /// Consecutive failures with a peer before the worker backs off.
    pub consecutive_failures_before_sleep: u32,

    /// Back-off applied after too many consecutive failures (ms).
    pub failure_sleep_ms: u64,

    /// Syncs are skipped while the intake backlog is at or above this depth.
    pub sync_throttle_backlog: usize,

    /// Interval between heartbeats to a single peer (ms).
    pub heartbeat_period_ms: u64,

    /// When the node considers itself fallen behind.
    pub fallen_behind_threshold: FallenBehindThreshold,

    /// First delay after a failed reconnect (ms). Doubles per failure.
    pub reconnect_backoff_min_ms: u64,

    /// Ceiling for the reconnect back-off (ms).
    pub reconnect_backoff_max_ms: u64,

    /// Consecutive failed reconnects before the node reports it is stuck.
    pub max_reconnect_failures: u32,
}

impl GossipSyncConfig {
    /// Build a config with the required inputs and defaults for everything
    /// else.
    pub fn new(permit_capacity: PermitCapacity, snarf: SnarfConfig) -> Self {
        Self {
            permit_capacity,
            snarf,
            suspension_decay_rate: 1.0,
            drain_poll_interval_ms: 10,
            idle_sleep_ms: 25,
            consecutive_failures_before_sleep: 3,
            failure_sleep_ms: 1_000,
            sync_throttle_backlog: 10_000,
            heartbeat_period_ms: 1_000,
            fallen_behind_threshold: FallenBehindThreshold::FractionOfNeighbors(0.5),
            reconnect_backoff_min_ms: 1_000,
            reconnect_backoff_max_ms: 60_000,
            max_reconnect_failures: 10,
        }
    }

    /// Create a config suitable for tests, with short sleeps everywhere.
    #[cfg(any(test, feature = "dev-context-only-utils"))]
    pub fn dev_default() -> Self {
        Self {
            permit_capacity: PermitCapacity::Fixed(4),
            snarf: SnarfConfig {
                lower_threshold: 500,
                upper_threshold: 2_000,
                max_snarf: 2,
                poll_period_ms: 5,
            },
            suspension_decay_rate: 2.0,
            drain_poll_interval_ms: 2,
            idle_sleep_ms: 2,
            consecutive_failures_before_sleep: 3,
            failure_sleep_ms: 20,
            sync_throttle_backlog: 1_000,
            heartbeat_period_ms: 50,
            fallen_behind_threshold: FallenBehindThreshold::AnyPeer,
            reconnect_backoff_min_ms: 0,
            reconnect_backoff_max_ms: 0,
            max_reconnect_failures: 3,
        }
    }

    /// Resolve the pool capacity for a node with `num_peers` neighbors.
    ///
    /// A node with no neighbors still gets a single permit under
    /// [`PermitCapacity::OnePerPeer`].
    pub fn resolved_capacity(&self, num_peers: usize) -> usize {
        match self.permit_capacity {
            PermitCapacity::Fixed(capacity) => capacity,
            PermitCapacity::OnePerPeer => num_peers.max(1),
        }
    }

    /// Reject configurations the control plane cannot run with.
    pub fn validate(&self) -> Result<()> {
        if let PermitCapacity::Fixed(0) = self.permit_capacity {
            return Err(invalid("permit capacity must be positive"));
        }
        if self.suspension_decay_rate.is_nan() || self.suspension_decay_rate <= 0.0 {
            return Err(invalid(format!(
                "suspension decay rate must be positive, got {}",
                self.suspension_decay_rate
            )));
        }
        if self.snarf.lower_threshold >= self.snarf.upper_threshold {
            return Err(invalid(format!(
                "snarf lower threshold {} must be below upper threshold {}",
                self.snarf.lower_threshold, self.snarf.upper_threshold
            )));
        }
        if self.snarf.poll_period_ms == 0 {
            return Err(invalid("snarf poll period must be positive"));
        }
        if self.drain_poll_interval_ms == 0 {
            return Err(invalid("drain poll interval must be positive"));
        }
        match self.fallen_behind_threshold {
            FallenBehindThreshold::MinPeers(0) => {
                return Err(invalid("fallen-behind peer minimum must be positive"));
            }
            FallenBehindThreshold::FractionOfNeighbors(f) if !(0.0..1.0).contains(&f) => {
                return Err(invalid(format!(
                    "fallen-behind fraction must be in [0, 1), got {f}"
                )));
            }
            _ => {}
        }
        if self.reconnect_backoff_min_ms > self.reconnect_backoff_max_ms {
            return Err(invalid("reconnect back-off minimum exceeds maximum"));
        }
        Ok(())
    }

    pub fn drain_poll_interval(&self) -> Duration {
        Duration::from_millis(self.drain_poll_interval_ms)
    }

    pub fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.idle_sleep_ms)
    }

    pub fn failure_sleep(&self) -> Duration {
        Duration::from_millis(self.failure_sleep_ms)
    }

    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_millis(self.heartbeat_period_ms)
    }

    pub fn reconnect_backoff_min(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_min_ms)
    }

    pub fn reconnect_backoff_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_max_ms)
    }
}

fn invalid(reason: impl Into<String>) -> GossipSyncError {
    GossipSyncError::InvalidConfig(reason.into())
}
