//! # Global engine configuration.
//!
//! Provides [`EngineConfig`], the centralized settings for the control plane,
//! and [`QuotaLimits`], the admission ceilings enforced by the quota governor.
//!
//! Config is consumed once at build time: `EngineBuilder::new(config, ..)`.
//!
//! ## Sentinel values
//! - `workers = 0` → clamped to 1 by [`EngineConfig::workers_clamped`]
//! - `call_timeout = 0s` → no timeout on external calls
//! - any `QuotaLimits` count of `0` / rate of `0.0` → unlimited

use std::time::Duration;

use crate::policies::BackoffPolicy;

/// Admission ceilings, checked atomically by the quota governor.
///
/// ## Field semantics
/// - `max_parent_runs`: active (non-terminal) top-level runs per workspace
/// - `max_total_runs`: active runs per workspace, children included
/// - `max_pending_subruns`: unresolved children per parent run
/// - `*_per_sec`: token-bucket refill rates per workspace; burst equals
///   one second of refill (minimum 1 token)
#[derive(Clone, Debug)]
pub struct QuotaLimits {
    /// Active top-level runs per workspace (`0` = unlimited).
    pub max_parent_runs: u32,
    /// Active runs per workspace including children (`0` = unlimited).
    pub max_total_runs: u32,
    /// Unresolved children per parent run (`0` = unlimited).
    pub max_pending_subruns: u32,
    /// Run creations per second per workspace (`0.0` = unlimited).
    pub run_creation_per_sec: f64,
    /// Sub-run spawns per second per workspace (`0.0` = unlimited).
    pub spawn_per_sec: f64,
    /// Snapshot reads per second per workspace (`0.0` = unlimited).
    pub snapshot_per_sec: f64,
}

impl Default for QuotaLimits {
    /// Default ceilings:
    ///
    /// - `max_parent_runs = 5`
    /// - `max_total_runs = 12`
    /// - `max_pending_subruns = 4`
    /// - `run_creation_per_sec = 10.0`
    /// - `spawn_per_sec = 2.0`
    /// - `snapshot_per_sec = 18.0`
    fn default() -> Self {
        Self {
            max_parent_runs: 5,
            max_total_runs: 12,
            max_pending_subruns: 4,
            run_creation_per_sec: 10.0,
            spawn_per_sec: 2.0,
            snapshot_per_sec: 18.0,
        }
    }
}

/// Global configuration for the engine.
///
/// Defines:
/// - **Tick execution**: worker count, retry backoff, step budget
/// - **Leases**: TTL and reaper cadence
/// - **Coordination**: reconcile sweep cadence
/// - **Event system**: bus capacity for push delivery
/// - **Shutdown behavior**: grace period for graceful termination
///
/// ## Notes
/// All fields are public for flexibility. Prefer the helper accessors to
/// avoid sprinkling sentinel checks across the codebase.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Number of tick workers draining the shared queue.
    ///
    /// Clamped to a minimum of 1 by [`EngineConfig::workers_clamped`].
    pub workers: usize,

    /// Lease time-to-live. A worker that stops renewing loses the run after
    /// this long; the reaper then re-enqueues a tick for it.
    pub lease_ttl: Duration,

    /// How often the lease reaper scans for expired leases.
    pub reaper_interval: Duration,

    /// How often the coordinator re-evaluates waiting parents and timeout
    /// deadlines.
    pub reconcile_interval: Duration,

    /// Capacity of the push bus broadcast channel ring buffer.
    ///
    /// Slow subscribers that lag behind more than `bus_capacity` messages
    /// receive `Lagged` and skip older items. Minimum value is 1.
    pub bus_capacity: usize,

    /// Maximum time to wait for in-flight ticks to finish on shutdown before
    /// aborting them.
    pub grace: Duration,

    /// Backoff applied when a busy tick is re-enqueued. Jitter is part of
    /// the policy itself.
    pub tick_retry: BackoffPolicy,

    /// Timeout for one model or tool invocation.
    ///
    /// - `Duration::ZERO` = no timeout
    /// - `> 0` = applied per call
    pub call_timeout: Duration,

    /// Default step budget for new runs; exceeding it fails the run.
    pub max_steps: u64,

    /// Admission ceilings.
    pub quota: QuotaLimits,
}

impl EngineConfig {
    /// Worker count clamped to a minimum of 1.
    #[inline]
    pub fn workers_clamped(&self) -> usize {
        self.workers.max(1)
    }

    /// Per-call timeout as an `Option`.
    ///
    /// - `None` → no timeout
    /// - `Some(d)` → timeout applied per call
    #[inline]
    pub fn call_timeout_opt(&self) -> Option<Duration> {
        if self.call_timeout == Duration::ZERO {
            None
        } else {
            Some(self.call_timeout)
        }
    }

    /// Bus capacity clamped to a minimum of 1.
    #[inline]
    pub fn bus_capacity_clamped(&self) -> usize {
        self.bus_capacity.max(1)
    }

    /// Interval at which a held lease should be renewed: half the TTL,
    /// minimum 1s.
    #[inline]
    pub fn lease_renew_interval(&self) -> Duration {
        (self.lease_ttl / 2).max(Duration::from_secs(1))
    }
}

impl Default for EngineConfig {
    /// Default configuration:
    ///
    /// - `workers = 4`
    /// - `lease_ttl = 20s`, `reaper_interval = 5s`
    /// - `reconcile_interval = 1s`
    /// - `bus_capacity = 1024`
    /// - `grace = 30s`
    /// - `tick_retry = BackoffPolicy::default()`
    /// - `call_timeout = 60s`
    /// - `max_steps = 80`
    /// - `quota = QuotaLimits::default()`
    fn default() -> Self {
        Self {
            workers: 4,
            lease_ttl: Duration::from_secs(20),
            reaper_interval: Duration::from_secs(5),
            reconcile_interval: Duration::from_secs(1),
            bus_capacity: 1024,
            grace: Duration::from_secs(30),
            tick_retry: BackoffPolicy::default(),
            call_timeout: Duration::from_secs(60),
            max_steps: 80,
            quota: QuotaLimits::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinels() {
        let mut cfg = EngineConfig::default();
        cfg.workers = 0;
        cfg.call_timeout = Duration::ZERO;
        cfg.bus_capacity = 0;
        assert_eq!(cfg.workers_clamped(), 1);
        assert_eq!(cfg.call_timeout_opt(), None);
        assert_eq!(cfg.bus_capacity_clamped(), 1);
    }

    #[test]
    fn renew_interval_is_half_ttl() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.lease_renew_interval(), Duration::from_secs(10));
    }
}
