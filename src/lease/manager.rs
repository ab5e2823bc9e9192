//! Lease table with fencing tokens.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::model::RunId;

/// Handle proving lease ownership. Renew and release require the matching
/// token, so a worker that lost its lease cannot clobber the next holder.
#[derive(Clone, Copy, Debug)]
pub struct Lease {
    pub run_id: RunId,
    token: u64,
}

struct Entry {
    token: u64,
    expires_at: Instant,
}

/// In-memory lease table. One entry per run; acquisition is non-blocking.
pub struct LeaseManager {
    ttl: Duration,
    counter: AtomicU64,
    entries: Mutex<HashMap<RunId, Entry>>,
}

impl LeaseManager {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            counter: AtomicU64::new(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<RunId, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Tries to acquire the run's lease. Returns `None` if a live lease is
    /// held elsewhere. An expired entry is reclaimed on the spot.
    pub fn try_acquire(&self, run_id: RunId) -> Option<Lease> {
        let now = Instant::now();
        let mut entries = self.lock();
        if let Some(entry) = entries.get(&run_id) {
            if entry.expires_at > now {
                return None;
            }
        }
        let token = self.counter.fetch_add(1, Ordering::Relaxed);
        entries.insert(
            run_id,
            Entry {
                token,
                expires_at: now + self.ttl,
            },
        );
        Some(Lease { run_id, token })
    }

    /// Extends the lease by one TTL. Returns `false` if the lease was lost
    /// (expired and reclaimed, or released).
    pub fn renew(&self, lease: &Lease) -> bool {
        let mut entries = self.lock();
        match entries.get_mut(&lease.run_id) {
            Some(entry) if entry.token == lease.token => {
                entry.expires_at = Instant::now() + self.ttl;
                true
            }
            _ => false,
        }
    }

    /// Releases the lease. No-op for a stale token.
    pub fn release(&self, lease: &Lease) {
        let mut entries = self.lock();
        if let Some(entry) = entries.get(&lease.run_id) {
            if entry.token == lease.token {
                entries.remove(&lease.run_id);
            }
        }
    }

    /// Whether a live lease exists for the run.
    pub fn is_held(&self, run_id: &RunId) -> bool {
        let now = Instant::now();
        self.lock()
            .get(run_id)
            .map(|e| e.expires_at > now)
            .unwrap_or(false)
    }

    /// Removes expired entries and returns the orphaned run ids, for the
    /// reaper to schedule recovery ticks.
    pub fn reap_expired(&self) -> Vec<RunId> {
        let now = Instant::now();
        let mut entries = self.lock();
        let expired: Vec<RunId> = entries
            .iter()
            .filter(|(_, e)| e.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            entries.remove(id);
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_is_refused_while_live() {
        let mgr = LeaseManager::new(Duration::from_secs(20));
        let run = RunId::new();
        let lease = mgr.try_acquire(run).expect("first acquire");
        assert!(mgr.try_acquire(run).is_none());
        mgr.release(&lease);
        assert!(mgr.try_acquire(run).is_some());
    }

    #[test]
    fn test_expired_lease_is_reclaimable() {
        let mgr = LeaseManager::new(Duration::ZERO);
        let run = RunId::new();
        let stale = mgr.try_acquire(run).expect("first acquire");
        let fresh = mgr.try_acquire(run).expect("reclaim expired");
        // The old holder cannot renew or release over the new one.
        assert!(!mgr.renew(&stale));
        mgr.release(&stale);
        assert!(mgr.renew(&fresh) || !mgr.is_held(&run));
    }

    #[test]
    fn test_renew_extends_live_lease() {
        let mgr = LeaseManager::new(Duration::from_secs(20));
        let run = RunId::new();
        let lease = mgr.try_acquire(run).expect("acquire");
        assert!(mgr.renew(&lease));
        assert!(mgr.is_held(&run));
    }

    #[test]
    fn test_reap_returns_only_expired() {
        let short = LeaseManager::new(Duration::ZERO);
        let a = RunId::new();
        let _ = short.try_acquire(a);
        assert_eq!(short.reap_expired(), vec![a]);
        assert!(short.reap_expired().is_empty());
    }
}
