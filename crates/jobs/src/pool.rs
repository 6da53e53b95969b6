//! Worker slots.
//!
//! A worker is nothing more than a lease in this table. The limit is passed
//! on every acquire because the effective ceiling moves between ticks; a
//! lower ceiling never evicts running work, it only blocks new leases until
//! enough of them drop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;

use tidepool_core::TenantId;

use crate::types::{Job, JobId};

#[derive(Debug, Clone)]
struct Slot {
    owner_id: TenantId,
    payload_bytes: u64,
    cancel: CancellationToken,
}

#[derive(Debug, Default)]
struct PoolInner {
    slots: Mutex<HashMap<JobId, Slot>>,
    peak: AtomicUsize,
}

impl PoolInner {
    fn slots(&self) -> MutexGuard<'_, HashMap<JobId, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Bounded table of worker leases.
#[derive(Debug, Clone, Default)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a slot for `job` if fewer than `limit` are in use.
    pub fn try_acquire(&self, job: &Job, limit: usize) -> Option<WorkerLease> {
        let mut slots = self.inner.slots();
        if slots.len() >= limit || slots.contains_key(&job.id) {
            return None;
        }

        let cancel = CancellationToken::new();
        slots.insert(
            job.id,
            Slot {
                owner_id: job.owner_id,
                payload_bytes: job.payload_bytes,
                cancel: cancel.clone(),
            },
        );
        self.inner.peak.fetch_max(slots.len(), Ordering::Relaxed);

        Some(WorkerLease {
            pool: self.inner.clone(),
            job_id: job.id,
            cancel,
        })
    }

    pub fn active(&self) -> usize {
        self.inner.slots().len()
    }

    /// Highest number of simultaneous leases seen.
    pub fn peak(&self) -> usize {
        self.inner.peak.load(Ordering::Relaxed)
    }

    /// Leases held per owner.
    pub fn active_by_owner(&self) -> HashMap<TenantId, usize> {
        let mut counts = HashMap::new();
        for slot in self.inner.slots().values() {
            *counts.entry(slot.owner_id).or_insert(0) += 1;
        }
        counts
    }

    pub fn in_flight_payload_bytes(&self) -> u64 {
        self.inner.slots().values().map(|s| s.payload_bytes).sum()
    }

    pub fn in_flight(&self) -> Vec<JobId> {
        self.inner.slots().keys().copied().collect()
    }

    /// Signal the handler holding `job_id`. Returns false if no lease is held.
    pub fn cancel(&self, job_id: JobId) -> bool {
        match self.inner.slots().get(&job_id) {
            Some(slot) => {
                slot.cancel.cancel();
                true
            }
            None => false,
        }
    }
}

/// Exclusive right to run one job. The slot frees itself on drop.
#[derive(Debug)]
pub struct WorkerLease {
    pool: Arc<PoolInner>,
    job_id: JobId,
    cancel: CancellationToken,
}

impl WorkerLease {
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        self.pool.slots().remove(&self.job_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::JobKind;

    fn job(owner: TenantId) -> Job {
        Job::new(owner, JobKind::custom("test"), serde_json::json!({"k": "v"}))
    }

    #[test]
    fn acquire_respects_limit() {
        let pool = WorkerPool::new();
        let owner = TenantId::new();

        let a = pool.try_acquire(&job(owner), 2).unwrap();
        let _b = pool.try_acquire(&job(owner), 2).unwrap();
        assert!(pool.try_acquire(&job(owner), 2).is_none());
        assert_eq!(pool.active(), 2);

        drop(a);
        assert_eq!(pool.active(), 1);
        assert!(pool.try_acquire(&job(owner), 2).is_some());
        assert_eq!(pool.peak(), 2);
    }

    #[test]
    fn a_job_holds_at_most_one_lease() {
        let pool = WorkerPool::new();
        let j = job(TenantId::new());
        let _lease = pool.try_acquire(&j, 8).unwrap();
        assert!(pool.try_acquire(&j, 8).is_none());
    }

    #[test]
    fn tracks_owners_and_payloads() {
        let pool = WorkerPool::new();
        let (t1, t2) = (TenantId::new(), TenantId::new());
        let j1 = job(t1);
        let bytes = j1.payload_bytes;
        let _l1 = pool.try_acquire(&j1, 8).unwrap();
        let _l2 = pool.try_acquire(&job(t1), 8).unwrap();
        let _l3 = pool.try_acquire(&job(t2), 8).unwrap();

        let by_owner = pool.active_by_owner();
        assert_eq!(by_owner[&t1], 2);
        assert_eq!(by_owner[&t2], 1);
        assert_eq!(pool.in_flight_payload_bytes(), bytes * 3);
    }

    #[test]
    fn cancel_signals_the_lease_token() {
        let pool = WorkerPool::new();
        let j = job(TenantId::new());
        let lease = pool.try_acquire(&j, 1).unwrap();
        let token = lease.cancellation();

        assert!(!token.is_cancelled());
        assert!(pool.cancel(j.id));
        assert!(token.is_cancelled());

        drop(lease);
        assert!(!pool.cancel(j.id));
    }
}
