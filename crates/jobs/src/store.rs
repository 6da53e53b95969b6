//! Job storage boundary and the in-memory reference store.
//!
//! Every status transition is a compare-and-swap on `(id, expected status)`
//! performed under the store's own lock, so two engines sharing a store can
//! never both claim, finish or cancel the same job.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};

use tidepool_core::{BatchId, TenantId};

use crate::types::{ClaimOrder, Job, JobError, JobId, JobStatus};

/// Job store abstraction.
pub trait JobStore: Send + Sync {
    /// Insert a new job.
    fn insert(&self, job: Job) -> Result<JobId, JobStoreError>;

    /// Get a job by ID.
    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Get a job by ID, enforcing tenant ownership.
    fn get_for_tenant(
        &self,
        tenant_id: TenantId,
        job_id: JobId,
    ) -> Result<Option<Job>, JobStoreError>;

    /// Queued jobs whose scheduled time has passed, in claim order.
    ///
    /// `after` pages through the queue: only jobs ordered strictly after it are returned.
    fn queued(
        &self,
        now: DateTime<Utc>,
        order: ClaimOrder,
        after: Option<&Job>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// Atomically move up to `max_count` of the listed jobs from queued to running.
    ///
    /// Jobs that are no longer queued (or not yet eligible) are skipped.
    fn claim_ready(
        &self,
        ids: &[JobId],
        max_count: usize,
        order: ClaimOrder,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// Return a running job to the queue without spending an attempt.
    fn release(&self, job_id: JobId) -> Result<bool, JobStoreError>;

    /// running -> done.
    fn mark_done(&self, job_id: JobId) -> Result<bool, JobStoreError>;

    /// Record a failed attempt of a running job and apply its retry policy.
    ///
    /// The retry is scheduled relative to `now`. Returns the updated job, or
    /// `None` if the job was not running.
    fn mark_failed(
        &self,
        job_id: JobId,
        error: JobError,
        retry_after: Option<Duration>,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError>;

    /// queued -> error without running the job or spending an attempt.
    fn reject(&self, job_id: JobId, error: JobError) -> Result<bool, JobStoreError>;

    /// Cancel a queued job immediately, or flag a running one for cooperative cancellation.
    fn mark_cancelled(&self, job_id: JobId, reason: JobError)
    -> Result<CancelOutcome, JobStoreError>;

    /// running -> cancelled, once the handler of a flagged job has returned.
    fn finish_cancelled(&self, job_id: JobId, reason: JobError) -> Result<bool, JobStoreError>;

    /// Put a terminally failed job back in the queue with a fresh retry budget.
    fn requeue_failed(&self, tenant_id: TenantId, job_id: JobId) -> Result<Job, JobStoreError>;

    /// Current status of each listed job. Unknown ids are omitted.
    fn dependency_statuses(
        &self,
        ids: &[JobId],
    ) -> Result<HashMap<JobId, JobStatus>, JobStoreError>;

    /// Jobs that list `job_id` in their `depends_on`.
    fn dependents(&self, job_id: JobId) -> Result<Vec<JobId>, JobStoreError>;

    /// All jobs of a batch.
    fn batch_jobs(&self, batch_id: BatchId) -> Result<Vec<Job>, JobStoreError>;

    /// Number of queued jobs, eligible or not.
    fn queue_depth(&self) -> Result<usize, JobStoreError>;

    /// Get job statistics for a tenant.
    fn stats(&self, tenant_id: TenantId) -> Result<JobStats, JobStoreError>;

    /// List jobs by status.
    fn list_by_status(
        &self,
        tenant_id: TenantId,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// Delete terminal jobs older than `older_than` or beyond the newest `keep_latest`.
    ///
    /// Jobs still listed as a dependency of a non-terminal job are kept.
    fn purge_terminal(
        &self,
        older_than: DateTime<Utc>,
        keep_latest: usize,
    ) -> Result<usize, JobStoreError>;
}

/// Result of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job was queued and is now cancelled.
    Cancelled,
    /// The job is running; its handler must observe the request.
    Requested,
    /// The job had already finished.
    AlreadyTerminal,
    NotFound,
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("tenant isolation violation")]
    TenantIsolation,
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("invalid transition for job {id}: {from:?} -> {to:?}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },
    #[error("storage error: {0}")]
    Storage(String),
}

/// Job statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub queued: usize,
    pub running: usize,
    pub done: usize,
    pub error: usize,
    pub cancelled: usize,
}

impl JobStats {
    pub fn record(&mut self, status: JobStatus) {
        match status {
            JobStatus::Queued => self.queued += 1,
            JobStatus::Running => self.running += 1,
            JobStatus::Done => self.done += 1,
            JobStatus::Error => self.error += 1,
            JobStatus::Cancelled => self.cancelled += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.queued + self.running + self.done + self.error + self.cancelled
    }
}

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<JobId, Job>,
    /// dependency -> jobs waiting on it
    dependents: HashMap<JobId, BTreeSet<JobId>>,
}

impl Inner {
    fn remove(&mut self, job_id: JobId) {
        if let Some(job) = self.jobs.remove(&job_id) {
            for dep in &job.depends_on {
                if let Some(set) = self.dependents.get_mut(dep) {
                    set.remove(&job_id);
                    if set.is_empty() {
                        self.dependents.remove(dep);
                    }
                }
            }
        }
        self.dependents.remove(&job_id);
    }

    /// Referenced by at least one job that has not finished.
    fn is_pinned(&self, job_id: JobId) -> bool {
        self.dependents.get(&job_id).is_some_and(|set| {
            set.iter()
                .filter_map(|id| self.jobs.get(id))
                .any(|job| !job.is_terminal())
        })
    }
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    inner: RwLock<Inner>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>, JobStoreError> {
        self.inner
            .read()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>, JobStoreError> {
        self.inner
            .write()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".to_string()))
    }
}

impl JobStore for InMemoryJobStore {
    fn insert(&self, job: Job) -> Result<JobId, JobStoreError> {
        let mut inner = self.write()?;
        if inner.jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        let id = job.id;
        for dep in &job.depends_on {
            inner.dependents.entry(*dep).or_default().insert(id);
        }
        inner.jobs.insert(id, job);
        Ok(id)
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.read()?.jobs.get(&job_id).cloned())
    }

    fn get_for_tenant(
        &self,
        tenant_id: TenantId,
        job_id: JobId,
    ) -> Result<Option<Job>, JobStoreError> {
        let inner = self.read()?;
        match inner.jobs.get(&job_id) {
            Some(job) if job.owner_id == tenant_id => Ok(Some(job.clone())),
            Some(_) => Err(JobStoreError::TenantIsolation),
            None => Ok(None),
        }
    }

    fn queued(
        &self,
        now: DateTime<Utc>,
        order: ClaimOrder,
        after: Option<&Job>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let inner = self.read()?;
        let mut result: Vec<_> = inner
            .jobs
            .values()
            .filter(|j| j.is_eligible(now))
            .filter(|j| after.is_none_or(|cursor| order.compare(j, cursor) == Ordering::Greater))
            .cloned()
            .collect();

        result.sort_by(|a, b| order.compare(a, b));
        result.truncate(limit);
        Ok(result)
    }

    fn claim_ready(
        &self,
        ids: &[JobId],
        max_count: usize,
        order: ClaimOrder,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobStoreError> {
        let mut inner = self.write()?;

        let mut candidates: Vec<&Job> = ids
            .iter()
            .filter_map(|id| inner.jobs.get(id))
            .filter(|j| j.is_eligible(now))
            .collect();
        candidates.sort_by(|a, b| order.compare(a, b));
        let chosen: Vec<JobId> = candidates.iter().take(max_count).map(|j| j.id).collect();

        let mut claimed = Vec::with_capacity(chosen.len());
        for id in chosen {
            if let Some(job) = inner.jobs.get_mut(&id) {
                job.mark_running(now);
                claimed.push(job.clone());
            }
        }
        Ok(claimed)
    }

    fn release(&self, job_id: JobId) -> Result<bool, JobStoreError> {
        let mut inner = self.write()?;
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or(JobStoreError::NotFound(job_id))?;
        if job.status != JobStatus::Running {
            return Ok(false);
        }
        job.release(Utc::now());
        Ok(true)
    }

    fn mark_done(&self, job_id: JobId) -> Result<bool, JobStoreError> {
        let mut inner = self.write()?;
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or(JobStoreError::NotFound(job_id))?;
        if job.status != JobStatus::Running {
            return Ok(false);
        }
        job.mark_done(Utc::now());
        Ok(true)
    }

    fn mark_failed(
        &self,
        job_id: JobId,
        error: JobError,
        retry_after: Option<Duration>,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        let mut inner = self.write()?;
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or(JobStoreError::NotFound(job_id))?;
        if job.status != JobStatus::Running {
            return Ok(None);
        }
        job.record_failure(error, retry_after, now);
        Ok(Some(job.clone()))
    }

    fn reject(&self, job_id: JobId, error: JobError) -> Result<bool, JobStoreError> {
        let mut inner = self.write()?;
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or(JobStoreError::NotFound(job_id))?;
        if job.status != JobStatus::Queued {
            return Ok(false);
        }
        job.reject(error, Utc::now());
        Ok(true)
    }

    fn mark_cancelled(
        &self,
        job_id: JobId,
        reason: JobError,
    ) -> Result<CancelOutcome, JobStoreError> {
        let mut inner = self.write()?;
        let Some(job) = inner.jobs.get_mut(&job_id) else {
            return Ok(CancelOutcome::NotFound);
        };
        match job.status {
            JobStatus::Queued => {
                job.mark_cancelled(reason, Utc::now());
                Ok(CancelOutcome::Cancelled)
            }
            JobStatus::Running => {
                job.cancel_requested = true;
                job.touch(Utc::now());
                Ok(CancelOutcome::Requested)
            }
            _ => Ok(CancelOutcome::AlreadyTerminal),
        }
    }

    fn finish_cancelled(&self, job_id: JobId, reason: JobError) -> Result<bool, JobStoreError> {
        let mut inner = self.write()?;
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or(JobStoreError::NotFound(job_id))?;
        if job.status != JobStatus::Running {
            return Ok(false);
        }
        job.mark_cancelled(reason, Utc::now());
        Ok(true)
    }

    fn requeue_failed(&self, tenant_id: TenantId, job_id: JobId) -> Result<Job, JobStoreError> {
        let mut inner = self.write()?;
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or(JobStoreError::NotFound(job_id))?;

        if job.owner_id != tenant_id {
            return Err(JobStoreError::TenantIsolation);
        }
        if job.status != JobStatus::Error {
            return Err(JobStoreError::InvalidTransition {
                id: job_id,
                from: job.status,
                to: JobStatus::Queued,
            });
        }

        job.requeue(Utc::now());
        Ok(job.clone())
    }

    fn dependency_statuses(
        &self,
        ids: &[JobId],
    ) -> Result<HashMap<JobId, JobStatus>, JobStoreError> {
        let inner = self.read()?;
        Ok(ids
            .iter()
            .filter_map(|id| inner.jobs.get(id).map(|j| (*id, j.status)))
            .collect())
    }

    fn dependents(&self, job_id: JobId) -> Result<Vec<JobId>, JobStoreError> {
        let inner = self.read()?;
        Ok(inner
            .dependents
            .get(&job_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default())
    }

    fn batch_jobs(&self, batch_id: BatchId) -> Result<Vec<Job>, JobStoreError> {
        let inner = self.read()?;
        let mut result: Vec<_> = inner
            .jobs
            .values()
            .filter(|j| j.batch_id == Some(batch_id))
            .cloned()
            .collect();
        result.sort_by_key(|j| (j.created_at, j.id));
        Ok(result)
    }

    fn queue_depth(&self) -> Result<usize, JobStoreError> {
        let inner = self.read()?;
        Ok(inner
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Queued)
            .count())
    }

    fn stats(&self, tenant_id: TenantId) -> Result<JobStats, JobStoreError> {
        let inner = self.read()?;
        let mut stats = JobStats::default();
        for job in inner.jobs.values().filter(|j| j.owner_id == tenant_id) {
            stats.record(job.status);
        }
        Ok(stats)
    }

    fn list_by_status(
        &self,
        tenant_id: TenantId,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let inner = self.read()?;
        let mut result: Vec<_> = inner
            .jobs
            .values()
            .filter(|j| j.owner_id == tenant_id && status.is_none_or(|s| j.status == s))
            .cloned()
            .collect();

        result.sort_by_key(|j| j.created_at);
        result.truncate(limit);
        Ok(result)
    }

    fn purge_terminal(
        &self,
        older_than: DateTime<Utc>,
        keep_latest: usize,
    ) -> Result<usize, JobStoreError> {
        let mut inner = self.write()?;

        let mut terminal: Vec<(DateTime<Utc>, JobId)> = inner
            .jobs
            .values()
            .filter(|j| j.is_terminal())
            .map(|j| (j.updated_at, j.id))
            .collect();
        // newest first
        terminal.sort_by(|a, b| b.cmp(a));

        let doomed: Vec<JobId> = terminal
            .iter()
            .enumerate()
            .filter(|(rank, (updated_at, _))| *rank >= keep_latest || *updated_at < older_than)
            .map(|(_, (_, id))| *id)
            .filter(|id| !inner.is_pinned(*id))
            .collect();

        for id in &doomed {
            inner.remove(*id);
        }
        Ok(doomed.len())
    }
}

impl<S: JobStore + ?Sized> JobStore for Arc<S> {
    fn insert(&self, job: Job) -> Result<JobId, JobStoreError> {
        (**self).insert(job)
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get(job_id)
    }

    fn get_for_tenant(
        &self,
        tenant_id: TenantId,
        job_id: JobId,
    ) -> Result<Option<Job>, JobStoreError> {
        (**self).get_for_tenant(tenant_id, job_id)
    }

    fn queued(
        &self,
        now: DateTime<Utc>,
        order: ClaimOrder,
        after: Option<&Job>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        (**self).queued(now, order, after, limit)
    }

    fn claim_ready(
        &self,
        ids: &[JobId],
        max_count: usize,
        order: ClaimOrder,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobStoreError> {
        (**self).claim_ready(ids, max_count, order, now)
    }

    fn release(&self, job_id: JobId) -> Result<bool, JobStoreError> {
        (**self).release(job_id)
    }

    fn mark_done(&self, job_id: JobId) -> Result<bool, JobStoreError> {
        (**self).mark_done(job_id)
    }

    fn mark_failed(
        &self,
        job_id: JobId,
        error: JobError,
        retry_after: Option<Duration>,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        (**self).mark_failed(job_id, error, retry_after, now)
    }

    fn reject(&self, job_id: JobId, error: JobError) -> Result<bool, JobStoreError> {
        (**self).reject(job_id, error)
    }

    fn mark_cancelled(
        &self,
        job_id: JobId,
        reason: JobError,
    ) -> Result<CancelOutcome, JobStoreError> {
        (**self).mark_cancelled(job_id, reason)
    }

    fn finish_cancelled(&self, job_id: JobId, reason: JobError) -> Result<bool, JobStoreError> {
        (**self).finish_cancelled(job_id, reason)
    }

    fn requeue_failed(&self, tenant_id: TenantId, job_id: JobId) -> Result<Job, JobStoreError> {
        (**self).requeue_failed(tenant_id, job_id)
    }

    fn dependency_statuses(
        &self,
        ids: &[JobId],
    ) -> Result<HashMap<JobId, JobStatus>, JobStoreError> {
        (**self).dependency_statuses(ids)
    }

    fn dependents(&self, job_id: JobId) -> Result<Vec<JobId>, JobStoreError> {
        (**self).dependents(job_id)
    }

    fn batch_jobs(&self, batch_id: BatchId) -> Result<Vec<Job>, JobStoreError> {
        (**self).batch_jobs(batch_id)
    }

    fn queue_depth(&self) -> Result<usize, JobStoreError> {
        (**self).queue_depth()
    }

    fn stats(&self, tenant_id: TenantId) -> Result<JobStats, JobStoreError> {
        (**self).stats(tenant_id)
    }

    fn list_by_status(
        &self,
        tenant_id: TenantId,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        (**self).list_by_status(tenant_id, status, limit)
    }

    fn purge_terminal(
        &self,
        older_than: DateTime<Utc>,
        keep_latest: usize,
    ) -> Result<usize, JobStoreError> {
        (**self).purge_terminal(older_than, keep_latest)
    }
}
