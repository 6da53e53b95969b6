//! Parallel execution engine.
//!
//! A scheduling tick resolves readiness, applies the concurrency ceiling and
//! the per-owner cap, claims jobs from the store in rounds and hands each to
//! its own Tokio task. The handler runs in a nested task so a panic or a hard
//! timeout only affects that job; the supervising task records the outcome
//! and then drops the worker lease.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use tidepool_core::{BatchId, DomainError, TenantId};

use crate::alerts::{Alert, AlertEvaluator, AlertRule, AlertSink, TracingAlertSink};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::handler::{HandlerError, HandlerRegistry, JobContext, JobHandler};
use crate::pool::{WorkerLease, WorkerPool};
use crate::resolver::{DependencyResolver, cascade_cancel};
use crate::resources::{MemorySampler, ProcessMemorySampler, ResourceMonitor, ResourceObservation};
use crate::scaling::{LoadObservation, ScalingController, ScalingDecision};
use crate::store::{CancelOutcome, JobStats, JobStore};
use crate::telemetry::{AttemptOutcome, EngineMetrics, MetricsSnapshot};
use crate::types::{ClaimOrder, FailureClass, Job, JobError, JobId, JobStatus};

/// What one scheduling tick did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    /// min(scaling ceiling, resource ceiling, max_workers)
    pub effective_limit: usize,
    pub owner_cap: usize,
    pub claimed: usize,
    pub dispatched: usize,
    /// Claimed but no free slot; returned to the queue
    pub released: usize,
    /// Failed at claim time (payload too large, no handler)
    pub rejected: Vec<JobId>,
    /// Cancelled because a prerequisite failed
    pub cancelled: Vec<JobId>,
    /// Ready but skipped because the owner is at its cap
    pub deferred: usize,
    /// Dispatched past the owner cap into slots no other owner could use
    pub lent: usize,
    /// Queued jobs inspected across all pages
    pub scanned: usize,
    pub stuck: usize,
}

/// Operator-facing summary of the engine's limits and load.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub in_flight: usize,
    pub peak_concurrency: usize,
    pub scaling_ceiling: usize,
    pub resource_ceiling: usize,
    pub effective_limit: usize,
    pub queue_depth: usize,
    pub stuck_jobs: usize,
    pub circuit_open: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CancelReport {
    pub cancelled: Vec<JobId>,
    /// Running jobs signalled to stop
    pub requested: Vec<JobId>,
    pub already_terminal: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchProgress {
    pub batch_id: BatchId,
    pub total: usize,
    pub queued: usize,
    pub running: usize,
    pub done: usize,
    pub error: usize,
    pub cancelled: usize,
    /// Share of jobs in a terminal state
    pub finished_ratio: f64,
}

/// Claim state shared by every page of one tick.
struct ClaimRound {
    limit: usize,
    owner_cap: usize,
    now_utc: DateTime<Utc>,
    owner_counts: HashMap<TenantId, usize>,
    /// Ready jobs skipped because their owner was at its cap
    deferred: Vec<Job>,
}

enum Execution {
    Finished(Result<(), HandlerError>),
    TimedOut,
    Panicked(String),
}

struct EngineInner<S> {
    store: S,
    config: EngineConfig,
    order: ClaimOrder,
    handlers: HandlerRegistry,
    pool: WorkerPool,
    resolver: Mutex<DependencyResolver>,
    resources: ResourceMonitor,
    scaling: ScalingController,
    metrics: EngineMetrics,
    alerts: AlertEvaluator,
    memory: Arc<dyn MemorySampler>,
    clock: SchedulerClock,
}

/// Background job engine. Cheap to clone; clones share all state.
pub struct Engine<S: JobStore + 'static> {
    inner: Arc<EngineInner<S>>,
}

impl<S: JobStore + 'static> Clone for Engine<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: JobStore + 'static> std::fmt::Debug for Engine<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.inner.config)
            .field("handlers", &self.inner.handlers)
            .field("in_flight", &self.inner.pool.active())
            .finish_non_exhaustive()
    }
}

/// Builder for [`Engine`].
pub struct EngineBuilder<S> {
    store: S,
    config: EngineConfig,
    order: ClaimOrder,
    handlers: HandlerRegistry,
    alert_rules: Option<Vec<AlertRule>>,
    alert_sink: Arc<dyn AlertSink>,
    memory: Arc<dyn MemorySampler>,
}

impl<S: JobStore + 'static> EngineBuilder<S> {
    pub fn handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = handlers;
        self
    }

    /// Register a handler for a job kind pattern.
    pub fn handler(mut self, pattern: impl Into<String>, handler: impl JobHandler + 'static) -> Self {
        self.handlers.register(pattern, handler);
        self
    }

    pub fn claim_order(mut self, order: ClaimOrder) -> Self {
        self.order = order;
        self
    }

    pub fn alert_rules(mut self, rules: Vec<AlertRule>) -> Self {
        self.alert_rules = Some(rules);
        self
    }

    pub fn alert_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.alert_sink = sink;
        self
    }

    pub fn memory_sampler(mut self, sampler: Arc<dyn MemorySampler>) -> Self {
        self.memory = sampler;
        self
    }

    pub fn build(self) -> EngineResult<Engine<S>> {
        self.config.validate()?;
        if self.handlers.is_empty() {
            warn!("engine built without handlers; every job will be rejected");
        }

        let rules = self
            .alert_rules
            .unwrap_or_else(|| AlertRule::defaults(&self.config));
        let inner = EngineInner {
            resolver: Mutex::new(DependencyResolver::new(self.config.readiness_ttl())),
            resources: ResourceMonitor::new(&self.config),
            scaling: ScalingController::new(&self.config),
            metrics: EngineMetrics::new(self.config.metrics_window()),
            alerts: AlertEvaluator::new(rules, self.alert_sink),
            pool: WorkerPool::new(),
            memory: self.memory,
            clock: SchedulerClock::start(),
            store: self.store,
            order: self.order,
            handlers: self.handlers,
            config: self.config,
        };
        Ok(Engine {
            inner: Arc::new(inner),
        })
    }
}

/// Engine clock. Follows Tokio's clock so paused-time tests drive every loop.
fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

/// Wall-clock time as the scheduler sees it: the start time advanced by the
/// engine clock, never behind the system clock. Claim eligibility and retry
/// backoff are both measured against it.
#[derive(Debug, Clone, Copy)]
struct SchedulerClock {
    origin: Instant,
    origin_utc: DateTime<Utc>,
}

impl SchedulerClock {
    fn start() -> Self {
        Self {
            origin: now(),
            origin_utc: Utc::now(),
        }
    }

    fn now_utc(&self) -> DateTime<Utc> {
        let elapsed = now().saturating_duration_since(self.origin);
        let driven = self.origin_utc + chrono::Duration::from_std(elapsed).unwrap_or_default();
        driven.max(Utc::now())
    }
}

impl<S: JobStore + 'static> Engine<S> {
    pub fn builder(store: S, config: EngineConfig) -> EngineBuilder<S> {
        EngineBuilder {
            store,
            config,
            order: ClaimOrder::default(),
            handlers: HandlerRegistry::new(),
            alert_rules: None,
            alert_sink: Arc::new(TracingAlertSink),
            memory: Arc::new(ProcessMemorySampler),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &S {
        &self.inner.store
    }

    fn resolver(&self) -> MutexGuard<'_, DependencyResolver> {
        self.inner
            .resolver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // ---------------------------------------------------------------------
    // Public surface
    // ---------------------------------------------------------------------

    /// Validate and persist a new job.
    pub fn enqueue(&self, job: Job) -> EngineResult<JobId> {
        if job.status != JobStatus::Queued || job.attempts != 0 {
            return Err(DomainError::validation("new jobs must be queued with no attempts").into());
        }
        if job.retry_policy.max_attempts == 0 {
            return Err(DomainError::validation("max_attempts must be at least 1").into());
        }
        if job.depends_on.contains(&job.id) {
            return Err(DomainError::validation(format!("job {} depends on itself", job.id)).into());
        }
        for dep in &job.depends_on {
            let Some(dependency) = self.inner.store.get(*dep)? else {
                return Err(DomainError::validation(format!("dependency {dep} does not exist")).into());
            };
            if dependency.owner_id != job.owner_id {
                return Err(DomainError::conflict(format!(
                    "dependency {dep} belongs to another owner"
                ))
                .into());
            }
        }

        let kind = job.kind.type_name();
        let category = job.kind.category().to_owned();
        let (owner_id, priority, deps) = (job.owner_id, job.priority, job.depends_on.len());
        let id = self.inner.store.insert(job)?;
        self.inner.metrics.record_enqueued(&category);
        info!(
            job_id = %id,
            owner_id = %owner_id,
            kind = %kind,
            priority = ?priority,
            dependencies = deps,
            "job enqueued"
        );
        Ok(id)
    }

    pub fn job(&self, tenant_id: TenantId, job_id: JobId) -> EngineResult<Option<Job>> {
        Ok(self.inner.store.get_for_tenant(tenant_id, job_id)?)
    }

    /// Cancel one job and, once it is terminal, everything downstream of it.
    pub fn cancel_job(&self, tenant_id: TenantId, job_id: JobId) -> EngineResult<CancelOutcome> {
        if self.inner.store.get_for_tenant(tenant_id, job_id)?.is_none() {
            return Err(EngineError::NotFound(job_id));
        }

        let outcome = self
            .inner
            .store
            .mark_cancelled(job_id, JobError::cancelled("cancelled on request"))?;
        match outcome {
            CancelOutcome::Cancelled => {
                self.inner.metrics.record_cancelled(1);
                self.after_terminal(job_id)?;
                info!(job_id = %job_id, owner_id = %tenant_id, "job cancelled");
            }
            CancelOutcome::Requested => {
                self.inner.pool.cancel(job_id);
                info!(job_id = %job_id, owner_id = %tenant_id, "cancellation requested for running job");
            }
            CancelOutcome::AlreadyTerminal | CancelOutcome::NotFound => {}
        }
        Ok(outcome)
    }

    /// Cancel every unfinished job of a batch.
    pub fn cancel_batch(&self, batch_id: BatchId) -> EngineResult<CancelReport> {
        let mut report = CancelReport::default();

        for job in self.inner.store.batch_jobs(batch_id)? {
            if job.is_terminal() {
                report.already_terminal += 1;
                continue;
            }
            match self
                .inner
                .store
                .mark_cancelled(job.id, JobError::cancelled(format!("batch {batch_id} cancelled")))?
            {
                CancelOutcome::Cancelled => {
                    report.cancelled.push(job.id);
                    self.inner.metrics.record_cancelled(1);
                    let cascaded = cascade_cancel(&self.inner.store, job.id)?;
                    self.inner.metrics.record_cancelled(cascaded.len());
                    let mut resolver = self.resolver();
                    resolver.on_terminal(job.id);
                    for id in &cascaded {
                        resolver.on_terminal(*id);
                    }
                    report.cancelled.extend(cascaded);
                }
                CancelOutcome::Requested => {
                    self.inner.pool.cancel(job.id);
                    report.requested.push(job.id);
                }
                // Cascaded by an earlier member of this batch
                CancelOutcome::AlreadyTerminal => report.already_terminal += 1,
                CancelOutcome::NotFound => {}
            }
        }

        self.resolver().invalidate_batch(Some(batch_id));
        info!(
            batch_id = %batch_id,
            cancelled = report.cancelled.len(),
            requested = report.requested.len(),
            "batch cancelled"
        );
        Ok(report)
    }

    /// Give a terminally failed job a fresh retry budget.
    pub fn retry_failed(&self, tenant_id: TenantId, job_id: JobId) -> EngineResult<Job> {
        let job = self.inner.store.requeue_failed(tenant_id, job_id)?;
        self.resolver().invalidate_batch(job.batch_id);
        info!(job_id = %job_id, owner_id = %tenant_id, "failed job re-queued by operator");
        Ok(job)
    }

    pub fn batch_progress(&self, batch_id: BatchId) -> EngineResult<BatchProgress> {
        let mut stats = JobStats::default();
        for job in self.inner.store.batch_jobs(batch_id)? {
            stats.record(job.status);
        }
        let total = stats.total();
        let finished = stats.done + stats.error + stats.cancelled;
        Ok(BatchProgress {
            batch_id,
            total,
            queued: stats.queued,
            running: stats.running,
            done: stats.done,
            error: stats.error,
            cancelled: stats.cancelled,
            finished_ratio: if total == 0 {
                0.0
            } else {
                finished as f64 / total as f64
            },
        })
    }

    pub fn stats(&self, tenant_id: TenantId) -> EngineResult<JobStats> {
        Ok(self.inner.store.stats(tenant_id)?)
    }

    pub fn status(&self) -> EngineResult<EngineStatus> {
        let scaling_ceiling = self.inner.scaling.ceiling();
        let resource_ceiling = self.inner.resources.current_ceiling();
        Ok(EngineStatus {
            in_flight: self.inner.pool.active(),
            peak_concurrency: self.inner.pool.peak(),
            scaling_ceiling,
            resource_ceiling,
            effective_limit: self.effective_limit(),
            queue_depth: self.inner.store.queue_depth()?,
            stuck_jobs: self.resolver().stuck_jobs().len(),
            circuit_open: self.inner.scaling.circuit_open(now()),
        })
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot(now())
    }

    pub fn in_flight(&self) -> usize {
        self.inner.pool.active()
    }

    // ---------------------------------------------------------------------
    // Scheduling
    // ---------------------------------------------------------------------

    pub fn effective_limit(&self) -> usize {
        self.inner
            .scaling
            .ceiling()
            .min(self.inner.resources.current_ceiling())
            .min(self.inner.config.max_workers)
            .max(1)
    }

    /// One scheduling pass: resolve, claim, dispatch. Never waits on a handler.
    ///
    /// The queue is read in pages of `candidate_window` jobs until the limit
    /// or `max_jobs_per_run` is reached or the queue runs out, so blocked and
    /// stuck jobs at the head of the queue cannot hide ready ones behind them.
    pub fn tick(&self) -> EngineResult<TickReport> {
        let inner = &*self.inner;
        let config = &inner.config;
        let started = now();
        let now_utc = inner.clock.now_utc();

        self.propagate_cancellations()?;

        let scaling = inner.scaling.ceiling();
        let resource = inner.resources.current_ceiling();
        let limit = self.effective_limit();
        inner.metrics.record_ceiling(scaling, resource, limit);

        let owner_cap = ((limit as f64 * config.owner_share).floor() as usize).max(1);
        let mut report = TickReport {
            effective_limit: limit,
            owner_cap,
            ..Default::default()
        };
        let mut round = ClaimRound {
            limit,
            owner_cap,
            now_utc,
            owner_counts: inner.pool.active_by_owner(),
            deferred: Vec::new(),
        };

        let mut resolver = self.resolver();
        let mut cursor: Option<Job> = None;
        let exhausted = loop {
            let page = inner
                .store
                .queued(now_utc, inner.order, cursor.as_ref(), config.candidate_window)?;
            report.scanned += page.len();
            let last_page = page.len() < config.candidate_window;
            cursor = page.last().cloned();

            let resolution = resolver.resolve(&inner.store, &page, started)?;
            self.cancel_doomed(resolution.doomed, &mut resolver, &mut report)?;

            let by_id: HashMap<JobId, &Job> = page.iter().map(|j| (j.id, j)).collect();
            let ready: Vec<&Job> = resolution
                .ready
                .iter()
                .filter_map(|id| by_id.get(id).copied())
                .collect();
            self.claim(&ready, &mut round, &mut resolver, &mut report)?;

            if report.claimed >= config.max_jobs_per_run || inner.pool.active() >= limit {
                break false;
            }
            if last_page {
                break true;
            }
        };

        // Nobody else had a ready job this tick: capped owners may fill the idle slots.
        if exhausted && config.lend_idle_slots && !round.deferred.is_empty() {
            let deferred = std::mem::take(&mut round.deferred);
            let lendable: Vec<&Job> = deferred.iter().collect();
            round.owner_cap = usize::MAX;
            let before = report.dispatched;
            self.claim(&lendable, &mut round, &mut resolver, &mut report)?;
            report.lent = report.dispatched - before;
            report.deferred = report.deferred.saturating_sub(report.lent);
        }

        report.stuck = resolver.stuck_jobs().len();
        inner.metrics.set_stuck_jobs(report.stuck);
        drop(resolver);

        inner.metrics.set_in_flight(inner.pool.active());
        if report.claimed > 0 || !report.rejected.is_empty() || !report.cancelled.is_empty() {
            debug!(
                limit,
                owner_cap,
                scanned = report.scanned,
                claimed = report.claimed,
                dispatched = report.dispatched,
                released = report.released,
                rejected = report.rejected.len(),
                cancelled = report.cancelled.len(),
                deferred = report.deferred,
                lent = report.lent,
                "scheduling tick"
            );
        }
        Ok(report)
    }

    /// Cancel candidates whose prerequisites failed, and everything behind them.
    fn cancel_doomed(
        &self,
        doomed: Vec<(JobId, JobError)>,
        resolver: &mut DependencyResolver,
        report: &mut TickReport,
    ) -> EngineResult<()> {
        let inner = &*self.inner;
        for (job_id, reason) in doomed {
            if inner.store.mark_cancelled(job_id, reason.clone())? == CancelOutcome::Cancelled {
                debug!(job_id = %job_id, reason = %reason, "dependency failed; job cancelled");
                let cascaded = cascade_cancel(&inner.store, job_id)?;
                resolver.on_terminal(job_id);
                for id in &cascaded {
                    resolver.on_terminal(*id);
                }
                inner.metrics.record_cancelled(1 + cascaded.len());
                report.cancelled.push(job_id);
                report.cancelled.extend(cascaded);
            }
        }
        Ok(())
    }

    /// Claim `ready` jobs (in order) in rounds of `batch_claim_size` and dispatch them.
    fn claim(
        &self,
        ready: &[&Job],
        round: &mut ClaimRound,
        resolver: &mut DependencyResolver,
        report: &mut TickReport,
    ) -> EngineResult<()> {
        let inner = &*self.inner;
        let config = &inner.config;
        let mut cursor = 0;

        while report.claimed < config.max_jobs_per_run && cursor < ready.len() {
            let active = inner.pool.active();
            if active >= round.limit {
                break;
            }
            let size = config
                .batch_claim_size
                .min(config.max_jobs_per_run - report.claimed)
                .min(round.limit - active);

            let mut ids = Vec::with_capacity(size);
            while ids.len() < size && cursor < ready.len() {
                let job = ready[cursor];
                cursor += 1;

                if let Err(error) = inner.resources.check_payload(job) {
                    self.reject(job, error, resolver, report)?;
                    continue;
                }
                if inner.handlers.resolve(&job.kind).is_none() {
                    let error = JobError::new(
                        FailureClass::NoHandler,
                        format!("no handler registered for {}", job.kind.type_name()),
                    );
                    self.reject(job, error, resolver, report)?;
                    continue;
                }

                let count = round.owner_counts.entry(job.owner_id).or_insert(0);
                if *count >= round.owner_cap {
                    report.deferred += 1;
                    round.deferred.push(job.clone());
                    continue;
                }
                *count += 1;
                ids.push(job.id);
            }
            if ids.is_empty() {
                break;
            }

            let claimed = inner.store.claim_ready(&ids, ids.len(), inner.order, round.now_utc)?;
            for id in ids.iter().filter(|id| !claimed.iter().any(|c| c.id == **id)) {
                // Lost the race to another engine instance
                if let Some(job) = ready.iter().find(|j| j.id == *id)
                    && let Some(count) = round.owner_counts.get_mut(&job.owner_id)
                {
                    *count = count.saturating_sub(1);
                }
            }

            report.claimed += claimed.len();
            for job in claimed {
                resolver.on_claimed(job.id);
                inner.metrics.record_claimed(job.kind.category());
                match inner.pool.try_acquire(&job, round.limit) {
                    Some(lease) => {
                        report.dispatched += 1;
                        self.dispatch(job, lease);
                    }
                    None => {
                        inner.store.release(job.id)?;
                        report.released += 1;
                        if let Some(count) = round.owner_counts.get_mut(&job.owner_id) {
                            *count = count.saturating_sub(1);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn reject(
        &self,
        job: &Job,
        error: JobError,
        resolver: &mut DependencyResolver,
        report: &mut TickReport,
    ) -> EngineResult<()> {
        let inner = &*self.inner;
        if !inner.store.reject(job.id, error.clone())? {
            return Ok(());
        }
        warn!(
            job_id = %job.id,
            owner_id = %job.owner_id,
            kind = %job.kind.type_name(),
            error = %error,
            "job rejected at claim time"
        );
        inner.metrics.record_rejected(job.kind.category());
        report.rejected.push(job.id);

        let cascaded = cascade_cancel(&inner.store, job.id)?;
        resolver.on_terminal(job.id);
        for id in &cascaded {
            resolver.on_terminal(*id);
        }
        inner.metrics.record_cancelled(cascaded.len());
        report.cancelled.extend(cascaded);
        Ok(())
    }

    /// Forward store-level cancellation flags (possibly set by another instance) to local handlers.
    fn propagate_cancellations(&self) -> EngineResult<()> {
        for job_id in self.inner.pool.in_flight() {
            if self
                .inner
                .store
                .get(job_id)?
                .is_some_and(|job| job.cancel_requested)
            {
                self.inner.pool.cancel(job_id);
            }
        }
        Ok(())
    }

    fn dispatch(&self, job: Job, lease: WorkerLease) {
        let Some(handler) = self.inner.handlers.resolve(&job.kind) else {
            return;
        };
        let engine = self.clone();
        let timeout = self.inner.config.job_timeout();
        let cancel = lease.cancellation();
        let span = info_span!(
            "job",
            job_id = %job.id,
            owner_id = %job.owner_id,
            kind = %job.kind.type_name(),
            attempt = job.attempts + 1,
        );
        let ctx = JobContext::new(job.clone(), cancel.clone());

        tokio::spawn(
            async move {
                let started = now();
                debug!("job started");
                let mut task: JoinHandle<Result<(), HandlerError>> =
                    tokio::spawn(async move { handler.run(ctx).await }.in_current_span());

                let execution = match tokio::time::timeout(timeout, &mut task).await {
                    Ok(Ok(result)) => Execution::Finished(result),
                    Ok(Err(join_error)) => Execution::Panicked(panic_message(join_error)),
                    Err(_) => {
                        task.abort();
                        Execution::TimedOut
                    }
                };

                if let Err(err) = engine.complete(&job, execution, &cancel, started) {
                    error!(error = %err, "failed to record job outcome");
                }
                drop(lease);
                engine.inner.metrics.set_in_flight(engine.inner.pool.active());
            }
            .instrument(span),
        );
    }

    /// Write the outcome of one execution to the store and propagate it.
    fn complete(
        &self,
        job: &Job,
        execution: Execution,
        cancel: &CancellationToken,
        started: Instant,
    ) -> EngineResult<()> {
        let inner = &*self.inner;
        let finished = now();
        let elapsed = finished.saturating_duration_since(started);
        let category = job.kind.category();

        let cancel_requested = cancel.is_cancelled()
            || inner
                .store
                .get(job.id)?
                .is_some_and(|current| current.cancel_requested);

        let (error, retry_after) = match execution {
            Execution::Finished(Ok(())) => {
                if inner.store.mark_done(job.id)? {
                    inner.metrics.record_attempt(category, AttemptOutcome::Succeeded, elapsed, finished);
                    self.resolver().on_completed(job.id);
                    info!(duration_ms = elapsed.as_millis() as u64, "job completed");
                }
                return Ok(());
            }
            Execution::Finished(Err(err)) => err.into_job_error(),
            Execution::TimedOut => {
                inner.metrics.record_timeout(category);
                (
                    JobError::new(
                        FailureClass::Timeout,
                        format!("exceeded job timeout of {} ms", inner.config.job_timeout_ms),
                    ),
                    None,
                )
            }
            Execution::Panicked(message) => (JobError::new(FailureClass::Panicked, message), None),
        };

        if cancel_requested {
            let reason = JobError::cancelled(format!("cancelled while running ({error})"));
            if inner.store.finish_cancelled(job.id, reason)? {
                inner.metrics.record_attempt(category, AttemptOutcome::Cancelled, elapsed, finished);
                info!("job cancelled");
                self.after_terminal(job.id)?;
            }
            return Ok(());
        }

        let failed_at = inner.clock.now_utc();
        let Some(updated) = inner
            .store
            .mark_failed(job.id, error.clone(), retry_after, failed_at)?
        else {
            debug!("job no longer running; outcome dropped");
            return Ok(());
        };

        if updated.status == JobStatus::Queued {
            inner.metrics.record_attempt(category, AttemptOutcome::Retried, elapsed, finished);
            warn!(
                error = %error,
                attempts = updated.attempts,
                max_attempts = updated.max_attempts(),
                retry_at = ?updated.scheduled_at,
                "job failed; retry scheduled"
            );
        } else {
            inner.metrics.record_attempt(category, AttemptOutcome::Failed, elapsed, finished);
            error!(
                error = %error,
                attempts = updated.attempts,
                "job failed permanently"
            );
            self.after_terminal(job.id)?;
        }
        Ok(())
    }

    /// Cascade a job's failure or cancellation to its dependents.
    fn after_terminal(&self, job_id: JobId) -> EngineResult<()> {
        let cascaded = cascade_cancel(&self.inner.store, job_id)?;
        if !cascaded.is_empty() {
            info!(job_id = %job_id, cancelled = cascaded.len(), "cancelled dependents");
        }
        self.inner.metrics.record_cancelled(cascaded.len());

        let mut resolver = self.resolver();
        resolver.on_terminal(job_id);
        for id in cascaded {
            resolver.on_terminal(id);
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Feedback loops
    // ---------------------------------------------------------------------

    /// Feed current load to the scaling controller.
    pub fn scaling_tick(&self) -> EngineResult<ScalingDecision> {
        let at = now();
        let queue_depth = self.inner.store.queue_depth()?;
        self.inner.metrics.set_queue_depth(queue_depth);

        Ok(self.inner.scaling.tick(LoadObservation {
            queue_depth,
            throughput_per_sec: self.inner.metrics.throughput(at),
            error_rate: self.inner.metrics.error_rate(at),
            at,
        }))
    }

    /// Sample resource pressure and run retention cleanup when due.
    pub fn resource_tick(&self) -> EngineResult<Option<usize>> {
        let at = now();
        let observation = ResourceObservation {
            memory_used_mb: self.inner.memory.resident_mb(),
            in_flight: self.inner.pool.active(),
            in_flight_payload_bytes: self.inner.pool.in_flight_payload_bytes(),
        };
        let ceiling = self.inner.resources.tick(observation, at);

        if self.inner.resources.cleanup_due(at) {
            let purged = self.inner.resources.run_cleanup(&self.inner.store, at)?;
            if purged > 0 {
                self.resolver().invalidate_batch(None);
            }
        }
        Ok(ceiling)
    }

    pub fn alert_tick(&self) -> Vec<Alert> {
        let at = now();
        let snapshot = self.inner.metrics.snapshot(at);
        self.inner.alerts.evaluate(&snapshot, at)
    }

    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    /// Drive every loop until `shutdown` fires, then wait for in-flight jobs.
    pub async fn run(self, shutdown: CancellationToken) {
        let config = &self.inner.config;
        let mut poll = tokio::time::interval(config.poll_interval());
        let mut scaling = tokio::time::interval(config.scaling_interval());
        let mut resource = tokio::time::interval(config.resource_interval());
        let mut alerts = tokio::time::interval(config.alert_interval());
        for interval in [&mut poll, &mut scaling, &mut resource, &mut alerts] {
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        }

        info!(
            min_workers = config.min_workers,
            max_workers = config.max_workers,
            poll_interval_ms = config.poll_interval_ms,
            "job engine started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = poll.tick() => {
                    if let Err(err) = self.tick() {
                        error!(error = %err, "scheduling tick failed");
                    }
                }
                _ = scaling.tick() => {
                    match self.scaling_tick() {
                        Ok(ScalingDecision::Hold) => {}
                        Ok(decision) => debug!(?decision, "scaling decision"),
                        Err(err) => error!(error = %err, "scaling tick failed"),
                    }
                }
                _ = resource.tick() => {
                    if let Err(err) = self.resource_tick() {
                        error!(error = %err, "resource tick failed");
                    }
                }
                _ = alerts.tick() => {
                    self.alert_tick();
                }
            }
        }

        info!(in_flight = self.inner.pool.active(), "job engine stopping");
        self.drain().await;
        info!("job engine stopped");
    }

    /// Wait until every lease is released. Supervisors enforce the job timeout, so this ends.
    async fn drain(&self) {
        let mut check = tokio::time::interval(self.inner.config.poll_interval());
        while self.inner.pool.active() > 0 {
            check.tick().await;
        }
    }

    /// Run the engine on a background task.
    pub fn spawn(self) -> EngineHandle {
        let shutdown = CancellationToken::new();
        let join = tokio::spawn(self.run(shutdown.clone()));
        EngineHandle { shutdown, join }
    }
}

fn panic_message(error: JoinError) -> String {
    if !error.is_panic() {
        return "handler task was cancelled".to_string();
    }
    let payload = error.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("handler panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("handler panicked: {message}")
    } else {
        "handler panicked".to_string()
    }
}

/// Handle to control a running engine.
#[derive(Debug)]
pub struct EngineHandle {
    shutdown: CancellationToken,
    join: JoinHandle<()>,
}

impl EngineHandle {
    /// Request graceful shutdown and wait for in-flight jobs.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(err) = self.join.await {
            error!(error = %err, "engine task ended abnormally");
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}
