//! Core job types and policies.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tidepool_core::{BatchId, TenantId};

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Job kind, used to route a job to its handler.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Pull data from a third-party source (mailbox, calendar, CRM export)
    IngestSource { source: String },
    /// Normalize one ingested record into the platform's model
    NormalizeRecord { record_type: String },
    /// Compute embeddings for normalized content
    GenerateEmbedding { model: String },
    /// Derive an AI-assisted insight from prepared data
    DeriveInsight { insight: String },
    /// Generic/custom job
    Custom { kind: String },
}

impl JobKind {
    pub fn ingest_source(source: impl Into<String>) -> Self {
        Self::IngestSource {
            source: source.into(),
        }
    }

    pub fn normalize_record(record_type: impl Into<String>) -> Self {
        Self::NormalizeRecord {
            record_type: record_type.into(),
        }
    }

    pub fn generate_embedding(model: impl Into<String>) -> Self {
        Self::GenerateEmbedding {
            model: model.into(),
        }
    }

    pub fn derive_insight(insight: impl Into<String>) -> Self {
        Self::DeriveInsight {
            insight: insight.into(),
        }
    }

    pub fn custom(kind: impl Into<String>) -> Self {
        Self::Custom { kind: kind.into() }
    }

    /// Routing key: `category.detail` for built-in kinds, verbatim for custom ones.
    pub fn type_name(&self) -> String {
        match self {
            JobKind::IngestSource { source } => format!("ingest_source.{source}"),
            JobKind::NormalizeRecord { record_type } => format!("normalize_record.{record_type}"),
            JobKind::GenerateEmbedding { model } => format!("generate_embedding.{model}"),
            JobKind::DeriveInsight { insight } => format!("derive_insight.{insight}"),
            JobKind::Custom { kind } => kind.clone(),
        }
    }

    /// Coarse label for metrics (bounded cardinality).
    pub fn category(&self) -> &str {
        match self {
            JobKind::IngestSource { .. } => "ingest_source",
            JobKind::NormalizeRecord { .. } => "normalize_record",
            JobKind::GenerateEmbedding { .. } => "generate_embedding",
            JobKind::DeriveInsight { .. } => "derive_insight",
            JobKind::Custom { .. } => "custom",
        }
    }
}

/// Scheduling priority. Higher variants always claim first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// Job execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for dependencies, a worker slot or its retry time
    Queued,
    /// Claimed by exactly one worker
    Running,
    /// Completed successfully
    Done,
    /// Failed permanently
    Error,
    /// Cancelled explicitly or because a dependency failed
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Error | JobStatus::Cancelled)
    }

    /// Terminal states that doom every dependent.
    pub fn is_failure(&self) -> bool {
        matches!(self, JobStatus::Error | JobStatus::Cancelled)
    }
}

/// Why a job attempt did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Network hiccup or other retryable fault reported by the handler
    Transient,
    /// Exceeded the engine's hard execution timeout
    Timeout,
    /// External API asked us to back off
    RateLimited,
    /// Handler task panicked
    Panicked,
    /// Payload above the configured size limit; never started
    PayloadTooLarge,
    /// A prerequisite ended in error or cancellation
    DependencyFailed,
    /// Handler declared the failure non-retryable
    Fatal,
    /// No handler registered for the job kind
    NoHandler,
    /// Cancelled on request
    Cancelled,
}

impl FailureClass {
    /// Whether a failure of this class spends retry budget.
    pub fn consumes_attempt(&self) -> bool {
        matches!(
            self,
            FailureClass::Transient
                | FailureClass::Timeout
                | FailureClass::RateLimited
                | FailureClass::Panicked
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::Transient => "transient",
            FailureClass::Timeout => "timeout",
            FailureClass::RateLimited => "rate_limited",
            FailureClass::Panicked => "panicked",
            FailureClass::PayloadTooLarge => "payload_too_large",
            FailureClass::DependencyFailed => "dependency_failed",
            FailureClass::Fatal => "fatal",
            FailureClass::NoHandler => "no_handler",
            FailureClass::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Human-readable failure recorded on a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub class: FailureClass,
    pub message: String,
}

impl JobError {
    pub fn new(class: FailureClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FailureClass::Transient, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(FailureClass::Fatal, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(FailureClass::Cancelled, message)
    }

    pub fn dependency_failed(dependency: JobId) -> Self {
        Self::new(
            FailureClass::DependencyFailed,
            format!("dependency {dependency} failed"),
        )
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.class, self.message)
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt-1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts allowed before the job fails permanently (at least 1)
    pub max_attempts: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0): delay is spread uniformly by ±jitter
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Create a policy that fails permanently on the first failure.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Delay for a given attempt number (1-indexed), before jitter.
    pub fn base_delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                // Clamp the exponent; 2^31 ms is already far past any sane cap.
                let exp = 2_f64.powi((attempt - 1).min(31) as i32);
                base_ms * exp
            }
            BackoffStrategy::Linear => base_ms * (attempt as f64),
        };

        Duration::from_millis(delay_ms.min(max_ms) as u64)
    }

    /// Delay for a given attempt number (1-indexed), jittered and capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.base_delay_for_attempt(attempt);
        let delay_ms = delay.as_millis() as f64;
        let spread = delay_ms * self.jitter.clamp(0.0, 1.0);

        let jittered = if spread > 0.0 {
            delay_ms + rand::rng().random_range(-spread..=spread)
        } else {
            delay_ms
        };

        let max_ms = self.max_delay.as_millis() as f64;
        Duration::from_millis(jittered.clamp(0.0, max_ms) as u64)
    }

    /// Check if more attempts are allowed after `attempts` failures.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// Ordering used when claiming queued jobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimOrder {
    /// Priority descending, then eligibility time ascending (FIFO within a tier)
    #[default]
    PriorityThenSchedule,
    /// Eligibility time only
    Fifo,
}

impl ClaimOrder {
    pub fn compare(&self, a: &Job, b: &Job) -> Ordering {
        let fifo = a
            .eligible_at()
            .cmp(&b.eligible_at())
            .then(a.created_at.cmp(&b.created_at))
            .then(a.id.cmp(&b.id));

        match self {
            ClaimOrder::PriorityThenSchedule => b.priority.cmp(&a.priority).then(fifo),
            ClaimOrder::Fifo => fifo,
        }
    }
}

/// A background job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique job ID
    pub id: JobId,
    /// Tenant that owns the job
    pub owner_id: TenantId,
    /// Batch this job was created in, if any
    pub batch_id: Option<BatchId>,
    /// Job kind for routing
    pub kind: JobKind,
    /// JSON payload, immutable across retries
    pub payload: serde_json::Value,
    /// Serialized payload size in bytes
    pub payload_bytes: u64,
    /// Scheduling priority
    pub priority: Priority,
    /// Current status
    pub status: JobStatus,
    /// Failed attempts that consumed retry budget
    pub attempts: u32,
    /// Retry policy
    pub retry_policy: RetryPolicy,
    /// Jobs that must be `Done` before this one may run
    pub depends_on: BTreeSet<JobId>,
    /// Most recent failure
    pub last_error: Option<JobError>,
    /// Cancellation was requested while the job was running
    pub cancel_requested: bool,
    /// Earliest time the job may be claimed (retry backoff or delayed start)
    pub scheduled_at: Option<DateTime<Utc>>,
    /// When the current attempt started
    pub started_at: Option<DateTime<Utc>>,
    /// When the job was created
    pub created_at: DateTime<Utc>,
    /// When the job was last updated
    pub updated_at: DateTime<Utc>,
    /// Execution history
    pub history: Vec<JobAttemptRecord>,
}

/// Record of a job execution attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobAttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<JobError>,
    pub duration_ms: u64,
}

impl Job {
    /// Create a new queued job.
    pub fn new(owner_id: TenantId, kind: JobKind, payload: serde_json::Value) -> Self {
        let now = Utc::now();
        let payload_bytes = serde_json::to_vec(&payload)
            .map(|bytes| bytes.len() as u64)
            .unwrap_or(0);

        Self {
            id: JobId::new(),
            owner_id,
            batch_id: None,
            kind,
            payload,
            payload_bytes,
            priority: Priority::Normal,
            status: JobStatus::Queued,
            attempts: 0,
            retry_policy: RetryPolicy::default(),
            depends_on: BTreeSet::new(),
            last_error: None,
            cancel_requested: false,
            scheduled_at: None,
            started_at: None,
            created_at: now,
            updated_at: now,
            history: Vec::new(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set a custom retry policy.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn in_batch(mut self, batch_id: BatchId) -> Self {
        self.batch_id = Some(batch_id);
        self
    }

    pub fn depends_on(mut self, ids: impl IntoIterator<Item = JobId>) -> Self {
        self.depends_on.extend(ids);
        self
    }

    /// Schedule the job for later execution.
    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    /// Schedule the job with a delay from now.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.scheduled_at = Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default());
        self
    }

    /// Time from which the job may be claimed.
    pub fn eligible_at(&self) -> DateTime<Utc> {
        self.scheduled_at.unwrap_or(self.created_at)
    }

    /// Queued and past its scheduled time.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Queued && self.eligible_at() <= now
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn max_attempts(&self) -> u32 {
        self.retry_policy.max_attempts
    }

    pub(crate) fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }

    /// Mark job as running (claimed).
    pub fn mark_running(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Running;
        self.started_at = Some(now);
        self.touch(now);
    }

    /// Return a claimed job to the queue without spending an attempt.
    pub fn release(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Queued;
        self.started_at = None;
        self.touch(now);
    }

    /// Mark job as done.
    pub fn mark_done(&mut self, now: DateTime<Utc>) {
        let started_at = self.started_at.take().unwrap_or(now);
        self.status = JobStatus::Done;
        self.touch(now);
        self.history.push(JobAttemptRecord {
            attempt: self.attempts + 1,
            started_at,
            finished_at: now,
            success: true,
            error: None,
            duration_ms: (now - started_at).num_milliseconds().max(0) as u64,
        });
    }

    /// Record a failed attempt and decide between retry and terminal error.
    ///
    /// Returns `true` when the job was re-queued for another attempt.
    pub fn record_failure(
        &mut self,
        error: JobError,
        retry_after: Option<Duration>,
        now: DateTime<Utc>,
    ) -> bool {
        let started_at = self.started_at.take().unwrap_or(now);
        let consumes = error.class.consumes_attempt();
        let max_attempts = self.retry_policy.max_attempts.max(1);

        self.history.push(JobAttemptRecord {
            attempt: self.attempts + 1,
            started_at,
            finished_at: now,
            success: false,
            error: Some(error.clone()),
            duration_ms: (now - started_at).num_milliseconds().max(0) as u64,
        });
        self.touch(now);

        if consumes {
            self.attempts = (self.attempts + 1).min(max_attempts);
        }

        let retry = consumes && self.retry_policy.should_retry(self.attempts);
        if retry {
            // Schedule retry with backoff
            let delay = retry_after
                .unwrap_or_else(|| self.retry_policy.delay_for_attempt(self.attempts));
            self.scheduled_at = Some(now + chrono::Duration::from_std(delay).unwrap_or_default());
            self.status = JobStatus::Queued;
        } else {
            self.status = JobStatus::Error;
        }
        self.last_error = Some(error);

        retry
    }

    /// Fail a queued job without running it or spending an attempt.
    pub fn reject(&mut self, error: JobError, now: DateTime<Utc>) {
        self.status = JobStatus::Error;
        self.last_error = Some(error);
        self.touch(now);
    }

    /// Mark job as cancelled.
    pub fn mark_cancelled(&mut self, error: JobError, now: DateTime<Utc>) {
        self.status = JobStatus::Cancelled;
        self.started_at = None;
        self.last_error = Some(error);
        self.touch(now);
    }

    /// Put a permanently failed job back in the queue with a fresh retry budget.
    pub fn requeue(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Queued;
        self.attempts = 0;
        self.scheduled_at = None;
        self.started_at = None;
        self.cancel_requested = false;
        self.last_error = None;
        self.history.clear();
        self.touch(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_job() -> Job {
        Job::new(TenantId::new(), JobKind::custom("test"), serde_json::json!({"key": "value"}))
    }

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.0,
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(800));
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 100,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.5,
        };

        for attempt in [5, 10, 40, 99] {
            assert!(policy.delay_for_attempt(attempt) <= Duration::from_secs(1));
        }
    }

    #[test]
    fn jitter_stays_within_spread() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(60),
            strategy: BackoffStrategy::Fixed,
            jitter: 0.2,
        };

        for _ in 0..200 {
            let delay = policy.delay_for_attempt(1);
            assert!(delay >= Duration::from_millis(800));
            assert!(delay <= Duration::from_millis(1200));
        }
    }

    #[test]
    fn linear_backoff_increases_linearly() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            strategy: BackoffStrategy::Linear,
            jitter: 0.0,
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(300));
    }

    #[test]
    fn should_retry_respects_max_attempts() {
        let policy = RetryPolicy {
            max_attempts: 3,
            ..Default::default()
        };

        assert!(policy.should_retry(0));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!policy.should_retry(4));
    }

    #[test]
    fn job_lifecycle() {
        let mut job = test_job();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempts, 0);
        assert!(job.payload_bytes > 0);

        let now = Utc::now();
        job.mark_running(now);
        assert_eq!(job.status, JobStatus::Running);

        job.mark_done(now);
        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(job.history.len(), 1);
        assert!(job.history[0].success);
    }

    #[test]
    fn job_failure_and_retry() {
        let mut job = test_job().with_retry_policy(RetryPolicy {
            max_attempts: 2,
            ..Default::default()
        });

        let now = Utc::now();
        job.mark_running(now);
        assert!(job.record_failure(JobError::transient("error 1"), None, now));
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempts, 1);
        assert!(job.scheduled_at.unwrap() >= now);

        job.mark_running(now);
        assert!(!job.record_failure(JobError::transient("error 2"), None, now));
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(job.attempts, 2);
        assert_eq!(job.last_error.as_ref().unwrap().message, "error 2");
    }

    #[test]
    fn fatal_failure_is_terminal_without_spending_attempts() {
        let mut job = test_job();
        let now = Utc::now();
        job.mark_running(now);

        assert!(!job.record_failure(JobError::fatal("bad credentials"), None, now));
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(job.attempts, 0);
    }

    #[test]
    fn retry_after_overrides_backoff() {
        let mut job = test_job();
        let now = Utc::now();
        job.mark_running(now);

        let error = JobError::new(FailureClass::RateLimited, "429");
        assert!(job.record_failure(error, Some(Duration::from_secs(90)), now));
        assert_eq!(job.scheduled_at, Some(now + chrono::Duration::seconds(90)));
    }

    #[test]
    fn job_error_renders_class_prefix() {
        let error = JobError::new(FailureClass::PayloadTooLarge, "12 MB exceeds 10 MB");
        assert_eq!(error.to_string(), "payload_too_large: 12 MB exceeds 10 MB");
    }

    #[test]
    fn priority_order_then_fifo() {
        let owner = TenantId::new();
        let now = Utc::now();
        let mut low = Job::new(owner, JobKind::custom("a"), serde_json::json!({}));
        low.priority = Priority::Low;
        let mut early = Job::new(owner, JobKind::custom("b"), serde_json::json!({}));
        early.scheduled_at = Some(now - chrono::Duration::seconds(10));
        let mut late = Job::new(owner, JobKind::custom("c"), serde_json::json!({}));
        late.scheduled_at = Some(now);
        let mut critical = Job::new(owner, JobKind::custom("d"), serde_json::json!({}));
        critical.priority = Priority::Critical;
        critical.scheduled_at = Some(now + chrono::Duration::seconds(10));

        let mut jobs = vec![low.clone(), late.clone(), critical.clone(), early.clone()];
        jobs.sort_by(|a, b| ClaimOrder::PriorityThenSchedule.compare(a, b));
        let order: Vec<_> = jobs.iter().map(|j| j.id).collect();

        assert_eq!(order, vec![critical.id, early.id, late.id, low.id]);
    }

    #[test]
    fn kind_routing_keys() {
        assert_eq!(JobKind::ingest_source("gmail").type_name(), "ingest_source.gmail");
        assert_eq!(JobKind::custom("reindex").type_name(), "reindex");
        assert_eq!(JobKind::derive_insight("churn").category(), "derive_insight");
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn failure_class() -> impl Strategy<Value = FailureClass> {
            prop_oneof![
                Just(FailureClass::Transient),
                Just(FailureClass::Timeout),
                Just(FailureClass::RateLimited),
                Just(FailureClass::Panicked),
                Just(FailureClass::Fatal),
            ]
        }

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 256,
                ..ProptestConfig::default()
            })]

            /// Property: attempts never exceed max_attempts, and an exhausted job never re-queues.
            #[test]
            fn attempts_never_exceed_max(
                max_attempts in 1u32..8,
                failures in proptest::collection::vec(failure_class(), 1..20)
            ) {
                let mut job = test_job().with_retry_policy(RetryPolicy {
                    max_attempts,
                    base_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(10),
                    strategy: BackoffStrategy::Exponential,
                    jitter: 0.5,
                });

                for class in failures {
                    if job.status != JobStatus::Queued {
                        break;
                    }
                    let now = Utc::now();
                    job.mark_running(now);
                    let requeued = job.record_failure(JobError::new(class, "boom"), None, now);

                    prop_assert!(job.attempts <= job.max_attempts());
                    if job.attempts == job.max_attempts() {
                        prop_assert!(!requeued);
                        prop_assert_eq!(job.status, JobStatus::Error);
                    }
                }
            }

            /// Property: backoff is monotone in the attempt number before jitter.
            #[test]
            fn base_backoff_is_monotone(attempt in 1u32..64, base_ms in 1u64..5_000) {
                let policy = RetryPolicy::exponential(
                    64,
                    Duration::from_millis(base_ms),
                    Duration::from_secs(300),
                );
                prop_assert!(policy.base_delay_for_attempt(attempt) <= policy.base_delay_for_attempt(attempt + 1));
            }
        }
    }
}
