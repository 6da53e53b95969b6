//! Job handlers and kind-based routing.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use tidepool_core::{BatchId, TenantId};

use crate::types::{FailureClass, Job, JobError, JobId, JobKind};

/// Failure reported by a handler.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HandlerError {
    /// Retry with the job's backoff policy
    #[error("{0}")]
    Transient(String),
    /// Do not retry
    #[error("{0}")]
    Fatal(String),
    /// Retry after the upstream-provided delay, or the backoff policy if none was given
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },
}

impl HandlerError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self::RateLimited {
            message: message.into(),
            retry_after,
        }
    }

    /// The error recorded on the job plus any retry delay override.
    pub fn into_job_error(self) -> (JobError, Option<Duration>) {
        match self {
            HandlerError::Transient(message) => (JobError::new(FailureClass::Transient, message), None),
            HandlerError::Fatal(message) => (JobError::new(FailureClass::Fatal, message), None),
            HandlerError::RateLimited {
                message,
                retry_after,
            } => (JobError::new(FailureClass::RateLimited, message), retry_after),
        }
    }
}

/// A payload that does not match the handler's schema will never succeed.
impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Fatal(format!("malformed payload: {err}"))
    }
}

/// What a handler gets to work with.
#[derive(Debug, Clone)]
pub struct JobContext {
    job: Arc<Job>,
    attempt: u32,
    cancel: CancellationToken,
}

impl JobContext {
    pub fn new(job: Job, cancel: CancellationToken) -> Self {
        let attempt = job.attempts + 1;
        Self {
            job: Arc::new(job),
            attempt,
            cancel,
        }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn job_id(&self) -> JobId {
        self.job.id
    }

    pub fn owner_id(&self) -> TenantId {
        self.job.owner_id
    }

    pub fn batch_id(&self) -> Option<BatchId> {
        self.job.batch_id
    }

    pub fn kind(&self) -> &JobKind {
        &self.job.kind
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.job.payload
    }

    /// Deserialize the payload; a mismatch is a fatal error.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        Ok(T::deserialize(&self.job.payload)?)
    }

    /// 1 on the first run; counts only attempts that consumed retry budget.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once cancellation is requested.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, ctx: JobContext) -> Result<(), HandlerError>;
}

/// Adapts an async closure into a [`JobHandler`].
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn run(&self, ctx: JobContext) -> Result<(), HandlerError> {
        (self.0)(ctx).await
    }
}

/// Routes job kinds to handlers: exact `type_name`, then `"prefix.*"`, then `"*"`.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut patterns: Vec<_> = self.handlers.keys().collect();
        patterns.sort();
        f.debug_struct("HandlerRegistry")
            .field("patterns", &patterns)
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a job kind pattern.
    pub fn register(&mut self, pattern: impl Into<String>, handler: impl JobHandler + 'static) {
        self.handlers.insert(pattern.into(), Arc::new(handler));
    }

    /// Register an async closure for a job kind pattern.
    pub fn register_fn<F, Fut>(&mut self, pattern: impl Into<String>, f: F)
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.register(pattern, FnHandler(f));
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Get the handler for a job kind.
    pub fn resolve(&self, kind: &JobKind) -> Option<Arc<dyn JobHandler>> {
        // Try exact match first
        let type_name = kind.type_name();
        if let Some(h) = self.handlers.get(&type_name) {
            return Some(h.clone());
        }

        // Longest matching "prefix.*" wins (e.g. "ingest_source.*" matches "ingest_source.gmail")
        let best = self
            .handlers
            .iter()
            .filter_map(|(pattern, handler)| {
                let prefix = pattern.strip_suffix(".*")?;
                let rest = type_name.strip_prefix(prefix)?;
                rest.starts_with('.').then_some((prefix.len(), handler))
            })
            .max_by_key(|(len, _)| *len);
        if let Some((_, handler)) = best {
            return Some(handler.clone());
        }

        // Try wildcard
        self.handlers.get("*").cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    #[async_trait]
    impl JobHandler for Named {
        async fn run(&self, _ctx: JobContext) -> Result<(), HandlerError> {
            Err(HandlerError::fatal(self.0))
        }
    }

    async fn name_of(registry: &HandlerRegistry, kind: JobKind) -> Option<String> {
        let handler = registry.resolve(&kind)?;
        let job = Job::new(TenantId::new(), kind, serde_json::json!({}));
        match handler.run(JobContext::new(job, CancellationToken::new())).await {
            Err(HandlerError::Fatal(name)) => Some(name),
            _ => None,
        }
    }

    #[tokio::test]
    async fn routing_prefers_exact_then_prefix_then_wildcard() {
        let mut registry = HandlerRegistry::new();
        registry.register("ingest_source.gmail", Named("exact"));
        registry.register("ingest_source.*", Named("prefix"));
        registry.register("*", Named("wildcard"));

        assert_eq!(name_of(&registry, JobKind::ingest_source("gmail")).await.as_deref(), Some("exact"));
        assert_eq!(name_of(&registry, JobKind::ingest_source("outlook")).await.as_deref(), Some("prefix"));
        assert_eq!(name_of(&registry, JobKind::derive_insight("churn")).await.as_deref(), Some("wildcard"));
    }

    #[tokio::test]
    async fn prefix_must_end_at_a_segment_boundary() {
        let mut registry = HandlerRegistry::new();
        registry.register("ingest.*", Named("short"));

        assert!(registry.resolve(&JobKind::ingest_source("gmail")).is_none());
        assert!(registry.resolve(&JobKind::custom("ingest.mailbox")).is_some());
    }

    #[tokio::test]
    async fn closures_are_handlers() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn("custom", |ctx: JobContext| async move {
            let payload: serde_json::Map<String, serde_json::Value> = ctx.payload_as()?;
            if payload.contains_key("ok") {
                Ok(())
            } else {
                Err(HandlerError::transient("missing key"))
            }
        });

        let handler = registry.resolve(&JobKind::custom("custom")).unwrap();
        let job = Job::new(TenantId::new(), JobKind::custom("custom"), serde_json::json!({"ok": true}));
        assert_eq!(JobContext::new(job.clone(), CancellationToken::new()).attempt(), 1);
        assert!(handler.run(JobContext::new(job, CancellationToken::new())).await.is_ok());
    }

    #[test]
    fn malformed_payloads_are_fatal() {
        let job = Job::new(TenantId::new(), JobKind::custom("x"), serde_json::json!("not an object"));
        let ctx = JobContext::new(job, CancellationToken::new());
        let err = ctx.payload_as::<HashMap<String, u32>>().unwrap_err();

        let (job_error, retry_after) = err.into_job_error();
        assert_eq!(job_error.class, FailureClass::Fatal);
        assert!(retry_after.is_none());
    }

    #[test]
    fn rate_limits_carry_their_delay() {
        let (job_error, retry_after) =
            HandlerError::rate_limited("429 from upstream", Some(Duration::from_secs(30))).into_job_error();
        assert_eq!(job_error.class, FailureClass::RateLimited);
        assert_eq!(retry_after, Some(Duration::from_secs(30)));
    }
}
