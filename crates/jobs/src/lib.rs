//! Background job processing engine.
//!
//! ## Design
//!
//! - Jobs are tenant-scoped, prioritised and may depend on other jobs
//! - All status transitions are compare-and-swap operations in the store
//! - Retry policy with exponential backoff and jitter
//! - Concurrency is the minimum of a load-based and a resource-based ceiling
//! - One owner never holds more than its share of the effective limit
//!
//! ## Components
//!
//! - `JobStore`: persistence boundary (in-memory reference implementation)
//! - `DependencyResolver`: readiness, failure cascades, cycle detection
//! - `ResourceMonitor`: memory-based ceiling, payload admission, retention
//! - `ScalingController`: queue-depth scaling with an error-rate circuit breaker
//! - `EngineMetrics` / `AlertEvaluator`: metrics and threshold alerts
//! - `Engine`: claims ready jobs and runs them on a bounded worker pool

pub mod alerts;
pub mod config;
pub mod engine;
pub mod error;
pub mod handler;
pub mod pool;
pub mod resolver;
pub mod resources;
pub mod scaling;
pub mod store;
pub mod telemetry;
pub mod types;


pub use alerts::{Alert, AlertCondition, AlertEvaluator, AlertRule, AlertSeverity, AlertSink};
pub use alerts::{RecordingAlertSink, TracingAlertSink};
pub use config::{ConfigError, EngineConfig};
pub use engine::{BatchProgress, CancelReport, Engine, EngineBuilder, EngineHandle, EngineStatus, TickReport};
pub use error::{EngineError, EngineResult};
pub use handler::{FnHandler, HandlerError, HandlerRegistry, JobContext, JobHandler};
pub use pool::{WorkerLease, WorkerPool};
pub use resolver::{DependencyResolver, Resolution, cascade_cancel};
pub use resources::{MemorySampler, NoopMemorySampler, ProcessMemorySampler, ResourceMonitor, ResourceObservation};
pub use scaling::{LoadObservation, ScalingController, ScalingDecision};
pub use store::{CancelOutcome, InMemoryJobStore, JobStats, JobStore, JobStoreError};
pub use telemetry::{EngineMetrics, MetricsSnapshot};
pub use types::{
    BackoffStrategy, ClaimOrder, FailureClass, Job, JobAttemptRecord, JobError, JobId, JobKind,
    JobStatus, Priority, RetryPolicy,
};

pub use tidepool_core::{BatchId, TenantId};
