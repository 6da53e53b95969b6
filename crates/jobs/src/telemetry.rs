//! Engine metrics: lifetime counters, sliding-window throughput and error
//! rate, per-kind latency and ceiling history.
//!
//! Every recording is mirrored to the `metrics` facade so an installed
//! exporter sees the same numbers as [`EngineMetrics::snapshot`].

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use tidepool_observability::metrics as names;

/// Latency samples kept per kind.
const LATENCY_SAMPLES: usize = 1024;
/// Ceiling changes kept in history.
const CEILING_HISTORY: usize = 256;

/// How a finished attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Succeeded,
    /// Failed, re-queued with backoff
    Retried,
    /// Failed terminally
    Failed,
    Cancelled,
}

/// Lifetime counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Counters {
    pub enqueued: u64,
    pub claimed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub retried: u64,
    pub cancelled: u64,
    pub rejected: u64,
    pub timed_out: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencySummary {
    pub count: usize,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub max_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CeilingPoint {
    pub at: DateTime<Utc>,
    pub scaling: usize,
    pub resource: usize,
    pub effective: usize,
}

/// Read-only view for dashboards and the alert evaluator.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub counters: Counters,
    pub throughput_per_sec: f64,
    pub error_rate: f64,
    pub queue_depth: usize,
    pub in_flight: usize,
    pub stuck_jobs: usize,
    pub ceiling: usize,
    pub latency: BTreeMap<String, LatencySummary>,
    pub ceiling_history: Vec<CeilingPoint>,
}

#[derive(Debug, Default)]
struct Inner {
    counters: Counters,
    /// (finished at, failed)
    outcomes: VecDeque<(Instant, bool)>,
    latency: HashMap<String, VecDeque<f64>>,
    queue_depth: usize,
    in_flight: usize,
    stuck_jobs: usize,
    ceiling: usize,
    ceiling_history: VecDeque<CeilingPoint>,
}

impl Inner {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some((at, _)) = self.outcomes.front() {
            if now.saturating_duration_since(*at) > window {
                self.outcomes.pop_front();
            } else {
                break;
            }
        }
    }
}

#[derive(Debug)]
pub struct EngineMetrics {
    window: Duration,
    inner: Mutex<Inner>,
}

impl EngineMetrics {
    pub fn new(window: Duration) -> Self {
        Self {
            window: window.max(Duration::from_millis(1)),
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record_enqueued(&self, kind: &str) {
        self.lock().counters.enqueued += 1;
        metrics::counter!(names::JOBS_ENQUEUED, "kind" => kind.to_owned()).increment(1);
    }

    pub fn record_claimed(&self, kind: &str) {
        self.lock().counters.claimed += 1;
        metrics::counter!(names::JOBS_CLAIMED, "kind" => kind.to_owned()).increment(1);
    }

    /// A job failed at claim time without running.
    pub fn record_rejected(&self, kind: &str) {
        self.lock().counters.rejected += 1;
        metrics::counter!(names::JOBS_REJECTED, "kind" => kind.to_owned()).increment(1);
    }

    pub fn record_timeout(&self, kind: &str) {
        self.lock().counters.timed_out += 1;
        metrics::counter!(names::JOBS_TIMED_OUT, "kind" => kind.to_owned()).increment(1);
    }

    /// Jobs cancelled without ever running (queued cancellation, cascades).
    pub fn record_cancelled(&self, count: usize) {
        if count == 0 {
            return;
        }
        self.lock().counters.cancelled += count as u64;
        metrics::counter!(names::JOBS_CANCELLED).increment(count as u64);
    }

    /// A handler finished (or was stopped) after running for `elapsed`.
    pub fn record_attempt(
        &self,
        kind: &str,
        outcome: AttemptOutcome,
        elapsed: Duration,
        at: Instant,
    ) {
        let mut inner = self.lock();
        match outcome {
            AttemptOutcome::Succeeded => {
                inner.counters.succeeded += 1;
                metrics::counter!(names::JOBS_SUCCEEDED, "kind" => kind.to_owned()).increment(1);
            }
            AttemptOutcome::Retried => {
                inner.counters.retried += 1;
                metrics::counter!(names::JOBS_RETRIED, "kind" => kind.to_owned()).increment(1);
            }
            AttemptOutcome::Failed => {
                inner.counters.failed += 1;
                metrics::counter!(names::JOBS_FAILED, "kind" => kind.to_owned()).increment(1);
            }
            AttemptOutcome::Cancelled => {
                inner.counters.cancelled += 1;
                metrics::counter!(names::JOBS_CANCELLED).increment(1);
            }
        }

        if outcome != AttemptOutcome::Cancelled {
            let failed = outcome != AttemptOutcome::Succeeded;
            inner.outcomes.push_back((at, failed));
            inner.prune(at, self.window);
        }

        let samples = inner.latency.entry(kind.to_owned()).or_default();
        if samples.len() == LATENCY_SAMPLES {
            samples.pop_front();
        }
        samples.push_back(elapsed.as_secs_f64() * 1000.0);
        metrics::histogram!(names::JOB_DURATION, "kind" => kind.to_owned())
            .record(elapsed.as_secs_f64());
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.lock().queue_depth = depth;
        metrics::gauge!(names::QUEUE_DEPTH).set(depth as f64);
    }

    pub fn set_in_flight(&self, in_flight: usize) {
        self.lock().in_flight = in_flight;
        metrics::gauge!(names::IN_FLIGHT).set(in_flight as f64);
    }

    pub fn set_stuck_jobs(&self, stuck: usize) {
        self.lock().stuck_jobs = stuck;
        metrics::gauge!(names::STUCK_JOBS).set(stuck as f64);
    }

    /// Record the limits of a tick; history keeps only changes.
    pub fn record_ceiling(&self, scaling: usize, resource: usize, effective: usize) {
        let mut inner = self.lock();
        inner.ceiling = effective;
        let changed = inner
            .ceiling_history
            .back()
            .is_none_or(|p| (p.scaling, p.resource, p.effective) != (scaling, resource, effective));
        if changed {
            if inner.ceiling_history.len() == CEILING_HISTORY {
                inner.ceiling_history.pop_front();
            }
            inner.ceiling_history.push_back(CeilingPoint {
                at: Utc::now(),
                scaling,
                resource,
                effective,
            });
        }
        metrics::gauge!(names::CONCURRENCY_CEILING).set(effective as f64);
    }

    /// Finished attempts per second over the window.
    pub fn throughput(&self, now: Instant) -> f64 {
        let mut inner = self.lock();
        inner.prune(now, self.window);
        inner.outcomes.len() as f64 / self.window.as_secs_f64()
    }

    /// Share of finished attempts in the window that failed; 0 when idle.
    pub fn error_rate(&self, now: Instant) -> f64 {
        let mut inner = self.lock();
        inner.prune(now, self.window);
        error_rate(&inner.outcomes)
    }

    pub fn snapshot(&self, now: Instant) -> MetricsSnapshot {
        let mut inner = self.lock();
        inner.prune(now, self.window);

        let latency = inner
            .latency
            .iter()
            .map(|(kind, samples)| (kind.clone(), summarize(samples)))
            .collect();

        MetricsSnapshot {
            counters: inner.counters.clone(),
            throughput_per_sec: inner.outcomes.len() as f64 / self.window.as_secs_f64(),
            error_rate: error_rate(&inner.outcomes),
            queue_depth: inner.queue_depth,
            in_flight: inner.in_flight,
            stuck_jobs: inner.stuck_jobs,
            ceiling: inner.ceiling,
            latency,
            ceiling_history: inner.ceiling_history.iter().cloned().collect(),
        }
    }
}

fn error_rate(outcomes: &VecDeque<(Instant, bool)>) -> f64 {
    if outcomes.is_empty() {
        return 0.0;
    }
    let failed = outcomes.iter().filter(|(_, failed)| *failed).count();
    failed as f64 / outcomes.len() as f64
}

fn summarize(samples: &VecDeque<f64>) -> LatencySummary {
    let mut sorted: Vec<f64> = samples.iter().copied().collect();
    sorted.sort_by(f64::total_cmp);

    let rank = |p: f64| -> f64 {
        if sorted.is_empty() {
            return 0.0;
        }
        let idx = ((p * sorted.len() as f64).ceil() as usize).clamp(1, sorted.len()) - 1;
        sorted[idx]
    };

    LatencySummary {
        count: sorted.len(),
        p50_ms: rank(0.50),
        p95_ms: rank(0.95),
        max_ms: sorted.last().copied().unwrap_or(0.0),
    }
}
