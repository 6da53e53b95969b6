//! Resource monitor: safety-based concurrency ceiling, payload admission and
//! job-history retention.

use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::store::{JobStore, JobStoreError};
use crate::types::{FailureClass, Job, JobError};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Source of the process's current memory usage.
pub trait MemorySampler: Send + Sync {
    /// Resident memory in MB, if it can be measured on this platform.
    fn resident_mb(&self) -> Option<f64>;
}

/// Reads the resident set size from `/proc/self/status` (Linux).
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessMemorySampler;

impl MemorySampler for ProcessMemorySampler {
    fn resident_mb(&self) -> Option<f64> {
        let content = fs::read_to_string("/proc/self/status").ok()?;
        parse_vm_rss_mb(&content)
    }
}

/// Never reports a sample; the monitor falls back to in-flight payload sizes.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMemorySampler;

impl MemorySampler for NoopMemorySampler {
    fn resident_mb(&self) -> Option<f64> {
        None
    }
}

/// Parse the `VmRSS:  123456 kB` line of a proc status file.
fn parse_vm_rss_mb(content: &str) -> Option<f64> {
    let line = content.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kb: f64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb / 1024.0)
}

/// One sample of resource pressure.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceObservation {
    pub memory_used_mb: Option<f64>,
    pub in_flight: usize,
    pub in_flight_payload_bytes: u64,
}

#[derive(Debug, Default)]
struct MonitorState {
    last_recompute: Option<Instant>,
    last_cleanup: Option<Instant>,
}

/// Yields the resource-safe concurrency ceiling.
#[derive(Debug)]
pub struct ResourceMonitor {
    max_workers: usize,
    max_memory_mb: f64,
    max_payload_bytes: u64,
    base_job_cost_mb: f64,
    interval: Duration,
    cleanup_interval: Duration,
    history_retention: chrono::Duration,
    history_count: usize,
    ceiling: AtomicUsize,
    state: Mutex<MonitorState>,
}

impl ResourceMonitor {
    pub fn new(config: &EngineConfig) -> Self {
        let monitor = Self {
            max_workers: config.max_workers.max(1),
            max_memory_mb: config.max_memory_mb as f64,
            max_payload_bytes: config.max_payload_bytes(),
            base_job_cost_mb: (config.base_job_cost_mb as f64).max(f64::EPSILON),
            interval: config.resource_interval(),
            cleanup_interval: config.cleanup_interval(),
            history_retention: config.history_retention(),
            history_count: config.max_job_history_count,
            ceiling: AtomicUsize::new(0),
            state: Mutex::new(MonitorState::default()),
        };
        let initial = monitor.compute_ceiling(&ResourceObservation::default());
        monitor.ceiling.store(initial, Ordering::Relaxed);
        monitor
    }

    /// Last computed ceiling.
    pub fn current_ceiling(&self) -> usize {
        self.ceiling.load(Ordering::Relaxed)
    }

    /// Recompute the ceiling if the resource interval has elapsed.
    ///
    /// Returns the new ceiling when a recompute happened.
    pub fn tick(&self, observation: ResourceObservation, now: Instant) -> Option<usize> {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(last) = state.last_recompute
                && now.saturating_duration_since(last) < self.interval
            {
                return None;
            }
            state.last_recompute = Some(now);
        }

        let ceiling = self.compute_ceiling(&observation);
        let previous = self.ceiling.swap(ceiling, Ordering::Relaxed);
        if previous != ceiling {
            debug!(
                previous,
                ceiling,
                in_flight = observation.in_flight,
                memory_used_mb = ?observation.memory_used_mb,
                "resource ceiling changed"
            );
        }
        Some(ceiling)
    }

    fn compute_ceiling(&self, observation: &ResourceObservation) -> usize {
        let payload_mb = observation.in_flight_payload_bytes as f64 / BYTES_PER_MB;
        let used_mb = observation.memory_used_mb.unwrap_or(payload_mb);
        let headroom_mb = (self.max_memory_mb - used_mb).max(0.0);

        let avg_payload_mb = if observation.in_flight > 0 {
            payload_mb / observation.in_flight as f64
        } else {
            0.0
        };
        let per_job_mb = avg_payload_mb.max(self.base_job_cost_mb);
        let extra = (headroom_mb / per_job_mb).floor() as usize;

        observation
            .in_flight
            .saturating_add(extra)
            .clamp(1, self.max_workers)
    }

    /// Reject payloads above the configured size before they start.
    pub fn check_payload(&self, job: &Job) -> Result<(), JobError> {
        if job.payload_bytes > self.max_payload_bytes {
            return Err(JobError::new(
                FailureClass::PayloadTooLarge,
                format!(
                    "payload is {:.2} MB, limit is {} MB",
                    job.payload_bytes as f64 / BYTES_PER_MB,
                    self.max_payload_bytes / (1024 * 1024)
                ),
            ));
        }
        Ok(())
    }

    pub fn cleanup_due(&self, now: Instant) -> bool {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .last_cleanup
            .is_none_or(|last| now.saturating_duration_since(last) >= self.cleanup_interval)
    }

    /// Purge old terminal jobs, at most once per cleanup interval.
    pub fn run_cleanup<S: JobStore + ?Sized>(
        &self,
        store: &S,
        now: Instant,
    ) -> Result<usize, JobStoreError> {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(last) = state.last_cleanup
                && now.saturating_duration_since(last) < self.cleanup_interval
            {
                return Ok(0);
            }
            state.last_cleanup = Some(now);
        }

        let cutoff = Utc::now() - self.history_retention;
        let purged = store.purge_terminal(cutoff, self.history_count)?;
        if purged > 0 {
            info!(purged, cutoff = %cutoff, keep_latest = self.history_count, "purged job history");
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryJobStore;
    use crate::types::JobKind;
    use tidepool_core::TenantId;

    fn config() -> EngineConfig {
        EngineConfig {
            max_workers: 16,
            max_memory_mb: 100,
            base_job_cost_mb: 10,
            max_job_payload_size_mb: 1,
            resource_interval_ms: 1_000,
            cleanup_interval_ms: 60_000,
            ..Default::default()
        }
    }

    #[test]
    fn ceiling_follows_memory_headroom() {
        let monitor = ResourceMonitor::new(&config());
        let now = Instant::now();

        // 60 MB used, 40 MB headroom at 10 MB/job -> 2 running + 4 more
        let ceiling = monitor.tick(
            ResourceObservation {
                memory_used_mb: Some(60.0),
                in_flight: 2,
                in_flight_payload_bytes: 0,
            },
            now,
        );
        assert_eq!(ceiling, Some(6));
        assert_eq!(monitor.current_ceiling(), 6);
    }

    #[test]
    fn ceiling_is_clamped() {
        let monitor = ResourceMonitor::new(&config());
        assert_eq!(monitor.current_ceiling(), 10);

        let exhausted = ResourceObservation {
            memory_used_mb: Some(500.0),
            in_flight: 0,
            in_flight_payload_bytes: 0,
        };
        assert_eq!(monitor.tick(exhausted, Instant::now()), Some(1));
    }

    #[test]
    fn large_in_flight_payloads_raise_per_job_cost() {
        let monitor = ResourceMonitor::new(&config());
        // No sample: 2 jobs holding 40 MB of payload -> 60 MB headroom at 20 MB/job
        let observation = ResourceObservation {
            memory_used_mb: None,
            in_flight: 2,
            in_flight_payload_bytes: 40 * 1024 * 1024,
        };
        assert_eq!(monitor.tick(observation, Instant::now()), Some(5));
    }

    #[test]
    fn recompute_is_rate_limited() {
        let monitor = ResourceMonitor::new(&config());
        let start = Instant::now();
        let busy = ResourceObservation {
            memory_used_mb: Some(95.0),
            in_flight: 0,
            in_flight_payload_bytes: 0,
        };

        assert!(monitor.tick(busy, start).is_some());
        assert!(monitor.tick(ResourceObservation::default(), start + Duration::from_millis(500)).is_none());
        assert_eq!(monitor.current_ceiling(), 1);
        assert!(monitor.tick(ResourceObservation::default(), start + Duration::from_secs(1)).is_some());
        assert_eq!(monitor.current_ceiling(), 10);
    }

    #[test]
    fn oversized_payloads_are_rejected() {
        let monitor = ResourceMonitor::new(&config());
        let tenant = TenantId::new();

        let small = Job::new(tenant, JobKind::custom("t"), serde_json::json!({"a": 1}));
        assert!(monitor.check_payload(&small).is_ok());

        let blob = "x".repeat(2 * 1024 * 1024);
        let big = Job::new(tenant, JobKind::custom("t"), serde_json::json!({ "blob": blob }));
        let error = monitor.check_payload(&big).unwrap_err();
        assert_eq!(error.class, FailureClass::PayloadTooLarge);
    }

    #[test]
    fn cleanup_runs_once_per_interval() {
        let monitor = ResourceMonitor::new(&EngineConfig {
            max_job_history_count: 0,
            ..config()
        });
        let store = InMemoryJobStore::new();
        let tenant = TenantId::new();
        for _ in 0..3 {
            let id = store
                .insert(Job::new(tenant, JobKind::custom("t"), serde_json::json!({})))
                .unwrap();
            store.mark_cancelled(id, JobError::cancelled("test")).unwrap();
        }

        let start = Instant::now();
        assert!(monitor.cleanup_due(start));
        assert_eq!(monitor.run_cleanup(&store, start).unwrap(), 3);
        assert!(!monitor.cleanup_due(start + Duration::from_secs(1)));
        assert_eq!(monitor.run_cleanup(&store, start + Duration::from_secs(1)).unwrap(), 0);
        assert!(monitor.cleanup_due(start + Duration::from_secs(60)));
    }

    #[test]
    fn parses_proc_status() {
        let status = "Name:\ttidepool\nVmPeak:\t  300000 kB\nVmRSS:\t  204800 kB\nThreads:\t8\n";
        assert_eq!(parse_vm_rss_mb(status), Some(200.0));
        assert_eq!(parse_vm_rss_mb("Name:\tx\n"), None);
    }
}
