//! Load-based concurrency scaling with an error-rate circuit breaker.
//!
//! # State Machine
//!
//! ```text
//! depth > target * up            --> ScaleUp   (+max(1, current/4), <= max_workers)
//! depth < target * down, errors low --> ScaleDown (-max(1, current/4), >= min_workers)
//! error_rate > threshold for error_window --> CircuitOpen (halve, >= min_workers)
//! ```
//!
//! Adjustments are at least `min_scale_interval` apart.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;

/// Load sample fed to the controller on every scaling tick.
#[derive(Debug, Clone, Copy)]
pub struct LoadObservation {
    pub queue_depth: usize,
    pub throughput_per_sec: f64,
    pub error_rate: f64,
    pub at: Instant,
}

/// What the controller did with the ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ScalingDecision {
    Hold,
    ScaleUp { from: usize, to: usize },
    ScaleDown { from: usize, to: usize },
    /// Forced scale-down on a sustained error rate
    CircuitOpen { from: usize, to: usize },
}

#[derive(Debug, Default)]
struct ControllerState {
    last_adjustment: Option<Instant>,
    /// When the error rate first rose above the threshold
    error_high_since: Option<Instant>,
}

/// Scaling controller. `ceiling()` is lock-free; `tick()` is driven by the engine's scaling loop.
#[derive(Debug)]
pub struct ScalingController {
    min_workers: usize,
    max_workers: usize,
    target_queue_depth: usize,
    scale_up_threshold: f64,
    scale_down_threshold: f64,
    error_rate_threshold: f64,
    min_scale_interval: Duration,
    error_window: Duration,
    ceiling: AtomicUsize,
    state: Mutex<ControllerState>,
}

impl ScalingController {
    pub fn new(config: &EngineConfig) -> Self {
        let min_workers = config.min_workers.max(1);
        Self {
            min_workers,
            max_workers: config.max_workers.max(min_workers),
            target_queue_depth: config.target_queue_depth,
            scale_up_threshold: config.scale_up_threshold,
            scale_down_threshold: config.scale_down_threshold,
            error_rate_threshold: config.error_rate_threshold,
            min_scale_interval: config.min_scale_interval(),
            error_window: config.error_window(),
            ceiling: AtomicUsize::new(min_workers),
            state: Mutex::new(ControllerState::default()),
        }
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling.load(Ordering::Relaxed)
    }

    /// Whether the error rate has been above the threshold for the full window.
    pub fn circuit_open(&self, at: Instant) -> bool {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .error_high_since
            .is_some_and(|since| at.saturating_duration_since(since) >= self.error_window)
    }

    pub fn tick(&self, observation: LoadObservation) -> ScalingDecision {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let at = observation.at;
        let current = self.ceiling();

        let errors_high = observation.error_rate > self.error_rate_threshold;
        if errors_high {
            state.error_high_since.get_or_insert(at);
        } else {
            state.error_high_since = None;
        }
        let circuit = state
            .error_high_since
            .is_some_and(|since| at.saturating_duration_since(since) >= self.error_window);

        debug!(
            queue_depth = observation.queue_depth,
            throughput = format!("{:.2}", observation.throughput_per_sec),
            error_rate = format!("{:.3}", observation.error_rate),
            ceiling = current,
            circuit,
            "scaling check"
        );

        if let Some(last) = state.last_adjustment
            && at.saturating_duration_since(last) < self.min_scale_interval
        {
            return ScalingDecision::Hold;
        }

        let step = (current / 4).max(1);
        let target = self.target_queue_depth as f64;
        let depth = observation.queue_depth as f64;

        let decision = if circuit {
            let to = (current / 2).max(self.min_workers);
            if to < current {
                warn!(
                    from = current,
                    to,
                    error_rate = format!("{:.3}", observation.error_rate),
                    "error rate sustained above threshold; forcing scale-down"
                );
                ScalingDecision::CircuitOpen { from: current, to }
            } else {
                ScalingDecision::Hold
            }
        } else if errors_high {
            // Not yet sustained: hold rather than add load to a struggling dependency
            ScalingDecision::Hold
        } else if depth > target * self.scale_up_threshold && current < self.max_workers {
            let to = (current + step).min(self.max_workers);
            info!(from = current, to, queue_depth = observation.queue_depth, "scaling up");
            ScalingDecision::ScaleUp { from: current, to }
        } else if depth < target * self.scale_down_threshold && current > self.min_workers {
            let to = current.saturating_sub(step).max(self.min_workers);
            info!(from = current, to, queue_depth = observation.queue_depth, "scaling down");
            ScalingDecision::ScaleDown { from: current, to }
        } else {
            ScalingDecision::Hold
        };

        match decision {
            ScalingDecision::ScaleUp { to, .. }
            | ScalingDecision::ScaleDown { to, .. }
            | ScalingDecision::CircuitOpen { to, .. } => {
                self.ceiling.store(to, Ordering::Relaxed);
                state.last_adjustment = Some(at);
            }
            ScalingDecision::Hold => {}
        }
        decision
    }
}
