//! Threshold alerting over metrics snapshots.
//!
//! Alerts are notifications only; nothing here touches job state.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use tidepool_observability::metrics as names;

use crate::config::EngineConfig;
use crate::telemetry::MetricsSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Low,
    Moderate,
    High,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Info => "info",
            AlertSeverity::Low => "low",
            AlertSeverity::Moderate => "moderate",
            AlertSeverity::High => "high",
            AlertSeverity::Critical => "critical",
        }
    }
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AlertCondition {
    ErrorRateAbove { threshold: f64 },
    QueueDepthAbove { depth: usize },
    StuckJobsAbove { count: usize },
    /// Throughput at or below `throughput` while at least `min_backlog` jobs wait
    ThroughputBelowWithBacklog { throughput: f64, min_backlog: usize },
}

impl AlertCondition {
    fn breached(&self, snapshot: &MetricsSnapshot) -> bool {
        match self {
            AlertCondition::ErrorRateAbove { threshold } => snapshot.error_rate > *threshold,
            AlertCondition::QueueDepthAbove { depth } => snapshot.queue_depth > *depth,
            AlertCondition::StuckJobsAbove { count } => snapshot.stuck_jobs > *count,
            AlertCondition::ThroughputBelowWithBacklog {
                throughput,
                min_backlog,
            } => {
                snapshot.throughput_per_sec <= *throughput && snapshot.queue_depth >= *min_backlog
            }
        }
    }

    fn describe(&self, snapshot: &MetricsSnapshot) -> String {
        match self {
            AlertCondition::ErrorRateAbove { threshold } => format!(
                "error rate {:.1}% above {:.1}%",
                snapshot.error_rate * 100.0,
                threshold * 100.0
            ),
            AlertCondition::QueueDepthAbove { depth } => {
                format!("queue depth {} above {}", snapshot.queue_depth, depth)
            }
            AlertCondition::StuckJobsAbove { .. } => format!(
                "{} job(s) can never become ready (dependency cycle)",
                snapshot.stuck_jobs
            ),
            AlertCondition::ThroughputBelowWithBacklog { .. } => format!(
                "throughput {:.2}/s with {} job(s) queued",
                snapshot.throughput_per_sec, snapshot.queue_depth
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AlertRule {
    pub name: String,
    pub severity: AlertSeverity,
    pub condition: AlertCondition,
    /// The condition must hold this long before the alert fires
    pub sustained_for: Duration,
}

impl AlertRule {
    pub fn new(
        name: impl Into<String>,
        severity: AlertSeverity,
        condition: AlertCondition,
        sustained_for: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            severity,
            condition,
            sustained_for,
        }
    }

    /// Rules shipped with the engine, derived from its configuration.
    pub fn defaults(config: &EngineConfig) -> Vec<AlertRule> {
        vec![
            AlertRule::new(
                "error_rate_high",
                AlertSeverity::High,
                AlertCondition::ErrorRateAbove {
                    threshold: config.error_rate_threshold,
                },
                Duration::from_secs(5 * 60),
            ),
            AlertRule::new(
                "queue_backlog",
                AlertSeverity::Moderate,
                AlertCondition::QueueDepthAbove {
                    depth: config.target_queue_depth.saturating_mul(4),
                },
                Duration::from_secs(10 * 60),
            ),
            AlertRule::new(
                "stuck_jobs",
                AlertSeverity::Critical,
                AlertCondition::StuckJobsAbove { count: 0 },
                Duration::ZERO,
            ),
            AlertRule::new(
                "throughput_stalled",
                AlertSeverity::Low,
                AlertCondition::ThroughputBelowWithBacklog {
                    throughput: 0.0,
                    min_backlog: 1,
                },
                Duration::from_secs(10 * 60),
            ),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub rule: String,
    pub severity: AlertSeverity,
    pub message: String,
    pub fired_at: DateTime<Utc>,
}

/// Destination for fired alerts.
pub trait AlertSink: Send + Sync {
    fn emit(&self, alert: &Alert);
}

/// Logs alerts at a level matching their severity.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn emit(&self, alert: &Alert) {
        match alert.severity {
            AlertSeverity::Critical | AlertSeverity::High => {
                error!(rule = %alert.rule, severity = %alert.severity, "{}", alert.message)
            }
            AlertSeverity::Moderate | AlertSeverity::Low => {
                warn!(rule = %alert.rule, severity = %alert.severity, "{}", alert.message)
            }
            AlertSeverity::Info => {
                info!(rule = %alert.rule, severity = %alert.severity, "{}", alert.message)
            }
        }
    }
}

/// Keeps alerts in memory.
#[derive(Debug, Default)]
pub struct RecordingAlertSink {
    alerts: Mutex<Vec<Alert>>,
}

impl RecordingAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl AlertSink for RecordingAlertSink {
    fn emit(&self, alert: &Alert) {
        self.alerts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(alert.clone());
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct RuleState {
    breach_since: Option<Instant>,
    fired: bool,
}

/// Evaluates rules against snapshots; fires once per breach episode.
pub struct AlertEvaluator {
    rules: Vec<AlertRule>,
    state: Mutex<Vec<RuleState>>,
    sink: Arc<dyn AlertSink>,
}

impl fmt::Debug for AlertEvaluator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlertEvaluator")
            .field("rules", &self.rules)
            .finish_non_exhaustive()
    }
}

impl AlertEvaluator {
    pub fn new(rules: Vec<AlertRule>, sink: Arc<dyn AlertSink>) -> Self {
        let state = vec![RuleState::default(); rules.len()];
        Self {
            rules,
            state: Mutex::new(state),
            sink,
        }
    }

    pub fn rules(&self) -> &[AlertRule] {
        &self.rules
    }

    /// Check every rule; returns the alerts fired by this evaluation.
    pub fn evaluate(&self, snapshot: &MetricsSnapshot, now: Instant) -> Vec<Alert> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let mut fired = Vec::new();

        for (rule, rule_state) in self.rules.iter().zip(state.iter_mut()) {
            if !rule.condition.breached(snapshot) {
                // Re-arm
                *rule_state = RuleState::default();
                continue;
            }

            let since = *rule_state.breach_since.get_or_insert(now);
            if rule_state.fired || now.saturating_duration_since(since) < rule.sustained_for {
                continue;
            }

            rule_state.fired = true;
            let alert = Alert {
                rule: rule.name.clone(),
                severity: rule.severity,
                message: rule.condition.describe(snapshot),
                fired_at: Utc::now(),
            };
            metrics::counter!(names::ALERTS_FIRED, "severity" => rule.severity.as_str())
                .increment(1);
            self.sink.emit(&alert);
            fired.push(alert);
        }

        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{Counters, MetricsSnapshot};
    use std::collections::BTreeMap;

    fn snapshot(error_rate: f64, queue_depth: usize, stuck_jobs: usize, throughput: f64) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: Counters::default(),
            throughput_per_sec: throughput,
            error_rate,
            queue_depth,
            in_flight: 0,
            stuck_jobs,
            ceiling: 4,
            latency: BTreeMap::new(),
            ceiling_history: Vec::new(),
        }
    }

    fn evaluator() -> (AlertEvaluator, Arc<RecordingAlertSink>) {
        let sink = Arc::new(RecordingAlertSink::new());
        let evaluator = AlertEvaluator::new(AlertRule::defaults(&EngineConfig::default()), sink.clone());
        (evaluator, sink)
    }

    #[test]
    fn stuck_jobs_fire_critical_immediately() {
        let (evaluator, sink) = evaluator();
        let fired = evaluator.evaluate(&snapshot(0.0, 0, 2, 1.0), Instant::now());

        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].severity, AlertSeverity::Critical);
        assert_eq!(sink.alerts().len(), 1);
    }

    #[test]
    fn error_rate_must_be_sustained() {
        let (evaluator, _) = evaluator();
        let start = Instant::now();
        let failing = snapshot(0.5, 10, 0, 2.0);

        assert!(evaluator.evaluate(&failing, start).is_empty());
        assert!(evaluator.evaluate(&failing, start + Duration::from_secs(120)).is_empty());

        let fired = evaluator.evaluate(&failing, start + Duration::from_secs(300));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].rule, "error_rate_high");
        assert_eq!(fired[0].severity, AlertSeverity::High);
    }

    #[test]
    fn fires_once_per_episode_and_rearms() {
        let (evaluator, sink) = evaluator();
        let start = Instant::now();
        let stuck = snapshot(0.0, 0, 1, 1.0);

        evaluator.evaluate(&stuck, start);
        evaluator.evaluate(&stuck, start + Duration::from_secs(15));
        assert_eq!(sink.alerts().len(), 1);

        evaluator.evaluate(&snapshot(0.0, 0, 0, 1.0), start + Duration::from_secs(30));
        evaluator.evaluate(&stuck, start + Duration::from_secs(45));
        assert_eq!(sink.alerts().len(), 2);
    }

    #[test]
    fn stalled_backlog_raises_low_alert() {
        let (evaluator, _) = evaluator();
        let start = Instant::now();
        let stalled = snapshot(0.0, 5, 0, 0.0);

        assert!(evaluator.evaluate(&stalled, start).is_empty());
        let fired = evaluator.evaluate(&stalled, start + Duration::from_secs(600));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].severity, AlertSeverity::Low);

        // Idle with an empty queue is not a stall
        let (evaluator, _) = self::evaluator();
        evaluator.evaluate(&snapshot(0.0, 0, 0, 0.0), start);
        assert!(evaluator
            .evaluate(&snapshot(0.0, 0, 0, 0.0), start + Duration::from_secs(600))
            .is_empty());
    }

    #[test]
    fn deep_queue_raises_moderate_alert() {
        let (evaluator, _) = evaluator();
        let start = Instant::now();
        let deep = snapshot(0.0, 401, 0, 5.0);

        evaluator.evaluate(&deep, start);
        let fired = evaluator.evaluate(&deep, start + Duration::from_secs(600));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].severity, AlertSeverity::Moderate);
    }
}
