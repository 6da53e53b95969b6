//! Engine configuration.

use std::time::Duration;

use serde::Deserialize;

use tidepool_observability::LogFormat;

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {field} {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("failed to read configuration from environment: {0}")]
    Env(#[from] envy::Error),
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Engine configuration. Every option has a default.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Floor for the scaling controller's concurrency ceiling
    pub min_workers: usize,
    /// Hard cap on concurrently running handlers
    pub max_workers: usize,
    /// Jobs claimed per store round trip
    pub batch_claim_size: usize,
    /// Claims allowed per scheduling tick
    pub max_jobs_per_run: usize,
    /// Hard execution timeout per job
    pub job_timeout_ms: u64,
    pub max_memory_mb: u64,
    pub max_job_payload_size_mb: u64,
    pub target_queue_depth: usize,
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
    pub error_rate_threshold: f64,
    /// Terminal jobs older than this are purged
    pub max_job_history_days: u32,
    /// Terminal jobs kept regardless of age (newest first)
    pub max_job_history_count: usize,
    /// Share of the effective limit one owner may hold.
    ///
    /// With a single active owner and `lend_idle_slots` off, the rest of the
    /// limit stays idle.
    pub owner_share: f64,
    /// Let owners at their cap take slots that no other owner's ready job
    /// could use in the same tick
    pub lend_idle_slots: bool,
    pub poll_interval_ms: u64,
    pub scaling_interval_ms: u64,
    pub resource_interval_ms: u64,
    pub alert_interval_ms: u64,
    pub cleanup_interval_ms: u64,
    /// Minimum time between two scaling adjustments
    pub min_scale_interval_ms: u64,
    /// How long the error rate must stay high before the circuit opens
    pub error_window_secs: u64,
    /// Sliding window for throughput and error rate
    pub metrics_window_secs: u64,
    /// Queued jobs inspected per scheduling tick
    pub candidate_window: usize,
    /// Assumed memory cost of one running job
    pub base_job_cost_mb: u64,
    pub readiness_ttl_ms: u64,
    pub log_format: LogFormat,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_workers: 2,
            max_workers: 16,
            batch_claim_size: 8,
            max_jobs_per_run: 64,
            job_timeout_ms: 300_000,
            max_memory_mb: 1024,
            max_job_payload_size_mb: 10,
            target_queue_depth: 100,
            scale_up_threshold: 1.5,
            scale_down_threshold: 0.5,
            error_rate_threshold: 0.25,
            max_job_history_days: 30,
            max_job_history_count: 10_000,
            owner_share: 0.5,
            lend_idle_slots: true,
            poll_interval_ms: 250,
            scaling_interval_ms: 5_000,
            resource_interval_ms: 2_000,
            alert_interval_ms: 15_000,
            cleanup_interval_ms: 3_600_000,
            min_scale_interval_ms: 15_000,
            error_window_secs: 60,
            metrics_window_secs: 60,
            candidate_window: 256,
            base_job_cost_mb: 8,
            readiness_ttl_ms: 30_000,
            log_format: LogFormat::Json,
        }
    }
}

impl EngineConfig {
    /// Load from `.env` and `TIDEPOOL_*` environment variables, then validate.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config: Self = envy::prefixed("TIDEPOOL_").from_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_workers == 0 {
            return Err(ConfigError::invalid("min_workers", "must be at least 1"));
        }
        if self.min_workers > self.max_workers {
            return Err(ConfigError::invalid(
                "min_workers",
                format!("({}) exceeds max_workers ({})", self.min_workers, self.max_workers),
            ));
        }
        if self.batch_claim_size == 0 {
            return Err(ConfigError::invalid("batch_claim_size", "must be at least 1"));
        }
        if self.max_jobs_per_run == 0 {
            return Err(ConfigError::invalid("max_jobs_per_run", "must be at least 1"));
        }
        if self.candidate_window == 0 {
            return Err(ConfigError::invalid("candidate_window", "must be at least 1"));
        }
        if self.max_memory_mb == 0 {
            return Err(ConfigError::invalid("max_memory_mb", "must be positive"));
        }
        if self.max_job_payload_size_mb == 0 {
            return Err(ConfigError::invalid("max_job_payload_size_mb", "must be positive"));
        }
        if self.base_job_cost_mb == 0 {
            return Err(ConfigError::invalid("base_job_cost_mb", "must be positive"));
        }
        if self.target_queue_depth == 0 {
            return Err(ConfigError::invalid("target_queue_depth", "must be positive"));
        }
        if !(self.scale_down_threshold >= 0.0 && self.scale_down_threshold < self.scale_up_threshold)
        {
            return Err(ConfigError::invalid(
                "scale_down_threshold",
                "must be non-negative and below scale_up_threshold",
            ));
        }
        if !(self.error_rate_threshold > 0.0 && self.error_rate_threshold <= 1.0) {
            return Err(ConfigError::invalid("error_rate_threshold", "must be in (0, 1]"));
        }
        if !(self.owner_share > 0.0 && self.owner_share <= 1.0) {
            return Err(ConfigError::invalid("owner_share", "must be in (0, 1]"));
        }

        let intervals = [
            ("job_timeout_ms", self.job_timeout_ms),
            ("poll_interval_ms", self.poll_interval_ms),
            ("scaling_interval_ms", self.scaling_interval_ms),
            ("resource_interval_ms", self.resource_interval_ms),
            ("alert_interval_ms", self.alert_interval_ms),
            ("cleanup_interval_ms", self.cleanup_interval_ms),
            ("metrics_window_secs", self.metrics_window_secs),
        ];
        for (field, value) in intervals {
            if value == 0 {
                return Err(ConfigError::invalid(field, "must be positive"));
            }
        }

        Ok(())
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_millis(self.job_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn scaling_interval(&self) -> Duration {
        Duration::from_millis(self.scaling_interval_ms)
    }

    pub fn resource_interval(&self) -> Duration {
        Duration::from_millis(self.resource_interval_ms)
    }

    pub fn alert_interval(&self) -> Duration {
        Duration::from_millis(self.alert_interval_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    pub fn min_scale_interval(&self) -> Duration {
        Duration::from_millis(self.min_scale_interval_ms)
    }

    pub fn error_window(&self) -> Duration {
        Duration::from_secs(self.error_window_secs)
    }

    pub fn metrics_window(&self) -> Duration {
        Duration::from_secs(self.metrics_window_secs)
    }

    pub fn readiness_ttl(&self) -> Duration {
        Duration::from_millis(self.readiness_ttl_ms)
    }

    pub fn max_payload_bytes(&self) -> u64 {
        self.max_job_payload_size_mb.saturating_mul(1024 * 1024)
    }

    pub fn history_retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.max_job_history_days))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.max_payload_bytes(), 10 * 1024 * 1024);
        assert_eq!(config.job_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config: EngineConfig =
            serde_json::from_value(serde_json::json!({"max_workers": 4, "log_format": "pretty"}))
                .unwrap();
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.min_workers, 2);
        assert_eq!(config.log_format, LogFormat::Pretty);
    }

    #[test]
    fn rejects_inconsistent_worker_bounds() {
        let config = EngineConfig {
            min_workers: 8,
            max_workers: 4,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "min_workers", .. })
        ));

        let config = EngineConfig {
            min_workers: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_thresholds() {
        for config in [
            EngineConfig {
                error_rate_threshold: 1.5,
                ..Default::default()
            },
            EngineConfig {
                scale_down_threshold: 2.0,
                ..Default::default()
            },
            EngineConfig {
                owner_share: 0.0,
                ..Default::default()
            },
            EngineConfig {
                job_timeout_ms: 0,
                ..Default::default()
            },
        ] {
            assert!(config.validate().is_err(), "{config:?}");
        }
    }

    #[test]
    fn reads_prefixed_environment() {
        let vars = vec![
            ("TIDEPOOL_MAX_WORKERS".to_string(), "32".to_string()),
            ("TIDEPOOL_JOB_TIMEOUT_MS".to_string(), "1000".to_string()),
            ("TIDEPOOL_LOG_FORMAT".to_string(), "compact".to_string()),
            ("UNRELATED".to_string(), "x".to_string()),
        ];
        let config: EngineConfig = envy::prefixed("TIDEPOOL_").from_iter(vars).unwrap();
        assert_eq!(config.max_workers, 32);
        assert_eq!(config.job_timeout_ms, 1000);
        assert_eq!(config.log_format, LogFormat::Compact);
        assert_eq!(config.batch_claim_size, 8);
        assert!(config.lend_idle_slots);
    }
}
