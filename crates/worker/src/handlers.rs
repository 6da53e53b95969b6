//! Handlers for the built-in job categories.
//!
//! These do the platform-neutral part of each step (paging, shaping records,
//! vectorising text, summarising series) and log what they produced. Source
//! connectors and model clients plug in behind the same routing keys.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, instrument};

use tidepool_jobs::{HandlerError, HandlerRegistry, JobContext, JobHandler};

/// Routing keys for every handler in this module.
pub fn registry() -> HandlerRegistry {
    let mut handlers = HandlerRegistry::new();
    handlers.register("ingest_source.*", IngestSourceHandler::default());
    handlers.register("normalize_record.*", NormalizeRecordHandler);
    handlers.register("generate_embedding.*", GenerateEmbeddingHandler::default());
    handlers.register("derive_insight.*", DeriveInsightHandler);
    handlers
}

#[derive(Debug, Deserialize)]
struct IngestRequest {
    #[serde(default = "default_pages")]
    pages: u32,
    cursor: Option<String>,
}

fn default_pages() -> u32 {
    3
}

/// Pulls a source page by page, stopping between pages when cancelled.
#[derive(Debug)]
pub struct IngestSourceHandler {
    page_delay: Duration,
}

impl Default for IngestSourceHandler {
    fn default() -> Self {
        Self {
            page_delay: Duration::from_millis(200),
        }
    }
}

#[async_trait]
impl JobHandler for IngestSourceHandler {
    #[instrument(skip(self, ctx), fields(component = "ingest_source", job_id = %ctx.job_id()))]
    async fn run(&self, ctx: JobContext) -> Result<(), HandlerError> {
        let request: IngestRequest = ctx.payload_as()?;
        let mut cursor = request.cursor.unwrap_or_default();

        for page in 1..=request.pages {
            tokio::select! {
                _ = ctx.cancelled() => {
                    return Err(HandlerError::transient(format!("interrupted at page {page}")));
                }
                _ = tokio::time::sleep(self.page_delay) => {}
            }
            cursor = format!("page-{page}");
            debug!(page, pages = request.pages, "page fetched");
        }

        info!(pages = request.pages, cursor = %cursor, "source ingested");
        Ok(())
    }
}

/// Lower-cases and trims field names, dropping empty values.
#[derive(Debug, Default)]
pub struct NormalizeRecordHandler;

fn normalize(record: &serde_json::Map<String, serde_json::Value>) -> BTreeMap<String, serde_json::Value> {
    record
        .iter()
        .filter(|(_, value)| !value.is_null() && value.as_str().is_none_or(|s| !s.trim().is_empty()))
        .map(|(key, value)| {
            let value = match value.as_str() {
                Some(s) => serde_json::Value::String(s.trim().to_string()),
                None => value.clone(),
            };
            (key.trim().to_lowercase().replace(' ', "_"), value)
        })
        .collect()
}

#[async_trait]
impl JobHandler for NormalizeRecordHandler {
    #[instrument(skip(self, ctx), fields(component = "normalize_record", job_id = %ctx.job_id()))]
    async fn run(&self, ctx: JobContext) -> Result<(), HandlerError> {
        let Some(records) = ctx.payload().get("records").and_then(|r| r.as_array()) else {
            return Err(HandlerError::fatal("payload has no `records` array"));
        };

        let mut fields = 0;
        for record in records {
            let Some(object) = record.as_object() else {
                return Err(HandlerError::fatal("records must be JSON objects"));
            };
            fields += normalize(object).len();
        }

        info!(records = records.len(), fields, "records normalized");
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct EmbeddingRequest {
    text: String,
}

/// Hashes tokens into a fixed-size, L2-normalised vector.
#[derive(Debug)]
pub struct GenerateEmbeddingHandler {
    dimensions: usize,
}

impl Default for GenerateEmbeddingHandler {
    fn default() -> Self {
        Self { dimensions: 64 }
    }
}

impl GenerateEmbeddingHandler {
    fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        for token in text.split_whitespace() {
            // FNV-1a
            let hash = token
                .to_lowercase()
                .bytes()
                .fold(0xcbf2_9ce4_8422_2325u64, |h, b| (h ^ b as u64).wrapping_mul(0x0100_0000_01b3));
            vector[(hash % self.dimensions as u64) as usize] += 1.0;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        vector
    }
}

#[async_trait]
impl JobHandler for GenerateEmbeddingHandler {
    #[instrument(skip(self, ctx), fields(component = "generate_embedding", job_id = %ctx.job_id()))]
    async fn run(&self, ctx: JobContext) -> Result<(), HandlerError> {
        let request: EmbeddingRequest = ctx.payload_as()?;
        if request.text.trim().is_empty() {
            return Err(HandlerError::fatal("nothing to embed"));
        }
        if ctx.is_cancelled() {
            return Err(HandlerError::transient("cancelled before embedding"));
        }

        let vector = self.embed(&request.text);
        let nonzero = vector.iter().filter(|v| **v != 0.0).count();
        info!(dimensions = vector.len(), nonzero, "embedding generated");
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct InsightRequest {
    series: Vec<f64>,
}

/// Summarises a numeric series and flags the last point when it is an outlier.
#[derive(Debug, Default)]
pub struct DeriveInsightHandler;

#[async_trait]
impl JobHandler for DeriveInsightHandler {
    #[instrument(skip(self, ctx), fields(component = "derive_insight", job_id = %ctx.job_id()))]
    async fn run(&self, ctx: JobContext) -> Result<(), HandlerError> {
        let request: InsightRequest = ctx.payload_as()?;
        let Some(&last) = request.series.last() else {
            return Err(HandlerError::fatal("series is empty"));
        };

        let n = request.series.len() as f64;
        let mean = request.series.iter().sum::<f64>() / n;
        let variance = request.series.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
        let std_dev = variance.sqrt();
        let outlier = std_dev > 0.0 && ((last - mean) / std_dev).abs() > 2.0;

        info!(
            points = request.series.len(),
            mean = format!("{mean:.3}"),
            std_dev = format!("{std_dev:.3}"),
            outlier,
            "insight derived"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidepool_jobs::{Job, JobKind, TenantId};
    use tokio_util::sync::CancellationToken;

    fn ctx(kind: JobKind, payload: serde_json::Value) -> JobContext {
        JobContext::new(Job::new(TenantId::new(), kind, payload), CancellationToken::new())
    }

    #[test]
    fn registry_covers_every_category() {
        let handlers = registry();
        for kind in [
            JobKind::ingest_source("gmail"),
            JobKind::normalize_record("contact"),
            JobKind::generate_embedding("minilm"),
            JobKind::derive_insight("churn"),
        ] {
            assert!(handlers.resolve(&kind).is_some(), "{}", kind.type_name());
        }
        assert!(handlers.resolve(&JobKind::custom("unknown")).is_none());
    }

    #[test]
    fn normalize_cleans_keys_and_drops_blanks() {
        let record = serde_json::json!({" First Name ": " Ada ", "email": "", "age": 36, "fax": null});
        let normalized = normalize(record.as_object().unwrap());

        assert_eq!(normalized.len(), 2);
        assert_eq!(normalized["first_name"], "Ada");
        assert_eq!(normalized["age"], 36);
    }

    #[test]
    fn embeddings_are_unit_length() {
        let handler = GenerateEmbeddingHandler::default();
        let vector = handler.embed("quarterly revenue grew in the north region");
        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();

        assert_eq!(vector.len(), 64);
        assert!((norm - 1.0).abs() < 1e-5);
        assert_eq!(vector, handler.embed("Quarterly revenue grew in the North region"));
    }

    #[tokio::test]
    async fn malformed_payloads_are_fatal() {
        let err = NormalizeRecordHandler
            .run(ctx(JobKind::normalize_record("contact"), serde_json::json!({"rows": []})))
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Fatal(_)));

        let err = DeriveInsightHandler
            .run(ctx(JobKind::derive_insight("churn"), serde_json::json!({"series": []})))
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Fatal(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn ingest_stops_between_pages_when_cancelled() {
        let context = ctx(JobKind::ingest_source("crm"), serde_json::json!({"pages": 100}));
        let token = context.cancellation_token();
        let handler = IngestSourceHandler::default();
        let task = tokio::spawn(async move { handler.run(context).await });

        tokio::time::sleep(Duration::from_millis(450)).await;
        token.cancel();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, HandlerError::Transient(message) if message.contains("page 3")));
    }
}
