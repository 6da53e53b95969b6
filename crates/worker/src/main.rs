//! Tidepool background worker.
//!
//! Loads `TIDEPOOL_*` configuration, registers the built-in handlers and runs
//! the job engine until Ctrl-C. Pass `--demo` to enqueue a sample pipeline.

mod handlers;

use anyhow::Context;
use tidepool_jobs::{
    BatchId, Engine, EngineConfig, InMemoryJobStore, Job, JobKind, JobStore, Priority, TenantId,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = EngineConfig::from_env().context("invalid engine configuration")?;
    tidepool_observability::init_with(config.log_format);

    let engine = Engine::builder(InMemoryJobStore::arc(), config)
        .handlers(handlers::registry())
        .build()?;

    if std::env::args().any(|arg| arg == "--demo") {
        seed_demo_pipeline(&engine)?;
    }

    let status = engine.clone();
    let handle = engine.spawn();
    tracing::info!("worker running; press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested; draining in-flight jobs");
    handle.shutdown().await;

    let summary = status.status()?;
    tracing::info!(
        peak_concurrency = summary.peak_concurrency,
        queue_depth = summary.queue_depth,
        "worker stopped"
    );
    Ok(())
}

/// Ingest → normalize → embed → insight, as one batch for a fresh tenant.
fn seed_demo_pipeline<S: JobStore + 'static>(engine: &Engine<S>) -> anyhow::Result<()> {
    let tenant_id = TenantId::new();
    let batch_id = BatchId::new();

    let ingest = engine.enqueue(
        Job::new(
            tenant_id,
            JobKind::ingest_source("crm"),
            serde_json::json!({ "pages": 5 }),
        )
        .in_batch(batch_id)
        .with_priority(Priority::High),
    )?;
    let normalize = engine.enqueue(
        Job::new(
            tenant_id,
            JobKind::normalize_record("contact"),
            serde_json::json!({ "records": [
                { " Full Name ": "Ada Lovelace", "Email": "ada@example.com", "fax": null },
                { " Full Name ": "Grace Hopper", "Email": "" }
            ] }),
        )
        .in_batch(batch_id)
        .depends_on([ingest]),
    )?;
    let embed = engine.enqueue(
        Job::new(
            tenant_id,
            JobKind::generate_embedding("hashing"),
            serde_json::json!({ "text": "Ada Lovelace wrote the first published algorithm" }),
        )
        .in_batch(batch_id)
        .depends_on([normalize]),
    )?;
    engine.enqueue(
        Job::new(
            tenant_id,
            JobKind::derive_insight("engagement"),
            serde_json::json!({ "series": [12.0, 14.0, 13.0, 15.0, 41.0] }),
        )
        .in_batch(batch_id)
        .depends_on([embed, normalize])
        .with_priority(Priority::Low),
    )?;

    tracing::info!(tenant_id = %tenant_id, batch_id = %batch_id, jobs = 4, "demo pipeline enqueued");
    Ok(())
}
